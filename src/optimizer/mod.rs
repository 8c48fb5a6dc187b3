pub mod fallback;
pub mod problem;
pub mod qp;
pub mod strategies;
pub mod types;

pub use fallback::*;
pub use problem::*;
pub use qp::*;
pub use strategies::*;
pub use types::*;

use tracing::{info, warn};

use crate::config::{OptimizerConfig, StrategyKind};

/// Runs the configured strategy behind the feasibility pre-check
pub struct DispatchOptimizer {
    pub strategy: Box<dyn DispatchStrategy>,
}

impl DispatchOptimizer {
    pub fn new(strategy: Box<dyn DispatchStrategy>) -> Self {
        Self { strategy }
    }

    pub fn from_config(cfg: &OptimizerConfig) -> Self {
        let strategy: Box<dyn DispatchStrategy> = match cfg.strategy {
            StrategyKind::Quadratic => Box::new(QuadraticStrategy::new(cfg.admm.clone())),
            StrategyKind::Linear => Box::new(LinearStrategy::new()),
        };
        Self::new(strategy)
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn optimize(&self, problem: &DispatchProblem) -> Result<DispatchSolution, DispatchError> {
        problem.validate()?;
        if let Err(e) = problem.check_feasibility() {
            warn!(strategy = self.strategy.name(), error = %e, "skipping solver");
            return Err(e);
        }
        let solution = self.strategy.solve(problem)?;
        info!(
            strategy = self.strategy.name(),
            objective = solution.objective,
            iterations = solution.iterations,
            "dispatch optimized"
        );
        Ok(solution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MicrogridMode;
    use crate::optimizer::problem::tests::{battery_params, scenario};

    struct Unreachable;

    impl DispatchStrategy for Unreachable {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        fn solve(&self, _problem: &DispatchProblem) -> Result<DispatchSolution, DispatchError> {
            panic!("solver must not run on an infeasible problem");
        }
    }

    #[test]
    fn test_infeasible_problem_never_reaches_solver() {
        let optimizer = DispatchOptimizer::new(Box::new(Unreachable));
        let problem = scenario(MicrogridMode::Islanded, 0.0, battery_params(0.55));
        let err = optimizer.optimize(&problem).unwrap_err();
        assert_eq!(err.status(), Some(SolveStatus::Infeasible));
    }

    #[test]
    fn test_strategy_from_config() {
        let mut cfg = OptimizerConfig::default();
        assert_eq!(DispatchOptimizer::from_config(&cfg).strategy_name(), "quadratic");
        cfg.strategy = StrategyKind::Linear;
        assert_eq!(DispatchOptimizer::from_config(&cfg).strategy_name(), "linear");
    }
}
