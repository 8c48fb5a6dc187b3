//! Linear dispatch: minimise weighted shortfall `sum w[i,j] * (r[i,j] - x[i,j])`
//! over the same bounds and constraints as the quadratic strategy.

#[cfg(feature = "optimization")]
use good_lp::{
    constraint, default_solver, variable, Expression, ProblemVariables, ResolutionError, Solution, SolverModel,
};
use tracing::info;
#[cfg(feature = "optimization")]
use tracing::warn;

use crate::optimizer::problem::DispatchProblem;
#[cfg(feature = "optimization")]
use crate::optimizer::types::SolveStatus;
use crate::optimizer::types::{DispatchError, DispatchSolution, DispatchStrategy};

#[derive(Debug, Clone, Copy, Default)]
pub struct LinearStrategy;

impl LinearStrategy {
    pub fn new() -> Self {
        Self
    }

    /// `sum w * (r - x)` at the given point.
    pub fn shortfall(problem: &DispatchProblem, x: &[f64]) -> f64 {
        problem
            .loads
            .iter()
            .enumerate()
            .flat_map(|(i, load)| {
                (0..problem.horizon)
                    .map(move |j| problem.weight(i, j) * (load.requested[j] - x[problem.load_var(i, j)]))
            })
            .sum()
    }

    #[cfg(feature = "optimization")]
    fn solve_lp(&self, problem: &DispatchProblem) -> Result<Vec<f64>, DispatchError> {
        let h = problem.horizon;
        let mut vars = ProblemVariables::new();

        let loads: Vec<Vec<good_lp::Variable>> = problem
            .loads
            .iter()
            .map(|load| {
                load.requested
                    .iter()
                    .map(|r| vars.add(variable().min(0.0).max(*r)))
                    .collect()
            })
            .collect();
        let rating = problem.battery.params.rating;
        let battery = vars.add_vector(variable().min(-rating).max(rating), h);

        // maximising served weighted power is the same as minimising shortfall
        let served = (0..problem.loads.len())
            .flat_map(|i| (0..h).map(move |j| (i, j)))
            .map(|(i, j)| problem.weight(i, j) * loads[i][j])
            .sum::<Expression>();

        let mut model = vars.maximise(served).using(default_solver);

        for j in 0..h {
            let step = loads.iter().map(|l| Expression::from(l[j])).sum::<Expression>() + battery[j];
            model = model.with(constraint!(step <= problem.supply[j]));
        }

        let (band_lo, band_hi, target) = problem.battery.cumulative_window();
        for j in 0..h {
            let cumulative = battery[..=j].iter().map(|b| Expression::from(*b)).sum::<Expression>();
            model = model.with(constraint!(cumulative.clone() >= band_lo));
            model = model.with(constraint!(cumulative <= band_hi));
        }
        let total = battery.iter().map(|b| Expression::from(*b)).sum::<Expression>();
        model = model.with(constraint!(total == target));

        let solution = model.solve().map_err(|e| match e {
            ResolutionError::Infeasible => DispatchError::Infeasible("linear program has no solution".into()),
            other => {
                warn!(error = %other, "linear solver failed");
                DispatchError::NotSolved {
                    status: SolveStatus::NumericalError,
                    iterations: 0,
                }
            }
        })?;

        let mut x = vec![0.0; problem.n_vars()];
        for (i, row) in loads.iter().enumerate() {
            for (j, var) in row.iter().enumerate() {
                x[problem.load_var(i, j)] = solution.value(*var);
            }
        }
        for (j, var) in battery.iter().enumerate() {
            x[problem.battery_var(j)] = solution.value(*var);
        }
        Ok(x)
    }

    #[cfg(not(feature = "optimization"))]
    fn solve_lp(&self, _problem: &DispatchProblem) -> Result<Vec<f64>, DispatchError> {
        Err(DispatchError::InvalidInput(
            "linear dispatch requires the 'optimization' feature".into(),
        ))
    }
}

impl DispatchStrategy for LinearStrategy {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn solve(&self, problem: &DispatchProblem) -> Result<DispatchSolution, DispatchError> {
        let x = self.solve_lp(problem)?;
        let objective = Self::shortfall(problem, &x);
        info!(objective, "linear dispatch solved");
        Ok(DispatchSolution {
            dispatch: problem.assemble(&x),
            objective,
            iterations: 0,
        })
    }
}
