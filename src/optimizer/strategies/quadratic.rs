//! Quadratic dispatch: penalise weighted squared shortfall of each load.
//!
//! Rows of the constraint matrix, in order:
//! - per-step supply cap `sum_i x[i,j] <= Psupply[j]`
//! - per-step cumulative battery power inside the SoC band (scaled by `Cbattery`)
//! - terminal cumulative battery power landing on `SoCend`
//! - one box row per variable

use nalgebra::{DMatrix, DVector};
use tracing::{info, warn};

use crate::config::AdmmConfig;
use crate::optimizer::problem::DispatchProblem;
use crate::optimizer::qp::{AdmmSolver, QpProblem, QpSolver};
use crate::optimizer::types::{DispatchError, DispatchSolution, DispatchStrategy, SolveStatus};

pub struct QuadraticStrategy {
    solver: Box<dyn QpSolver>,
}

impl QuadraticStrategy {
    pub fn new(settings: AdmmConfig) -> Self {
        Self::with_solver(Box::new(AdmmSolver::new(settings)))
    }

    pub fn with_solver(solver: Box<dyn QpSolver>) -> Self {
        Self { solver }
    }

    /// Lower and upper bound of every decision variable.
    pub fn variable_bounds(problem: &DispatchProblem) -> (Vec<f64>, Vec<f64>) {
        let n = problem.n_vars();
        let mut lower = vec![0.0; n];
        let mut upper = vec![0.0; n];
        for (i, load) in problem.loads.iter().enumerate() {
            for j in 0..problem.horizon {
                upper[problem.load_var(i, j)] = load.requested[j];
            }
        }
        let rating = problem.battery.params.rating;
        for j in 0..problem.horizon {
            lower[problem.battery_var(j)] = -rating;
            upper[problem.battery_var(j)] = rating;
        }
        (lower, upper)
    }

    pub fn formulate(problem: &DispatchProblem) -> QpProblem {
        let h = problem.horizon;
        let n = problem.n_vars();
        let m = 2 * h + 1 + n;

        let mut p = DMatrix::zeros(n, n);
        let mut q = DVector::zeros(n);
        for (i, load) in problem.loads.iter().enumerate() {
            for j in 0..h {
                let v = problem.load_var(i, j);
                let w = problem.weight(i, j);
                p[(v, v)] = w;
                q[v] = -w * load.requested[j];
            }
        }

        let mut a = DMatrix::zeros(m, n);
        let mut l = DVector::from_element(m, f64::NEG_INFINITY);
        let mut u = DVector::from_element(m, f64::INFINITY);

        for j in 0..h {
            for i in 0..problem.loads.len() {
                a[(j, problem.load_var(i, j))] = 1.0;
            }
            a[(j, problem.battery_var(j))] = 1.0;
            u[j] = problem.supply[j];
        }

        let (band_lo, band_hi, target) = problem.battery.cumulative_window();
        for j in 0..h {
            let row = h + j;
            for k in 0..=j {
                a[(row, problem.battery_var(k))] = 1.0;
            }
            l[row] = band_lo;
            u[row] = band_hi;
        }

        let terminal = 2 * h;
        for k in 0..h {
            a[(terminal, problem.battery_var(k))] = 1.0;
        }
        l[terminal] = target;
        u[terminal] = target;

        let (lower, upper) = Self::variable_bounds(problem);
        for v in 0..n {
            let row = terminal + 1 + v;
            a[(row, v)] = 1.0;
            l[row] = lower[v];
            u[row] = upper[v];
        }

        QpProblem { p, q, a, l, u }
    }
}

impl DispatchStrategy for QuadraticStrategy {
    fn name(&self) -> &'static str {
        "quadratic"
    }

    fn solve(&self, problem: &DispatchProblem) -> Result<DispatchSolution, DispatchError> {
        let qp = Self::formulate(problem);
        let solution = self.solver.solve(&qp);
        match solution.status {
            SolveStatus::Solved => {}
            SolveStatus::Infeasible => {
                warn!(iterations = solution.iterations, "QP reported infeasible");
                return Err(DispatchError::Infeasible("solver found an infeasibility certificate".into()));
            }
            status => {
                return Err(DispatchError::NotSolved {
                    status,
                    iterations: solution.iterations,
                })
            }
        }

        // ADMM iterates satisfy the boxes only up to tolerance
        let (lower, upper) = Self::variable_bounds(problem);
        let x: Vec<f64> = solution
            .x
            .iter()
            .enumerate()
            .map(|(v, value)| value.clamp(lower[v], upper[v]))
            .collect();
        let objective = problem.shortfall_cost(&x);
        info!(
            iterations = solution.iterations,
            objective,
            r_prim = solution.primal_residual,
            r_dual = solution.dual_residual,
            "quadratic dispatch solved"
        );
        Ok(DispatchSolution {
            dispatch: problem.assemble(&x),
            objective,
            iterations: solution.iterations,
        })
    }
}
