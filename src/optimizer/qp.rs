//! Convex quadratic programs and an ADMM solver for them.
//!
//! Problems take the form
//!
//! ```text
//! minimise   0.5 x'Px + q'x
//! subject to l <= Ax <= u
//! ```
//!
//! with `P` positive semidefinite. Equality rows use `l == u`, one-sided rows
//! use an infinite bound. The solver follows the operator-splitting scheme of
//! OSQP: Ruiz equilibration of the data, one cached factorisation of
//! `P + sigma I + A' diag(rho) A`, relaxed iterates and step-size adaptation.
//! Stopping is judged on the unscaled problem. Degenerate problems, where
//! several rows meet at the optimum, are finished by polishing: the active
//! set read off the iterates is solved exactly and kept only if the result
//! passes the KKT conditions. A primal infeasibility certificate comes from
//! successive dual iterates.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use tracing::{debug, warn};

use super::types::SolveStatus;
use crate::config::AdmmConfig;

const RHO_MIN: f64 = 1e-6;
const RHO_MAX: f64 = 1e6;
const RHO_EQ_SCALE: f64 = 1e3;
const RHO_ADAPT_RATIO: f64 = 5.0;
const DIV_GUARD: f64 = 1e-10;
const MIN_SCALING: f64 = 1e-4;
const MAX_SCALING: f64 = 1e4;
const POLISH_DELTA: f64 = 1e-6;
const POLISH_REFINE_STEPS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct QpProblem {
    pub p: DMatrix<f64>,
    pub q: DVector<f64>,
    pub a: DMatrix<f64>,
    pub l: DVector<f64>,
    pub u: DVector<f64>,
}

impl QpProblem {
    pub fn n(&self) -> usize {
        self.q.len()
    }

    pub fn m(&self) -> usize {
        self.l.len()
    }

    pub fn objective(&self, x: &DVector<f64>) -> f64 {
        0.5 * x.dot(&(&self.p * x)) + self.q.dot(x)
    }

    pub fn validate(&self) -> Result<(), String> {
        let (n, m) = (self.n(), self.m());
        if self.p.shape() != (n, n) {
            return Err(format!("P is {:?}, expected {}x{}", self.p.shape(), n, n));
        }
        if self.a.shape() != (m, n) {
            return Err(format!("A is {:?}, expected {}x{}", self.a.shape(), m, n));
        }
        if self.u.len() != m {
            return Err(format!("u has {} rows, expected {}", self.u.len(), m));
        }
        if let Some(i) = (0..m).find(|&i| self.l[i].is_nan() || self.u[i].is_nan() || self.l[i] > self.u[i]) {
            return Err(format!("row {} has bounds [{}, {}]", i, self.l[i], self.u[i]));
        }
        if self.p.iter().chain(self.q.iter()).chain(self.a.iter()).any(|v| !v.is_finite()) {
            return Err("problem data is not finite".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QpSolution {
    pub status: SolveStatus,
    pub x: DVector<f64>,
    /// Constraint multipliers
    pub y: DVector<f64>,
    pub iterations: usize,
    pub primal_residual: f64,
    pub dual_residual: f64,
}

/// Narrow boundary to a QP solver
pub trait QpSolver: Send + Sync {
    fn solve(&self, problem: &QpProblem) -> QpSolution;
}

#[derive(Debug, Clone, Default)]
pub struct AdmmSolver {
    settings: AdmmConfig,
}

fn inf_norm(v: &DVector<f64>) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}

impl AdmmSolver {
    pub fn new(settings: AdmmConfig) -> Self {
        Self { settings }
    }

    fn row_rho(&self, problem: &QpProblem, rho: f64) -> DVector<f64> {
        DVector::from_fn(problem.m(), |i, _| {
            let (l, u) = (problem.l[i], problem.u[i]);
            if l == f64::NEG_INFINITY && u == f64::INFINITY {
                RHO_MIN
            } else if (u - l).abs() < 1e-9 {
                (rho * RHO_EQ_SCALE).min(RHO_MAX)
            } else {
                rho
            }
        })
    }

    fn factor(&self, problem: &QpProblem, rho: &DVector<f64>) -> Option<Cholesky<f64, Dyn>> {
        let n = problem.n();
        let kkt = &problem.p
            + DMatrix::identity(n, n) * self.settings.sigma
            + problem.a.transpose() * DMatrix::from_diagonal(rho) * &problem.a;
        Cholesky::new(kkt)
    }

    /// `u'max(dy, 0) + l'min(dy, 0)`, or `None` when an infinite bound makes
    /// `dy` useless as a certificate.
    fn support(problem: &QpProblem, dy: &DVector<f64>) -> Option<f64> {
        let mut total = 0.0;
        for i in 0..problem.m() {
            if dy[i] > 0.0 {
                if !problem.u[i].is_finite() {
                    return None;
                }
                total += problem.u[i] * dy[i];
            } else if dy[i] < 0.0 {
                if !problem.l[i].is_finite() {
                    return None;
                }
                total += problem.l[i] * dy[i];
            }
        }
        Some(total)
    }

    fn primal_infeasible(&self, problem: &QpProblem, at: &DMatrix<f64>, dy: &DVector<f64>) -> bool {
        let norm = inf_norm(dy);
        if norm <= DIV_GUARD {
            return false;
        }
        let eps = self.settings.eps_infeasible * norm;
        if inf_norm(&(at * dy)) > eps {
            return false;
        }
        matches!(Self::support(problem, dy), Some(s) if s < -eps)
    }

    fn residuals(&self, problem: &QpProblem, x: &DVector<f64>, z: &DVector<f64>, y: &DVector<f64>) -> Residuals {
        let s = &self.settings;
        let ax = &problem.a * x;
        let px = &problem.p * x;
        let aty = problem.a.tr_mul(y);
        let prim_scale = inf_norm(&ax).max(inf_norm(z));
        let dual_scale = inf_norm(&px).max(inf_norm(&aty)).max(inf_norm(&problem.q));
        Residuals {
            r_prim: inf_norm(&(&ax - z)),
            r_dual: inf_norm(&(&px + &problem.q + &aty)),
            eps_prim: s.eps_abs + s.eps_rel * prim_scale,
            eps_dual: s.eps_abs + s.eps_rel * dual_scale,
        }
    }

    /// Solves the equality-constrained problem on the guessed active set and
    /// keeps the result only if it is primal feasible and stationary with
    /// correctly signed multipliers.
    fn polish(
        &self,
        problem: &QpProblem,
        scaled: &QpProblem,
        scaling: &Scaling,
        active: &[Option<Bound>],
    ) -> Option<Polished> {
        let n = scaled.n();
        let rows: Vec<(usize, Bound)> = active
            .iter()
            .enumerate()
            .filter_map(|(i, bound)| bound.map(|b| (i, b)))
            .collect();
        let size = n + rows.len();

        let mut kkt = DMatrix::zeros(size, size);
        for i in 0..n {
            for j in 0..n {
                kkt[(i, j)] = scaled.p[(i, j)];
            }
        }
        let mut rhs = DVector::zeros(size);
        for i in 0..n {
            rhs[i] = -scaled.q[i];
        }
        for (k, &(row, bound)) in rows.iter().enumerate() {
            for j in 0..n {
                kkt[(n + k, j)] = scaled.a[(row, j)];
                kkt[(j, n + k)] = scaled.a[(row, j)];
            }
            rhs[n + k] = match bound {
                Bound::Lower => scaled.l[row],
                Bound::Upper => scaled.u[row],
            };
        }

        // quasi-definite regularisation, then refinement against the exact system
        let mut regularised = kkt.clone();
        for i in 0..size {
            regularised[(i, i)] += if i < n { POLISH_DELTA } else { -POLISH_DELTA };
        }
        let lu = regularised.lu();
        let mut sol = lu.solve(&rhs)?;
        for _ in 0..POLISH_REFINE_STEPS {
            let correction = lu.solve(&(&rhs - &kkt * &sol))?;
            sol += correction;
        }
        if sol.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let mut y_scaled = DVector::zeros(scaled.m());
        for (k, &(row, bound)) in rows.iter().enumerate() {
            let value = sol[n + k];
            y_scaled[row] = if is_equality(scaled, row) {
                value
            } else {
                match bound {
                    Bound::Lower => value.min(0.0),
                    Bound::Upper => value.max(0.0),
                }
            };
        }
        let x = scaling.unscale_x(&sol.rows(0, n).into_owned());
        let y = scaling.unscale_y(&y_scaled);
        let ax = &problem.a * &x;
        let z = DVector::from_fn(problem.m(), |i, _| ax[i].clamp(problem.l[i], problem.u[i]));
        let check = self.residuals(problem, &x, &z, &y);
        if !check.converged() {
            debug!(r_prim = check.r_prim, r_dual = check.r_dual, rows = rows.len(), "polish rejected");
            return None;
        }
        Some(Polished {
            x,
            y,
            residuals: (check.r_prim, check.r_dual),
        })
    }

    fn finish(
        status: SolveStatus,
        x: DVector<f64>,
        y: DVector<f64>,
        iterations: usize,
        residuals: (f64, f64),
    ) -> QpSolution {
        QpSolution {
            status,
            x,
            y,
            iterations,
            primal_residual: residuals.0,
            dual_residual: residuals.1,
        }
    }
}

/// Residuals of an unscaled iterate against their stopping tolerances
struct Residuals {
    r_prim: f64,
    r_dual: f64,
    eps_prim: f64,
    eps_dual: f64,
}

impl Residuals {
    fn converged(&self) -> bool {
        self.r_prim <= self.eps_prim && self.r_dual <= self.eps_dual
    }

    /// How many tolerances away from convergence, 1.0 or less is converged.
    fn score(&self) -> f64 {
        (self.r_prim / self.eps_prim).max(self.r_dual / self.eps_dual)
    }
}

struct BestIterate {
    score: f64,
    x: DVector<f64>,
    y: DVector<f64>,
    residuals: (f64, f64),
}

struct Polished {
    x: DVector<f64>,
    y: DVector<f64>,
    residuals: (f64, f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Lower,
    Upper,
}

fn is_equality(problem: &QpProblem, row: usize) -> bool {
    (problem.u[row] - problem.l[row]).abs() < 1e-9
}

/// Rows whose multiplier pushes the iterate onto a bound.
fn active_set(problem: &QpProblem, z: &DVector<f64>, y: &DVector<f64>) -> Vec<Option<Bound>> {
    (0..problem.m())
        .map(|i| {
            if z[i] - problem.l[i] < -y[i] {
                Some(Bound::Lower)
            } else if problem.u[i] - z[i] < y[i] {
                Some(Bound::Upper)
            } else {
                None
            }
        })
        .collect()
}

/// Diagonal equilibration `P <- D P D`, `q <- D q`, `A <- E A D`,
/// `l, u <- E l, E u`. Iterates map back as `x = D x'`, `z = z' / E`,
/// `y = E y'`.
struct Scaling {
    d: DVector<f64>,
    e: DVector<f64>,
}

fn limit_scaling(norm: f64) -> f64 {
    if norm < MIN_SCALING {
        1.0
    } else {
        norm.min(MAX_SCALING)
    }
}

fn abs_max<'a>(values: impl Iterator<Item = &'a f64>) -> f64 {
    values.fold(0.0, |acc, v| acc.max(v.abs()))
}

impl Scaling {
    fn ruiz(problem: &QpProblem, iterations: usize) -> (QpProblem, Self) {
        let (n, m) = (problem.n(), problem.m());
        let mut scaled = problem.clone();
        let mut d = DVector::from_element(n, 1.0);
        let mut e = DVector::from_element(m, 1.0);

        for _ in 0..iterations {
            let d_step = DVector::from_fn(n, |j, _| {
                let norm = abs_max(scaled.p.column(j).iter().chain(scaled.a.column(j).iter()));
                1.0 / limit_scaling(norm).sqrt()
            });
            let e_step = DVector::from_fn(m, |i, _| 1.0 / limit_scaling(abs_max(scaled.a.row(i).iter())).sqrt());

            for i in 0..n {
                for j in 0..n {
                    scaled.p[(i, j)] *= d_step[i] * d_step[j];
                }
            }
            for i in 0..m {
                for j in 0..n {
                    scaled.a[(i, j)] *= e_step[i] * d_step[j];
                }
            }
            scaled.q.component_mul_assign(&d_step);
            d.component_mul_assign(&d_step);
            e.component_mul_assign(&e_step);
        }

        scaled.l = problem.l.component_mul(&e);
        scaled.u = problem.u.component_mul(&e);
        (scaled, Self { d, e })
    }

    fn unscale_x(&self, x: &DVector<f64>) -> DVector<f64> {
        x.component_mul(&self.d)
    }

    fn unscale_z(&self, z: &DVector<f64>) -> DVector<f64> {
        z.component_div(&self.e)
    }

    fn unscale_y(&self, y: &DVector<f64>) -> DVector<f64> {
        y.component_mul(&self.e)
    }
}

impl QpSolver for AdmmSolver {
    fn solve(&self, problem: &QpProblem) -> QpSolution {
        let (n, m) = (problem.n(), problem.m());
        let s = &self.settings;
        let mut x = DVector::zeros(n);
        let mut z = DVector::zeros(m);
        let mut y = DVector::zeros(m);

        if let Err(reason) = problem.validate() {
            warn!(reason = %reason, "rejecting malformed QP");
            return Self::finish(SolveStatus::NumericalError, x, y, 0, (f64::NAN, f64::NAN));
        }

        let (scaled, scaling) = Scaling::ruiz(problem, s.scaling_iterations);
        let mut rho = s.rho.clamp(RHO_MIN, RHO_MAX);
        let mut rho_vec = self.row_rho(&scaled, rho);
        let Some(mut chol) = self.factor(&scaled, &rho_vec) else {
            warn!("KKT matrix is not positive definite");
            return Self::finish(SolveStatus::NumericalError, x, y, 0, (f64::NAN, f64::NAN));
        };
        let at = scaled.a.transpose();
        let at_orig = problem.a.transpose();
        let check_every = s.check_every.max(1);
        let mut residuals = (f64::INFINITY, f64::INFINITY);
        let mut best: Option<BestIterate> = None;
        let mut last_active: Option<Vec<Option<Bound>>> = None;
        let mut polished: Option<Vec<Option<Bound>>> = None;

        for iter in 1..=s.max_iterations {
            let rhs = &x * s.sigma - &scaled.q + &at * (rho_vec.component_mul(&z) - &y);
            let x_tilde = chol.solve(&rhs);
            let z_tilde = &scaled.a * &x_tilde;

            let x_next = &x_tilde * s.alpha + &x * (1.0 - s.alpha);
            let z_relaxed = &z_tilde * s.alpha + &z * (1.0 - s.alpha);
            let shifted = &z_relaxed + y.component_div(&rho_vec);
            let z_next = DVector::from_fn(m, |i, _| shifted[i].clamp(scaled.l[i], scaled.u[i]));
            let y_next = &y + rho_vec.component_mul(&(&z_relaxed - &z_next));

            let dy = scaling.unscale_y(&(&y_next - &y));
            x = x_next;
            z = z_next;
            y = y_next;

            if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
                warn!(iteration = iter, "ADMM iterates diverged");
                return Self::finish(
                    SolveStatus::NumericalError,
                    scaling.unscale_x(&x),
                    scaling.unscale_y(&y),
                    iter,
                    residuals,
                );
            }

            if iter % check_every != 0 && iter != s.max_iterations {
                continue;
            }

            let (x_orig, y_orig) = (scaling.unscale_x(&x), scaling.unscale_y(&y));
            let check = self.residuals(problem, &x_orig, &scaling.unscale_z(&z), &y_orig);
            residuals = (check.r_prim, check.r_dual);

            if check.converged() {
                debug!(iterations = iter, r_prim = check.r_prim, r_dual = check.r_dual, rho, "ADMM converged");
                return Self::finish(SolveStatus::Solved, x_orig, y_orig, iter, residuals);
            }
            if self.primal_infeasible(problem, &at_orig, &dy) {
                debug!(iterations = iter, "primal infeasibility certificate found");
                return Self::finish(SolveStatus::Infeasible, x_orig, y_orig, iter, residuals);
            }

            let score = check.score();
            if best.as_ref().map_or(true, |b| score < b.score) {
                best = Some(BestIterate {
                    score,
                    x: x_orig.clone(),
                    y: y_orig.clone(),
                    residuals,
                });
            }

            if s.polish {
                let active = active_set(&scaled, &z, &y);
                if last_active.as_ref() == Some(&active) && polished.as_ref() != Some(&active) {
                    if let Some(p) = self.polish(problem, &scaled, &scaling, &active) {
                        debug!(iterations = iter, r_prim = p.residuals.0, r_dual = p.residuals.1, "polished solution accepted");
                        return Self::finish(SolveStatus::Solved, p.x, p.y, iter, p.residuals);
                    }
                    polished = Some(active.clone());
                }
                last_active = Some(active);
            }

            // step size adapts in the scaled space the iterates live in
            let ax = &scaled.a * &x;
            let px = &scaled.p * &x;
            let aty = &at * &y;
            let r_prim = inf_norm(&(&ax - &z));
            let r_dual = inf_norm(&(&px + &scaled.q + &aty));
            let prim_scale = inf_norm(&ax).max(inf_norm(&z));
            let dual_scale = inf_norm(&px).max(inf_norm(&aty)).max(inf_norm(&scaled.q));
            let ratio = (r_prim / (prim_scale + DIV_GUARD)) / (r_dual / (dual_scale + DIV_GUARD) + DIV_GUARD);
            let rho_new = (rho * ratio.sqrt()).clamp(RHO_MIN, RHO_MAX);
            if rho_new > rho * RHO_ADAPT_RATIO || rho_new < rho / RHO_ADAPT_RATIO {
                rho = rho_new;
                rho_vec = self.row_rho(&scaled, rho);
                chol = match self.factor(&scaled, &rho_vec) {
                    Some(c) => c,
                    None => {
                        warn!(iteration = iter, rho, "refactorisation failed");
                        return Self::finish(
                            SolveStatus::NumericalError,
                            x_orig,
                            y_orig,
                            iter,
                            residuals,
                        );
                    }
                };
            }
        }

        if let Some(best) = best.filter(|b| b.score <= s.loose_factor) {
            warn!(
                iterations = s.max_iterations,
                r_prim = best.residuals.0,
                r_dual = best.residuals.1,
                score = best.score,
                "iteration limit reached, accepting best iterate within loose tolerance"
            );
            return Self::finish(SolveStatus::Solved, best.x, best.y, s.max_iterations, best.residuals);
        }
        warn!(iterations = s.max_iterations, r_prim = residuals.0, r_dual = residuals.1, "ADMM hit iteration limit");
        Self::finish(
            SolveStatus::MaxIterations,
            scaling.unscale_x(&x),
            scaling.unscale_y(&y),
            s.max_iterations,
            residuals,
        )
    }
}
