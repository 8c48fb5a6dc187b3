use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

use super::problem::DispatchProblem;
use crate::domain::{DispatchMap, LoadKind};

/// Terminal state reported by a solver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    Solved,
    Infeasible,
    MaxIterations,
    NumericalError,
}

#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("no {0} request in this cycle")]
    MissingKind(LoadKind),
    #[error("invalid dispatch input: {0}")]
    InvalidInput(String),
    #[error("dispatch problem is infeasible: {0}")]
    Infeasible(String),
    #[error("solver stopped with status {status} after {iterations} iterations")]
    NotSolved { status: SolveStatus, iterations: usize },
}

impl DispatchError {
    /// Solver status this error corresponds to, if the problem reached a solver.
    pub fn status(&self) -> Option<SolveStatus> {
        match self {
            DispatchError::MissingKind(_) | DispatchError::InvalidInput(_) => None,
            DispatchError::Infeasible(_) => Some(SolveStatus::Infeasible),
            DispatchError::NotSolved { status, .. } => Some(*status),
        }
    }
}

/// Allocation for one solved cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSolution {
    pub dispatch: DispatchMap,
    /// Value of the strategy's own objective at the returned point
    pub objective: f64,
    pub iterations: usize,
}

/// A way of turning a dispatch problem into per-client allocations
pub trait DispatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn solve(&self, problem: &DispatchProblem) -> Result<DispatchSolution, DispatchError>;
}
