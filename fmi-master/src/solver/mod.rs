//! Root finders for algebraic loops.
//!
//! The residual of a coupled loop is expensive: every evaluation is a network round trip
//! through all implicated slaves. The solvers here therefore never ask for an analytic Jacobian
//! and try to keep the number of evaluations low.

mod broyden;
mod fixed_point;

pub use broyden::{Broyden, InitialJacobian};
pub use fixed_point::FixedPoint;

use crate::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Norm {
    #[default]
    Euclidean,
    Max,
}

impl Norm {
    pub fn of(self, values: &[f64]) -> f64 {
        match self {
            Norm::Euclidean => values.iter().map(|v| v * v).sum::<f64>().sqrt(),
            Norm::Max => values.iter().fold(0.0, |acc, v| acc.max(v.abs())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverOptions {
    /// Converged once the residual norm is at or below this value.
    pub tolerance: f64,
    /// Upper bound on solver iterations.
    pub max_iterations: usize,
    /// Relative perturbation used for finite-difference Jacobians.
    pub fd_step: f64,
    pub norm: Norm,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 50,
            fd_step: 1e-7,
            norm: Norm::Euclidean,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveReport {
    pub iterations: usize,
    /// Number of residual evaluations, including finite-difference probes.
    pub evaluations: usize,
    pub residual_norm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    MaxIterations,
    SingularJacobian,
    NonFinite,
}

/// A loop that could not be solved to tolerance.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error(
    "Loop solver did not converge ({reason:?}) after {iterations} iteration(s) and {evaluations} evaluation(s), residual norm {residual_norm:e}"
)]
pub struct ConvergenceFailure {
    /// Labels of the unknowns, filled in by the coordinator.
    pub unknowns: Vec<String>,
    pub residual: Vec<f64>,
    pub residual_norm: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub reason: FailureReason,
}

/// Residual function: evaluate `f(x)` into the second argument.
pub type Residual<'a> = dyn FnMut(&[f64], &mut [f64]) -> Result<(), Error> + 'a;

/// A derivative-free nonlinear solver.
pub trait RootFinder: Send {
    /// Find `x` with `residual(x) == 0`, starting from the value `x` holds.
    ///
    /// On success `x` holds the root and the last residual evaluation was made at exactly that
    /// point. On failure `x` holds the last iterate. Errors raised by `residual` abort the solve
    /// and are returned unchanged.
    fn solve(
        &mut self,
        residual: &mut Residual<'_>,
        x: &mut [f64],
        options: &SolverOptions,
    ) -> Result<SolveReport, Error>;
}
