//! Error types surfaced to the receding-horizon loop.

use thiserror::Error;

use crate::types::Float;

/// Errors that can occur while building or running the controller.
///
/// `ModelSingularity` and `DimensionMismatch` indicate a broken model or a
/// programming error and abort the whole run. `IntegratorNonconvergence` and
/// `QpInfeasible` are numerical conditions that only invalidate the current
/// control step.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NmpcError {
    /// Mass matrix failed to invert at the current configuration.
    #[error("mass matrix is singular at the current configuration")]
    ModelSingularity,

    /// Implicit stage solve ran out of its iteration budget.
    #[error("stage solve did not converge: residual {residual:e} after {iters} iterations")]
    IntegratorNonconvergence {
        /// Residual norm when the budget ran out.
        residual: Float,
        /// Number of Newton iterations taken.
        iters: usize,
    },

    /// The QP solver reported infeasibility or a numerical failure.
    #[error("QP solve failed with status {status}")]
    QpInfeasible {
        /// Solver status as reported by the backend.
        status: String,
    },

    /// Malformed input shape.
    #[error("dimension mismatch in {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// What was being checked.
        what: &'static str,
        /// Expected dimension.
        expected: usize,
        /// Actual dimension.
        actual: usize,
    },
}
