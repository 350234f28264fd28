//! Error types for condensing, sensitivity analysis and hybrid control.
//!
//! Expected optimization outcomes (an infeasible initial state, a solver
//! hitting its time limit) are *not* errors: they are reported through
//! [`SolveStatus`](crate::optimization::SolveStatus),
//! [`MipStatus`](crate::mip::MipStatus) and NaN-filled solutions.

use ndarray_linalg::error::LinalgError;
use thiserror::Error;

/// Errors raised by the crate.
#[derive(Debug, Error)]
pub enum MpcError {
    /// A sequence, vector or matrix does not have the expected shape.
    #[error("Dimension mismatch in {context}: expected {expected}, got {got}")]
    Dimension {
        context: String,
        expected: usize,
        got: usize,
    },

    /// An internal invariant of the condensed program does not hold.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The KKT system of an active set cannot be inverted.
    #[error("Singular active set {active_set:?}: {reason}")]
    SingularActiveSet {
        active_set: Vec<usize>,
        reason: String,
    },

    /// An auxiliary program that must be bounded is not (e.g. an unbounded mode domain).
    #[error("Unbounded program: {0}")]
    Unbounded(String),

    /// The numerical backend failed for reasons other than infeasibility.
    #[error("Solver failure: {0}")]
    Solver(String),

    /// The explicit solution was queried before being computed.
    #[error("Explicit solution not available, call `compute_explicit_solution` first")]
    ExplicitSolutionUnavailable,

    /// The requested operation does not exist for this kind of program.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Linear algebra error: {0}")]
    Linalg(#[from] LinalgError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MpcError {
    /// Shorthand for a [`MpcError::Dimension`] error.
    pub fn dimension(context: impl Into<String>, expected: usize, got: usize) -> Self {
        MpcError::Dimension {
            context: context.into(),
            expected,
            got,
        }
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, MpcError>;
