//! Errors of the simulation and sensitivity engine.
//!
//! Structural and configuration errors abort the current operation. Numerical
//! failures ([`OptimError::is_numerical`]) are recoverable: the optimizer
//! reports them to the NLP solver as "not evaluable" instead of an error.

use thiserror::Error;
use transflow_core::TransflowError;

#[derive(Debug, Error)]
pub enum OptimError {
    #[error(transparent)]
    Core(#[from] TransflowError),

    #[error("Singular matrix: no usable pivot in column {column}")]
    SingularMatrix { column: usize },

    #[error("Singular new-state derivative in the step ending at t = {time}")]
    SingularStep { time: f64 },

    #[error("Newton iteration failed at t = {time} after {iterations} iterations (residual {residual:e})")]
    NewtonFailure {
        time: f64,
        iterations: usize,
        residual: f64,
    },

    #[error("Sparsity pattern changed: entry ({row}, {column}) was not part of the assembled pattern")]
    PatternMismatch { row: usize, column: usize },

    #[error("Entry ({row}, {column}) lies outside a {rows}x{columns} matrix")]
    EntryOutOfBounds {
        row: usize,
        column: usize,
        rows: usize,
        columns: usize,
    },

    #[error("Dimension mismatch for {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Incompatible structure: {0}")]
    IncompatibleStructure(String),

    #[error("Invalid optimization setup: {0}")]
    InvalidSetup(String),
}

pub type OptimResult<T> = Result<T, OptimError>;

impl OptimError {
    /// Whether the error stems from a failed solve rather than from misuse.
    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            OptimError::SingularMatrix { .. }
                | OptimError::SingularStep { .. }
                | OptimError::NewtonFailure { .. }
        )
    }
}
