//! Error type shared by the transflow crates.
//!
//! Structural mismatches, out-of-range accesses and schema violations are
//! programmer or configuration errors. They are always reported through
//! [`TransflowError`] and never silently coerced.

use thiserror::Error;

/// Errors raised by grids, interpolating vectors and configuration documents.
#[derive(Error, Debug)]
pub enum TransflowError {
    /// Two objects that must share a layout do not.
    #[error("Incompatible structure: {0}")]
    IncompatibleStructure(String),

    /// A time lies outside the grid span by more than the tolerance.
    #[error("Time {time} lies outside the interpolation span [{first}, {last}]")]
    OutOfRange { time: f64, first: f64, last: f64 },

    /// A node index does not address stored data.
    #[error("Index {index} out of range for {len} interpolation points")]
    Index { index: usize, len: usize },

    /// Grid construction parameters are inconsistent.
    #[error("Invalid time grid: {0}")]
    InvalidGrid(String),

    /// A configuration document violates its schema.
    #[error("Schema violation in document \"{id}\" at \"{pointer}\": {message}")]
    Schema {
        id: String,
        pointer: String,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience type alias for results using [`TransflowError`].
pub type TransflowResult<T> = Result<T, TransflowError>;

impl TransflowError {
    pub(crate) fn schema(id: &str, pointer: impl Into<String>, message: impl Into<String>) -> Self {
        TransflowError::Schema {
            id: id.to_string(),
            pointer: pointer.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_error_mentions_id_and_pointer() {
        let err = TransflowError::schema("inflow", "/data/1/values", "expected 2 items");
        let msg = err.to_string();
        assert!(msg.contains("inflow"));
        assert!(msg.contains("/data/1/values"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: TransflowError = io_err.into();
        assert!(matches!(err, TransflowError::Io(_)));
    }
}
