//! Row access error types.

use thiserror::Error;

/// Errors raised while reading values out of a [`Row`](crate::Row).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    /// Value is null when non-null was expected.
    #[error("unexpected null value")]
    UnexpectedNull,

    /// Type mismatch during conversion.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected type name.
        expected: &'static str,
        /// Actual SQL type name.
        actual: &'static str,
    },

    /// Value is out of range for target type.
    #[error("value out of range for {target_type}")]
    OutOfRange {
        /// Target type name.
        target_type: &'static str,
    },

    /// No column with the given name exists in the row.
    #[error("no column named `{0}`")]
    UnknownColumn(String),

    /// Column index past the end of the row.
    #[error("column index {index} out of bounds for row of {len} columns")]
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Number of columns in the row.
        len: usize,
    },
}
