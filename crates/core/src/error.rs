//! Error types for semcache
//!
//! One error enum is shared by every crate in the workspace so the facade can
//! surface index, store and rebuild failures through a single `Result`.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use std::io;
use thiserror::Error;

/// Result type alias for semcache operations
pub type SemcacheResult<T> = std::result::Result<T, SemcacheError>;

/// Error types for the semantic cache core
#[derive(Debug, Error)]
pub enum SemcacheError {
    /// Vector length doesn't match the index dimension
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension fixed at index construction
        expected: usize,
        /// Length of the offending vector
        got: usize,
    },

    /// Invalid dimension requested at construction (must be > 0)
    #[error("Invalid dimension: {dimension} (must be > 0)")]
    InvalidDimension {
        /// The invalid dimension value
        dimension: usize,
    },

    /// Row id was never assigned by this index instance
    #[error("Row not found: {row}")]
    RowNotFound {
        /// The requested row id
        row: u64,
    },

    /// Cache key is not known to the component that was asked
    #[error("Key not found: {key}")]
    KeyNotFound {
        /// The requested key
        key: String,
    },

    /// Snapshot on disk is incompatible with what the caller asked for
    #[error("Snapshot format mismatch: {0}")]
    FormatMismatch(String),

    /// Networked liveness backend could not be reached
    #[error("Liveness backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A rebuild was abandoned before it could be swapped in
    #[error("Rebuild abandoned: {0}")]
    RebuildAbandoned(String),

    /// Configuration could not be read or is invalid
    #[error("Config error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error (snapshot files, config files)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SemcacheError {
    /// Create a dimension mismatch error
    pub fn dimension(expected: usize, got: usize) -> Self {
        SemcacheError::DimensionMismatch { expected, got }
    }

    /// Create a format mismatch error
    pub fn format(msg: impl Into<String>) -> Self {
        SemcacheError::FormatMismatch(msg.into())
    }

    /// Create a backend unavailable error
    pub fn backend(msg: impl Into<String>) -> Self {
        SemcacheError::BackendUnavailable(msg.into())
    }

    /// Check if this error is a dimension error (mismatch or invalid)
    pub fn is_dimension_error(&self) -> bool {
        matches!(
            self,
            SemcacheError::DimensionMismatch { .. } | SemcacheError::InvalidDimension { .. }
        )
    }

    /// Check if this error indicates a row or key was not found
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SemcacheError::RowNotFound { .. } | SemcacheError::KeyNotFound { .. }
        )
    }

    /// Check if this error is a snapshot format mismatch
    pub fn is_format_mismatch(&self) -> bool {
        matches!(self, SemcacheError::FormatMismatch(_))
    }
}
