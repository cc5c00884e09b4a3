//! Error type for the item encoding pipeline.
//!
//! # Error Categories
//!
//! | Category | Variants | Recovery Strategy |
//! |----------|----------|-------------------|
//! | Configuration | ConfigurationError | Fix configuration before construction |
//! | Consistency | InternalConsistencyError | None, programming defect |
//! | Computation | TensorError | None, propagate |
//! | Loading | WeightLoadError, IoError, SerializationError | Fix model directory |
//!
//! # Design Principles
//!
//! - **FAIL FAST**: configuration is checked at construction, never mid-forward
//! - **NO COERCION**: mask/cache length mismatches abort the step, shapes are never padded or truncated
//! - **CONTEXTUAL**: every variant carries the values needed to debug it

use thiserror::Error;

/// Error type for every fallible operation in the crate.
#[derive(Debug, Error)]
pub enum SeqRecError {
    /// Invalid option or option combination (unfreeze count out of range,
    /// pooling strategy requiring an absent segment, non-positive decay, ...).
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    /// Mask/cache length mismatch at a splice point.
    #[error("Internal consistency error at {splice}: expected {expected}, got {actual}")]
    InternalConsistencyError {
        splice: String,
        expected: usize,
        actual: usize,
    },

    /// Tensor operation failed inside candle.
    #[error("Tensor error: {message}")]
    TensorError { message: String },

    /// A pretrained weight was missing or had the wrong shape.
    #[error("Weight load failed for '{name}': {message}")]
    WeightLoadError { name: String, message: String },

    /// File I/O error (model weights, config files).
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON/TOML (de)serialization failed.
    #[error("Serialization error: {message}")]
    SerializationError { message: String },
}

/// Result type alias for crate operations.
pub type SeqRecResult<T> = Result<T, SeqRecError>;

impl SeqRecError {
    /// Shorthand for a [`SeqRecError::ConfigurationError`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// Shorthand for a [`SeqRecError::InternalConsistencyError`].
    pub fn consistency(splice: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::InternalConsistencyError {
            splice: splice.into(),
            expected,
            actual,
        }
    }

    /// True for errors raised by option validation.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::ConfigurationError { .. })
    }

    /// True for splice-point length mismatches.
    pub fn is_consistency(&self) -> bool {
        matches!(self, Self::InternalConsistencyError { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_configuration_error_message() {
        let err = SeqRecError::config("last_query_len must be at least 1");
        let msg = err.to_string();
        assert!(msg.contains("Configuration error"));
        assert!(msg.contains("last_query_len"));
        assert!(err.is_configuration());
        assert!(!err.is_consistency());
    }

    #[test]
    fn test_consistency_error_reports_lengths() {
        let err = SeqRecError::consistency("second pass attention mask", 8, 7);
        let msg = err.to_string();
        assert!(msg.contains("second pass attention mask"));
        assert!(msg.contains("expected 8"));
        assert!(msg.contains("got 7"));
        assert!(err.is_consistency());
    }

    #[test]
    fn test_io_error_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "config.json missing");
        let err: SeqRecError = io.into();
        assert!(err.to_string().contains("config.json missing"));
        assert!(err.source().is_some());
    }
}
