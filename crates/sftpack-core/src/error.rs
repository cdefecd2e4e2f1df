//! Error types for sftpack.

use thiserror::Error;

/// Result type alias for sftpack operations.
pub type Result<T> = std::result::Result<T, SftPackError>;

/// Main error type for sftpack operations.
///
/// Row-level problems never surface here; they are reported as
/// [`RecordError`] and recovered inside a batch.
#[derive(Error, Debug)]
pub enum SftPackError {
    /// The tokenizer (or another startup dependency) could not be loaded.
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// An internal invariant was broken. Always a defect, never bad input.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Tokenizer errors.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Arrow / Parquet export errors.
    #[error("Arrow error: {0}")]
    Arrow(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SftPackError {
    /// Whether the error is fatal for the whole process rather than a single call.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::EngineUnavailable(_) | Self::InvariantViolation(_))
    }
}

/// Why a single raw record could not be normalized.
///
/// These are recovered by substituting a default record; they are counted
/// and logged but never abort a batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The record is not valid JSON.
    #[error("invalid JSON: {0}")]
    Parse(String),

    /// The record parsed but is not a JSON object.
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// A required field is missing or has the wrong type.
    #[error("field `{field}`: {reason}")]
    Field {
        /// Field name.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// A turn carried a role the canonical schema cannot express.
    #[error("unsupported role `{0}`")]
    UnsupportedRole(String),
}

impl RecordError {
    /// Shorthand for a missing required field.
    pub fn missing(field: &'static str) -> Self {
        Self::Field {
            field,
            reason: "missing".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SftPackError::EngineUnavailable("x".into()).is_fatal());
        assert!(SftPackError::InvariantViolation("x".into()).is_fatal());
        assert!(!SftPackError::InvalidArgument("x".into()).is_fatal());
    }

    #[test]
    fn test_record_error_display() {
        let err = RecordError::missing("content");
        assert_eq!(err.to_string(), "field `content`: missing");
        assert_eq!(
            RecordError::UnsupportedRole("tool".into()).to_string(),
            "unsupported role `tool`"
        );
    }
}
