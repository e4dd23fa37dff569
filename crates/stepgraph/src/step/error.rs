//! Structured step and instance errors

use serde::{Deserialize, Serialize};

/// Categorical error kind
///
/// Every terminal error is persisted with one of these kinds so callers
/// can react programmatically without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Build-time graph definition problem surfaced at dispatch
    Definition,

    /// Input/output mismatch, bad resume type, ambiguous edge selection
    Type,

    /// Failure a retry policy may still recover from
    Transient,

    /// Retry exhausted, aborted, or unrecoverable step failure
    Permanent,

    /// Persistence failure, lock lease loss, serialization failure
    Engine,

    /// Instance was cancelled
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Definition => write!(f, "definition"),
            Self::Type => write!(f, "type"),
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Engine => write!(f, "engine"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Error produced by a step or recorded on a failed instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    /// Categorical kind
    pub kind: ErrorKind,

    /// Error type tag for routing and retry-list matching
    pub error_type: Option<String>,

    /// Human-readable message
    pub message: String,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl StepError {
    fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            error_type: None,
            message: message.into(),
            details: None,
        }
    }

    /// Create a transient (retryable) error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Transient, message)
    }

    /// Create a permanent error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Permanent, message)
    }

    /// Create a type error (routing/input mismatch)
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Type, message)
    }

    /// Create a definition error
    pub fn definition(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Definition, message)
    }

    /// Create an engine-internal error
    pub fn engine(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Engine, message)
    }

    /// Create a cancellation marker
    pub fn cancelled() -> Self {
        Self::with_kind(ErrorKind::Cancelled, "cancelled")
    }

    /// Set the error type tag
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether this error marks a cancellation
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StepError {}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(StepError::transient("x").kind, ErrorKind::Transient);
        assert_eq!(StepError::permanent("x").kind, ErrorKind::Permanent);
        assert!(StepError::cancelled().is_cancelled());
    }

    #[test]
    fn test_with_type() {
        let error = StepError::transient("connection refused").with_type("io_error");
        assert_eq!(error.error_type, Some("io_error".to_string()));
    }

    #[test]
    fn test_display() {
        let error = StepError::permanent("boom");
        assert_eq!(error.to_string(), "boom");
        assert_eq!(error.kind.to_string(), "permanent");
    }

    #[test]
    fn test_serialization() {
        let error = StepError::type_error("bad input")
            .with_type("type_mismatch")
            .with_details(serde_json::json!({"expected": "string"}));

        let json = serde_json::to_string(&error).unwrap();
        let parsed: StepError = serde_json::from_str(&json).unwrap();
        assert_eq!(error, parsed);
    }
}
