//! Error types for the retrieval engine.

use thiserror::Error;

/// Result type alias using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the retrieval engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed query or configuration parameter. Never retried.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A downstream collaborator could not be reached.
    #[error("{component} unavailable: {message}")]
    Unavailable { component: String, message: String },

    /// A bounded operation ran out of time.
    #[error("{component} timed out after {elapsed_ms}ms")]
    Timeout { component: String, elapsed_ms: u64 },

    /// Internal state inconsistency detected in a cache or index structure.
    #[error("Corrupted {structure}: {message}")]
    Corrupted { structure: String, message: String },

    /// The caller cancelled the operation.
    #[error("Cancelled during {phase}")]
    Cancelled { phase: String },

    /// Document not found.
    #[error("Document not found: {id}")]
    DocumentNotFound { id: String },

    /// Database error.
    #[error("Database error: {message}")]
    Database { message: String },

    /// Embedding model error.
    #[error("Embedding error: {message}")]
    Embedding { message: String },

    /// Answer generation error.
    #[error("Generation error: {message}")]
    Generation { message: String },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Caller-visible failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The request itself is malformed.
    BadRequest,
    /// A collaborator is down; retrying later may succeed.
    TemporarilyDegraded,
    /// Anything else.
    Internal,
}

impl EngineError {
    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an unavailable error for a named component.
    pub fn unavailable(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error for a named component.
    pub fn timeout(component: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            component: component.into(),
            elapsed_ms,
        }
    }

    /// Create a corruption error for a named structure.
    pub fn corrupted(structure: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupted {
            structure: structure.into(),
            message: message.into(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(phase: impl Into<String>) -> Self {
        Self::Cancelled {
            phase: phase.into(),
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Create an embedding error.
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding {
            message: message.into(),
        }
    }

    /// Create a generation error.
    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a bounded retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }

    /// Map onto the failure class reported to callers.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::InvalidArgument { .. } | Self::DocumentNotFound { .. } => FailureClass::BadRequest,
            Self::Unavailable { .. }
            | Self::Timeout { .. }
            | Self::Cancelled { .. }
            | Self::Embedding { .. }
            | Self::Generation { .. } => FailureClass::TemporarilyDegraded,
            _ => FailureClass::Internal,
        }
    }

    /// Get a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::Unavailable { .. } => "UNAVAILABLE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Corrupted { .. } => "CORRUPTED",
            Self::Cancelled { .. } => "CANCELLED",
            Self::DocumentNotFound { .. } => "DOCUMENT_NOT_FOUND",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Embedding { .. } => "EMBEDDING_ERROR",
            Self::Generation { .. } => "GENERATION_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

/// Map a poisoned lock into an internal error.
impl<T> From<std::sync::PoisonError<T>> for EngineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::internal(format!("lock poisoned: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::unavailable("vector_store", "connection refused");
        assert!(err.to_string().contains("vector_store"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            EngineError::invalid_argument("top_k").error_code(),
            "INVALID_ARGUMENT"
        );
        assert_eq!(EngineError::timeout("keyword", 10).error_code(), "TIMEOUT");
        assert_eq!(EngineError::database("test").error_code(), "DATABASE_ERROR");
    }

    #[test]
    fn test_failure_classes() {
        assert_eq!(
            EngineError::invalid_argument("x").class(),
            FailureClass::BadRequest
        );
        assert_eq!(
            EngineError::unavailable("answer_generator", "x").class(),
            FailureClass::TemporarilyDegraded
        );
        assert_eq!(
            EngineError::corrupted("cache", "x").class(),
            FailureClass::Internal
        );
    }

    #[test]
    fn test_retryable() {
        assert!(EngineError::unavailable("a", "b").is_retryable());
        assert!(EngineError::timeout("a", 1).is_retryable());
        assert!(!EngineError::invalid_argument("a").is_retryable());
    }
}
