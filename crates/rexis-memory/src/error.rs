//! Error types for the memory engine
//!
//! Every failure carries a stable [`ErrorKind`] so callers can branch on the
//! category of a failure without parsing messages.

use thiserror::Error;

/// Result alias used throughout the crate
pub type RmemResult<T> = Result<T, RmemError>;

/// Stable error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing key, entity, episode or fact
    NotFound,
    /// `if_not_exists` violation or similar write conflict
    Conflict,
    /// Malformed input
    Validation,
    /// Provider used before `initialize`
    NotReady,
    /// Provider reports itself unhealthy or cannot be reached
    BackendUnavailable,
    /// A middleware hook rejected the operation
    Middleware,
    /// A pruning/compression policy failed
    Policy,
    /// Record (de)serialization failed
    Serialization,
    /// The language model collaborator failed
    LanguageModel,
    /// Anything else
    Internal,
}

impl ErrorKind {
    /// Short machine-readable code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::NotReady => "not_ready",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::Middleware => "middleware",
            ErrorKind::Policy => "policy",
            ErrorKind::Serialization => "serialization",
            ErrorKind::LanguageModel => "language_model",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory engine error
#[derive(Debug, Error)]
pub enum RmemError {
    /// Entity lookup failed
    #[error("{entity} not found: {id}")]
    NotFound {
        /// What kind of record was looked up
        entity: &'static str,
        /// The identifier that was not found
        id: String,
    },

    /// Write conflict
    #[error("conflict on key '{key}': {reason}")]
    Conflict {
        /// Conflicting key
        key: String,
        /// Why the write was rejected
        reason: String,
    },

    /// Invalid input
    #[error("validation failed for '{field}': {constraint} (got {value})")]
    Validation {
        /// Offending field
        field: String,
        /// The violated constraint
        constraint: String,
        /// The value that was supplied
        value: String,
    },

    /// Provider not initialized
    #[error("{provider} provider is not ready")]
    NotReady {
        /// Provider name
        provider: &'static str,
    },

    /// Backend unavailable
    #[error("{provider} backend unavailable: {message}")]
    BackendUnavailable {
        /// Provider name
        provider: &'static str,
        /// Failure detail
        message: String,
    },

    /// Middleware failure
    #[error("middleware '{middleware}' failed during {stage}: {message}")]
    Middleware {
        /// Middleware name
        middleware: String,
        /// Hook that failed
        stage: &'static str,
        /// Failure detail
        message: String,
    },

    /// Policy failure
    #[error("memory policy '{policy}' failed: {message}")]
    Policy {
        /// Policy name
        policy: String,
        /// Failure detail
        message: String,
    },

    /// Serialization failure
    #[error("serialization failed during {operation}: {source}")]
    Serialization {
        /// Operation being performed
        operation: &'static str,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },

    /// Language model failure
    #[error("language model call failed during {operation}: {source}")]
    LanguageModel {
        /// Operation being performed
        operation: &'static str,
        /// Underlying error
        #[source]
        source: anyhow::Error,
    },

    /// Storage-level failure that does not fit another kind
    #[error("storage operation '{operation}' failed: {message}")]
    Storage {
        /// Operation being performed
        operation: &'static str,
        /// Failure detail
        message: String,
    },

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl RmemError {
    /// Stable category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RmemError::NotFound { .. } => ErrorKind::NotFound,
            RmemError::Conflict { .. } => ErrorKind::Conflict,
            RmemError::Validation { .. } => ErrorKind::Validation,
            RmemError::NotReady { .. } => ErrorKind::NotReady,
            RmemError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            RmemError::Middleware { .. } => ErrorKind::Middleware,
            RmemError::Policy { .. } => ErrorKind::Policy,
            RmemError::Serialization { .. } => ErrorKind::Serialization,
            RmemError::LanguageModel { .. } => ErrorKind::LanguageModel,
            RmemError::Storage { .. } => ErrorKind::Internal,
            RmemError::Config(_) => ErrorKind::Validation,
        }
    }

    /// Missing record
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Write conflict
    pub fn conflict(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Invalid input
    pub fn validation(
        field: impl Into<String>,
        constraint: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::Validation {
            field: field.into(),
            constraint: constraint.into(),
            value: value.into(),
        }
    }

    /// Provider used before initialization
    pub fn not_ready(provider: &'static str) -> Self {
        Self::NotReady { provider }
    }

    /// Backend unavailable
    pub fn backend_unavailable(provider: &'static str, message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            provider,
            message: message.into(),
        }
    }

    /// Middleware hook failure
    pub fn middleware(
        middleware: impl Into<String>,
        stage: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::Middleware {
            middleware: middleware.into(),
            stage,
            message: message.into(),
        }
    }

    /// Policy failure
    pub fn policy(policy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Policy {
            policy: policy.into(),
            message: message.into(),
        }
    }

    /// Serialization failure
    pub fn serialization(operation: &'static str, source: serde_json::Error) -> Self {
        Self::Serialization { operation, source }
    }

    /// Language model failure
    pub fn language_model(operation: &'static str, source: anyhow::Error) -> Self {
        Self::LanguageModel { operation, source }
    }

    /// Generic storage failure
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    /// Whether this error means the record does not exist
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<serde_json::Error> for RmemError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(RmemError::not_found("fact", "f1").kind(), ErrorKind::NotFound);
        assert_eq!(RmemError::conflict("k", "exists").kind(), ErrorKind::Conflict);
        assert_eq!(RmemError::not_ready("kv").kind(), ErrorKind::NotReady);
        assert_eq!(
            RmemError::policy("fifo", "boom").kind().as_str(),
            "policy"
        );
    }

    #[test]
    fn test_error_messages() {
        let err = RmemError::validation("limit", "must be positive", "0");
        assert_eq!(
            err.to_string(),
            "validation failed for 'limit': must be positive (got 0)"
        );

        let err = RmemError::not_found("episode", "ep-1");
        assert_eq!(err.to_string(), "episode not found: ep-1");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_serde_error_conversion() {
        let bad: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: RmemError = bad.unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }
}
