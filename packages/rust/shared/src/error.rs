//! Error types for PlanIndex.
//!
//! Library crates use [`PlanIndexError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all PlanIndex operations.
#[derive(Debug, thiserror::Error)]
pub enum PlanIndexError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Analysis oracle failure (transport, service, or response parsing).
    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),

    /// Structured payload could not be decoded.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad input, unknown enum value, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A row the pipeline depends on does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A status change that the lifecycle does not allow.
    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// The operation collides with an active job.
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PlanIndexError>;

impl PlanIndexError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Missing rows and missing configuration are never worth retrying.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::Config { .. } => true,
            Self::Oracle(e) => !e.is_retryable(),
            _ => false,
        }
    }
}

/// Failure modes of a single analysis-oracle call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OracleError {
    /// The service asked us to slow down (HTTP 429).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The request timed out in transit or at the service.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The service is temporarily unavailable (5xx, connection refused).
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The service rejected the input, but the rejection is known to be flaky.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The response text could not be parsed as the expected JSON.
    #[error("malformed response: {message}")]
    Malformed { message: String, truncated: bool },

    /// The service refused the request permanently (auth, unknown model, ...).
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// No credentials or endpoint available.
    #[error("oracle not configured: {0}")]
    NotConfigured(String),
}

impl OracleError {
    /// Whether the retry policy should try this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Timeout(_) | Self::Unavailable(_) | Self::InvalidInput(_)
        )
    }

    pub fn malformed(msg: impl Into<String>, truncated: bool) -> Self {
        Self::Malformed {
            message: msg.into(),
            truncated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = PlanIndexError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = PlanIndexError::invalid_transition("page", "pass2_complete", "pass1_processing");
        assert_eq!(
            err.to_string(),
            "invalid page transition: pass2_complete -> pass1_processing"
        );
    }

    #[test]
    fn oracle_error_classification() {
        assert!(OracleError::RateLimited("slow down".into()).is_retryable());
        assert!(OracleError::Timeout("deadline".into()).is_retryable());
        assert!(OracleError::Unavailable("503".into()).is_retryable());
        assert!(OracleError::InvalidInput("bad image".into()).is_retryable());
        assert!(!OracleError::malformed("eof", true).is_retryable());
        assert!(
            !OracleError::Rejected {
                status: 401,
                message: "no key".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn fatal_errors() {
        assert!(PlanIndexError::not_found("page", "p1").is_fatal());
        assert!(PlanIndexError::from(OracleError::NotConfigured("key".into())).is_fatal());
        assert!(!PlanIndexError::from(OracleError::Timeout("t".into())).is_fatal());
        assert!(!PlanIndexError::Storage("locked".into()).is_fatal());
    }
}
