//! Outflow error taxonomy.
//!
//! The scheduler layer uses [`OutflowError::is_retryable`] to decide between
//! backoff-rescheduling a failed job and parking it for manual review.

use thiserror::Error;

/// All errors produced by Outflow crates.
#[derive(Debug, Error)]
pub enum OutflowError {
    /// Missing or malformed action/node parameters. Surfaces immediately to
    /// the caller; never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A messaging, HTTP, or generation collaborator failed. Retried with
    /// exponential backoff up to a bounded attempt count.
    #[error("external service error: {0}")]
    ExternalService(String),

    /// Persisted state contradicts itself (e.g. a resume pointing at a node
    /// that no longer exists). Triggers state regeneration, not a crash.
    #[error("state inconsistency: {0}")]
    StateInconsistency(String),

    /// A referenced agent/account/resource no longer exists. Scheduled jobs
    /// tied to it are removed instead of retried forever.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Database failure.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration load/parse failure.
    #[error("config error: {0}")]
    Config(String),

    /// Template rendering failure.
    #[error("template error: {0}")]
    Template(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OutflowError>;

impl OutflowError {
    /// Whether a job that failed with this error should be rescheduled
    /// with backoff (true) or terminally failed/parked (false).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OutflowError::ExternalService(_) | OutflowError::Store(_) | OutflowError::Io(_)
        )
    }
}

impl From<serde_json::Error> for OutflowError {
    fn from(e: serde_json::Error) -> Self {
        OutflowError::Validation(format!("invalid JSON: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        assert!(OutflowError::ExternalService("timeout".into()).is_retryable());
        assert!(!OutflowError::Validation("missing url".into()).is_retryable());
        assert!(!OutflowError::Permanent("agent deleted".into()).is_retryable());
        assert!(!OutflowError::StateInconsistency("bad resume".into()).is_retryable());
    }
}
