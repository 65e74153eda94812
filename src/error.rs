//! # Relay Error Taxonomy
//!
//! Storage failures are classified as transient or permanent where they occur.
//! Everything above the storage seams works in terms of [`RelayError`].

use crate::models::{NodeId, Uaid};
use thiserror::Error;

/// Failure raised by a storage backend, already classified.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Transient storage failure during {operation}: {reason}")]
    Transient { operation: String, reason: String },

    #[error("Permanent storage failure during {operation}: {reason}")]
    Permanent { operation: String, reason: String },
}

impl StorageError {
    pub fn transient(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn permanent(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permanent {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn operation(&self) -> &str {
        match self {
            Self::Transient { operation, .. } | Self::Permanent { operation, .. } => operation,
        }
    }

    /// Classify a database error raised while running `operation`.
    ///
    /// Pool exhaustion, connection I/O, serialization failures (`40001`) and
    /// deadlocks (`40P01`) can succeed on a later attempt. Everything else is
    /// permanent.
    #[cfg(feature = "postgres")]
    pub fn from_sqlx(operation: &str, err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::WorkerCrashed => Self::transient(operation, err.to_string()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some("40001") | Some("40P01") | Some("57P01") => {
                    Self::transient(operation, err.to_string())
                }
                _ => Self::permanent(operation, err.to_string()),
            },
            _ => Self::permanent(operation, err.to_string()),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by the relay core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Transient storage error (retries exhausted): {0}")]
    TransientStorage(StorageError),

    #[error("Permanent storage error: {0}")]
    PermanentStorage(StorageError),

    #[error("Ownership conflict for {uaid}: held by {holder:?}")]
    OwnershipConflict { uaid: Uaid, holder: Option<NodeId> },

    #[error("Acceptance failed: {reason}")]
    AcceptanceFailed { reason: String },

    #[error("Bridge gateway {gateway} unavailable: {reason}")]
    BridgeUnavailable { gateway: String, reason: String },

    #[error("Malformed client message: {0}")]
    MalformedClientMessage(String),

    #[error("Invalid state transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// Whether retrying the same operation locally can help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientStorage(_) | Self::BridgeUnavailable { .. }
        )
    }

    pub fn ownership_conflict(uaid: Uaid, holder: Option<NodeId>) -> Self {
        Self::OwnershipConflict { uaid, holder }
    }
}

impl From<StorageError> for RelayError {
    fn from(err: StorageError) -> Self {
        if err.is_transient() {
            Self::TransientStorage(err)
        } else {
            Self::PermanentStorage(err)
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_relay_variants_by_class() {
        let transient = StorageError::transient("append", "pool timed out");
        let permanent = StorageError::permanent("append", "constraint violated");

        assert!(matches!(
            RelayError::from(transient),
            RelayError::TransientStorage(_)
        ));
        assert!(matches!(
            RelayError::from(permanent),
            RelayError::PermanentStorage(_)
        ));
    }

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(RelayError::TransientStorage(StorageError::transient("ack", "io")).is_retryable());
        assert!(
            !RelayError::PermanentStorage(StorageError::permanent("ack", "bad")).is_retryable()
        );
        assert!(!RelayError::ownership_conflict(Uaid::new(), None).is_retryable());
        assert!(!RelayError::MalformedClientMessage("x".into()).is_retryable());
    }

    #[test]
    fn bridge_unavailability_is_retryable() {
        let err = RelayError::BridgeUnavailable {
            gateway: "fcm".into(),
            reason: "503".into(),
        };
        assert!(err.is_retryable());
    }
}
