// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication protocol.
//!
//! Errors are categorized by where they come from: the transport behind the
//! pull/push handlers, the storage instances, or the caller misusing the API.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Pull` | Yes | Pull handler failed (network, server error) |
//! | `Push` | Yes | Push handler failed (network, server error) |
//! | `MalformedPushResult` | Yes | Push handler answered with something unusable |
//! | `Storage` | No | Fork or meta instance failed (not a revision conflict) |
//! | `Config` | No | Replication configured incorrectly |
//! | `InvalidState` | No | Lifecycle violation (e.g. restarting a one-shot replication) |
//! | `Canceled` | No | Replication was canceled |
//! | `Interrupted` | No | Pause/cancel cut a retry wait short |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Only transport errors are retried, and only by the orchestrator's
//! handler wrapper. Storage errors abort the cycle that hit them and are
//! surfaced on the `error` event stream.

use crate::checkpoint::Direction;
use crate::storage::StorageError;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The pull handler failed.
    ///
    /// `checkpoint` is the serialized checkpoint the pull was made from.
    #[error("Pull error (checkpoint {checkpoint}): {message}")]
    Pull { checkpoint: String, message: String },

    /// The push handler failed.
    #[error("Push error ({rows} rows): {message}")]
    Push { rows: usize, message: String },

    /// The push handler returned a conflict that does not belong to the batch.
    #[error("Malformed push result: {0}")]
    MalformedPushResult(String),

    /// Fork or meta storage instance failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The replication has been canceled.
    #[error("Replication canceled")]
    Canceled,

    /// A handler call was abandoned because the replication was paused or canceled.
    #[error("Replication interrupted")]
    Interrupted,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a pull error from the checkpoint that was requested.
    pub fn pull(checkpoint: Option<&crate::checkpoint::Checkpoint>, message: impl Into<String>) -> Self {
        Self::Pull {
            checkpoint: checkpoint
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string()),
            message: message.into(),
        }
    }

    /// Create a push error for a batch of `rows` rows.
    pub fn push(rows: usize, message: impl Into<String>) -> Self {
        Self::Push {
            rows,
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Pull { .. } => true,
            Self::Push { .. } => true,
            Self::MalformedPushResult(_) => true,
            Self::Storage(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Canceled => false,
            Self::Interrupted => false,
            Self::Internal(_) => false,
        }
    }

    /// Direction the error belongs to, if it is direction specific.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Self::Pull { .. } => Some(Direction::Down),
            Self::Push { .. } | Self::MalformedPushResult(_) => Some(Direction::Up),
            _ => None,
        }
    }

    /// Interrupted cycles are expected on pause/cancel and are not reported.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Interrupted | Self::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use serde_json::json;

    #[test]
    fn test_is_retryable_pull() {
        let cp = Checkpoint::from(json!({"id": "a", "lwt": 10}));
        let err = ReplicationError::pull(Some(&cp), "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection reset"));
        assert!(err.to_string().contains("\"lwt\":10"));
        assert_eq!(err.direction(), Some(Direction::Down));
    }

    #[test]
    fn test_pull_without_checkpoint() {
        let err = ReplicationError::pull(None, "timeout");
        assert!(err.to_string().contains("none"));
    }

    #[test]
    fn test_is_retryable_push() {
        let err = ReplicationError::push(3, "503");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("3 rows"));
        assert_eq!(err.direction(), Some(Direction::Up));
    }

    #[test]
    fn test_is_retryable_malformed_push() {
        let err = ReplicationError::MalformedPushResult("unknown id".to_string());
        assert!(err.is_retryable());
        assert_eq!(err.direction(), Some(Direction::Up));
    }

    #[test]
    fn test_not_retryable_storage() {
        let err = ReplicationError::from(StorageError::Closed);
        assert!(!err.is_retryable());
        assert_eq!(err.direction(), None);
    }

    #[test]
    fn test_not_retryable_config() {
        let err = ReplicationError::Config("no pull or push".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = ReplicationError::InvalidState {
            expected: "Created".to_string(),
            actual: "Canceled".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Canceled"));
    }

    #[test]
    fn test_interruption() {
        assert!(ReplicationError::Interrupted.is_interruption());
        assert!(ReplicationError::Canceled.is_interruption());
        assert!(!ReplicationError::Internal("x".into()).is_interruption());
        assert!(!ReplicationError::Interrupted.is_retryable());
    }
}
