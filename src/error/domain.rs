//! Domain-specific error types using `thiserror`.
//!
//! This module defines the main error enums for the sync core: engine
//! lifecycle and bookkeeping errors, and the explicit result type returned
//! by the remote backend seam.

use std::fmt::{Display, Formatter, Result as FmtResult};

use thiserror::Error;

use crate::store::database::StoreError;

/// Classification of a failed remote write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// The request never reached the backend or timed out.
    Network,
    /// The backend answered but is temporarily unable to serve.
    Unavailable,
    /// The backend rejected the row (unique key, foreign key, check).
    Constraint,
    /// The session is missing, expired or lacks permission.
    Unauthorized,
}

impl RemoteErrorKind {
    /// Whether a write that failed this way is worth retrying unchanged.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Unavailable)
    }
}

impl Display for RemoteErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let label = match self {
            Self::Network => "network",
            Self::Unavailable => "unavailable",
            Self::Constraint => "constraint",
            Self::Unauthorized => "unauthorized",
        };
        f.write_str(label)
    }
}

/// Failure reported by the remote backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Remote {kind} error: {message}")]
pub struct RemoteError {
    /// What went wrong.
    pub kind: RemoteErrorKind,
    /// Backend-supplied detail.
    pub message: String,
}

impl RemoteError {
    /// Creates a new remote error.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether the failed write may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Sync engine errors.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local store error.
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),
    /// `start` was called on a running engine.
    #[error("Sync engine is already running")]
    AlreadyRunning,
    /// The entry key is not acceptable.
    #[error("Invalid entry key: {reason}")]
    InvalidKey { reason: String },
}

#[cfg(test)]
mod tests {
    use crate::{
        error::domain::{RemoteError, RemoteErrorKind, SyncError},
        store::database::StoreError,
    };

    #[test]
    fn test_remote_error_display() {
        let error = RemoteError::new(RemoteErrorKind::Constraint, "duplicate card slug");
        assert_eq!(
            error.to_string(),
            "Remote constraint error: duplicate card slug"
        );
    }

    #[test]
    fn test_remote_error_retryable_kinds() {
        assert!(RemoteErrorKind::Network.is_retryable());
        assert!(RemoteErrorKind::Unavailable.is_retryable());
        assert!(!RemoteErrorKind::Constraint.is_retryable());
        assert!(!RemoteErrorKind::Unauthorized.is_retryable());
    }

    #[test]
    fn test_sync_error_display() {
        assert_eq!(
            SyncError::AlreadyRunning.to_string(),
            "Sync engine is already running"
        );

        let invalid_key = SyncError::InvalidKey {
            reason: "key is empty".to_string(),
        };
        assert_eq!(invalid_key.to_string(), "Invalid entry key: key is empty");

        let store: SyncError = StoreError::InvalidData {
            reason: "bad state".to_string(),
        }
        .into();
        assert!(store.to_string().starts_with("Store error: "));
    }
}
