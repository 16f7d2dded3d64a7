//! Error taxonomy for the download orchestrator.
//!
//! Variant messages stay constant; per-failure context rides in structured
//! fields so log processors can aggregate by error kind.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Boxed source error carried inside [`DownloadError`] variants.
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias for orchestrator operations.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Errors surfaced by the download orchestrator.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The magnet link or torrent payload could not be parsed.
    #[error("invalid download source")]
    InvalidSource {
        /// Underlying parse failure.
        #[source]
        source: BoxedSource,
    },
    /// The metadata exchange did not resolve before the deadline.
    #[error("metadata acquisition timed out")]
    MetadataTimeout {
        /// Deadline that elapsed.
        timeout: Duration,
    },
    /// The save directory exists but is not writable.
    #[error("save directory permission denied")]
    PermissionDenied {
        /// Directory that rejected the write.
        path: PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: std::io::Error,
    },
    /// The save directory could not be created.
    #[error("save directory creation failed")]
    DirectoryCreationFailure {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: std::io::Error,
    },
    /// The engine refused to create a transfer task.
    #[error("task creation failed")]
    TaskCreationFailure {
        /// Engine-reported failure.
        #[source]
        source: BoxedSource,
    },
    /// A transient network failure interrupted the transfer.
    #[error("network failure during transfer")]
    NetworkError {
        /// Engine-reported cause.
        message: String,
    },
    /// No session with the given identifier exists.
    #[error("session not found")]
    SessionNotFound {
        /// Identifier that failed to resolve.
        session_id: Uuid,
    },
    /// The requested operation is not valid in the session's current state.
    #[error("operation invalid in current session state")]
    InvalidTransition {
        /// Operation that was attempted.
        operation: &'static str,
        /// Status the session was in.
        status: &'static str,
    },
    /// The session store failed.
    #[error("session store failure")]
    Store {
        /// Underlying store error.
        #[from]
        source: StoreError,
    },
    /// A task-level call into the engine failed.
    #[error("task operation failed")]
    TaskOperationFailed {
        /// Operation that was attempted.
        operation: &'static str,
        /// Engine-reported failure.
        #[source]
        source: BoxedSource,
    },
}

impl DownloadError {
    /// Build an [`Self::InvalidSource`] from any parse error.
    #[must_use]
    pub fn invalid_source(source: impl Into<BoxedSource>) -> Self {
        Self::InvalidSource {
            source: source.into(),
        }
    }

    /// Build a [`Self::TaskOperationFailed`] from an engine error.
    #[must_use]
    pub fn task_operation(operation: &'static str, source: anyhow::Error) -> Self {
        Self::TaskOperationFailed {
            operation,
            source: source.into(),
        }
    }

    /// Whether the retry machinery should handle this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkError { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_constant() {
        let err = DownloadError::NetworkError {
            message: "tracker unreachable".into(),
        };
        assert_eq!(err.to_string(), "network failure during transfer");
    }

    #[test]
    fn only_network_errors_are_retryable() {
        let network = DownloadError::NetworkError {
            message: "reset".into(),
        };
        assert!(network.is_retryable());

        let missing = DownloadError::SessionNotFound {
            session_id: Uuid::new_v4(),
        };
        assert!(!missing.is_retryable());
    }

    #[test]
    fn task_operation_preserves_source() {
        let err = DownloadError::task_operation("start", anyhow::anyhow!("engine busy"));
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "engine busy");
    }
}
