//! Error types for task state reads.

use thiserror::Error;

/// Failure reading state from a running torrent task.
///
/// The progress monitor classifies these to decide between routing the
/// session into the retry path and failing it outright.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Transient network-related failure; eligible for automatic retry.
    #[error("task network failure")]
    Network {
        /// Operation that failed.
        operation: &'static str,
        /// Human-readable failure description.
        message: String,
    },
    /// Non-recoverable engine failure.
    #[error("task fatal failure")]
    Fatal {
        /// Operation that failed.
        operation: &'static str,
        /// Human-readable failure description.
        message: String,
    },
}

impl TaskError {
    /// Whether the failure is network-related and therefore retryable.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// The failure description, independent of classification.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Network { message, .. } | Self::Fatal { message, .. } => message,
        }
    }
}

/// Convenience alias for task state reads.
pub type TaskResult<T> = Result<T, TaskError>;
