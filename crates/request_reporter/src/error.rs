//! Error types for reporter operations.

use thiserror::Error;

/// Errors raised while starting or stopping reporter components.
#[derive(Debug, Error)]
pub enum ReporterError {
    /// The component was started outside of a Tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    /// The background task panicked or was cancelled.
    #[error("reporter task failed: {0}")]
    TaskFailed(String),
}

impl From<tokio::task::JoinError> for ReporterError {
    fn from(err: tokio::task::JoinError) -> Self {
        ReporterError::TaskFailed(err.to_string())
    }
}
