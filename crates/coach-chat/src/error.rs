//! Error types for coach-chat

use coach_stream::ErrorCategory;
use thiserror::Error;

use crate::queue::ActionKind;

/// Result type alias using coach-chat Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in chat services
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the streaming layer
    #[error(transparent)]
    Stream(#[from] coach_stream::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Key-value storage failed
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// A conversation or message does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input or payload
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Operation needs connectivity
    #[error("Offline")]
    Offline,

    /// No executor is registered for a queued action's type
    #[error("No executor registered for {0}")]
    NoExecutor(ActionKind),
}

impl Error {
    /// Classify this error for retry decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Stream(e) => e.category(),
            Error::Json(_) | Error::Validation(_) | Error::NoExecutor(_) => {
                ErrorCategory::Validation
            }
            Error::NotFound(_) => ErrorCategory::Http4xx,
            Error::Offline => ErrorCategory::Network,
            Error::Storage(_) => ErrorCategory::Unknown,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Stream(e) => e.is_retryable(),
            other => other.category().is_retryable(),
        }
    }
}
