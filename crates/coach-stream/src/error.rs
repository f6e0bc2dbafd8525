//! Error types for coach-stream

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using coach-stream Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used to decide whether (and how long) to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Connectivity or fetch failure
    Network,
    /// HTTP 429
    RateLimit,
    /// Request or idle timeout
    Timeout,
    /// HTTP 5xx
    #[serde(rename = "http-5xx")]
    Http5xx,
    /// Any other non-success HTTP status
    #[serde(rename = "http-4xx")]
    Http4xx,
    /// Malformed payload
    Validation,
    /// User-initiated cancellation. Not a failure.
    Abort,
    /// Transport failure that fits nowhere else
    Unknown,
}

impl ErrorCategory {
    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorCategory::RateLimit,
            408 => ErrorCategory::Timeout,
            500..=599 => ErrorCategory::Http5xx,
            _ => ErrorCategory::Http4xx,
        }
    }

    /// Classify an error code as carried on the wire.
    ///
    /// Numeric codes are treated as HTTP statuses; otherwise the category
    /// names produced by [`ErrorCategory::as_str`] are recognised.
    pub fn from_code(code: &str) -> Option<Self> {
        if let Ok(status) = code.trim().parse::<u16>() {
            return Some(Self::from_status(status));
        }
        let category = match code.trim().to_lowercase().replace('_', "-").as_str() {
            "network" => ErrorCategory::Network,
            "rate-limit" | "rate-limited" => ErrorCategory::RateLimit,
            "timeout" => ErrorCategory::Timeout,
            "http-5xx" => ErrorCategory::Http5xx,
            "http-4xx" => ErrorCategory::Http4xx,
            "validation" => ErrorCategory::Validation,
            "abort" | "aborted" => ErrorCategory::Abort,
            "unknown" => ErrorCategory::Unknown,
            _ => return None,
        };
        Some(category)
    }

    /// Whether an operation failing with this category may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network
                | ErrorCategory::RateLimit
                | ErrorCategory::Timeout
                | ErrorCategory::Http5xx
                | ErrorCategory::Unknown
        )
    }

    /// Stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::RateLimit => "rate-limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Http5xx => "http-5xx",
            ErrorCategory::Http4xx => "http-4xx",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Abort => "abort",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The terminal error recorded on an accumulated message.
///
/// This is the shape of an `error` stream part, whether it arrived on the
/// wire or was synthesised locally from a transport failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub is_retryable: bool,
}

impl StreamError {
    pub fn new(message: impl Into<String>, code: Option<String>, is_retryable: bool) -> Self {
        Self {
            message: message.into(),
            code,
            is_retryable,
        }
    }

    /// Category derived from the code, falling back to the retryable flag.
    pub fn category(&self) -> ErrorCategory {
        if let Some(category) = self.code.as_deref().and_then(ErrorCategory::from_code) {
            return category;
        }
        if self.is_retryable {
            ErrorCategory::Unknown
        } else {
            ErrorCategory::Validation
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

/// Errors that can occur while streaming a model response
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Connectivity failure
    #[error("Network error: {0}")]
    Network(String),

    /// No data within the allowed window
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Malformed request or payload
    #[error("Invalid payload: {0}")]
    Validation(String),

    /// Stream was aborted by the caller
    #[error("Request aborted")]
    Aborted,

    /// The endpoint reported an error part
    #[error("Stream error: {0}")]
    Stream(StreamError),
}

impl Error {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Http(e) => {
                if e.is_timeout() {
                    ErrorCategory::Timeout
                } else if let Some(status) = e.status() {
                    ErrorCategory::from_status(status.as_u16())
                } else if e.is_connect() || e.is_request() || e.is_body() {
                    ErrorCategory::Network
                } else if e.is_decode() {
                    ErrorCategory::Validation
                } else {
                    ErrorCategory::Unknown
                }
            }
            Error::Json(_) | Error::Validation(_) => ErrorCategory::Validation,
            Error::Status { status, .. } => ErrorCategory::from_status(*status),
            Error::Network(_) => ErrorCategory::Network,
            Error::Timeout(_) => ErrorCategory::Timeout,
            Error::Aborted => ErrorCategory::Abort,
            Error::Stream(e) => e.category(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Stream(e) => e.is_retryable,
            Error::Status { status, .. } => *status >= 500 || *status == 429,
            other => other.category().is_retryable(),
        }
    }

    /// Convert into the error shape recorded on an accumulated message
    pub fn to_stream_error(&self) -> StreamError {
        match self {
            Error::Stream(e) => e.clone(),
            Error::Status { status, body } => {
                let message = if body.trim().is_empty() {
                    format!("HTTP {}", status)
                } else {
                    body.clone()
                };
                StreamError::new(message, Some(status.to_string()), self.is_retryable())
            }
            other => StreamError::new(
                other.to_string(),
                Some(other.category().as_str().to_string()),
                other.is_retryable(),
            ),
        }
    }
}

impl From<StreamError> for Error {
    fn from(e: StreamError) -> Self {
        Error::Stream(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ErrorCategory::from_status(429), ErrorCategory::RateLimit);
        assert_eq!(ErrorCategory::from_status(503), ErrorCategory::Http5xx);
        assert_eq!(ErrorCategory::from_status(404), ErrorCategory::Http4xx);
        assert_eq!(ErrorCategory::from_status(408), ErrorCategory::Timeout);
    }

    #[test]
    fn test_status_retryable() {
        assert!(Error::Status { status: 500, body: String::new() }.is_retryable());
        assert!(Error::Status { status: 429, body: String::new() }.is_retryable());
        assert!(!Error::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!Error::Status { status: 401, body: String::new() }.is_retryable());
    }

    #[test]
    fn test_retryable_typed_variants() {
        assert!(Error::Network("connection reset".into()).is_retryable());
        assert!(Error::Timeout("idle".into()).is_retryable());
    }

    #[test]
    fn test_not_retryable() {
        assert!(!Error::Validation("bad".into()).is_retryable());
        assert!(!Error::Aborted.is_retryable());
    }

    #[test]
    fn test_category_from_code() {
        assert_eq!(ErrorCategory::from_code("503"), Some(ErrorCategory::Http5xx));
        assert_eq!(ErrorCategory::from_code("rate_limit"), Some(ErrorCategory::RateLimit));
        assert_eq!(ErrorCategory::from_code("network"), Some(ErrorCategory::Network));
        assert_eq!(ErrorCategory::from_code("E_WHATEVER"), None);
    }

    #[test]
    fn test_stream_error_category_fallback() {
        assert_eq!(
            StreamError::new("boom", None, true).category(),
            ErrorCategory::Unknown
        );
        assert_eq!(
            StreamError::new("bad input", Some("E42".into()), false).category(),
            ErrorCategory::Validation
        );
    }

    #[test]
    fn test_to_stream_error_keeps_category() {
        let err = Error::Timeout("no data for 30s".into()).to_stream_error();
        assert!(err.is_retryable);
        assert_eq!(err.category(), ErrorCategory::Timeout);

        let err = Error::Status { status: 502, body: "bad gateway".into() }.to_stream_error();
        assert_eq!(err.message, "bad gateway");
        assert_eq!(err.code.as_deref(), Some("502"));
        assert_eq!(err.category(), ErrorCategory::Http5xx);
    }

    #[test]
    fn test_empty_status_body_gets_message() {
        let err = Error::Status { status: 500, body: "  ".into() }.to_stream_error();
        assert_eq!(err.message, "HTTP 500");
    }

    #[test]
    fn test_category_serde_names() {
        let json = serde_json::to_string(&ErrorCategory::Http5xx).unwrap();
        assert_eq!(json, "\"http-5xx\"");
        let json = serde_json::to_string(&ErrorCategory::RateLimit).unwrap();
        assert_eq!(json, "\"rate-limit\"");
    }
}
