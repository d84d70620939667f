//! Error classification for protected operations.
//!
//! Foreign failures are adapted into a closed set of kinds with known
//! retryability. A configurable pattern list in the retry policy covers
//! anything the closed set does not.

use std::time::Duration;
use thiserror::Error;

/// Closed classification of operation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection dropped mid-request
    ConnectionReset,
    /// The remote side took too long
    Timeout,
    /// Provider throttled the request
    RateLimited,
    /// Service is temporarily down
    ServiceUnavailable,
    /// Generic 5xx-class failure
    ServerError,
    /// DNS or socket level failure
    Network,
    /// The request itself is malformed
    InvalidRequest,
    /// Authentication or authorization failure
    Unauthorized,
    /// The response could not be parsed
    ResponseFormat,
    /// Anything that could not be classified
    Unknown,
}

impl ErrorKind {
    /// Default retryability of the kind, before pattern overrides.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionReset
                | ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::ServiceUnavailable
                | ErrorKind::ServerError
                | ErrorKind::Network
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionReset => "connection reset",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::ServiceUnavailable => "service unavailable",
            ErrorKind::ServerError => "server error",
            ErrorKind::Network => "network error",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::ResponseFormat => "response format error",
            ErrorKind::Unknown => "unknown error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure of a protected operation, adapted into the closed set.
///
/// Callers map their transport or provider errors into this type before
/// handing an operation to the pipeline; `from_status` covers the common
/// HTTP case.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
    /// HTTP status the failure was derived from, when known
    pub status: Option<u16>,
}

impl OperationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    /// Transient failure worth retrying.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    /// Permanent failure, never retried.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    /// Classify a failure by HTTP status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimited,
            503 => ErrorKind::ServiceUnavailable,
            500..=599 => ErrorKind::ServerError,
            400 | 404 | 422 => ErrorKind::InvalidRequest,
            401 | 403 => ErrorKind::Unauthorized,
            _ => ErrorKind::Unknown,
        };
        Self {
            kind,
            message: message.into(),
            status: Some(status),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Failure classification surfaced by the pipeline.
///
/// Every classified failure of a pipeline call is folded into one of these
/// variants and carried inside the returned result; none escapes as a raw
/// error.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Rejected without invoking the operation
    #[error("Circuit breaker is open - retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    /// Every allowed attempt failed
    #[error("All {max_attempts} attempts failed, last error: {last_error}")]
    RetryExhausted {
        attempts: u32,
        max_attempts: u32,
        #[source]
        last_error: OperationError,
    },

    /// Non-retryable failure, stopped without consuming the retry budget
    #[error("Operation rejected: {source}")]
    Rejected {
        #[source]
        source: OperationError,
    },

    /// Deadline expired before the operation settled
    #[error("Operation timed out after {elapsed:?} (budget {timeout_used:?})")]
    TimedOut {
        elapsed: Duration,
        timeout_used: Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            OperationError::from_status(429, "slow down").kind,
            ErrorKind::RateLimited
        );
        assert_eq!(
            OperationError::from_status(408, "late").kind,
            ErrorKind::Timeout
        );
        assert_eq!(
            OperationError::from_status(503, "down").kind,
            ErrorKind::ServiceUnavailable
        );
        assert_eq!(
            OperationError::from_status(500, "boom").kind,
            ErrorKind::ServerError
        );
        assert_eq!(
            OperationError::from_status(401, "denied").kind,
            ErrorKind::Unauthorized
        );
        assert_eq!(
            OperationError::from_status(400, "bad").kind,
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            OperationError::from_status(418, "teapot").kind,
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_convenience_constructors() {
        assert!(OperationError::retryable("flaky upstream").is_retryable());
        assert!(!OperationError::fatal("malformed prompt").is_retryable());
        assert_eq!(OperationError::fatal("malformed prompt").status, None);
    }

    #[test]
    fn test_default_retryability() {
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::ServerError.is_retryable());
        assert!(!ErrorKind::InvalidRequest.is_retryable());
        assert!(!ErrorKind::Unauthorized.is_retryable());
        assert!(!ErrorKind::ResponseFormat.is_retryable());
        assert!(!ErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn test_error_display_includes_kind_and_message() {
        let err = OperationError::from_status(429, "quota exceeded");
        let text = err.to_string();
        assert!(text.contains("rate limited"));
        assert!(text.contains("quota exceeded"));
        assert_eq!(err.status, Some(429));
    }
}
