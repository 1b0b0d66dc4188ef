//! Error types for webhook dispatch.

use std::{fmt, time::Duration};

use cadenza_core::{retry::FailureKind, CoreError};
use thiserror::Error;

/// Result type alias for webhook operations.
pub type Result<T> = std::result::Result<T, WebhookError>;

/// Error types for webhook dispatch.
#[derive(Debug, Clone, Error)]
pub enum WebhookError {
    /// Connection-level failure reaching the endpoint.
    #[error("transport error: {message}")]
    Transport {
        /// Error message describing the failure
        message: String,
    },

    /// The endpoint did not answer within its timeout.
    #[error("endpoint timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// The endpoint answered with a non-2xx status.
    #[error("endpoint responded with HTTP {status_code}")]
    Http {
        /// HTTP status code
        status_code: u16,
        /// Response body, truncated
        body: String,
        /// Seconds requested by a `Retry-After` header
        retry_after_seconds: Option<u64>,
    },

    /// The webhook event does not exist.
    #[error("webhook event not found: {id}")]
    EventNotFound {
        /// Missing webhook event id
        id: String,
    },

    /// The endpoint does not exist.
    #[error("webhook endpoint not found: {id}")]
    EndpointNotFound {
        /// Missing endpoint id
        id: String,
    },

    /// Another dispatcher holds the event's lease.
    #[error("webhook event {id} is already being dispatched")]
    AlreadyClaimed {
        /// Contended webhook event id
        id: String,
    },

    /// Payload could not be signed.
    #[error("signing failed: {message}")]
    Signing {
        /// Error message
        message: String,
    },

    /// Database operation failed.
    #[error("database error: {message}")]
    Database {
        /// Database error message
        message: String,
    },

    /// Invalid client configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },
}

impl WebhookError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates an HTTP status error.
    pub fn http(
        status_code: u16,
        body: impl Into<String>,
        retry_after_seconds: Option<u64>,
    ) -> Self {
        Self::Http { status_code, body: body.into(), retry_after_seconds }
    }

    /// Creates a signing error.
    pub fn signing(message: impl Into<String>) -> Self {
        Self::Signing { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Classifies a failed callback for the retry policy.
    ///
    /// Transport failures, timeouts, 5xx, 408 and 429 are retried. Every
    /// other status is a permanent rejection.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => FailureKind::Retryable,
            Self::Http { status_code: 429, retry_after_seconds, .. } => match retry_after_seconds {
                Some(seconds) => {
                    FailureKind::RateLimited { retry_after: Duration::from_secs(*seconds) }
                },
                None => FailureKind::Retryable,
            },
            Self::Http { status_code, .. } if *status_code == 408 || *status_code >= 500 => {
                FailureKind::Retryable
            },
            _ => FailureKind::Permanent,
        }
    }

    /// Determines if this error is a temporary endpoint failure.
    pub fn is_retryable(&self) -> bool {
        self.failure_kind().is_retryable()
    }

    /// Returns the HTTP status code, if the endpoint answered.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    /// Returns the error category label.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<CoreError> for WebhookError {
    fn from(err: CoreError) -> Self {
        Self::Database { message: err.to_string() }
    }
}

impl From<serde_json::Error> for WebhookError {
    fn from(err: serde_json::Error) -> Self {
        Self::signing(format!("payload serialization failed: {err}"))
    }
}

/// Category of webhook error for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transport failures and timeouts.
    Network,
    /// Endpoint responded with 5xx, 408 or 429.
    Server,
    /// Endpoint rejected the callback.
    Client,
    /// Missing or contended records.
    Request,
    /// Database operations.
    Database,
    /// Signing and configuration problems.
    Configuration,
}

impl From<&WebhookError> for ErrorCategory {
    fn from(error: &WebhookError) -> Self {
        match error {
            WebhookError::Transport { .. } | WebhookError::Timeout { .. } => Self::Network,
            WebhookError::Http { .. } if error.is_retryable() => Self::Server,
            WebhookError::Http { .. } => Self::Client,
            WebhookError::EventNotFound { .. }
            | WebhookError::EndpointNotFound { .. }
            | WebhookError::AlreadyClaimed { .. } => Self::Request,
            WebhookError::Database { .. } => Self::Database,
            WebhookError::Signing { .. } | WebhookError::Configuration { .. } => {
                Self::Configuration
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
            Self::Request => write!(f, "request"),
            Self::Database => write!(f, "database"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_split_into_retryable_and_permanent() {
        for status in [500, 502, 503, 504, 408, 429] {
            assert!(WebhookError::http(status, "", None).is_retryable(), "{status} should retry");
        }
        for status in [400, 401, 403, 404, 410, 422] {
            assert!(!WebhookError::http(status, "", None).is_retryable(), "{status} is permanent");
        }
    }

    #[test]
    fn retry_after_is_used_as_rate_limit_hint() {
        assert_eq!(
            WebhookError::http(429, "", Some(90)).failure_kind(),
            FailureKind::RateLimited { retry_after: Duration::from_secs(90) }
        );
        assert_eq!(WebhookError::http(429, "", None).failure_kind(), FailureKind::Retryable);
    }

    #[test]
    fn categories_follow_retryability() {
        assert_eq!(WebhookError::http(503, "", None).category(), ErrorCategory::Server);
        assert_eq!(WebhookError::http(404, "", None).category(), ErrorCategory::Client);
        let timeout = WebhookError::timeout(Duration::from_secs(5));
        assert_eq!(timeout.category(), ErrorCategory::Network);
        assert_eq!(ErrorCategory::Client.to_string(), "client");
    }
}
