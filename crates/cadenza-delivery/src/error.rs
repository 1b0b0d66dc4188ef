//! Error types for partner delivery operations.
//!
//! Adapter failures are classified into the retry taxonomy (transport,
//! server, rate limit, client rejection) before they reach the state
//! machine. The remaining variants describe caller mistakes, concurrency
//! conflicts and infrastructure failures that the orchestrator reports per
//! partner.

use std::{fmt, time::Duration};

use cadenza_core::{
    models::{DeliveryOperation, DeliveryState},
    retry::FailureKind,
    CoreError,
};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for partner delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection-level failure talking to the partner.
    #[error("transport error: {message}")]
    Transport {
        /// Error message describing the failure
        message: String,
    },

    /// The adapter call exceeded its deadline.
    #[error("partner call timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// The partner failed on its side (5xx-equivalent).
    #[error("partner server error: HTTP {status_code}")]
    ServerError {
        /// HTTP-equivalent status code
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// The partner asked to slow down.
    #[error("partner rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds to wait before retrying
        retry_after_seconds: u64,
    },

    /// The partner rejected the request (4xx-equivalent).
    #[error("partner rejected request: HTTP {status_code}")]
    ClientError {
        /// HTTP-equivalent status code
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// The partner rejected the release on validation grounds.
    #[error("release rejected by partner: {reason}")]
    Rejected {
        /// Partner-supplied reason
        reason: String,
    },

    /// Another attempt holds the (release, partner) lease.
    #[error("delivery of release {release_id} to {partner_id} already in progress")]
    AlreadyInProgress {
        /// Release concerned
        release_id: String,
        /// Partner concerned
        partner_id: String,
    },

    /// The series consumed its whole retry budget.
    #[error("retry budget exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Retries consumed by the series
        attempts: u32,
    },

    /// The scheduled retry time has not been reached.
    #[error("retry not due until {next_retry_at}")]
    NotDue {
        /// When the row becomes eligible
        next_retry_at: DateTime<Utc>,
    },

    /// The requested operation is not allowed from the row's current state.
    #[error("cannot {operation} a delivery in state {state}")]
    InvalidTransition {
        /// Operation requested
        operation: &'static str,
        /// State the row was in
        state: DeliveryState,
    },

    /// No release with this id exists.
    #[error("unknown release: {release_id}")]
    UnknownRelease {
        /// Missing release id
        release_id: String,
    },

    /// No partner with this id exists.
    #[error("unknown partner: {partner_id}")]
    UnknownPartner {
        /// Missing partner id
        partner_id: String,
    },

    /// No delivery row exists for the pair.
    #[error("release {release_id} was never delivered to {partner_id}")]
    NotStarted {
        /// Release concerned
        release_id: String,
        /// Partner concerned
        partner_id: String,
    },

    /// The partner accepted the release without handing out an id, so there
    /// is nothing to address a takedown to.
    #[error("release {release_id} has no external id at {partner_id}")]
    MissingExternalId {
        /// Release concerned
        release_id: String,
        /// Partner concerned
        partner_id: String,
    },

    /// The partner is not accepting deliveries.
    #[error("partner {partner_id} is not active")]
    PartnerInactive {
        /// Partner concerned
        partner_id: String,
    },

    /// No adapter is registered for the partner.
    #[error("no adapter registered for partner {partner_id}")]
    AdapterMissing {
        /// Partner concerned
        partner_id: String,
    },

    /// The operator cancelled the batch before this partner was dispatched.
    #[error("dispatch cancelled before {operation} started")]
    Cancelled {
        /// Operation that was not started
        operation: DeliveryOperation,
    },

    /// Persistence failed.
    #[error("database error: {message}")]
    Database {
        /// Database error message
        message: String,
    },

    /// Invalid adapter or orchestrator configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a transport error from a message.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(deadline: Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates a server error from a partner response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a rate limit error with retry guidance.
    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a client error from a partner response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a validation rejection.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected { reason: reason.into() }
    }

    /// Creates a concurrency conflict error.
    pub fn already_in_progress(
        release_id: impl fmt::Display,
        partner_id: impl fmt::Display,
    ) -> Self {
        Self::AlreadyInProgress {
            release_id: release_id.to_string(),
            partner_id: partner_id.to_string(),
        }
    }

    /// Creates an invalid transition error.
    pub fn invalid_transition(operation: &'static str, state: DeliveryState) -> Self {
        Self::InvalidTransition { operation, state }
    }

    /// Creates a not started error.
    pub fn not_started(release_id: impl fmt::Display, partner_id: impl fmt::Display) -> Self {
        Self::NotStarted { release_id: release_id.to_string(), partner_id: partner_id.to_string() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Classifies an adapter failure for the retry policy.
    ///
    /// Only adapter outcomes are meaningful here; every other variant is
    /// treated as permanent because retrying the partner call cannot fix it.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::ServerError { .. } => {
                FailureKind::Retryable
            },
            Self::RateLimited { retry_after_seconds } => FailureKind::RateLimited {
                retry_after: Duration::from_secs(*retry_after_seconds),
            },
            _ => FailureKind::Permanent,
        }
    }

    /// Determines if this error represents a temporary adapter failure.
    pub fn is_retryable(&self) -> bool {
        self.failure_kind().is_retryable()
    }

    /// Returns the HTTP-equivalent status code carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ServerError { status_code, .. } | Self::ClientError { status_code, .. } => {
                Some(*status_code)
            },
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Returns the partner response body carried by the error, if any.
    pub fn response_body(&self) -> Option<&str> {
        match self {
            Self::ServerError { body, .. } | Self::ClientError { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Returns the error category label.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::database(err.to_string())
    }
}

/// Category of delivery error for logs and attempt records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transport failures and timeouts.
    Network,
    /// Partner-side failures.
    Server,
    /// Partner rate limiting.
    RateLimit,
    /// Permanent partner rejections.
    Rejection,
    /// Lease conflicts and disallowed transitions.
    Conflict,
    /// Unknown ids, inactive partners, cancelled dispatches.
    Request,
    /// Database operations.
    Database,
    /// Configuration problems.
    Configuration,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Transport { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::ClientError { .. } | DeliveryError::Rejected { .. } => Self::Rejection,
            DeliveryError::AlreadyInProgress { .. }
            | DeliveryError::RetriesExhausted { .. }
            | DeliveryError::NotDue { .. }
            | DeliveryError::InvalidTransition { .. } => Self::Conflict,
            DeliveryError::UnknownRelease { .. }
            | DeliveryError::UnknownPartner { .. }
            | DeliveryError::NotStarted { .. }
            | DeliveryError::MissingExternalId { .. }
            | DeliveryError::PartnerInactive { .. }
            | DeliveryError::Cancelled { .. } => Self::Request,
            DeliveryError::Database { .. } => Self::Database,
            DeliveryError::AdapterMissing { .. } | DeliveryError::Configuration { .. } => {
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
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Rejection => write!(f, "rejection"),
            Self::Conflict => write!(f, "conflict"),
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
    fn adapter_failures_classified_for_retry() {
        assert!(DeliveryError::transport("connection reset").is_retryable());
        assert!(DeliveryError::timeout(Duration::from_secs(5)).is_retryable());
        assert!(DeliveryError::server_error(503, "unavailable").is_retryable());
        assert!(DeliveryError::rate_limited(30).is_retryable());

        assert!(!DeliveryError::client_error(422, "bad upc").is_retryable());
        assert!(!DeliveryError::rejected("missing artwork").is_retryable());
        assert!(!DeliveryError::database("pool closed").is_retryable());
    }

    #[test]
    fn rate_limit_carries_retry_after_hint() {
        assert_eq!(
            DeliveryError::rate_limited(120).failure_kind(),
            FailureKind::RateLimited { retry_after: Duration::from_secs(120) }
        );
        assert_eq!(DeliveryError::rate_limited(120).status_code(), Some(429));
    }

    #[test]
    fn conflicts_are_categorized_separately_from_rejections() {
        let conflict = DeliveryError::already_in_progress("r1", "spotify");
        assert_eq!(conflict.category(), ErrorCategory::Conflict);
        assert_eq!(
            conflict.to_string(),
            "delivery of release r1 to spotify already in progress"
        );

        let rejection = DeliveryError::client_error(400, "invalid");
        assert_eq!(rejection.category(), ErrorCategory::Rejection);
        assert_eq!(rejection.category().to_string(), "rejection");
    }

    #[test]
    fn missing_external_id_is_a_permanent_request_error() {
        let err = DeliveryError::MissingExternalId {
            release_id: "r1".to_string(),
            partner_id: "deezer".to_string(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Request);
        assert_eq!(err.to_string(), "release r1 has no external id at deezer");
    }

    #[test]
    fn invalid_transition_names_state_label() {
        let err = DeliveryError::invalid_transition("retry", DeliveryState::Rejected);
        assert_eq!(err.to_string(), "cannot retry a delivery in state rejected");
    }
}
