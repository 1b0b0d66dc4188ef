//! Core domain models and strongly-typed identifiers.
//!
//! Defines releases, partners, delivery status rows, attempt records and
//! webhook entities, plus newtype ID wrappers for compile-time type safety.
//! Status enums are persisted as lowercase text labels.

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
pub use sqlx::types::Json;
use uuid::Uuid;

use crate::error::CoreError;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Default number of attempts a delivery series may consume.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Default partner rate-limit budget (requests per window).
pub const DEFAULT_RATE_LIMIT_REQUESTS: i32 = 100;

/// Default partner rate-limit window in seconds.
pub const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: i32 = 3600;

/// Declares a UUID-backed identifier with display, serde and sqlx support.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

/// Implements label conversion and text persistence for a fieldless enum.
macro_rules! text_enum {
    ($name:ident, $what:literal, { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            /// Returns the label used in storage and on the wire.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok(Self::$variant),)+
                    _ => Err(CoreError::InvalidInput(format!("invalid {}: {s}", $what))),
                }
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <&str as sqlx::Type<PgDb>>::type_info()
            }

            fn compatible(ty: &PgTypeInfo) -> bool {
                <&str as sqlx::Type<PgDb>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(s.parse()?)
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
            }
        }
    };
}

uuid_id!(
    /// Strongly-typed release identifier.
    ///
    /// Releases are owned by the catalog; the dispatch core only reads them.
    ReleaseId
);

uuid_id!(
    /// Identifier of a `DeliveryStatus` row.
    DeliveryId
);

uuid_id!(
    /// Identifier of an immutable `DeliveryAttempt` record.
    AttemptId
);

uuid_id!(
    /// Strongly-typed webhook endpoint identifier.
    EndpointId
);

uuid_id!(
    /// Identifier of a `WebhookEvent` delivery series.
    WebhookEventId
);

uuid_id!(
    /// Identifier of a domain event published on the event bus.
    ///
    /// Together with an endpoint id it forms the webhook idempotency key, so a
    /// domain event replayed by the bus maps onto the same delivery series.
    EventId
);

/// Partner identifier.
///
/// Partners are keyed by a stable slug (`spotify`, `apple-music`) rather than
/// a UUID. Ordering is lexicographic and serves as the dispatch tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartnerId(pub String);

impl PartnerId {
    /// Creates a partner identifier from its slug.
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    /// Returns the slug.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartnerId {
    fn from(slug: &str) -> Self {
        Self(slug.to_string())
    }
}

impl sqlx::Type<PgDb> for PartnerId {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <String as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for PartnerId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let slug = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(slug))
    }
}

impl sqlx::Encode<'_, PgDb> for PartnerId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Catalog lifecycle of a release.
///
/// ```text
/// draft -> processing -> ready -> delivered -> live
///                                     |-> failed
///                                     `-> takedown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    /// Being edited, not yet submitted.
    Draft,
    /// Assets are being processed.
    Processing,
    /// Ready to be delivered.
    Ready,
    /// Delivered to at least one partner.
    Delivered,
    /// Published on at least one partner.
    Live,
    /// Delivery failed.
    Failed,
    /// Removed from distribution.
    Takedown,
}

text_enum!(ReleaseStatus, "release status", {
    Draft => "draft",
    Processing => "processing",
    Ready => "ready",
    Delivered => "delivered",
    Live => "live",
    Failed => "failed",
    Takedown => "takedown",
});

/// A distributable music product.
///
/// Read-only reference data for the dispatch core.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Release {
    /// Unique identifier for this release.
    pub id: ReleaseId,

    /// Release title.
    pub title: String,

    /// Primary artist name.
    pub artist: String,

    /// Universal Product Code, when assigned.
    pub upc: Option<String>,

    /// Catalog status.
    pub status: ReleaseStatus,

    /// Opaque release document forwarded to partner adapters.
    pub metadata: Json<Value>,

    /// When the release was created.
    pub created_at: DateTime<Utc>,

    /// When the release was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Kind of distribution partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartnerType {
    /// Digital service provider (streaming/download store).
    Dsp,
    /// Aggregator redistributing to further stores.
    Aggregator,
    /// Distributor.
    Distributor,
    /// Social or video platform.
    Platform,
}

text_enum!(PartnerType, "partner type", {
    Dsp => "dsp",
    Aggregator => "aggregator",
    Distributor => "distributor",
    Platform => "platform",
});

/// Operational status of a partner integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartnerStatus {
    /// Accepting deliveries.
    Active,
    /// Disabled by an operator.
    Inactive,
    /// Integration not yet approved.
    Pending,
    /// Temporarily suspended.
    Suspended,
}

text_enum!(PartnerStatus, "partner status", {
    Active => "active",
    Inactive => "inactive",
    Pending => "pending",
    Suspended => "suspended",
});

/// External platform that receives releases.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryPartner {
    /// Partner slug.
    pub id: PartnerId,

    /// Display name, included in webhook payloads.
    pub name: String,

    /// Kind of partner.
    pub partner_type: PartnerType,

    /// Whether the partner currently accepts deliveries.
    pub status: PartnerStatus,

    /// Dispatch priority; higher is served first under a concurrency budget.
    pub priority: i32,

    /// Whether new releases are delivered to this partner automatically.
    pub auto_deliver: bool,

    /// Adapter calls allowed per rate-limit window. Zero disables the limit.
    pub rate_limit_requests: i32,

    /// Length of the rate-limit window in seconds.
    pub rate_limit_window_seconds: i32,

    /// Attempts a delivery or takedown series may consume.
    pub max_retries: i32,

    /// When the partner was registered.
    pub created_at: DateTime<Utc>,

    /// When the partner was last updated.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryPartner {
    /// Returns whether deliveries may be dispatched to this partner.
    pub fn is_active(&self) -> bool {
        self.status == PartnerStatus::Active
    }

    /// Returns the rate-limit window length.
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.rate_limit_window_seconds).unwrap_or(0))
    }
}

/// State of one (release, partner) delivery unit.
///
/// ```text
/// pending -> in_progress -> delivered -> live
///                       |-> failed
///                       `-> rejected
/// in_progress | delivered | live -> takedown -> suspended
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Row created, no attempt made yet.
    Pending,

    /// Delivery under way, possibly waiting for a scheduled retry.
    InProgress,

    /// Partner accepted the release.
    Delivered,

    /// Partner confirmed publication.
    Live,

    /// Retryable failures exhausted the retry budget.
    Failed,

    /// Partner permanently rejected the release.
    Rejected,

    /// Release removed from the partner.
    Takedown,

    /// Taken-down delivery parked by an operator.
    Suspended,
}

text_enum!(DeliveryState, "delivery state", {
    Pending => "pending",
    InProgress => "in_progress",
    Delivered => "delivered",
    Live => "live",
    Failed => "failed",
    Rejected => "rejected",
    Takedown => "takedown",
    Suspended => "suspended",
});

impl DeliveryState {
    /// Returns whether the partner holds the release.
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered | Self::Live)
    }

    /// Returns whether a `start` call has nothing left to do in this state.
    pub const fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Delivered
                | Self::Live
                | Self::Failed
                | Self::Rejected
                | Self::Takedown
                | Self::Suspended
        )
    }
}

/// Partner operation a delivery row's retry fields currently describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOperation {
    /// Sending the release to the partner.
    Deliver,
    /// Removing the release from the partner.
    Takedown,
}

text_enum!(DeliveryOperation, "delivery operation", {
    Deliver => "deliver",
    Takedown => "takedown",
});

/// The mutable delivery row for one (release, partner) pair.
///
/// Exactly one row exists per pair. It is only mutated by the delivery state
/// machine while holding the row's claim, and never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryStatus {
    /// Unique identifier for this row.
    pub id: DeliveryId,

    /// Release being delivered.
    pub release_id: ReleaseId,

    /// Target partner.
    pub partner_id: PartnerId,

    /// Operation the retry bookkeeping belongs to.
    pub operation: DeliveryOperation,

    /// Current state.
    pub status: DeliveryState,

    /// Partner-side reference, known once the partner accepted the release.
    pub external_id: Option<String>,

    /// Free-form status last reported by the partner.
    pub external_status: Option<String>,

    /// Last classified error, cleared on success.
    pub error_message: Option<String>,

    /// Retryable failures consumed by the current series.
    pub retry_count: i32,

    /// Retry budget of the current series.
    pub max_retries: i32,

    /// When the sweeper should revisit this row.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// In-flight lease. Set while an attempt is running.
    pub claimed_at: Option<DateTime<Utc>>,

    /// When the partner accepted the release.
    pub delivered_at: Option<DateTime<Utc>>,

    /// When the partner confirmed publication.
    pub live_at: Option<DateTime<Utc>>,

    /// When the row entered `failed` or `rejected`.
    pub failed_at: Option<DateTime<Utc>>,

    /// When the takedown completed.
    pub takedown_at: Option<DateTime<Utc>>,

    /// When the row was suspended.
    pub suspended_at: Option<DateTime<Utc>>,

    /// When the row was created.
    pub created_at: DateTime<Utc>,

    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryStatus {
    /// Creates a fresh `pending` row.
    pub fn new(
        release_id: ReleaseId,
        partner_id: PartnerId,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            release_id,
            partner_id,
            operation: DeliveryOperation::Deliver,
            status: DeliveryState::Pending,
            external_id: None,
            external_status: None,
            error_message: None,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            claimed_at: None,
            delivered_at: None,
            live_at: None,
            failed_at: None,
            takedown_at: None,
            suspended_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns whether a scheduled retry (if any) has come due.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Returns whether the current series still has retry budget.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Returns whether a takedown series is scheduled to continue.
    pub fn takedown_pending(&self) -> bool {
        self.operation == DeliveryOperation::Takedown && self.next_retry_at.is_some()
    }
}

/// Classified outcome of a single adapter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The partner accepted the request.
    Success,
    /// Transient failure; the series may retry.
    RetryableFailure,
    /// Permanent failure; retrying cannot change the outcome.
    PermanentFailure,
}

text_enum!(AttemptOutcome, "attempt outcome", {
    Success => "success",
    RetryableFailure => "retryable_failure",
    PermanentFailure => "permanent_failure",
});

/// Immutable audit record of one partner adapter call.
///
/// Written before the owning `DeliveryStatus` is committed and never
/// modified afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    /// Unique identifier for this attempt.
    pub id: AttemptId,

    /// Owning delivery row.
    pub delivery_id: DeliveryId,

    /// Release the attempt was made for.
    pub release_id: ReleaseId,

    /// Partner the attempt was made to.
    pub partner_id: PartnerId,

    /// Operation attempted.
    pub operation: DeliveryOperation,

    /// Sequential number within the delivery row, starting at 1.
    pub attempt_number: i32,

    /// Classified outcome.
    pub outcome: AttemptOutcome,

    /// Payload handed to the adapter.
    pub request_payload: Json<Value>,

    /// Partner response body, when one was received.
    pub response_payload: Option<Json<Value>>,

    /// HTTP-equivalent status code, when the partner responded.
    pub status_code: Option<i32>,

    /// Wall time spent in the adapter call.
    pub latency_ms: i64,

    /// Error category label for failed attempts.
    pub error_kind: Option<String>,

    /// Human-readable error description.
    pub error_message: Option<String>,

    /// When the adapter call started.
    pub started_at: DateTime<Utc>,

    /// When the adapter call returned.
    pub completed_at: DateTime<Utc>,
}

/// Health state of a webhook endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    /// Receives events.
    Active,
    /// Disabled by its owner.
    Inactive,
    /// Disabled after repeated failures.
    Failed,
    /// Disabled by an operator.
    Suspended,
}

text_enum!(EndpointStatus, "endpoint status", {
    Active => "active",
    Inactive => "inactive",
    Failed => "failed",
    Suspended => "suspended",
});

/// Domain event types that can be published and subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A partner accepted a release.
    DeliveryComplete,
    /// A delivery ended in `failed` or `rejected`.
    DeliveryFailed,
    /// A partner confirmed publication.
    ReleaseLive,
    /// A release was removed from a partner.
    TakedownComplete,
    /// A takedown series gave up.
    TakedownFailed,
    /// A taken-down delivery was suspended.
    DeliverySuspended,
}

text_enum!(EventType, "event type", {
    DeliveryComplete => "delivery_complete",
    DeliveryFailed => "delivery_failed",
    ReleaseLive => "release_live",
    TakedownComplete => "takedown_complete",
    TakedownFailed => "takedown_failed",
    DeliverySuspended => "delivery_suspended",
});

/// Subscriber-configured callback target.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookEndpoint {
    /// Unique identifier for this endpoint.
    pub id: EndpointId,

    /// Human-readable name.
    pub name: String,

    /// Callback URL.
    pub url: String,

    /// Shared secret used to sign payloads.
    pub secret: String,

    /// Event types this endpoint subscribes to.
    pub event_types: Json<Vec<EventType>>,

    /// Health state; only `active` endpoints receive events.
    pub status: EndpointStatus,

    /// Extra static headers sent with every callback.
    pub headers: Json<HashMap<String, String>>,

    /// Maximum delivery attempts per event.
    pub retry_count: i32,

    /// Base backoff delay in seconds.
    pub retry_delay_seconds: i32,

    /// Request timeout in seconds.
    pub timeout_seconds: i32,

    /// When a callback last succeeded.
    pub last_success: Option<DateTime<Utc>>,

    /// When a delivery series last ended in failure.
    pub last_failure: Option<DateTime<Utc>>,

    /// When the endpoint was registered.
    pub created_at: DateTime<Utc>,

    /// When the endpoint was last updated.
    pub updated_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    /// Returns whether this endpoint should receive events of `event_type`.
    pub fn subscribes_to(&self, event_type: EventType) -> bool {
        self.status == EndpointStatus::Active && self.event_types.0.contains(&event_type)
    }

    /// Returns the base backoff delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.retry_delay_seconds).unwrap_or(0))
    }

    /// Returns the request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.timeout_seconds).unwrap_or(0))
    }
}

/// Delivery state of one webhook event series.
///
/// ```text
/// pending -> sent
///        `-> retrying ->* sent | abandoned
///        `-> failed (permanent rejection)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    /// Enqueued, not yet attempted.
    Pending,
    /// Delivered (terminal).
    Sent,
    /// Permanently rejected by the endpoint (terminal).
    Failed,
    /// Waiting for a scheduled retry.
    Retrying,
    /// Attempts exhausted (terminal).
    Abandoned,
}

text_enum!(WebhookEventStatus, "webhook event status", {
    Pending => "pending",
    Sent => "sent",
    Failed => "failed",
    Retrying => "retrying",
    Abandoned => "abandoned",
});

impl WebhookEventStatus {
    /// Returns whether no further delivery attempt will be made.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Abandoned)
    }
}

/// One (endpoint, domain event) delivery series.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookEvent {
    /// Unique identifier for this series.
    pub id: WebhookEventId,

    /// Target endpoint.
    pub endpoint_id: EndpointId,

    /// Domain event being delivered.
    pub event_id: EventId,

    /// Type of the domain event.
    pub event_type: EventType,

    /// Key derived from `(endpoint_id, event_id)`, sent with every attempt.
    pub idempotency_key: String,

    /// JSON body delivered to the endpoint.
    pub payload: Json<Value>,

    /// Current state.
    pub status: WebhookEventStatus,

    /// Attempts made so far.
    pub attempt_count: i32,

    /// Attempt cap copied from the endpoint at enqueue time.
    pub max_attempts: i32,

    /// When the next attempt is due.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// In-flight lease.
    pub claimed_at: Option<DateTime<Utc>>,

    /// Status code of the last response.
    pub http_status_code: Option<i32>,

    /// Body of the last response, truncated.
    pub response_body: Option<String>,

    /// Duration of the last attempt.
    pub response_time_ms: Option<i64>,

    /// Last error description.
    pub error_message: Option<String>,

    /// When the event was delivered.
    pub sent_at: Option<DateTime<Utc>>,

    /// When the series was enqueued.
    pub created_at: DateTime<Utc>,

    /// When the series was last written.
    pub updated_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Creates a `pending` series for `endpoint`.
    pub fn new(
        endpoint: &WebhookEndpoint,
        event_id: EventId,
        event_type: EventType,
        idempotency_key: String,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WebhookEventId::new(),
            endpoint_id: endpoint.id,
            event_id,
            event_type,
            idempotency_key,
            payload: Json(payload),
            status: WebhookEventStatus::Pending,
            attempt_count: 0,
            max_attempts: endpoint.retry_count,
            next_retry_at: None,
            claimed_at: None,
            http_status_code: None,
            response_body: None,
            response_time_ms: None,
            error_message: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
