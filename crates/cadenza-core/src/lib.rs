//! Core domain models, events and persistence for release delivery.
//!
//! Provides strongly-typed identifiers, the delivery and webhook entities, the
//! shared retry policy, the domain event bus and the Postgres repositories.
//! The delivery and webhook crates build on these types and never talk to
//! each other directly.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod retry;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    event_channel, ChannelEventHandler, DomainEvent, EventHandler, MulticastEventHandler,
    NoOpEventHandler,
};
pub use models::{
    AttemptId, AttemptOutcome, DeliveryAttempt, DeliveryId, DeliveryOperation, DeliveryPartner,
    DeliveryState, DeliveryStatus, EndpointId, EndpointStatus, EventId, EventType, PartnerId,
    PartnerStatus, PartnerType, Release, ReleaseId, ReleaseStatus, WebhookEndpoint, WebhookEvent,
    WebhookEventId, WebhookEventStatus,
};
pub use retry::{BackoffStrategy, FailureKind, RetryDecision, RetryPolicy};
pub use time::{Clock, RealClock, TestClock};
