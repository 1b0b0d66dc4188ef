//! Domain events and the event bus boundary.
//!
//! The delivery state machine publishes one `DomainEvent` per terminal
//! transition; the webhook dispatcher consumes the same stream. Neither side
//! references the other: both only see the `EventHandler` trait.
//!
//! ```text
//! ┌──────────────────────┐  DomainEvent   ┌────────────────────┐
//! │ DeliveryStateMachine │ ─────────────▶ │ EventHandler       │
//! │ (producer)           │                │  ├ Multicast       │
//! └──────────────────────┘                │  ├ Channel ──▶ rx  │
//!                                         │  └ NoOp            │
//!                                         └────────────────────┘
//!                                                   │
//!                                                   ▼
//!                                         ┌────────────────────┐
//!                                         │ WebhookDispatcher  │
//!                                         │ (consumer)         │
//!                                         └────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::models::{DeliveryState, EventId, EventType, PartnerId, ReleaseId};

/// A status change published on the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique id of this occurrence.
    pub id: EventId,

    /// What happened.
    pub event_type: EventType,

    /// Release concerned.
    pub release_id: ReleaseId,

    /// Partner concerned.
    pub partner_id: PartnerId,

    /// Partner display name.
    pub partner_name: String,

    /// Partner-side reference, if known.
    pub external_id: Option<String>,

    /// Delivery state after the transition.
    pub status: DeliveryState,

    /// When the transition was committed.
    pub timestamp: DateTime<Utc>,
}

/// Subscriber side of the event bus.
///
/// Handlers must not fail the publisher: errors are logged and swallowed
/// inside the handler.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a domain event.
    async fn handle_event(&self, event: DomainEvent);
}

/// Handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DomainEvent) {}
}

/// Forwards every event to all registered subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DomainEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}

/// Publishes events into a bounded in-process channel.
///
/// Decouples the publisher from consumer latency: the state machine only
/// waits for channel capacity, never for webhook HTTP calls.
#[derive(Debug, Clone)]
pub struct ChannelEventHandler {
    sender: mpsc::Sender<DomainEvent>,
}

/// Creates a bounded event bus, returning the publishing handler and the
/// receiving end for a consumer.
pub fn event_channel(capacity: usize) -> (ChannelEventHandler, mpsc::Receiver<DomainEvent>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (ChannelEventHandler { sender }, receiver)
}

#[async_trait::async_trait]
impl EventHandler for ChannelEventHandler {
    async fn handle_event(&self, event: DomainEvent) {
        let event_id = event.id;
        if self.sender.send(event).await.is_err() {
            warn!(event_id = %event_id, "event bus receiver closed, dropping domain event");
        }
    }
}
