//! JSON body of a webhook callback.

use cadenza_core::{
    events::DomainEvent,
    models::{DeliveryState, EventId, EventType, PartnerId, ReleaseId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Callback body sent to subscriber endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Domain event id.
    pub event_id: EventId,
    /// Event type label.
    pub event_type: EventType,
    /// Release concerned.
    pub release_id: ReleaseId,
    /// Partner concerned.
    pub partner_id: PartnerId,
    /// Partner display name.
    pub partner_name: String,
    /// Delivery state after the transition.
    pub status: DeliveryState,
    /// Partner-side reference, if known.
    pub external_id: Option<String>,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
    /// Stable key of the (endpoint, event) pair.
    pub idempotency_key: String,
}

impl WebhookPayload {
    /// Builds the payload of `event` for one endpoint.
    pub fn from_event(event: &DomainEvent, idempotency_key: impl Into<String>) -> Self {
        Self {
            event_id: event.id,
            event_type: event.event_type,
            release_id: event.release_id,
            partner_id: event.partner_id.clone(),
            partner_name: event.partner_name.clone(),
            status: event.status,
            external_id: event.external_id.clone(),
            timestamp: event.timestamp,
            idempotency_key: idempotency_key.into(),
        }
    }

    /// Converts the payload into a JSON value.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}
