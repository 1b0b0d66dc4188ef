//! Event recording for assertions on published domain events.

use async_trait::async_trait;
use cadenza_core::{
    events::{DomainEvent, EventHandler},
    models::{EventType, PartnerId},
};
use tokio::sync::RwLock;

/// Event handler that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: RwLock<Vec<DomainEvent>>,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every event in publish order.
    pub async fn events(&self) -> Vec<DomainEvent> {
        self.events.read().await.clone()
    }

    /// Returns the events of one type in publish order.
    pub async fn of_type(&self, event_type: EventType) -> Vec<DomainEvent> {
        self.events.read().await.iter().filter(|e| e.event_type == event_type).cloned().collect()
    }

    /// Returns the events published for one partner.
    pub async fn for_partner(&self, partner_id: &PartnerId) -> Vec<DomainEvent> {
        self.events.read().await.iter().filter(|e| &e.partner_id == partner_id).cloned().collect()
    }

    /// Counts events of one type.
    pub async fn count(&self, event_type: EventType) -> usize {
        self.events.read().await.iter().filter(|e| e.event_type == event_type).count()
    }

    /// Drops everything recorded so far.
    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: DomainEvent) {
        self.events.write().await.push(event);
    }
}
