//! Builders for releases, partners and webhook endpoints.
//!
//! Every builder starts from values that pass validation, so tests only set
//! what they assert on.

use std::collections::HashMap;

use cadenza_core::{
    events::DomainEvent,
    models::{
        DeliveryPartner, DeliveryState, EndpointId, EndpointStatus, EventId, EventType, Json,
        PartnerId, PartnerStatus, PartnerType, Release, ReleaseId, ReleaseStatus,
        WebhookEndpoint, DEFAULT_MAX_RETRIES,
    },
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

/// Fixed instant every fixture and test clock starts from.
///
/// Aligned to a whole hour so rate-limit windows start on it.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().unwrap_or_else(Utc::now)
}

/// Builder for test releases.
#[derive(Debug, Clone)]
pub struct ReleaseBuilder {
    id: ReleaseId,
    title: String,
    artist: String,
    upc: Option<String>,
    status: ReleaseStatus,
    metadata: Value,
}

impl ReleaseBuilder {
    /// Creates a ready release with a fresh id.
    pub fn new() -> Self {
        Self {
            id: ReleaseId::new(),
            title: "Night Drive".to_string(),
            artist: "The Test Pattern".to_string(),
            upc: Some("0602445790128".to_string()),
            status: ReleaseStatus::Ready,
            metadata: json!({
                "genre": "electronic",
                "tracks": [
                    { "position": 1, "title": "Night Drive", "isrc": "USRC17607839" },
                    { "position": 2, "title": "Overpass", "isrc": "USRC17607840" }
                ]
            }),
        }
    }

    /// Sets the release id.
    #[must_use]
    pub fn id(mut self, id: ReleaseId) -> Self {
        self.id = id;
        self
    }

    /// Sets the title.
    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Sets the primary artist.
    #[must_use]
    pub fn artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = artist.into();
        self
    }

    /// Sets the catalog status.
    #[must_use]
    pub fn status(mut self, status: ReleaseStatus) -> Self {
        self.status = status;
        self
    }

    /// Replaces the metadata document.
    #[must_use]
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Builds the release.
    pub fn build(self) -> Release {
        let now = epoch();
        Release {
            id: self.id,
            title: self.title,
            artist: self.artist,
            upc: self.upc,
            status: self.status,
            metadata: Json(self.metadata),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for ReleaseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for test partners.
#[derive(Debug, Clone)]
pub struct PartnerBuilder {
    id: PartnerId,
    name: String,
    partner_type: PartnerType,
    status: PartnerStatus,
    priority: i32,
    auto_deliver: bool,
    rate_limit_requests: i32,
    rate_limit_window_seconds: i32,
    max_retries: i32,
}

impl PartnerBuilder {
    /// Creates an active, unlimited partner with the default retry budget.
    pub fn new(id: &str) -> Self {
        let mut name = id.to_string();
        if let Some(first) = name.get_mut(..1) {
            first.make_ascii_uppercase();
        }

        Self {
            id: PartnerId::new(id),
            name,
            partner_type: PartnerType::Dsp,
            status: PartnerStatus::Active,
            priority: 0,
            auto_deliver: true,
            rate_limit_requests: 0,
            rate_limit_window_seconds: 3600,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the dispatch priority.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Limits the partner to `requests` calls per `window_seconds`.
    #[must_use]
    pub fn rate_limit(mut self, requests: i32, window_seconds: i32) -> Self {
        self.rate_limit_requests = requests;
        self.rate_limit_window_seconds = window_seconds;
        self
    }

    /// Sets whether the partner receives every release automatically.
    #[must_use]
    pub fn auto_deliver(mut self, auto_deliver: bool) -> Self {
        self.auto_deliver = auto_deliver;
        self
    }

    /// Sets the partner status.
    #[must_use]
    pub fn status(mut self, status: PartnerStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the partner type.
    #[must_use]
    pub fn partner_type(mut self, partner_type: PartnerType) -> Self {
        self.partner_type = partner_type;
        self
    }

    /// Builds the partner.
    pub fn build(self) -> DeliveryPartner {
        let now = epoch();
        DeliveryPartner {
            id: self.id,
            name: self.name,
            partner_type: self.partner_type,
            status: self.status,
            priority: self.priority,
            auto_deliver: self.auto_deliver,
            rate_limit_requests: self.rate_limit_requests,
            rate_limit_window_seconds: self.rate_limit_window_seconds,
            max_retries: self.max_retries,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Builder for webhook endpoints.
#[derive(Debug, Clone)]
pub struct EndpointBuilder {
    url: String,
    name: String,
    secret: String,
    event_types: Vec<EventType>,
    status: EndpointStatus,
    headers: HashMap<String, String>,
    retry_count: i32,
    retry_delay_seconds: i32,
    timeout_seconds: i32,
}

impl EndpointBuilder {
    /// Creates an active endpoint subscribed to every event type.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: "label-ops".to_string(),
            secret: "whsec_test_secret".to_string(),
            event_types: vec![
                EventType::DeliveryComplete,
                EventType::DeliveryFailed,
                EventType::ReleaseLive,
                EventType::TakedownComplete,
                EventType::TakedownFailed,
                EventType::DeliverySuspended,
            ],
            status: EndpointStatus::Active,
            headers: HashMap::new(),
            retry_count: 3,
            retry_delay_seconds: 60,
            timeout_seconds: 5,
        }
    }

    /// Sets the signing secret.
    #[must_use]
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    /// Restricts the subscription to `event_types`.
    #[must_use]
    pub fn events(mut self, event_types: &[EventType]) -> Self {
        self.event_types = event_types.to_vec();
        self
    }

    /// Sets the endpoint status.
    #[must_use]
    pub fn status(mut self, status: EndpointStatus) -> Self {
        self.status = status;
        self
    }

    /// Adds a static header sent with every callback.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the attempt cap.
    #[must_use]
    pub fn retry_count(mut self, retry_count: i32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Sets the backoff base, in seconds.
    #[must_use]
    pub fn retry_delay_seconds(mut self, seconds: i32) -> Self {
        self.retry_delay_seconds = seconds;
        self
    }

    /// Sets the request timeout, in seconds.
    #[must_use]
    pub fn timeout_seconds(mut self, seconds: i32) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Builds the endpoint.
    pub fn build(self) -> WebhookEndpoint {
        let now = epoch();
        WebhookEndpoint {
            id: EndpointId::new(),
            name: self.name,
            url: self.url,
            secret: self.secret,
            event_types: Json(self.event_types),
            status: self.status,
            headers: Json(self.headers),
            retry_count: self.retry_count,
            retry_delay_seconds: self.retry_delay_seconds,
            timeout_seconds: self.timeout_seconds,
            last_success: None,
            last_failure: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Creates a domain event for a fresh release on the `spotify` partner.
pub fn domain_event(event_type: EventType) -> DomainEvent {
    let status = match event_type {
        EventType::DeliveryComplete => DeliveryState::Delivered,
        EventType::DeliveryFailed => DeliveryState::Failed,
        EventType::ReleaseLive => DeliveryState::Live,
        EventType::TakedownComplete => DeliveryState::Takedown,
        EventType::TakedownFailed => DeliveryState::Live,
        EventType::DeliverySuspended => DeliveryState::Suspended,
    };

    DomainEvent {
        id: EventId::new(),
        event_type,
        release_id: ReleaseId::new(),
        partner_id: PartnerId::new("spotify"),
        partner_name: "Spotify".to_string(),
        external_id: Some("sp-4411".to_string()),
        status,
        timestamp: epoch(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partner_names_default_to_capitalized_id() {
        assert_eq!(PartnerBuilder::new("deezer").build().name, "Deezer");
    }

    #[test]
    fn endpoint_defaults_subscribe_to_everything() {
        let endpoint = EndpointBuilder::new("http://localhost/hook").build();
        assert!(endpoint.subscribes_to(EventType::DeliverySuspended));
        assert!(endpoint.subscribes_to(EventType::DeliveryComplete));
    }
}
