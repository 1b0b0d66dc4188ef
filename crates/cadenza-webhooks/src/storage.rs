//! Storage abstraction for the webhook dispatcher.

use std::{future::Future, pin::Pin, sync::Arc};

use cadenza_core::{
    error::Result,
    models::{EndpointId, EventId, EventType, WebhookEndpoint, WebhookEvent, WebhookEventId},
    storage::Storage,
};
use chrono::{DateTime, Utc};

/// Storage operations required by the webhook dispatcher.
pub trait WebhookStorage: Send + Sync + 'static {
    /// Lists active endpoints subscribed to `event_type`.
    fn find_subscribed_endpoints(
        &self,
        event_type: EventType,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookEndpoint>>> + Send + '_>>;

    /// Finds an endpoint by id.
    fn find_endpoint(
        &self,
        endpoint_id: EndpointId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEndpoint>>> + Send + '_>>;

    /// Inserts `event` unless its (endpoint, event) pair already exists.
    ///
    /// Returns the stored series and whether it was created by this call.
    fn find_or_create_event(
        &self,
        event: WebhookEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(WebhookEvent, bool)>> + Send + '_>>;

    /// Finds a webhook event by id.
    fn find_event(
        &self,
        id: WebhookEventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>>;

    /// Lists the series created for one domain event.
    fn find_events_for(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookEvent>>> + Send + '_>>;

    /// Takes the in-flight lease on a non-terminal event.
    fn try_claim_event(
        &self,
        id: WebhookEventId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>>;

    /// Persists every mutable field of `event`.
    fn save_event(
        &self,
        event: WebhookEvent,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Drops the lease on an event.
    fn release_event_claim(
        &self,
        id: WebhookEventId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Records a successful callback on the endpoint.
    fn record_endpoint_success(
        &self,
        endpoint_id: EndpointId,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Records a failed series on the endpoint.
    fn record_endpoint_failure(
        &self,
        endpoint_id: EndpointId,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Lists unclaimed pending or retrying events that are due.
    fn find_due_events(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookEvent>>> + Send + '_>>;
}

/// Production storage implementation using PostgreSQL.
pub struct PostgresWebhookStorage {
    storage: Arc<Storage>,
}

impl PostgresWebhookStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl WebhookStorage for PostgresWebhookStorage {
    fn find_subscribed_endpoints(
        &self,
        event_type: EventType,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookEndpoint>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_endpoints.find_subscribed(event_type).await })
    }

    fn find_endpoint(
        &self,
        endpoint_id: EndpointId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEndpoint>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_endpoints.find_by_id(endpoint_id).await })
    }

    fn find_or_create_event(
        &self,
        event: WebhookEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(WebhookEvent, bool)>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.find_or_create(&event).await })
    }

    fn find_event(
        &self,
        id: WebhookEventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.find_by_id(id).await })
    }

    fn find_events_for(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookEvent>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.find_by_event(event_id).await })
    }

    fn try_claim_event(
        &self,
        id: WebhookEventId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.try_claim(id, now, stale_before).await })
    }

    fn save_event(
        &self,
        event: WebhookEvent,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.update(&event).await })
    }

    fn release_event_claim(
        &self,
        id: WebhookEventId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.release_claim(id).await })
    }

    fn record_endpoint_success(
        &self,
        endpoint_id: EndpointId,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_endpoints.record_success(endpoint_id, at).await })
    }

    fn record_endpoint_failure(
        &self,
        endpoint_id: EndpointId,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_endpoints.record_failure(endpoint_id, at).await })
    }

    fn find_due_events(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookEvent>>> + Send + '_>> {
        let storage = self.storage.clone();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Box::pin(async move { storage.webhook_events.find_due(now, stale_before, limit).await })
    }
}

pub mod mock {
    //! In-memory webhook storage for tests.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use cadenza_core::{error::Result, models::WebhookEventStatus};
    use chrono::{DateTime, Utc};
    use tokio::sync::RwLock;

    use super::{
        EndpointId, EventId, EventType, WebhookEndpoint, WebhookEvent, WebhookEventId,
        WebhookStorage,
    };

    #[derive(Default)]
    struct State {
        endpoints: HashMap<EndpointId, WebhookEndpoint>,
        events: Vec<WebhookEvent>,
    }

    /// In-memory webhook storage.
    #[derive(Default, Clone)]
    pub struct MockWebhookStorage {
        state: Arc<RwLock<State>>,
    }

    impl MockWebhookStorage {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers or replaces an endpoint.
        pub async fn add_endpoint(&self, endpoint: WebhookEndpoint) {
            self.state.write().await.endpoints.insert(endpoint.id, endpoint);
        }

        /// Returns the stored copy of an endpoint.
        pub async fn endpoint(&self, id: EndpointId) -> Option<WebhookEndpoint> {
            self.state.read().await.endpoints.get(&id).cloned()
        }

        /// Returns every stored event in enqueue order.
        pub async fn events(&self) -> Vec<WebhookEvent> {
            self.state.read().await.events.clone()
        }
    }

    impl WebhookStorage for MockWebhookStorage {
        fn find_subscribed_endpoints(
            &self,
            event_type: EventType,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookEndpoint>>> + Send + '_>> {
            Box::pin(async move {
                let mut endpoints: Vec<_> = self
                    .state
                    .read()
                    .await
                    .endpoints
                    .values()
                    .filter(|endpoint| endpoint.subscribes_to(event_type))
                    .cloned()
                    .collect();
                endpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                Ok(endpoints)
            })
        }

        fn find_endpoint(
            &self,
            endpoint_id: EndpointId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEndpoint>>> + Send + '_>> {
            Box::pin(
                async move { Ok(self.state.read().await.endpoints.get(&endpoint_id).cloned()) },
            )
        }

        fn find_or_create_event(
            &self,
            event: WebhookEvent,
        ) -> Pin<Box<dyn Future<Output = Result<(WebhookEvent, bool)>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if let Some(existing) = state
                    .events
                    .iter()
                    .find(|e| e.endpoint_id == event.endpoint_id && e.event_id == event.event_id)
                {
                    return Ok((existing.clone(), false));
                }
                state.events.push(event.clone());
                Ok((event, true))
            })
        }

        fn find_event(
            &self,
            id: WebhookEventId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>> {
            Box::pin(async move {
                Ok(self.state.read().await.events.iter().find(|e| e.id == id).cloned())
            })
        }

        fn find_events_for(
            &self,
            event_id: EventId,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookEvent>>> + Send + '_>> {
            Box::pin(async move {
                Ok(self
                    .state
                    .read()
                    .await
                    .events
                    .iter()
                    .filter(|e| e.event_id == event_id)
                    .cloned()
                    .collect())
            })
        }

        fn try_claim_event(
            &self,
            id: WebhookEventId,
            now: DateTime<Utc>,
            stale_before: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let Some(event) = state.events.iter_mut().find(|e| e.id == id) else {
                    return Ok(None);
                };
                let claimable = matches!(
                    event.status,
                    WebhookEventStatus::Pending | WebhookEventStatus::Retrying
                );
                if !claimable || event.claimed_at.is_some_and(|claimed| claimed >= stale_before) {
                    return Ok(None);
                }
                event.claimed_at = Some(now);
                Ok(Some(event.clone()))
            })
        }

        fn save_event(
            &self,
            event: WebhookEvent,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if let Some(stored) = state.events.iter_mut().find(|e| e.id == event.id) {
                    *stored = event;
                }
                Ok(())
            })
        }

        fn release_event_claim(
            &self,
            id: WebhookEventId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if let Some(event) = state.events.iter_mut().find(|e| e.id == id) {
                    event.claimed_at = None;
                }
                Ok(())
            })
        }

        fn record_endpoint_success(
            &self,
            endpoint_id: EndpointId,
            at: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                if let Some(endpoint) = self.state.write().await.endpoints.get_mut(&endpoint_id) {
                    endpoint.last_success = Some(at);
                    endpoint.updated_at = at;
                }
                Ok(())
            })
        }

        fn record_endpoint_failure(
            &self,
            endpoint_id: EndpointId,
            at: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                if let Some(endpoint) = self.state.write().await.endpoints.get_mut(&endpoint_id) {
                    endpoint.last_failure = Some(at);
                    endpoint.updated_at = at;
                }
                Ok(())
            })
        }

        fn find_due_events(
            &self,
            now: DateTime<Utc>,
            stale_before: DateTime<Utc>,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookEvent>>> + Send + '_>> {
            Box::pin(async move {
                let mut due: Vec<_> = self
                    .state
                    .read()
                    .await
                    .events
                    .iter()
                    .filter(|e| {
                        matches!(
                            e.status,
                            WebhookEventStatus::Pending | WebhookEventStatus::Retrying
                        )
                    })
                    .filter(|e| e.next_retry_at.map_or(true, |at| at <= now))
                    .filter(|e| e.claimed_at.map_or(true, |claimed| claimed < stale_before))
                    .cloned()
                    .collect();
                due.sort_by_key(|e| e.next_retry_at.unwrap_or(e.created_at));
                due.truncate(limit);
                Ok(due)
            })
        }
    }
}
