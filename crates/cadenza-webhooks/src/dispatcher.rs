//! Webhook fan-out and delivery.
//!
//! Each domain event becomes one `WebhookEvent` series per active subscribed
//! endpoint. A series is delivered with the endpoint's own retry budget and
//! backoff:
//!
//! ```text
//! pending ──2xx──▶ sent
//!    │
//!    ├──5xx/408/429/timeout──▶ retrying ──…──▶ sent | abandoned
//!    │
//!    └──other 4xx──▶ failed
//! ```
//!
//! Series are keyed by `(endpoint_id, event_id)`, so enqueueing the same
//! domain event twice never produces a second callback.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use cadenza_core::{
    events::{DomainEvent, EventHandler},
    models::{
        EndpointStatus, EventId, WebhookEndpoint, WebhookEvent, WebhookEventId, WebhookEventStatus,
    },
    retry::{RetryDecision, RetryPolicy, WEBHOOK_BASE_DELAY},
    time::Clock,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    client::{WebhookClient, WebhookRequest},
    error::{Result, WebhookError},
    payload::WebhookPayload,
    signing::{canonical_json, idempotency_key, sign},
    storage::WebhookStorage,
};

/// Configuration for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Age after which an unreleased lease is considered abandoned.
    pub claim_lease: Duration,
    /// Maximum events handled by one `dispatch_due` call.
    pub batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { claim_lease: Duration::from_secs(120), batch_size: 50 }
    }
}

/// Delivers domain events to subscriber endpoints.
pub struct WebhookDispatcher {
    storage: Arc<dyn WebhookStorage>,
    client: Arc<WebhookClient>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl fmt::Debug for WebhookDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookDispatcher").field("config", &self.config).finish_non_exhaustive()
    }
}

impl WebhookDispatcher {
    /// Creates a dispatcher.
    pub fn new(
        storage: Arc<dyn WebhookStorage>,
        client: Arc<WebhookClient>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self { storage, client, clock, config }
    }

    /// Returns the clock used for scheduling.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Creates one series per active endpoint subscribed to the event type.
    ///
    /// Existing series for the same (endpoint, event) pair are returned
    /// unchanged.
    ///
    /// # Errors
    ///
    /// `Database` if endpoints cannot be listed or a series cannot be stored.
    pub async fn enqueue(&self, event: &DomainEvent) -> Result<Vec<WebhookEvent>> {
        let endpoints = self.storage.find_subscribed_endpoints(event.event_type).await?;
        let now = self.clock.now_utc();

        let mut series = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints.iter().filter(|e| e.subscribes_to(event.event_type)) {
            let key = idempotency_key(endpoint.id, event.id);
            let payload = WebhookPayload::from_event(event, key.clone()).to_value()?;

            let mut row =
                WebhookEvent::new(endpoint, event.id, event.event_type, key, payload, now);
            row.max_attempts = endpoint.retry_count.max(1);

            let (stored, created) = self.storage.find_or_create_event(row).await?;
            if created {
                debug!(
                    webhook_event_id = %stored.id,
                    endpoint_id = %endpoint.id,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "webhook event enqueued"
                );
            }
            series.push(stored);
        }

        if series.is_empty() {
            debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                "no subscribers for event"
            );
        }

        Ok(series)
    }

    /// Makes one delivery attempt for a series.
    ///
    /// Terminal series are returned untouched without contacting the
    /// endpoint, so redelivering a `sent` event is a no-op.
    ///
    /// # Errors
    ///
    /// - `EventNotFound` if the series does not exist
    /// - `AlreadyClaimed` if another dispatcher is delivering it
    /// - `Database` or `Signing` failures
    ///
    /// Endpoint failures are not errors: they are recorded on the series.
    pub async fn dispatch(&self, id: WebhookEventId) -> Result<WebhookEvent> {
        let event = self
            .storage
            .find_event(id)
            .await?
            .ok_or_else(|| WebhookError::EventNotFound { id: id.to_string() })?;
        if event.status.is_terminal() {
            debug!(webhook_event_id = %id, status = %event.status, "webhook event already settled");
            return Ok(event);
        }

        let now = self.clock.now_utc();
        let stale_before = now - lease(self.config.claim_lease);
        let Some(claimed) = self.storage.try_claim_event(id, now, stale_before).await? else {
            return match self.storage.find_event(id).await? {
                Some(current) if current.status.is_terminal() => Ok(current),
                _ => Err(WebhookError::AlreadyClaimed { id: id.to_string() }),
            };
        };

        let result = self.dispatch_claimed(claimed).await;
        if result.is_err() {
            if let Err(e) = self.storage.release_event_claim(id).await {
                warn!(webhook_event_id = %id, error = %e, "failed to release webhook claim");
            }
        }
        result
    }

    /// Enqueues `event` and immediately attempts every series that is due.
    ///
    /// # Errors
    ///
    /// Errors from [`enqueue`](Self::enqueue). Per-series dispatch errors are
    /// logged; those series stay due for the next sweep.
    pub async fn process_event(&self, event: &DomainEvent) -> Result<Vec<WebhookEvent>> {
        let series = self.enqueue(event).await?;
        let now = self.clock.now_utc();

        let mut settled = Vec::with_capacity(series.len());
        for row in series {
            if row.status.is_terminal() || row.next_retry_at.is_some_and(|at| at > now) {
                settled.push(row);
                continue;
            }
            match self.dispatch(row.id).await {
                Ok(updated) => settled.push(updated),
                Err(e) => {
                    warn!(webhook_event_id = %row.id, error = %e, "webhook dispatch failed");
                    settled.push(row);
                },
            }
        }
        Ok(settled)
    }

    /// Attempts pending and retrying series whose retry time has come.
    ///
    /// Returns how many series were attempted.
    ///
    /// # Errors
    ///
    /// `Database` if due series cannot be listed.
    pub async fn dispatch_due(&self) -> Result<usize> {
        let now = self.clock.now_utc();
        let stale_before = now - lease(self.config.claim_lease);
        let due = self.storage.find_due_events(now, stale_before, self.config.batch_size).await?;

        let mut attempted = 0;
        for event in due {
            match self.dispatch(event.id).await {
                Ok(_) => attempted += 1,
                Err(WebhookError::AlreadyClaimed { .. }) => {},
                Err(e) => {
                    warn!(
                        webhook_event_id = %event.id,
                        error = %e,
                        "scheduled webhook dispatch failed"
                    );
                },
            }
        }
        Ok(attempted)
    }

    /// Lists the series created for a domain event.
    ///
    /// # Errors
    ///
    /// `Database` on storage failure.
    pub async fn events_for(&self, event_id: EventId) -> Result<Vec<WebhookEvent>> {
        Ok(self.storage.find_events_for(event_id).await?)
    }

    async fn dispatch_claimed(&self, mut event: WebhookEvent) -> Result<WebhookEvent> {
        let Some(endpoint) = self.storage.find_endpoint(event.endpoint_id).await? else {
            return self.fail_without_attempt(event, "endpoint no longer exists").await;
        };
        if endpoint.status != EndpointStatus::Active {
            let reason = format!("endpoint is {}", endpoint.status);
            return self.fail_without_attempt(event, &reason).await;
        }

        let body = canonical_json(&event.payload.0)?;
        let signature = sign(&endpoint.secret, body.as_bytes())?;
        let attempt_number = event.attempt_count + 1;

        let request = WebhookRequest {
            webhook_event_id: event.id,
            url: endpoint.url.clone(),
            body: Bytes::from(body),
            signature,
            idempotency_key: event.idempotency_key.clone(),
            event_type: event.event_type,
            attempt_number,
            headers: endpoint.headers.0.clone(),
            timeout: endpoint.timeout(),
        };

        let started = self.clock.now();
        let outcome = self.client.send(&request).await;
        let elapsed = self.clock.now().duration_since(started);
        let now = self.clock.now_utc();

        event.attempt_count = attempt_number;
        event.response_time_ms = Some(i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX));
        event.claimed_at = None;
        event.updated_at = now;

        match outcome {
            Ok(response) => {
                event.status = WebhookEventStatus::Sent;
                event.sent_at = Some(now);
                event.next_retry_at = None;
                event.http_status_code = Some(i32::from(response.status_code));
                event.response_body = Some(response.body);
                event.error_message = None;

                self.storage.save_event(event.clone()).await?;
                self.storage.record_endpoint_success(endpoint.id, now).await?;
                info!(
                    webhook_event_id = %event.id,
                    endpoint_id = %endpoint.id,
                    attempt = attempt_number,
                    "webhook delivered"
                );
            },
            Err(error) => {
                event.http_status_code = error.status_code().map(i32::from);
                event.response_body = match &error {
                    WebhookError::Http { body, .. } => Some(body.clone()),
                    _ => None,
                };
                event.error_message = Some(error.to_string());

                let decision = if error.is_retryable() {
                    let failures = u32::try_from(attempt_number).unwrap_or(u32::MAX);
                    retry_policy(&endpoint, event.max_attempts)
                        .next_delay(failures, error.failure_kind())
                } else {
                    RetryDecision::GiveUp { reason: "endpoint rejected the callback".to_string() }
                };

                match decision {
                    RetryDecision::Retry { .. } => {
                        event.status = WebhookEventStatus::Retrying;
                        event.next_retry_at = decision.next_attempt_at(now);
                        self.storage.save_event(event.clone()).await?;
                        warn!(
                            webhook_event_id = %event.id,
                            endpoint_id = %endpoint.id,
                            attempt = attempt_number,
                            max_attempts = event.max_attempts,
                            next_retry_at = ?event.next_retry_at,
                            error = %error,
                            "webhook delivery failed, retry scheduled"
                        );
                    },
                    RetryDecision::GiveUp { reason } => {
                        event.status = if error.is_retryable() {
                            WebhookEventStatus::Abandoned
                        } else {
                            WebhookEventStatus::Failed
                        };
                        event.next_retry_at = None;
                        self.storage.save_event(event.clone()).await?;
                        self.storage.record_endpoint_failure(endpoint.id, now).await?;
                        error!(
                            webhook_event_id = %event.id,
                            endpoint_id = %endpoint.id,
                            attempt = attempt_number,
                            status = %event.status,
                            reason = %reason,
                            error = %error,
                            "webhook delivery given up"
                        );
                    },
                }
            },
        }

        Ok(event)
    }

    async fn fail_without_attempt(
        &self,
        mut event: WebhookEvent,
        reason: &str,
    ) -> Result<WebhookEvent> {
        let now = self.clock.now_utc();
        event.status = WebhookEventStatus::Failed;
        event.next_retry_at = None;
        event.error_message = Some(reason.to_string());
        event.claimed_at = None;
        event.updated_at = now;
        self.storage.save_event(event.clone()).await?;

        warn!(
            webhook_event_id = %event.id,
            endpoint_id = %event.endpoint_id,
            reason,
            "webhook event failed without attempt"
        );
        Ok(event)
    }
}

#[async_trait]
impl EventHandler for WebhookDispatcher {
    async fn handle_event(&self, event: DomainEvent) {
        if let Err(e) = self.process_event(&event).await {
            error!(event_id = %event.id, error = %e, "failed to enqueue webhook events");
        }
    }
}

fn retry_policy(endpoint: &WebhookEndpoint, max_attempts: i32) -> RetryPolicy {
    let base = endpoint.retry_delay();
    let base = if base.is_zero() { WEBHOOK_BASE_DELAY } else { base };
    RetryPolicy::webhook(u32::try_from(max_attempts).unwrap_or(1), base)
}

fn lease(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(120))
}
