//! Delivery state machine for one (release, partner) pair.
//!
//! ```text
//! pending -> in_progress -> delivered -> live
//!                       |-> failed     (retry budget spent)
//!                       `-> rejected   (permanent partner error)
//! in_progress | delivered | live -> takedown -> suspended
//! ```
//!
//! Every transition runs while holding the row's lease (`claimed_at`), so at
//! most one attempt per pair is in flight and attempt N+1 cannot start before
//! attempt N is recorded. Different pairs never contend.
//!
//! Scheduled retries are persisted as `next_retry_at`; nothing here holds a
//! timer. A sweep (or the orchestrator's settle loop) calls back in once the
//! row is due.

use std::{sync::Arc, time::Duration};

use cadenza_core::{
    events::{DomainEvent, EventHandler},
    models::{
        AttemptId, AttemptOutcome, DeliveryAttempt, DeliveryId, DeliveryOperation,
        DeliveryPartner, DeliveryState, DeliveryStatus, EventId, EventType, Json, PartnerId,
        Release, ReleaseId,
    },
    retry::{RetryDecision, RetryPolicy},
    time::Clock,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    adapter::{AdapterRegistry, PartnerAdapter, PartnerResponse, PublicationStatus, ReleasePayload},
    error::{DeliveryError, Result},
    rate_limit::{Admission, RateLimiter},
    storage::DeliveryStorage,
};

/// Tunables for the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Deadline for a single adapter call.
    pub attempt_timeout: Duration,

    /// Age after which an unreleased lease is considered abandoned.
    pub claim_lease: Duration,

    /// Backoff policy. `max_attempts` is overridden per row by `max_retries`.
    pub retry_policy: RetryPolicy,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            claim_lease: Duration::from_secs(300),
            retry_policy: RetryPolicy::delivery(),
        }
    }
}

/// A delivery row together with its attempt log.
#[derive(Debug, Clone)]
pub struct DeliveryHistory {
    /// Current row.
    pub status: DeliveryStatus,
    /// Attempts in attempt order.
    pub attempts: Vec<DeliveryAttempt>,
}

enum PartnerCall<'a> {
    Deliver(&'a ReleasePayload),
    Takedown(&'a str),
}

impl PartnerCall<'_> {
    fn request_payload(&self) -> Value {
        match self {
            Self::Deliver(payload) => payload.to_value(),
            Self::Takedown(external_id) => json!({ "external_id": external_id }),
        }
    }
}

/// Drives delivery rows through their lifecycle.
pub struct DeliveryStateMachine {
    storage: Arc<dyn DeliveryStorage>,
    adapters: Arc<AdapterRegistry>,
    rate_limiter: Arc<RateLimiter>,
    events: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
    config: MachineConfig,
}

impl DeliveryStateMachine {
    /// Creates a state machine.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        adapters: Arc<AdapterRegistry>,
        events: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
        config: MachineConfig,
    ) -> Self {
        Self {
            storage,
            adapters,
            rate_limiter: Arc::new(RateLimiter::new()),
            events,
            clock,
            config,
        }
    }

    /// Shares an existing rate limiter instead of the machine's own.
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    /// Returns the clock used for timestamps.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Returns the machine configuration.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Starts (or resumes) delivering `release` to `partner`.
    ///
    /// A fresh row moves to `in_progress` and the adapter is called once. An
    /// `in_progress` row whose retry is due gets its next attempt; one that is
    /// not yet due is returned unchanged. Rows that already reached the
    /// partner are returned unchanged.
    ///
    /// # Errors
    ///
    /// - `AlreadyInProgress` if another attempt holds the pair's lease.
    /// - `InvalidTransition` for `failed`/`rejected` rows (use `retry`).
    /// - `PartnerInactive`, `AdapterMissing`, `Database`.
    pub async fn start(
        &self,
        release: &Release,
        partner: &DeliveryPartner,
    ) -> Result<DeliveryStatus> {
        ensure_active(partner)?;
        let adapter = self.adapters.get(&partner.id)?;

        let now = self.clock.now_utc();
        let row = self
            .storage
            .find_or_create(DeliveryStatus::new(
                release.id,
                partner.id.clone(),
                partner.max_retries,
                now,
            ))
            .await?;
        let row = self.claim(&row).await?;
        let id = row.id;

        let result = async {
            match (row.status, row.operation) {
                (DeliveryState::Pending, _) => {
                    let mut row = row;
                    row.operation = DeliveryOperation::Deliver;
                    row.status = DeliveryState::InProgress;
                    row.retry_count = 0;
                    row.max_retries = partner.max_retries;
                    row.next_retry_at = None;
                    row.updated_at = now;
                    // Persisted before the adapter is called so a crash mid-call
                    // leaves a row the sweeper can pick up.
                    self.storage.save(row.clone()).await?;

                    let payload = ReleasePayload::from_release(release);
                    self.execute(row, partner, adapter.as_ref(), PartnerCall::Deliver(&payload))
                        .await
                },
                (DeliveryState::InProgress, DeliveryOperation::Deliver) if row.retry_due(now) => {
                    let payload = ReleasePayload::from_release(release);
                    self.execute(row, partner, adapter.as_ref(), PartnerCall::Deliver(&payload))
                        .await
                },
                (DeliveryState::Failed | DeliveryState::Rejected, _) => {
                    Err(DeliveryError::invalid_transition("start", row.status))
                },
                _ => {
                    debug!(
                        release_id = %row.release_id,
                        partner_id = %row.partner_id,
                        status = %row.status,
                        "start is a no-op for current state"
                    );
                    self.unclaim(row).await
                },
            }
        }
        .await;

        self.release_on_error(id, result).await
    }

    /// Runs the next scheduled attempt of a delivery series.
    ///
    /// Allowed from `failed` while the row still has retry budget, and from
    /// `in_progress` once `next_retry_at` elapsed. A no-op on `delivered` and
    /// `live` rows: no attempt is recorded.
    ///
    /// # Errors
    ///
    /// - `NotStarted` if the pair has no row.
    /// - `RetriesExhausted` for a `failed` row without budget.
    /// - `NotDue` for an `in_progress` row whose retry is still scheduled.
    /// - `InvalidTransition` for any other state.
    /// - `AlreadyInProgress`, `PartnerInactive`, `AdapterMissing`, `Database`.
    pub async fn retry(
        &self,
        release: &Release,
        partner: &DeliveryPartner,
    ) -> Result<DeliveryStatus> {
        let row = self.find_existing(release.id, &partner.id).await?;
        if row.status.is_delivered() && row.operation == DeliveryOperation::Deliver {
            return Ok(row);
        }

        ensure_active(partner)?;
        let adapter = self.adapters.get(&partner.id)?;

        let row = self.claim(&row).await?;
        let id = row.id;
        let now = self.clock.now_utc();

        let result = async {
            let mut row = row;
            match (row.status, row.operation) {
                (DeliveryState::Delivered | DeliveryState::Live, _) => self.unclaim(row).await,
                (DeliveryState::Failed, _) => {
                    row.max_retries = partner.max_retries.max(row.retry_count);
                    if !row.has_retry_budget() {
                        return Err(DeliveryError::RetriesExhausted {
                            attempts: u32::try_from(row.retry_count).unwrap_or(0),
                        });
                    }
                    row.operation = DeliveryOperation::Deliver;
                    row.status = DeliveryState::InProgress;
                    row.next_retry_at = None;
                    row.updated_at = now;
                    self.storage.save(row.clone()).await?;

                    let payload = ReleasePayload::from_release(release);
                    self.execute(row, partner, adapter.as_ref(), PartnerCall::Deliver(&payload))
                        .await
                },
                (DeliveryState::InProgress, DeliveryOperation::Deliver) => {
                    if let Some(next_retry_at) = row.next_retry_at.filter(|at| *at > now) {
                        return Err(DeliveryError::NotDue { next_retry_at });
                    }
                    row.max_retries = partner.max_retries.max(row.retry_count);

                    let payload = ReleasePayload::from_release(release);
                    self.execute(row, partner, adapter.as_ref(), PartnerCall::Deliver(&payload))
                        .await
                },
                (state, _) => Err(DeliveryError::invalid_transition("retry", state)),
            }
        }
        .await;

        self.release_on_error(id, result).await
    }

    /// Takes a release down from a partner.
    ///
    /// Starts a new takedown series from `in_progress`, `delivered` or `live`,
    /// or continues a scheduled one. An `in_progress` row without an external
    /// id never reached the partner and is taken down locally without calling
    /// the adapter. A `delivered` or `live` row without one cannot be
    /// addressed at the partner: the takedown fails permanently and the row
    /// keeps its status. A no-op on rows already in `takedown` or `suspended`.
    ///
    /// Failed takedown attempts are retried with the same policy as
    /// deliveries; while they are pending the row keeps its previous status.
    ///
    /// # Errors
    ///
    /// - `NotStarted` if the pair has no row.
    /// - `InvalidTransition` from `pending`, `failed` or `rejected`.
    /// - `NotDue` while a scheduled takedown retry is still pending.
    /// - `MissingExternalId` for a delivered row the partner gave no id for.
    /// - `AlreadyInProgress`, `AdapterMissing`, `Database`.
    pub async fn takedown(
        &self,
        release_id: ReleaseId,
        partner: &DeliveryPartner,
    ) -> Result<DeliveryStatus> {
        let row = self.find_existing(release_id, &partner.id).await?;
        let row = self.claim(&row).await?;
        let id = row.id;
        let now = self.clock.now_utc();

        let result = async {
            let mut row = row;
            match row.status {
                DeliveryState::Takedown | DeliveryState::Suspended => self.unclaim(row).await,
                DeliveryState::InProgress | DeliveryState::Delivered | DeliveryState::Live => {
                    if row.takedown_pending() {
                        if let Some(next_retry_at) = row.next_retry_at.filter(|at| *at > now) {
                            return Err(DeliveryError::NotDue { next_retry_at });
                        }
                    } else {
                        row.operation = DeliveryOperation::Takedown;
                        row.retry_count = 0;
                        row.max_retries = partner.max_retries;
                        row.next_retry_at = None;
                        row.updated_at = now;
                    }

                    match (row.status, row.external_id.clone()) {
                        (_, Some(external_id)) => {
                            let adapter = self.adapters.get(&partner.id)?;
                            self.storage.save(row.clone()).await?;
                            self.execute(
                                row,
                                partner,
                                adapter.as_ref(),
                                PartnerCall::Takedown(&external_id),
                            )
                            .await
                        },
                        (DeliveryState::InProgress, None) => {
                            row.status = DeliveryState::Takedown;
                            row.takedown_at = Some(now);
                            row.error_message = None;
                            row.claimed_at = None;
                            self.storage.save(row.clone()).await?;
                            info!(
                                release_id = %row.release_id,
                                partner_id = %row.partner_id,
                                "release never reached partner, taken down locally"
                            );
                            self.publish(EventType::TakedownComplete, &row, partner).await;
                            Ok(row)
                        },
                        (_, None) => {
                            let error = DeliveryError::MissingExternalId {
                                release_id: row.release_id.to_string(),
                                partner_id: row.partner_id.to_string(),
                            };
                            row.next_retry_at = None;
                            row.error_message = Some(error.to_string());
                            row.claimed_at = None;
                            self.storage.save(row.clone()).await?;
                            warn!(
                                release_id = %row.release_id,
                                partner_id = %row.partner_id,
                                status = %row.status,
                                "partner holds the release without an external id, takedown failed"
                            );
                            self.publish(EventType::TakedownFailed, &row, partner).await;
                            Err(error)
                        },
                    }
                },
                state => Err(DeliveryError::invalid_transition("take down", state)),
            }
        }
        .await;

        self.release_on_error(id, result).await
    }

    /// Records that the partner published the release.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless the row is `delivered` (`live` is a no-op),
    /// plus `NotStarted`, `AlreadyInProgress`, `Database`.
    pub async fn mark_live(
        &self,
        release_id: ReleaseId,
        partner: &DeliveryPartner,
    ) -> Result<DeliveryStatus> {
        let row = self.find_existing(release_id, &partner.id).await?;
        if row.status == DeliveryState::Live {
            return Ok(row);
        }

        let row = self.claim(&row).await?;
        let id = row.id;
        let result = async {
            match row.status {
                DeliveryState::Delivered => self.go_live(row, partner, None).await,
                DeliveryState::Live => self.unclaim(row).await,
                state => Err(DeliveryError::invalid_transition("mark live", state)),
            }
        }
        .await;

        self.release_on_error(id, result).await
    }

    /// Asks the partner whether a delivered release is published and marks
    /// the row `live` when it is.
    ///
    /// Status polls are not delivery attempts and are not recorded as such;
    /// the partner-reported label is kept in `external_status`.
    ///
    /// # Errors
    ///
    /// Adapter errors are returned as-is. Also `InvalidTransition` unless the
    /// row is `delivered` with an external id, `NotStarted`,
    /// `AlreadyInProgress`, `AdapterMissing`, `Database`.
    pub async fn poll_publication(
        &self,
        release_id: ReleaseId,
        partner: &DeliveryPartner,
    ) -> Result<DeliveryStatus> {
        let row = self.find_existing(release_id, &partner.id).await?;
        if row.status == DeliveryState::Live {
            return Ok(row);
        }
        let adapter = self.adapters.get(&partner.id)?;

        let row = self.claim(&row).await?;
        let id = row.id;
        let result = async {
            let mut row = row;
            let external_id = match (row.status, row.external_id.clone()) {
                (DeliveryState::Delivered, Some(external_id)) => external_id,
                (state, _) => return Err(DeliveryError::invalid_transition("poll", state)),
            };

            let publication = tokio::time::timeout(
                self.config.attempt_timeout,
                adapter.check_status(&external_id),
            )
            .await
            .map_err(|_| DeliveryError::timeout(self.config.attempt_timeout))??;

            debug!(
                release_id = %row.release_id,
                partner_id = %row.partner_id,
                publication = %publication,
                "partner reported publication status"
            );

            if publication == PublicationStatus::Published {
                return self.go_live(row, partner, Some(publication)).await;
            }

            row.external_status = Some(publication.as_str().to_string());
            row.updated_at = self.clock.now_utc();
            self.unclaim(row).await
        }
        .await;

        self.release_on_error(id, result).await
    }

    /// Parks a taken-down delivery.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless the row is in `takedown` (`suspended` is a
    /// no-op), plus `NotStarted`, `AlreadyInProgress`, `Database`.
    pub async fn suspend(
        &self,
        release_id: ReleaseId,
        partner: &DeliveryPartner,
    ) -> Result<DeliveryStatus> {
        let row = self.find_existing(release_id, &partner.id).await?;
        let row = self.claim(&row).await?;
        let id = row.id;

        let result = async {
            let mut row = row;
            match row.status {
                DeliveryState::Takedown => {
                    let now = self.clock.now_utc();
                    row.status = DeliveryState::Suspended;
                    row.suspended_at = Some(now);
                    row.updated_at = now;
                    row.claimed_at = None;
                    self.storage.save(row.clone()).await?;
                    info!(
                        release_id = %row.release_id,
                        partner_id = %row.partner_id,
                        "delivery suspended"
                    );
                    self.publish(EventType::DeliverySuspended, &row, partner).await;
                    Ok(row)
                },
                DeliveryState::Suspended => self.unclaim(row).await,
                state => Err(DeliveryError::invalid_transition("suspend", state)),
            }
        }
        .await;

        self.release_on_error(id, result).await
    }

    /// Takes a row off the retry schedule without touching its status.
    ///
    /// Used for rows no caller can drive (unknown or inactive partner, no
    /// adapter, spent budget): `next_retry_at` is cleared and `reason` kept
    /// in `error_message`. A later `start`, `retry` or `takedown` resumes the
    /// series.
    ///
    /// # Errors
    ///
    /// `NotStarted`, `AlreadyInProgress`, `Database`.
    pub async fn park(
        &self,
        release_id: ReleaseId,
        partner_id: &PartnerId,
        reason: &str,
    ) -> Result<DeliveryStatus> {
        let row = self.find_existing(release_id, partner_id).await?;
        let mut row = self.claim(&row).await?;
        let id = row.id;

        row.next_retry_at = None;
        row.error_message = Some(reason.to_string());
        row.updated_at = self.clock.now_utc();
        warn!(
            release_id = %row.release_id,
            partner_id = %row.partner_id,
            status = %row.status,
            reason,
            "delivery taken off the retry schedule"
        );

        let result = self.unclaim(row).await;
        self.release_on_error(id, result).await
    }

    /// Returns the row for a pair and its attempts.
    ///
    /// # Errors
    ///
    /// `NotStarted` if the pair has no row, or `Database`.
    pub async fn history(
        &self,
        release_id: ReleaseId,
        partner_id: &PartnerId,
    ) -> Result<DeliveryHistory> {
        let status = self.find_existing(release_id, partner_id).await?;
        let attempts = self.storage.find_attempts(status.id).await?;
        Ok(DeliveryHistory { status, attempts })
    }

    /// Finds the row for a pair, if any.
    pub async fn find(
        &self,
        release_id: ReleaseId,
        partner_id: &PartnerId,
    ) -> Result<Option<DeliveryStatus>> {
        Ok(self.storage.find(release_id, partner_id).await?)
    }

    /// Lists every row of a release.
    pub async fn statuses(&self, release_id: ReleaseId) -> Result<Vec<DeliveryStatus>> {
        Ok(self.storage.find_for_release(release_id).await?)
    }

    /// Lists up to `limit` unclaimed rows with an elapsed `next_retry_at`.
    pub async fn due(&self, limit: usize) -> Result<Vec<DeliveryStatus>> {
        let now = self.clock.now_utc();
        let lease = chrono::Duration::from_std(self.config.claim_lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        Ok(self.storage.find_due(now, now - lease, limit).await?)
    }

    /// Runs one adapter call for the row's current operation and commits its
    /// outcome. The row must be claimed; the lease is dropped by the commit.
    async fn execute(
        &self,
        mut row: DeliveryStatus,
        partner: &DeliveryPartner,
        adapter: &dyn PartnerAdapter,
        call: PartnerCall<'_>,
    ) -> Result<DeliveryStatus> {
        let now = self.clock.now_utc();
        if let Admission::Deferred { reset_at } =
            self.rate_limiter.try_acquire(partner, now).await
        {
            info!(
                release_id = %row.release_id,
                partner_id = %row.partner_id,
                operation = %row.operation,
                reset_at = %reset_at,
                "partner rate limit budget exhausted, deferring"
            );
            row.next_retry_at = Some(reset_at);
            row.error_message = Some("partner rate limit budget exhausted".to_string());
            row.updated_at = now;
            row.claimed_at = None;
            self.storage.save(row.clone()).await?;
            return Ok(row);
        }

        let attempt_number = self.storage.next_attempt_number(row.id).await?;
        let span = info_span!(
            "partner_attempt",
            release_id = %row.release_id,
            partner_id = %row.partner_id,
            operation = %row.operation,
            attempt_number,
        );

        // Attempt timestamps of one row strictly increase even when the wall
        // clock stalls or steps back between attempts.
        let mut started_at = self.clock.now_utc();
        if attempt_number > 1 && started_at <= row.updated_at {
            started_at = row.updated_at + chrono::Duration::microseconds(1);
        }
        let started = self.clock.now();
        let request_payload = call.request_payload();
        let outcome = async {
            let call = async {
                match call {
                    PartnerCall::Deliver(payload) => adapter.deliver(payload).await,
                    PartnerCall::Takedown(external_id) => adapter.takedown(external_id).await,
                }
            };
            match tokio::time::timeout(self.config.attempt_timeout, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(DeliveryError::timeout(self.config.attempt_timeout)),
            }
        }
        .instrument(span)
        .await;
        let completed_at = self.clock.now_utc().max(started_at);
        let latency_ms =
            i64::try_from(self.clock.now().duration_since(started).as_millis()).unwrap_or(i64::MAX);

        let mut attempt = DeliveryAttempt {
            id: AttemptId::new(),
            delivery_id: row.id,
            release_id: row.release_id,
            partner_id: row.partner_id.clone(),
            operation: row.operation,
            attempt_number,
            outcome: AttemptOutcome::Success,
            request_payload: Json(request_payload),
            response_payload: None,
            status_code: None,
            latency_ms,
            error_kind: None,
            error_message: None,
            started_at,
            completed_at,
        };

        row.claimed_at = None;
        row.updated_at = completed_at;

        let event = match outcome {
            Ok(response) => {
                attempt.status_code = response.status_code.map(i32::from);
                attempt.response_payload = response.body.clone().map(Json);
                self.apply_success(&mut row, response, completed_at)
            },
            Err(error) => {
                attempt.outcome = if error.is_retryable() {
                    AttemptOutcome::RetryableFailure
                } else {
                    AttemptOutcome::PermanentFailure
                };
                attempt.status_code = error.status_code().map(i32::from);
                attempt.response_payload =
                    error.response_body().map(|body| Json(Value::String(body.to_string())));
                attempt.error_kind = Some(error.category().to_string());
                attempt.error_message = Some(error.to_string());
                self.apply_failure(&mut row, &error, completed_at)
            },
        };

        self.storage.commit_attempt(attempt, row.clone()).await?;

        if let Some(event_type) = event {
            self.publish(event_type, &row, partner).await;
        }

        Ok(row)
    }

    fn apply_success(
        &self,
        row: &mut DeliveryStatus,
        response: PartnerResponse,
        at: DateTime<Utc>,
    ) -> Option<EventType> {
        row.next_retry_at = None;
        row.error_message = None;

        match row.operation {
            DeliveryOperation::Deliver => {
                row.status = DeliveryState::Delivered;
                row.delivered_at = Some(at);
                if response.external_id.is_some() {
                    row.external_id = response.external_id;
                }
                info!(
                    release_id = %row.release_id,
                    partner_id = %row.partner_id,
                    external_id = ?row.external_id,
                    "release delivered"
                );
                Some(EventType::DeliveryComplete)
            },
            DeliveryOperation::Takedown => {
                row.status = DeliveryState::Takedown;
                row.takedown_at = Some(at);
                info!(
                    release_id = %row.release_id,
                    partner_id = %row.partner_id,
                    "release taken down"
                );
                Some(EventType::TakedownComplete)
            },
        }
    }

    fn apply_failure(
        &self,
        row: &mut DeliveryStatus,
        error: &DeliveryError,
        at: DateTime<Utc>,
    ) -> Option<EventType> {
        row.error_message = Some(error.to_string());

        let decision = if error.is_retryable() {
            row.retry_count = (row.retry_count + 1).min(row.max_retries);
            self.policy_for(row).next_delay(failures(row), error.failure_kind())
        } else {
            RetryDecision::GiveUp { reason: "non-retryable failure".to_string() }
        };

        match decision {
            RetryDecision::Retry { .. } => {
                row.next_retry_at = decision.next_attempt_at(at);
                warn!(
                    release_id = %row.release_id,
                    partner_id = %row.partner_id,
                    operation = %row.operation,
                    retry_count = row.retry_count,
                    max_retries = row.max_retries,
                    next_retry_at = ?row.next_retry_at,
                    error = %error,
                    "partner call failed, retry scheduled"
                );
                None
            },
            RetryDecision::GiveUp { reason } => {
                row.next_retry_at = None;
                warn!(
                    release_id = %row.release_id,
                    partner_id = %row.partner_id,
                    operation = %row.operation,
                    retry_count = row.retry_count,
                    error = %error,
                    reason = %reason,
                    "partner call failed, giving up"
                );

                match row.operation {
                    DeliveryOperation::Deliver => {
                        row.status = if error.is_retryable() {
                            DeliveryState::Failed
                        } else {
                            DeliveryState::Rejected
                        };
                        row.failed_at = Some(at);
                        Some(EventType::DeliveryFailed)
                    },
                    // The row keeps its previous status; the partner still
                    // holds the release.
                    DeliveryOperation::Takedown => Some(EventType::TakedownFailed),
                }
            },
        }
    }

    fn policy_for(&self, row: &DeliveryStatus) -> RetryPolicy {
        self.config
            .retry_policy
            .clone()
            .with_max_attempts(u32::try_from(row.max_retries).unwrap_or(0))
    }

    async fn go_live(
        &self,
        mut row: DeliveryStatus,
        partner: &DeliveryPartner,
        publication: Option<PublicationStatus>,
    ) -> Result<DeliveryStatus> {
        let now = self.clock.now_utc();
        row.status = DeliveryState::Live;
        row.live_at = Some(now);
        row.updated_at = now;
        row.claimed_at = None;
        if let Some(publication) = publication {
            row.external_status = Some(publication.as_str().to_string());
        }
        self.storage.save(row.clone()).await?;

        info!(release_id = %row.release_id, partner_id = %row.partner_id, "release live");
        self.publish(EventType::ReleaseLive, &row, partner).await;
        Ok(row)
    }

    async fn find_existing(
        &self,
        release_id: ReleaseId,
        partner_id: &PartnerId,
    ) -> Result<DeliveryStatus> {
        self.storage
            .find(release_id, partner_id)
            .await?
            .ok_or_else(|| DeliveryError::not_started(release_id, partner_id))
    }

    async fn claim(&self, row: &DeliveryStatus) -> Result<DeliveryStatus> {
        let now = self.clock.now_utc();
        let lease = chrono::Duration::from_std(self.config.claim_lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        self.storage
            .try_claim(row.id, now, now - lease)
            .await?
            .ok_or_else(|| DeliveryError::already_in_progress(row.release_id, &row.partner_id))
    }

    /// Persists `row` with its lease dropped and returns it.
    async fn unclaim(&self, mut row: DeliveryStatus) -> Result<DeliveryStatus> {
        row.claimed_at = None;
        self.storage.save(row.clone()).await?;
        Ok(row)
    }

    async fn release_on_error(
        &self,
        delivery_id: DeliveryId,
        result: Result<DeliveryStatus>,
    ) -> Result<DeliveryStatus> {
        if result.is_err() {
            if let Err(e) = self.storage.release_claim(delivery_id).await {
                warn!(delivery_id = %delivery_id, error = %e, "failed to release delivery claim");
            }
        }
        result
    }

    async fn publish(
        &self,
        event_type: EventType,
        row: &DeliveryStatus,
        partner: &DeliveryPartner,
    ) {
        let event = DomainEvent {
            id: EventId::new(),
            event_type,
            release_id: row.release_id,
            partner_id: row.partner_id.clone(),
            partner_name: partner.name.clone(),
            external_id: row.external_id.clone(),
            status: row.status,
            timestamp: row.updated_at,
        };

        debug!(event_id = %event.id, event_type = %event_type, "publishing domain event");
        self.events.handle_event(event).await;
    }
}

fn ensure_active(partner: &DeliveryPartner) -> Result<()> {
    if partner.is_active() {
        Ok(())
    } else {
        Err(DeliveryError::PartnerInactive { partner_id: partner.id.to_string() })
    }
}

fn failures(row: &DeliveryStatus) -> u32 {
    u32::try_from(row.retry_count).unwrap_or(0)
}
