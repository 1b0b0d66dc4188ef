//! Fan-out of release operations across partners.
//!
//! The orchestrator resolves releases and partners through the [`Catalog`],
//! orders partners by priority and drives one state machine per partner with
//! bounded concurrency. Partner failures never abort the batch: each partner
//! gets its own [`PartnerResult`].

use std::{collections::HashSet, sync::Arc, time::Duration};

use cadenza_core::{
    models::{
        DeliveryOperation, DeliveryPartner, DeliveryState, DeliveryStatus, PartnerId, Release,
        ReleaseId,
    },
    time::Clock,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    catalog::Catalog,
    error::{DeliveryError, Result},
    machine::{DeliveryHistory, DeliveryStateMachine},
};

/// Pause before re-reading a row whose scheduled attempt another caller holds.
const CONTENTION_BACKOFF: Duration = Duration::from_secs(1);

/// Configuration for the delivery orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Partners processed concurrently within one request.
    pub concurrency: usize,

    /// How long a request keeps driving scheduled retries before leaving the
    /// rest to the retry sweeper. Zero returns after the first attempt.
    pub settle_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { concurrency: 4, settle_timeout: Duration::from_secs(15 * 60) }
    }
}

/// Outcome of an operation for one partner.
#[derive(Debug, Clone)]
pub struct PartnerResult {
    /// Partner the result belongs to.
    pub partner_id: PartnerId,
    /// Display name of the partner.
    pub partner_name: String,
    /// Row status after the operation, if the row exists.
    pub final_status: Option<DeliveryState>,
    /// Identifier assigned by the partner.
    pub external_id: Option<String>,
    /// Retries consumed in the current series.
    pub retry_count: i32,
    /// Error that stopped the operation for this partner.
    pub error: Option<DeliveryError>,
}

impl PartnerResult {
    fn from_row(partner: &DeliveryPartner, row: &DeliveryStatus) -> Self {
        Self {
            partner_id: partner.id.clone(),
            partner_name: partner.name.clone(),
            final_status: Some(row.status),
            external_id: row.external_id.clone(),
            retry_count: row.retry_count,
            error: None,
        }
    }

    fn from_error(
        partner: &DeliveryPartner,
        row: Option<&DeliveryStatus>,
        error: DeliveryError,
    ) -> Self {
        Self {
            partner_id: partner.id.clone(),
            partner_name: partner.name.clone(),
            final_status: row.map(|r| r.status),
            external_id: row.and_then(|r| r.external_id.clone()),
            retry_count: row.map_or(0, |r| r.retry_count),
            error: Some(error),
        }
    }

    /// Returns true when the operation completed without error.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Coordinates delivery operations for a release across partners.
pub struct DeliveryOrchestrator {
    catalog: Arc<dyn Catalog>,
    machine: Arc<DeliveryStateMachine>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    cancellation_token: CancellationToken,
}

impl DeliveryOrchestrator {
    /// Creates an orchestrator.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        machine: Arc<DeliveryStateMachine>,
        config: OrchestratorConfig,
    ) -> Self {
        let clock = machine.clock();
        Self { catalog, machine, clock, config, cancellation_token: CancellationToken::new() }
    }

    /// Uses `token` to stop scheduling attempts on shutdown.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Returns the cancellation token observed by running requests.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Returns the underlying state machine.
    pub fn machine(&self) -> Arc<DeliveryStateMachine> {
        self.machine.clone()
    }

    /// Delivers a release to the given partners.
    ///
    /// Partners run in priority order (highest first, ties by id) with at
    /// most `concurrency` in flight. Results come back in that order.
    ///
    /// # Errors
    ///
    /// `UnknownRelease` or `UnknownPartner` before any partner is contacted,
    /// or `Database` if reference data cannot be read.
    pub async fn deliver(
        &self,
        release_id: ReleaseId,
        partner_ids: &[PartnerId],
    ) -> Result<Vec<PartnerResult>> {
        let release = self.resolve_release(release_id).await?;
        let partners = self.resolve_partners(partner_ids).await?;

        info!(
            release_id = %release_id,
            partner_count = partners.len(),
            "delivering release"
        );

        Ok(self.fan_out(&release, partners, DeliveryOperation::Deliver).await)
    }

    /// Delivers a release to every active partner flagged for auto-delivery.
    ///
    /// # Errors
    ///
    /// Same as [`deliver`](Self::deliver).
    pub async fn deliver_auto(&self, release_id: ReleaseId) -> Result<Vec<PartnerResult>> {
        let release = self.resolve_release(release_id).await?;
        let partners: Vec<_> = self
            .catalog
            .list_partners()
            .await?
            .into_iter()
            .filter(|p| p.auto_deliver && p.is_active())
            .collect();

        info!(
            release_id = %release_id,
            partner_count = partners.len(),
            "auto-delivering release"
        );

        Ok(self.fan_out(&release, sorted(partners), DeliveryOperation::Deliver).await)
    }

    /// Retries failed deliveries of a release.
    ///
    /// With an empty `partner_ids` every `failed` row that still has retry
    /// budget (under the partner's current `max_retries`) is retried. Named
    /// partners are retried regardless and report why when they cannot be.
    ///
    /// # Errors
    ///
    /// Same as [`deliver`](Self::deliver).
    pub async fn retry_failed(
        &self,
        release_id: ReleaseId,
        partner_ids: &[PartnerId],
    ) -> Result<Vec<PartnerResult>> {
        let release = self.resolve_release(release_id).await?;
        let partners = if partner_ids.is_empty() {
            let mut eligible = Vec::new();
            for row in self.machine.statuses(release_id).await? {
                if row.status != DeliveryState::Failed {
                    continue;
                }
                let partner = self.resolve_partner(&row.partner_id).await?;
                if row.retry_count < partner.max_retries {
                    eligible.push(partner);
                }
            }
            sorted(eligible)
        } else {
            self.resolve_partners(partner_ids).await?
        };

        info!(
            release_id = %release_id,
            partner_count = partners.len(),
            "retrying failed deliveries"
        );
        Ok(self.fan_out(&release, partners, DeliveryOperation::Deliver).await)
    }

    /// Takes a release down from partners.
    ///
    /// With an empty `partner_ids` every row that reached a partner (or is
    /// still being delivered) is taken down.
    ///
    /// # Errors
    ///
    /// Same as [`deliver`](Self::deliver).
    pub async fn process_takedown(
        &self,
        release_id: ReleaseId,
        partner_ids: &[PartnerId],
    ) -> Result<Vec<PartnerResult>> {
        let release = self.resolve_release(release_id).await?;
        let partners = if partner_ids.is_empty() {
            let mut targets = Vec::new();
            for row in self.machine.statuses(release_id).await? {
                if matches!(
                    row.status,
                    DeliveryState::InProgress | DeliveryState::Delivered | DeliveryState::Live
                ) {
                    targets.push(self.resolve_partner(&row.partner_id).await?);
                }
            }
            sorted(targets)
        } else {
            self.resolve_partners(partner_ids).await?
        };

        info!(release_id = %release_id, partner_count = partners.len(), "processing takedown");
        Ok(self.fan_out(&release, partners, DeliveryOperation::Takedown).await)
    }

    /// Marks a delivered release live on one partner.
    ///
    /// # Errors
    ///
    /// Lookup errors, or any error from the state machine.
    pub async fn mark_live(
        &self,
        release_id: ReleaseId,
        partner_id: &PartnerId,
    ) -> Result<DeliveryStatus> {
        let partner = self.resolve_partner(partner_id).await?;
        self.machine.mark_live(release_id, &partner).await
    }

    /// Polls one partner for publication and marks the row live if published.
    ///
    /// # Errors
    ///
    /// Lookup errors, or any error from the state machine or adapter.
    pub async fn poll_publication(
        &self,
        release_id: ReleaseId,
        partner_id: &PartnerId,
    ) -> Result<DeliveryStatus> {
        let partner = self.resolve_partner(partner_id).await?;
        self.machine.poll_publication(release_id, &partner).await
    }

    /// Suspends a taken-down delivery.
    ///
    /// # Errors
    ///
    /// Lookup errors, or any error from the state machine.
    pub async fn suspend(
        &self,
        release_id: ReleaseId,
        partner_id: &PartnerId,
    ) -> Result<DeliveryStatus> {
        let partner = self.resolve_partner(partner_id).await?;
        self.machine.suspend(release_id, &partner).await
    }

    /// Returns the delivery row and attempt log for one partner.
    ///
    /// # Errors
    ///
    /// `NotStarted` if the pair has no row, or `Database`.
    pub async fn history(
        &self,
        release_id: ReleaseId,
        partner_id: &PartnerId,
    ) -> Result<DeliveryHistory> {
        self.machine.history(release_id, partner_id).await
    }

    /// Lists the delivery rows of a release.
    ///
    /// # Errors
    ///
    /// `Database` if the rows cannot be read.
    pub async fn statuses(&self, release_id: ReleaseId) -> Result<Vec<DeliveryStatus>> {
        self.machine.statuses(release_id).await
    }

    async fn fan_out(
        &self,
        release: &Release,
        partners: Vec<DeliveryPartner>,
        operation: DeliveryOperation,
    ) -> Vec<PartnerResult> {
        stream::iter(partners)
            .map(|partner| async move {
                let span = info_span!(
                    "partner_operation",
                    release_id = %release.id,
                    partner_id = %partner.id,
                    operation = %operation,
                );
                self.run_for_partner(release, &partner, operation).instrument(span).await
            })
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await
    }

    async fn run_for_partner(
        &self,
        release: &Release,
        partner: &DeliveryPartner,
        operation: DeliveryOperation,
    ) -> PartnerResult {
        let deadline = self.settle_deadline();

        let outcome = if self.cancellation_token.is_cancelled() {
            Err(DeliveryError::Cancelled { operation })
        } else {
            let first = match operation {
                DeliveryOperation::Deliver => self.first_delivery_step(release, partner).await,
                DeliveryOperation::Takedown => self.machine.takedown(release.id, partner).await,
            };
            match first {
                Ok(row) => self.settle(row, release, partner, deadline).await,
                Err(e) => Err(e),
            }
        };

        match outcome {
            Ok(row) => PartnerResult::from_row(partner, &row),
            Err(error) => {
                match &error {
                    DeliveryError::Cancelled { .. } => {
                        info!("operation cancelled before completion");
                    },
                    DeliveryError::AlreadyInProgress { .. } => {
                        debug!("pair is busy with another attempt");
                    },
                    _ => warn!(error = %error, "partner operation failed"),
                }
                let row = self.machine.find(release.id, &partner.id).await.ok().flatten();
                PartnerResult::from_error(partner, row.as_ref(), error)
            },
        }
    }

    /// Failed rows re-enter through `retry`; everything else through `start`.
    async fn first_delivery_step(
        &self,
        release: &Release,
        partner: &DeliveryPartner,
    ) -> Result<DeliveryStatus> {
        match self.machine.find(release.id, &partner.id).await? {
            Some(row) if row.status == DeliveryState::Failed => {
                self.machine.retry(release, partner).await
            },
            _ => self.machine.start(release, partner).await,
        }
    }

    /// Keeps driving scheduled retries until the row settles, the next retry
    /// falls past `deadline`, or the request is cancelled.
    async fn settle(
        &self,
        mut row: DeliveryStatus,
        release: &Release,
        partner: &DeliveryPartner,
        deadline: DateTime<Utc>,
    ) -> Result<DeliveryStatus> {
        while let Some(next_retry_at) = scheduled_retry(&row) {
            if next_retry_at > deadline {
                debug!(
                    next_retry_at = %next_retry_at,
                    "next retry falls outside the settle window, leaving it to the sweeper"
                );
                return Ok(row);
            }

            let wait = (next_retry_at - self.clock.now_utc()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                () = self.clock.sleep(wait) => {},
                () = self.cancellation_token.cancelled() => {
                    return Err(DeliveryError::Cancelled { operation: row.operation });
                },
            }

            let step = match row.operation {
                DeliveryOperation::Deliver => self.machine.retry(release, partner).await,
                DeliveryOperation::Takedown => self.machine.takedown(release.id, partner).await,
            };

            row = match step {
                Ok(row) => row,
                // The sweeper got to the due row first; follow its outcome.
                Err(DeliveryError::NotDue { .. }) => self.reload(release, partner).await?,
                Err(DeliveryError::AlreadyInProgress { .. }) => {
                    debug!("scheduled attempt is running elsewhere, waiting for it");
                    tokio::select! {
                        () = self.clock.sleep(CONTENTION_BACKOFF) => {},
                        () = self.cancellation_token.cancelled() => {
                            return Err(DeliveryError::Cancelled { operation: row.operation });
                        },
                    }
                    self.reload(release, partner).await?
                },
                Err(e) => return Err(e),
            };
        }

        Ok(row)
    }

    async fn reload(&self, release: &Release, partner: &DeliveryPartner) -> Result<DeliveryStatus> {
        self.machine
            .find(release.id, &partner.id)
            .await?
            .ok_or_else(|| DeliveryError::not_started(release.id, &partner.id))
    }

    fn settle_deadline(&self) -> DateTime<Utc> {
        let now = self.clock.now_utc();
        chrono::Duration::from_std(self.config.settle_timeout)
            .map(|window| now + window)
            .unwrap_or(now)
    }

    async fn resolve_release(&self, release_id: ReleaseId) -> Result<Release> {
        self.catalog
            .find_release(release_id)
            .await?
            .ok_or_else(|| DeliveryError::UnknownRelease { release_id: release_id.to_string() })
    }

    async fn resolve_partner(&self, partner_id: &PartnerId) -> Result<DeliveryPartner> {
        self.catalog
            .find_partner(partner_id)
            .await?
            .ok_or_else(|| DeliveryError::UnknownPartner { partner_id: partner_id.to_string() })
    }

    async fn resolve_partners(&self, partner_ids: &[PartnerId]) -> Result<Vec<DeliveryPartner>> {
        let mut seen = HashSet::new();
        let mut partners = Vec::with_capacity(partner_ids.len());
        for partner_id in partner_ids {
            if seen.insert(partner_id.clone()) {
                partners.push(self.resolve_partner(partner_id).await?);
            }
        }
        Ok(sorted(partners))
    }
}

/// Orders partners by priority (highest first), ties broken by id.
fn sorted(mut partners: Vec<DeliveryPartner>) -> Vec<DeliveryPartner> {
    partners.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
    partners
}

fn scheduled_retry(row: &DeliveryStatus) -> Option<DateTime<Utc>> {
    match row.operation {
        DeliveryOperation::Deliver if row.status == DeliveryState::InProgress => row.next_retry_at,
        DeliveryOperation::Takedown if row.takedown_pending() => row.next_retry_at,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use cadenza_core::models::{PartnerStatus, PartnerType};

    use super::*;

    fn partner(id: &str, priority: i32) -> DeliveryPartner {
        let now = Utc::now();
        DeliveryPartner {
            id: PartnerId::new(id),
            name: id.to_uppercase(),
            partner_type: PartnerType::Dsp,
            status: PartnerStatus::Active,
            priority,
            auto_deliver: true,
            rate_limit_requests: 0,
            rate_limit_window_seconds: 3600,
            max_retries: 3,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn partners_sort_by_priority_then_id() {
        let ordered = sorted(vec![
            partner("tidal", 5),
            partner("apple", 10),
            partner("spotify", 10),
            partner("amazon", 5),
        ]);
        let ids: Vec<_> = ordered.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["apple", "spotify", "amazon", "tidal"]);
    }

    #[test]
    fn only_pending_series_are_scheduled() {
        let now = Utc::now();
        let mut row = DeliveryStatus::new(ReleaseId::new(), PartnerId::new("p1"), 3, now);
        assert_eq!(scheduled_retry(&row), None);

        row.status = DeliveryState::InProgress;
        row.next_retry_at = Some(now);
        assert_eq!(scheduled_retry(&row), Some(now));

        row.status = DeliveryState::Delivered;
        assert_eq!(scheduled_retry(&row), None);

        row.operation = DeliveryOperation::Takedown;
        assert_eq!(scheduled_retry(&row), Some(now));
    }
}
