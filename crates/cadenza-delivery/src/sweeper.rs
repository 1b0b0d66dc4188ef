//! Background driver for scheduled delivery retries.
//!
//! Rows whose `next_retry_at` has elapsed are picked up in batches and pushed
//! through the state machine again: delivery series via `retry`, takedown
//! series via `takedown`. A sweep racing an orchestrator request on the same
//! pair simply loses the lease and skips the row.

use std::{sync::Arc, time::Duration};

use cadenza_core::{
    models::{DeliveryOperation, DeliveryStatus},
    time::Clock,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    catalog::Catalog,
    error::{DeliveryError, Result},
    machine::DeliveryStateMachine,
};

/// Configuration for the retry sweeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Pause between sweeps that made no progress.
    pub poll_interval: Duration,

    /// Maximum rows handled per sweep.
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(5), batch_size: 50 }
    }
}

/// Outcome counts of a single sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Rows found due.
    pub due: usize,
    /// Rows pushed through the state machine.
    pub processed: usize,
    /// Rows skipped because another caller held the lease.
    pub contended: usize,
    /// Rows no caller can drive, taken off the schedule.
    pub parked: usize,
    /// Rows whose retry ended in an error.
    pub errors: usize,
}

/// Periodically retries due delivery rows.
pub struct RetrySweeper {
    catalog: Arc<dyn Catalog>,
    machine: Arc<DeliveryStateMachine>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
    cancellation_token: CancellationToken,
}

impl RetrySweeper {
    /// Creates a sweeper.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        machine: Arc<DeliveryStateMachine>,
        config: SweeperConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        let clock = machine.clock();
        Self { catalog, machine, clock, config, cancellation_token }
    }

    /// Sweeps until cancelled.
    ///
    /// Sweeps back to back while they make progress and pause for
    /// `poll_interval` otherwise. Sweep errors are logged and the loop keeps
    /// going.
    pub async fn run(&self) {
        info!(
            poll_interval_ms =
                u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            batch_size = self.config.batch_size,
            "retry sweeper starting"
        );

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let progressed = match self.sweep_once().await {
                Ok(stats) => stats.processed > 0,
                Err(e) => {
                    error!(error = %e, "retry sweep failed");
                    false
                },
            };

            if !progressed {
                tokio::select! {
                    () = self.clock.sleep(self.config.poll_interval) => {},
                    () = self.cancellation_token.cancelled() => break,
                }
            }
        }

        info!("retry sweeper stopped");
    }

    /// Runs one sweep over due rows.
    ///
    /// # Errors
    ///
    /// `Database` if due rows cannot be listed. Per-row failures are counted
    /// in the returned stats instead.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        let due = self.machine.due(self.config.batch_size).await?;
        let mut stats = SweepStats { due: due.len(), ..SweepStats::default() };

        for row in due {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.process(&row).await {
                Ok(updated) => {
                    stats.processed += 1;
                    debug!(
                        release_id = %updated.release_id,
                        partner_id = %updated.partner_id,
                        status = %updated.status,
                        "swept delivery"
                    );
                },
                Err(DeliveryError::AlreadyInProgress { .. }) => stats.contended += 1,
                Err(e) if cannot_proceed(&e) => {
                    match self.machine.park(row.release_id, &row.partner_id, &e.to_string()).await {
                        Ok(_) => stats.parked += 1,
                        Err(park_error) => {
                            stats.errors += 1;
                            warn!(
                                release_id = %row.release_id,
                                partner_id = %row.partner_id,
                                error = %park_error,
                                "failed to park undeliverable row"
                            );
                        },
                    }
                },
                Err(e) => {
                    stats.errors += 1;
                    warn!(
                        release_id = %row.release_id,
                        partner_id = %row.partner_id,
                        error = %e,
                        "scheduled retry failed"
                    );
                },
            }
        }

        if stats.due > 0 {
            info!(
                due = stats.due,
                processed = stats.processed,
                contended = stats.contended,
                parked = stats.parked,
                errors = stats.errors,
                "retry sweep complete"
            );
        }

        Ok(stats)
    }

    async fn process(&self, row: &DeliveryStatus) -> Result<DeliveryStatus> {
        let partner = self
            .catalog
            .find_partner(&row.partner_id)
            .await?
            .ok_or_else(|| DeliveryError::UnknownPartner {
                partner_id: row.partner_id.to_string(),
            })?;

        match row.operation {
            DeliveryOperation::Deliver => {
                let release = self.catalog.find_release(row.release_id).await?.ok_or_else(|| {
                    DeliveryError::UnknownRelease { release_id: row.release_id.to_string() }
                })?;
                self.machine.retry(&release, &partner).await
            },
            DeliveryOperation::Takedown => self.machine.takedown(row.release_id, &partner).await,
        }
    }
}

/// Errors that will repeat on every sweep until an operator steps in.
fn cannot_proceed(error: &DeliveryError) -> bool {
    matches!(
        error,
        DeliveryError::UnknownRelease { .. }
            | DeliveryError::UnknownPartner { .. }
            | DeliveryError::NotStarted { .. }
            | DeliveryError::PartnerInactive { .. }
            | DeliveryError::AdapterMissing { .. }
            | DeliveryError::MissingExternalId { .. }
            | DeliveryError::RetriesExhausted { .. }
            | DeliveryError::InvalidTransition { .. }
    )
}
