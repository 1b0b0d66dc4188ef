//! Invariant checks over delivery rows, attempt logs and webhook series.
//!
//! Each check returns an `anyhow::Result` so tests can `?` several of them
//! and get a readable message naming the violated property.

use std::{collections::BTreeMap, time::Duration};

use anyhow::{ensure, Context, Result};
use cadenza_core::models::{
    AttemptOutcome, DeliveryAttempt, DeliveryId, DeliveryOperation, DeliveryState, DeliveryStatus,
    WebhookEvent, WebhookEventStatus,
};
use cadenza_delivery::DeliveryHistory;

/// Properties that must hold for every delivery and webhook series.
pub struct Invariants;

impl Invariants {
    /// Runs every delivery check against one history.
    pub fn check_history(history: &DeliveryHistory) -> Result<()> {
        Self::retry_budget_respected(&history.status)?;
        Self::failed_means_exhausted_or_permanent(&history.status, &history.attempts)?;
        Self::attempt_numbers_contiguous(&history.attempts)?;
        Self::attempts_sequential(&history.attempts)?;
        Ok(())
    }

    /// `retry_count` never exceeds `max_retries`.
    pub fn retry_budget_respected(row: &DeliveryStatus) -> Result<()> {
        ensure!(
            row.retry_count <= row.max_retries,
            "delivery {} consumed {} retries with a budget of {}",
            row.id,
            row.retry_count,
            row.max_retries
        );
        Ok(())
    }

    /// A `failed` row spent its budget; a `rejected` row ended on a
    /// permanent failure.
    pub fn failed_means_exhausted_or_permanent(
        row: &DeliveryStatus,
        attempts: &[DeliveryAttempt],
    ) -> Result<()> {
        match row.status {
            DeliveryState::Failed => ensure!(
                row.retry_count == row.max_retries,
                "delivery {} failed with {} of {} retries left",
                row.id,
                row.max_retries - row.retry_count,
                row.max_retries
            ),
            DeliveryState::Rejected => {
                let last = attempts
                    .iter()
                    .filter(|a| a.delivery_id == row.id)
                    .max_by_key(|a| a.attempt_number)
                    .context("rejected delivery has no attempts")?;
                ensure!(
                    last.outcome == AttemptOutcome::PermanentFailure,
                    "delivery {} rejected after a {} attempt",
                    row.id,
                    last.outcome
                );
            },
            _ => {},
        }
        Ok(())
    }

    /// Attempt numbers of each row run 1, 2, 3, … without gaps or repeats.
    pub fn attempt_numbers_contiguous(attempts: &[DeliveryAttempt]) -> Result<()> {
        for (delivery_id, mut numbers) in group(attempts, |a| a.attempt_number) {
            numbers.sort_unstable();
            for (expected, actual) in (1..).zip(&numbers) {
                ensure!(
                    *actual == expected,
                    "delivery {delivery_id} attempt numbers {numbers:?} are not contiguous"
                );
            }
        }
        Ok(())
    }

    /// No attempt starts before the previous attempt of its row completed,
    /// and start times strictly increase with the attempt number.
    pub fn attempts_sequential(attempts: &[DeliveryAttempt]) -> Result<()> {
        for (delivery_id, mut ordered) in group(attempts, DeliveryAttempt::clone) {
            ordered.sort_by_key(|a| a.attempt_number);
            for pair in ordered.windows(2) {
                ensure!(
                    pair[1].started_at >= pair[0].completed_at,
                    "delivery {delivery_id} attempt {} started before attempt {} completed",
                    pair[1].attempt_number,
                    pair[0].attempt_number
                );
                ensure!(
                    pair[1].started_at > pair[0].started_at,
                    "delivery {delivery_id} attempts {} and {} share a start time",
                    pair[0].attempt_number,
                    pair[1].attempt_number
                );
            }
        }
        Ok(())
    }

    /// Consecutive retries of one series wait at least `base * 2^(n-1)`.
    ///
    /// Only attempts of `operation` are considered; series boundaries are
    /// where a success or permanent failure ends the run of retryable
    /// failures.
    pub fn backoff_respected(
        attempts: &[DeliveryAttempt],
        operation: DeliveryOperation,
        base: Duration,
    ) -> Result<()> {
        let mut ordered: Vec<_> = attempts.iter().filter(|a| a.operation == operation).collect();
        ordered.sort_by_key(|a| a.attempt_number);

        let mut failures = 0u32;
        for pair in ordered.windows(2) {
            if pair[0].outcome != AttemptOutcome::RetryableFailure {
                failures = 0;
                continue;
            }
            failures += 1;

            let expected = base.saturating_mul(2u32.saturating_pow(failures - 1));
            let gap = (pair[1].started_at - pair[0].completed_at)
                .to_std()
                .context("attempt completed after its successor started")?;
            ensure!(
                gap >= expected,
                "retry after failure {failures} waited {gap:?}, expected at least {expected:?}"
            );
        }
        Ok(())
    }

    /// A webhook series never exceeds its attempt cap and its status agrees
    /// with its bookkeeping.
    pub fn webhook_series_consistent(event: &WebhookEvent) -> Result<()> {
        ensure!(
            event.attempt_count <= event.max_attempts,
            "webhook event {} made {} attempts with a cap of {}",
            event.id,
            event.attempt_count,
            event.max_attempts
        );
        match event.status {
            WebhookEventStatus::Sent => {
                ensure!(event.sent_at.is_some(), "sent webhook event {} has no sent_at", event.id);
            },
            WebhookEventStatus::Abandoned => ensure!(
                event.attempt_count == event.max_attempts,
                "webhook event {} abandoned after {} of {} attempts",
                event.id,
                event.attempt_count,
                event.max_attempts
            ),
            WebhookEventStatus::Retrying => ensure!(
                event.next_retry_at.is_some(),
                "retrying webhook event {} has no retry scheduled",
                event.id
            ),
            WebhookEventStatus::Pending | WebhookEventStatus::Failed => {},
        }
        ensure!(event.claimed_at.is_none(), "webhook event {} still holds its lease", event.id);
        Ok(())
    }
}

fn group<T>(
    attempts: &[DeliveryAttempt],
    project: impl Fn(&DeliveryAttempt) -> T,
) -> BTreeMap<DeliveryId, Vec<T>> {
    let mut grouped: BTreeMap<DeliveryId, Vec<T>> = BTreeMap::new();
    for attempt in attempts {
        grouped.entry(attempt.delivery_id).or_default().push(project(attempt));
    }
    grouped
}

#[cfg(test)]
mod tests {
    use cadenza_core::models::{AttemptId, Json, PartnerId, ReleaseId};
    use chrono::Utc;
    use serde_json::Value;

    use super::*;

    fn attempt(delivery_id: DeliveryId, number: i32, offset_secs: i64) -> DeliveryAttempt {
        let at = Utc::now() + chrono::Duration::seconds(offset_secs);
        DeliveryAttempt {
            id: AttemptId::new(),
            delivery_id,
            release_id: ReleaseId::new(),
            partner_id: PartnerId::new("p1"),
            operation: DeliveryOperation::Deliver,
            attempt_number: number,
            outcome: AttemptOutcome::RetryableFailure,
            request_payload: Json(Value::Null),
            response_payload: None,
            status_code: Some(503),
            latency_ms: 0,
            error_kind: None,
            error_message: None,
            started_at: at,
            completed_at: at,
        }
    }

    #[test]
    fn detects_gaps_in_attempt_numbers() {
        let id = DeliveryId::new();
        let ok = [attempt(id, 1, 0), attempt(id, 2, 60)];
        assert!(Invariants::attempt_numbers_contiguous(&ok).is_ok());

        let gap = [attempt(id, 1, 0), attempt(id, 3, 60)];
        assert!(Invariants::attempt_numbers_contiguous(&gap).is_err());
    }

    #[test]
    fn detects_attempts_sharing_a_start_time() {
        let id = DeliveryId::new();
        let ok = [attempt(id, 1, 0), attempt(id, 2, 60)];
        assert!(Invariants::attempts_sequential(&ok).is_ok());

        let first = attempt(id, 1, 0);
        let mut second = attempt(id, 2, 0);
        second.started_at = first.started_at;
        second.completed_at = first.completed_at;
        assert!(Invariants::attempts_sequential(&[first, second]).is_err());
    }

    #[test]
    fn detects_short_backoff() {
        let id = DeliveryId::new();
        let base = Duration::from_secs(60);

        let ok = [attempt(id, 1, 0), attempt(id, 2, 60), attempt(id, 3, 180)];
        assert!(Invariants::backoff_respected(&ok, DeliveryOperation::Deliver, base).is_ok());

        let short = [attempt(id, 1, 0), attempt(id, 2, 60), attempt(id, 3, 90)];
        assert!(Invariants::backoff_respected(&short, DeliveryOperation::Deliver, base).is_err());
    }
}
