//! State machine transitions: conflicts, takedowns, publication and rate
//! limits.

use std::{sync::Arc, time::Duration};

use cadenza_core::{
    models::{AttemptOutcome, DeliveryOperation, DeliveryState, EventType, PartnerId},
    retry::DELIVERY_BASE_DELAY,
    time::Clock,
};
use cadenza_delivery::{adapter::PublicationStatus, DeliveryError, SweeperConfig};
use cadenza_testing::{Gate, Invariants, PartnerBuilder, ReleaseBuilder, ScriptedAdapter, TestEnv};
use chrono::Duration as ChronoDuration;

fn p(id: &str) -> PartnerId {
    PartnerId::new(id)
}

#[tokio::test]
async fn concurrent_attempt_on_same_pair_is_refused() {
    let gate = Gate::new();
    let adapter = Arc::new(ScriptedAdapter::new("p1").with_gate(gate.clone()));
    let env = TestEnv::builder()
        .partner(PartnerBuilder::new("p1").build(), adapter.clone())
        .build()
        .await;
    let release = env.release().await;
    let partner = env.partner("p1").await.unwrap();

    let first = {
        let machine = env.machine.clone();
        let release = release.clone();
        let partner = partner.clone();
        tokio::spawn(async move { machine.start(&release, &partner).await })
    };
    gate.wait_entered(1).await;

    let err = env.machine.start(&release, &partner).await.unwrap_err();
    assert!(matches!(err, DeliveryError::AlreadyInProgress { .. }));

    let results = env.orchestrator.deliver(release.id, &[p("p1")]).await.unwrap();
    assert!(matches!(results[0].error, Some(DeliveryError::AlreadyInProgress { .. })));
    assert_eq!(results[0].final_status, Some(DeliveryState::InProgress));

    gate.open();
    let row = first.await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryState::Delivered);
    assert_eq!(row.claimed_at, None);
    assert_eq!(adapter.deliver_calls(), 1);
    assert_eq!(adapter.max_in_flight(), 1);

    let history = env.history(release.id, "p1").await.unwrap();
    assert_eq!(history.attempts.len(), 1);
}

#[tokio::test]
async fn takedown_then_suspend() {
    let adapter = Arc::new(ScriptedAdapter::new("p1"));
    let env = TestEnv::builder()
        .partner(PartnerBuilder::new("p1").build(), adapter.clone())
        .build()
        .await;
    let release = env.release().await;
    env.orchestrator.deliver(release.id, &[p("p1")]).await.unwrap();

    let err = env.orchestrator.suspend(release.id, &p("p1")).await.unwrap_err();
    assert!(matches!(
        err,
        DeliveryError::InvalidTransition { state: DeliveryState::Delivered, .. }
    ));

    let results = env.orchestrator.process_takedown(release.id, &[]).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].final_status, Some(DeliveryState::Takedown));
    assert_eq!(results[0].external_id.as_deref(), Some("p1-1"), "external id survives takedown");
    assert_eq!(adapter.takedown_calls(), 1);
    assert_eq!(env.events.count(EventType::TakedownComplete).await, 1);

    // The takedown ran at the same virtual instant as the delivery.
    let history = env.history(release.id, "p1").await.unwrap();
    assert_eq!(history.attempts.len(), 2);
    assert!(history.attempts[1].started_at > history.attempts[0].started_at);
    Invariants::check_history(&history).unwrap();

    let row = env.orchestrator.suspend(release.id, &p("p1")).await.unwrap();
    assert_eq!(row.status, DeliveryState::Suspended);
    assert!(row.suspended_at.is_some());
    assert_eq!(env.events.count(EventType::DeliverySuspended).await, 1);

    // Both are no-ops once suspended.
    let again = env.orchestrator.process_takedown(release.id, &[p("p1")]).await.unwrap();
    assert_eq!(again[0].final_status, Some(DeliveryState::Suspended));
    env.orchestrator.suspend(release.id, &p("p1")).await.unwrap();
    assert_eq!(adapter.takedown_calls(), 1);
    assert_eq!(env.events.count(EventType::DeliverySuspended).await, 1);
}

#[tokio::test]
async fn failed_takedown_is_retried_and_numbered_after_deliveries() {
    let adapter = Arc::new(
        ScriptedAdapter::new("p1").fail_takedown(DeliveryError::server_error(502, "bad gateway")),
    );
    let env = TestEnv::builder()
        .partner(PartnerBuilder::new("p1").build(), adapter.clone())
        .build()
        .await;
    let release = env.release().await;
    env.orchestrator.deliver(release.id, &[p("p1")]).await.unwrap();

    let results = env.orchestrator.process_takedown(release.id, &[p("p1")]).await.unwrap();

    assert_eq!(results[0].final_status, Some(DeliveryState::Takedown));
    assert_eq!(adapter.takedown_calls(), 2);

    let history = env.history(release.id, "p1").await.unwrap();
    let log: Vec<_> = history
        .attempts
        .iter()
        .map(|a| (a.attempt_number, a.operation, a.outcome))
        .collect();
    assert_eq!(
        log,
        [
            (1, DeliveryOperation::Deliver, AttemptOutcome::Success),
            (2, DeliveryOperation::Takedown, AttemptOutcome::RetryableFailure),
            (3, DeliveryOperation::Takedown, AttemptOutcome::Success),
        ]
    );
    Invariants::check_history(&history).unwrap();
    Invariants::backoff_respected(
        &history.attempts,
        DeliveryOperation::Takedown,
        DELIVERY_BASE_DELAY,
    )
        .unwrap();
}

#[tokio::test]
async fn permanent_takedown_failure_keeps_release_delivered() {
    let adapter = Arc::new(
        ScriptedAdapter::new("p1")
            .fail_takedown(DeliveryError::client_error(403, "takedown not permitted")),
    );
    let env = TestEnv::builder()
        .partner(PartnerBuilder::new("p1").build(), adapter.clone())
        .build()
        .await;
    let release = env.release().await;
    env.orchestrator.deliver(release.id, &[p("p1")]).await.unwrap();

    let results = env.orchestrator.process_takedown(release.id, &[p("p1")]).await.unwrap();
    assert_eq!(results[0].final_status, Some(DeliveryState::Delivered));
    assert_eq!(env.events.count(EventType::TakedownFailed).await, 1);
    assert_eq!(env.events.count(EventType::TakedownComplete).await, 0);

    let row = env.history(release.id, "p1").await.unwrap().status;
    assert!(row.error_message.as_deref().unwrap().contains("403"));
    assert_eq!(row.next_retry_at, None);

    // An operator can start a fresh takedown series.
    let results = env.orchestrator.process_takedown(release.id, &[p("p1")]).await.unwrap();
    assert_eq!(results[0].final_status, Some(DeliveryState::Takedown));
    assert_eq!(adapter.takedown_calls(), 2);
}

#[tokio::test]
async fn release_that_never_reached_partner_is_taken_down_locally() {
    let adapter = Arc::new(ScriptedAdapter::new("p1").fail(DeliveryError::transport("refused")));
    let env = TestEnv::builder()
        .settle_timeout(Duration::ZERO)
        .partner(PartnerBuilder::new("p1").build(), adapter.clone())
        .build()
        .await;
    let release = env.release().await;

    let results = env.orchestrator.deliver(release.id, &[p("p1")]).await.unwrap();
    assert_eq!(results[0].final_status, Some(DeliveryState::InProgress));
    assert_eq!(results[0].external_id, None);

    let results = env.orchestrator.process_takedown(release.id, &[]).await.unwrap();
    assert_eq!(results[0].final_status, Some(DeliveryState::Takedown));
    assert_eq!(adapter.takedown_calls(), 0);
    assert_eq!(env.events.count(EventType::TakedownComplete).await, 1);

    // The pending delivery retry is gone with it.
    env.advance(Duration::from_secs(3600));
    let stats = env.sweeper(SweeperConfig::default()).sweep_once().await.unwrap();
    assert_eq!(stats.due, 0);
    assert_eq!(adapter.deliver_calls(), 1);
}

#[tokio::test]
async fn delivered_release_without_external_id_fails_takedown() {
    let adapter = Arc::new(ScriptedAdapter::new("p1").accept_without_id());
    let env = TestEnv::builder()
        .partner(PartnerBuilder::new("p1").build(), adapter.clone())
        .build()
        .await;
    let release = env.release().await;
    let partner = env.partner("p1").await.unwrap();

    let row = env.machine.start(&release, &partner).await.unwrap();
    assert_eq!(row.status, DeliveryState::Delivered);
    assert_eq!(row.external_id, None);

    let err = env.machine.takedown(release.id, &partner).await.unwrap_err();
    assert!(matches!(err, DeliveryError::MissingExternalId { .. }));
    assert_eq!(adapter.takedown_calls(), 0);
    assert_eq!(env.events.count(EventType::TakedownFailed).await, 1);
    assert_eq!(env.events.count(EventType::TakedownComplete).await, 0);

    let history = env.history(release.id, "p1").await.unwrap();
    assert_eq!(history.status.status, DeliveryState::Delivered);
    assert_eq!(history.status.takedown_at, None);
    assert_eq!(history.status.next_retry_at, None);
    assert_eq!(history.status.claimed_at, None);
    assert!(history.status.error_message.is_some());
    assert_eq!(history.attempts.len(), 1);

    let results = env.orchestrator.process_takedown(release.id, &[]).await.unwrap();
    assert!(matches!(results[0].error, Some(DeliveryError::MissingExternalId { .. })));
    assert_eq!(results[0].final_status, Some(DeliveryState::Delivered));
}

#[tokio::test]
async fn retry_on_delivered_or_live_row_does_nothing() {
    let adapter = Arc::new(ScriptedAdapter::new("p1").publication(PublicationStatus::Published));
    let env = TestEnv::builder()
        .partner(PartnerBuilder::new("p1").build(), adapter.clone())
        .build()
        .await;
    let release = env.release().await;
    let partner = env.partner("p1").await.unwrap();

    let delivered = env.machine.start(&release, &partner).await.unwrap();
    assert_eq!(delivered.status, DeliveryState::Delivered);

    env.advance(Duration::from_secs(3600));
    let row = env.machine.retry(&release, &partner).await.unwrap();
    assert_eq!(row.status, DeliveryState::Delivered);
    assert_eq!(row.retry_count, 0);
    assert_eq!(row.external_id, delivered.external_id);
    assert_eq!(adapter.deliver_calls(), 1);
    assert_eq!(env.history(release.id, "p1").await.unwrap().attempts.len(), 1);

    let live = env.machine.poll_publication(release.id, &partner).await.unwrap();
    assert_eq!(live.status, DeliveryState::Live);

    let row = env.machine.retry(&release, &partner).await.unwrap();
    assert_eq!(row.status, DeliveryState::Live);
    assert_eq!(row.live_at, live.live_at);
    assert_eq!(adapter.deliver_calls(), 1);
    assert_eq!(env.history(release.id, "p1").await.unwrap().attempts.len(), 1);
    assert_eq!(env.events.count(EventType::DeliveryComplete).await, 1);
}

#[tokio::test]
async fn takedown_of_unknown_or_undelivered_pair_is_refused() {
    let adapter = Arc::new(
        ScriptedAdapter::new("p1").fail(DeliveryError::rejected("artwork below 3000px")),
    );
    let env = TestEnv::builder()
        .partner(PartnerBuilder::new("p1").build(), adapter.clone())
        .partner(PartnerBuilder::new("p2").build(), Arc::new(ScriptedAdapter::new("p2")))
        .build()
        .await;
    let release = env.release().await;
    env.orchestrator.deliver(release.id, &[p("p1")]).await.unwrap();

    let results = env.orchestrator.process_takedown(release.id, &[p("p1"), p("p2")]).await.unwrap();
    assert!(matches!(
        results[0].error,
        Some(DeliveryError::InvalidTransition { state: DeliveryState::Rejected, .. })
    ));
    assert!(matches!(results[1].error, Some(DeliveryError::NotStarted { .. })));

    // Bulk takedown skips rows that never reached the partner.
    assert!(env.orchestrator.process_takedown(release.id, &[]).await.unwrap().is_empty());
    assert_eq!(adapter.takedown_calls(), 0);
}

#[tokio::test]
async fn polling_records_partner_status_and_goes_live_when_published() {
    let adapter = Arc::new(
        ScriptedAdapter::new("p1")
            .publication(PublicationStatus::Processing)
            .publication(PublicationStatus::Published),
    );
    let env = TestEnv::builder()
        .partner(PartnerBuilder::new("p1").build(), adapter.clone())
        .build()
        .await;
    let release = env.release().await;
    env.orchestrator.deliver(release.id, &[p("p1")]).await.unwrap();

    let row = env.orchestrator.poll_publication(release.id, &p("p1")).await.unwrap();
    assert_eq!(row.status, DeliveryState::Delivered);
    assert_eq!(row.external_status.as_deref(), Some("processing"));
    assert_eq!(row.claimed_at, None);

    let row = env.orchestrator.poll_publication(release.id, &p("p1")).await.unwrap();
    assert_eq!(row.status, DeliveryState::Live);
    assert_eq!(row.external_status.as_deref(), Some("published"));
    assert!(row.live_at.is_some());

    // Live rows are not polled again.
    env.orchestrator.poll_publication(release.id, &p("p1")).await.unwrap();
    assert_eq!(adapter.status_calls(), 2);

    let history = env.history(release.id, "p1").await.unwrap();
    assert_eq!(history.attempts.len(), 1, "polls are not delivery attempts");

    let live = env.events.of_type(EventType::ReleaseLive).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].external_id.as_deref(), Some("p1-1"));
}

#[tokio::test]
async fn failed_poll_leaves_row_untouched() {
    let adapter = Arc::new(
        ScriptedAdapter::new("p1").publication_error(DeliveryError::server_error(500, "oops")),
    );
    let env = TestEnv::builder()
        .partner(PartnerBuilder::new("p1").build(), adapter.clone())
        .build()
        .await;
    let release = env.release().await;
    env.orchestrator.deliver(release.id, &[p("p1")]).await.unwrap();

    let err = env.orchestrator.poll_publication(release.id, &p("p1")).await.unwrap_err();
    assert!(matches!(err, DeliveryError::ServerError { status_code: 500, .. }));

    let row = env.history(release.id, "p1").await.unwrap().status;
    assert_eq!(row.status, DeliveryState::Delivered);
    assert_eq!(row.external_status, None);
    assert_eq!(row.claimed_at, None, "lease is released after a failed poll");
}

#[tokio::test]
async fn mark_live_only_from_delivered() {
    let env = TestEnv::builder()
        .partner(PartnerBuilder::new("p1").build(), Arc::new(ScriptedAdapter::new("p1")))
        .partner(
            PartnerBuilder::new("p2").build(),
            Arc::new(ScriptedAdapter::new("p2").fail(DeliveryError::rejected("duplicate UPC"))),
        )
        .partner(PartnerBuilder::new("p3").build(), Arc::new(ScriptedAdapter::new("p3")))
        .build()
        .await;
    let release = env.release().await;
    env.orchestrator.deliver(release.id, &[p("p1"), p("p2")]).await.unwrap();

    let row = env.orchestrator.mark_live(release.id, &p("p1")).await.unwrap();
    assert_eq!(row.status, DeliveryState::Live);
    env.orchestrator.mark_live(release.id, &p("p1")).await.unwrap();
    assert_eq!(env.events.count(EventType::ReleaseLive).await, 1);

    let err = env.orchestrator.mark_live(release.id, &p("p2")).await.unwrap_err();
    assert!(matches!(err, DeliveryError::InvalidTransition { state: DeliveryState::Rejected, .. }));

    let err = env.orchestrator.mark_live(release.id, &p("p3")).await.unwrap_err();
    assert!(matches!(err, DeliveryError::NotStarted { .. }));

    // Live rows can still be taken down.
    let results = env.orchestrator.process_takedown(release.id, &[]).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].final_status, Some(DeliveryState::Takedown));
}

#[tokio::test]
async fn rate_limited_partner_defers_without_spending_an_attempt() {
    let adapter = Arc::new(ScriptedAdapter::new("p1"));
    let env = TestEnv::builder()
        .partner(PartnerBuilder::new("p1").rate_limit(1, 3600).build(), adapter.clone())
        .build()
        .await;
    let first = env.release().await;
    let second = env.add_release(ReleaseBuilder::new().title("Morning Drive").build()).await;
    let start = env.clock.now_utc();

    let results = env.orchestrator.deliver(first.id, &[p("p1")]).await.unwrap();
    assert_eq!(results[0].final_status, Some(DeliveryState::Delivered));

    let results = env.orchestrator.deliver(second.id, &[p("p1")]).await.unwrap();
    assert!(results[0].is_ok());
    assert_eq!(results[0].final_status, Some(DeliveryState::InProgress));
    assert_eq!(results[0].retry_count, 0);
    assert_eq!(adapter.deliver_calls(), 1);

    let history = env.history(second.id, "p1").await.unwrap();
    assert!(history.attempts.is_empty());
    assert_eq!(history.status.next_retry_at, Some(start + ChronoDuration::hours(1)));

    let partner = env.partner("p1").await.unwrap();
    assert_eq!(env.rate_limiter.remaining(&partner, env.clock.now_utc()).await, Some(0));

    env.advance(Duration::from_secs(3600));
    let stats = env.sweeper(SweeperConfig::default()).sweep_once().await.unwrap();
    assert_eq!(stats.processed, 1);

    let history = env.history(second.id, "p1").await.unwrap();
    assert_eq!(history.status.status, DeliveryState::Delivered);
    assert_eq!(history.attempts.len(), 1);
    assert_eq!(history.attempts[0].attempt_number, 1);
}

#[tokio::test]
async fn retry_before_schedule_is_not_due() {
    let adapter = Arc::new(ScriptedAdapter::new("p1").fail(DeliveryError::rate_limited(300)));
    let env = TestEnv::builder()
        .settle_timeout(Duration::ZERO)
        .partner(PartnerBuilder::new("p1").build(), adapter.clone())
        .build()
        .await;
    let release = env.release().await;
    env.orchestrator.deliver(release.id, &[p("p1")]).await.unwrap();
    let partner = env.partner("p1").await.unwrap();

    let row = env.history(release.id, "p1").await.unwrap().status;
    assert_eq!(row.next_retry_at, Some(env.clock.now_utc() + ChronoDuration::seconds(300)));
    assert_eq!(
        env.history(release.id, "p1").await.unwrap().attempts[0].error_kind.as_deref(),
        Some("rate_limit")
    );

    let err = env.machine.retry(&release, &partner).await.unwrap_err();
    assert!(matches!(err, DeliveryError::NotDue { .. }));

    // `start` on a scheduled row waits too.
    let row = env.machine.start(&release, &partner).await.unwrap();
    assert_eq!(row.status, DeliveryState::InProgress);
    assert_eq!(adapter.deliver_calls(), 1);

    env.advance(Duration::from_secs(300));
    let row = env.machine.retry(&release, &partner).await.unwrap();
    assert_eq!(row.status, DeliveryState::Delivered);
    assert_eq!(row.retry_count, 1);
}
