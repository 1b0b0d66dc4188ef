//! End-to-end tests of the assembled service: HTTP partner APIs and webhook
//! subscribers are wiremock servers, storage is in memory.

use std::{sync::Arc, time::Duration};

use cadenza::{Backends, Config, PartnerConfig, Service};
use cadenza_core::{
    models::{
        DeliveryState, EventType, PartnerId, PartnerType, WebhookEvent, WebhookEventStatus,
    },
    TestClock,
};
use cadenza_delivery::{catalog::mock::InMemoryCatalog, storage::mock::MockDeliveryStorage};
use cadenza_testing::{epoch, EndpointBuilder, ReleaseBuilder};
use cadenza_webhooks::{storage::mock::MockWebhookStorage, verify_signature};
use serde_json::{json, Value};
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

const SECRET: &str = "whsec_e2e";

struct Harness {
    service: Service,
    catalog: Arc<InMemoryCatalog>,
    webhooks: MockWebhookStorage,
}

fn partner_config(id: &str, base_url: String) -> PartnerConfig {
    PartnerConfig {
        id: id.to_string(),
        name: Some("Spotify".to_string()),
        partner_type: PartnerType::Dsp,
        base_url,
        api_key: Some("partner-token".to_string()),
        active: true,
        priority: 10,
        auto_deliver: true,
        rate_limit_requests: 0,
        rate_limit_window_seconds: 3600,
        max_retries: 3,
        timeout_seconds: Some(5),
    }
}

async fn harness(partner_api: &MockServer, subscriber: &MockServer) -> Harness {
    let mut config = Config::default();
    config.partners = vec![partner_config("spotify", partner_api.uri())];
    config.shutdown_grace_seconds = 5;
    // Idle background loops advance the virtual clock on every pass; leases
    // must outlive a real HTTP round trip regardless.
    config.delivery.claim_lease_seconds = 365 * 24 * 3600;
    config.webhooks.claim_lease_seconds = 365 * 24 * 3600;
    config.validate().unwrap();

    let clock = TestClock::starting_at(epoch());
    let catalog = Arc::new(InMemoryCatalog::new());
    for partner in &config.partners {
        catalog.add_partner(partner.to_partner(epoch())).await;
    }

    let webhooks = MockWebhookStorage::new();
    webhooks
        .add_endpoint(
            EndpointBuilder::new(format!("{}/hooks", subscriber.uri())).secret(SECRET).build(),
        )
        .await;

    let service = Service::build(
        &config,
        Backends {
            catalog: catalog.clone(),
            delivery_storage: Arc::new(MockDeliveryStorage::new()),
            webhook_storage: Arc::new(webhooks.clone()),
            clock: Arc::new(clock),
        },
    )
    .unwrap();

    Harness { service, catalog, webhooks }
}

/// Waits (in real time) until `count` webhook series reached `sent`.
async fn wait_for_sent(storage: &MockWebhookStorage, count: usize) -> Vec<WebhookEvent> {
    for _ in 0..250 {
        let sent: Vec<_> = storage
            .events()
            .await
            .into_iter()
            .filter(|e| e.status == WebhookEventStatus::Sent)
            .collect();
        if sent.len() >= count {
            return sent;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {count} sent webhook(s)");
}

async fn callback_bodies(subscriber: &MockServer) -> Vec<Value> {
    let requests = subscriber.received_requests().await.unwrap_or_default();
    for request in &requests {
        let signature = request
            .headers
            .get("x-signature")
            .and_then(|v| v.to_str().ok())
            .expect("callback carries a signature");
        assert!(verify_signature(SECRET, &request.body, signature));
    }
    requests.iter().map(|r| serde_json::from_slice(&r.body).unwrap()).collect()
}

#[tokio::test]
async fn delivery_with_retry_notifies_subscribers() {
    let partner_api = MockServer::start().await;
    let subscriber = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/releases"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream maintenance"))
        .up_to_n_times(1)
        .mount(&partner_api)
        .await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/releases"))
        .and(matchers::header("authorization", "Bearer partner-token"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"external_id": "sp-99"})))
        .mount(&partner_api)
        .await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/hooks"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&subscriber)
        .await;

    let h = harness(&partner_api, &subscriber).await;
    let release = ReleaseBuilder::new().build();
    h.catalog.add_release(release.clone()).await;

    let orchestrator = h.service.orchestrator();
    let results = orchestrator.deliver(release.id, &[PartnerId::new("spotify")]).await.unwrap();
    assert_eq!(results[0].final_status, Some(DeliveryState::Delivered));
    assert_eq!(results[0].external_id.as_deref(), Some("sp-99"));
    assert_eq!(results[0].retry_count, 1);

    let token = h.service.cancellation_token();
    let running = tokio::spawn(h.service.run());

    let sent = wait_for_sent(&h.webhooks, 1).await;
    assert_eq!(sent[0].event_type, EventType::DeliveryComplete);

    let bodies = callback_bodies(&subscriber).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["event_type"], "delivery_complete");
    assert_eq!(bodies[0]["partner_id"], "spotify");
    assert_eq!(bodies[0]["partner_name"], "Spotify");
    assert_eq!(bodies[0]["external_id"], "sp-99");
    assert_eq!(bodies[0]["status"], "delivered");

    drop(orchestrator);
    token.cancel();
    tokio::time::timeout(Duration::from_secs(10), running).await.unwrap().unwrap();
}

#[tokio::test]
async fn partner_rejection_and_takedown_are_reported() {
    let partner_api = MockServer::start().await;
    let subscriber = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/releases"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 7731})))
        .up_to_n_times(1)
        .mount(&partner_api)
        .await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/releases"))
        .respond_with(ResponseTemplate::new(422).set_body_string("missing ISRC"))
        .mount(&partner_api)
        .await;
    Mock::given(matchers::method("DELETE"))
        .and(matchers::path("/releases/7731"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&partner_api)
        .await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/hooks"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&subscriber)
        .await;

    let h = harness(&partner_api, &subscriber).await;
    let accepted = ReleaseBuilder::new().build();
    let rejected = ReleaseBuilder::new().title("Unfinished Demo").build();
    h.catalog.add_release(accepted.clone()).await;
    h.catalog.add_release(rejected.clone()).await;

    let orchestrator = h.service.orchestrator();
    let spotify = [PartnerId::new("spotify")];

    let results = orchestrator.deliver_auto(accepted.id).await.unwrap();
    assert_eq!(results[0].external_id.as_deref(), Some("7731"));

    let results = orchestrator.deliver(rejected.id, &spotify).await.unwrap();
    assert_eq!(results[0].final_status, Some(DeliveryState::Rejected));
    assert_eq!(results[0].retry_count, 0);

    // A 404 on takedown means the partner no longer has the release.
    let results = orchestrator.process_takedown(accepted.id, &[]).await.unwrap();
    assert_eq!(results[0].final_status, Some(DeliveryState::Takedown));

    let token = h.service.cancellation_token();
    let running = tokio::spawn(h.service.run());

    wait_for_sent(&h.webhooks, 3).await;
    let mut types: Vec<_> = callback_bodies(&subscriber)
        .await
        .iter()
        .map(|body| body["event_type"].as_str().unwrap_or_default().to_string())
        .collect();
    types.sort();
    assert_eq!(types, ["delivery_complete", "delivery_failed", "takedown_complete"]);

    drop(orchestrator);
    token.cancel();
    tokio::time::timeout(Duration::from_secs(10), running).await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_stops_background_tasks_without_events() {
    let partner_api = MockServer::start().await;
    let subscriber = MockServer::start().await;
    let h = harness(&partner_api, &subscriber).await;

    let token = h.service.cancellation_token();
    let running = tokio::spawn(h.service.run());
    tokio::task::yield_now().await;

    token.cancel();
    tokio::time::timeout(Duration::from_secs(10), running).await.unwrap().unwrap();
    assert!(h.webhooks.events().await.is_empty());
    assert!(subscriber.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn events_published_while_shutting_down_are_kept_for_the_sweep() {
    let partner_api = MockServer::start().await;
    let subscriber = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/releases"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"external_id": "sp-5"})))
        .mount(&partner_api)
        .await;

    let h = harness(&partner_api, &subscriber).await;
    let release = ReleaseBuilder::new().build();
    h.catalog.add_release(release.clone()).await;

    let orchestrator = h.service.orchestrator();
    let spotify = PartnerId::new("spotify");
    orchestrator.deliver(release.id, &[spotify.clone()]).await.unwrap();

    let token = h.service.cancellation_token();
    let running = tokio::spawn(h.service.run());
    token.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A request that was already running finishes after shutdown began.
    let row = orchestrator.mark_live(release.id, &spotify).await.unwrap();
    assert_eq!(row.status, DeliveryState::Live);
    drop(orchestrator);

    // Returns once the last publisher is gone, well inside the drain timeout.
    tokio::time::timeout(Duration::from_secs(2), running).await.unwrap().unwrap();

    let live: Vec<_> = h
        .webhooks
        .events()
        .await
        .into_iter()
        .filter(|e| e.event_type == EventType::ReleaseLive)
        .collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].status, WebhookEventStatus::Pending);
}
