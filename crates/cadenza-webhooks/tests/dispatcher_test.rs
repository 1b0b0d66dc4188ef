//! Webhook dispatch against live HTTP endpoints.

use std::time::Duration;

use cadenza_core::{
    events::{event_channel, EventHandler},
    models::{EndpointStatus, EventType, WebhookEventStatus},
    Clock,
};
use cadenza_testing::{domain_event, EndpointBuilder, Invariants, WebhookTestEnv};
use cadenza_webhooks::{
    client::{IDEMPOTENCY_HEADER, SIGNATURE_HEADER},
    verify_signature, DispatchWorker, EventConsumer,
};
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

async fn endpoint_server(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn successful_callback_is_signed_and_sent_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .respond_with(ResponseTemplate::new(200).set_body_string("received"))
        .expect(1)
        .mount(&server)
        .await;

    let env = WebhookTestEnv::new().unwrap();
    let endpoint = env
        .add_endpoint(
            EndpointBuilder::new(format!("{}/hooks", server.uri())).secret("s3cr3t").build(),
        )
        .await;
    let event = domain_event(EventType::DeliveryComplete);

    let series = env.dispatcher.process_event(&event).await.unwrap();
    assert_eq!(series.len(), 1);
    let sent = &series[0];
    assert_eq!(sent.status, WebhookEventStatus::Sent);
    assert_eq!(sent.attempt_count, 1);
    assert_eq!(sent.http_status_code, Some(200));
    assert_eq!(sent.response_body.as_deref(), Some("received"));
    Invariants::webhook_series_consistent(&env.event(sent).await.unwrap()).unwrap();

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let signature = request.headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
    assert!(verify_signature("s3cr3t", &request.body, signature));
    assert!(!verify_signature("wrong", &request.body, signature));
    assert_eq!(
        request.headers.get(IDEMPOTENCY_HEADER).unwrap().to_str().unwrap(),
        sent.idempotency_key
    );

    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["event_type"], "delivery_complete");
    assert_eq!(body["partner_id"], "spotify");
    assert_eq!(body["release_id"], event.release_id.to_string());

    // Redelivering the same domain event must not produce a second callback.
    let again = env.dispatcher.process_event(&event).await.unwrap();
    assert_eq!(again[0].id, sent.id);
    assert_eq!(again[0].status, WebhookEventStatus::Sent);
    let redispatched = env.dispatcher.dispatch(sent.id).await.unwrap();
    assert_eq!(redispatched.attempt_count, 1);

    let stored = env.storage.endpoint(endpoint.id).await.unwrap();
    assert!(stored.last_success.is_some());
    assert!(stored.last_failure.is_none());
}

#[tokio::test]
async fn server_errors_retry_with_growing_gaps_then_abandon() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let env = WebhookTestEnv::new().unwrap();
    let endpoint = env
        .add_endpoint(
            EndpointBuilder::new(server.uri()).retry_count(3).retry_delay_seconds(60).build(),
        )
        .await;

    let series =
        env.dispatcher.process_event(&domain_event(EventType::DeliveryFailed)).await.unwrap();
    let first = &series[0];
    assert_eq!(first.status, WebhookEventStatus::Retrying);
    assert_eq!(first.attempt_count, 1);
    assert_eq!(first.http_status_code, Some(503));
    assert_eq!(
        first.next_retry_at.unwrap() - env.clock.now_utc(),
        chrono::Duration::seconds(60)
    );

    let second = env.run_next_retry(first).await.unwrap();
    assert_eq!(second.status, WebhookEventStatus::Retrying);
    assert_eq!(second.attempt_count, 2);
    assert_eq!(
        second.next_retry_at.unwrap() - env.clock.now_utc(),
        chrono::Duration::seconds(120)
    );

    let third = env.run_next_retry(&second).await.unwrap();
    assert_eq!(third.status, WebhookEventStatus::Abandoned);
    assert_eq!(third.attempt_count, 3);
    assert_eq!(third.next_retry_at, None);
    Invariants::webhook_series_consistent(&third).unwrap();

    // Nothing left to sweep.
    env.clock.advance(Duration::from_secs(24 * 3600));
    assert_eq!(env.dispatcher.dispatch_due().await.unwrap(), 0);

    let stored = env.storage.endpoint(endpoint.id).await.unwrap();
    assert!(stored.last_failure.is_some());
}

#[tokio::test]
async fn client_errors_fail_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such hook"))
        .expect(1)
        .mount(&server)
        .await;

    let env = WebhookTestEnv::new().unwrap();
    env.add_endpoint(EndpointBuilder::new(server.uri()).build()).await;

    let series = env.dispatcher.process_event(&domain_event(EventType::ReleaseLive)).await.unwrap();
    let failed = &series[0];
    assert_eq!(failed.status, WebhookEventStatus::Failed);
    assert_eq!(failed.attempt_count, 1);
    assert_eq!(failed.http_status_code, Some(404));
    assert_eq!(failed.response_body.as_deref(), Some("no such hook"));
    assert_eq!(failed.next_retry_at, None);

    env.clock.advance(Duration::from_secs(3600));
    assert_eq!(env.dispatcher.dispatch_due().await.unwrap(), 0);
}

#[tokio::test]
async fn retry_after_header_sets_the_next_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(204)).mount(&server).await;

    let env = WebhookTestEnv::new().unwrap();
    env.add_endpoint(EndpointBuilder::new(server.uri()).build()).await;

    let series =
        env.dispatcher.process_event(&domain_event(EventType::TakedownComplete)).await.unwrap();
    let throttled = &series[0];
    assert_eq!(throttled.status, WebhookEventStatus::Retrying);
    assert_eq!(
        throttled.next_retry_at.unwrap() - env.clock.now_utc(),
        chrono::Duration::seconds(30)
    );

    let sent = env.run_next_retry(throttled).await.unwrap();
    assert_eq!(sent.status, WebhookEventStatus::Sent);
    assert_eq!(sent.attempt_count, 2);
    assert_eq!(sent.http_status_code, Some(204));
}

#[tokio::test]
async fn only_active_subscribed_endpoints_receive_events() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let env = WebhookTestEnv::new().unwrap();
    let subscribed = env.add_endpoint(EndpointBuilder::new(server.uri()).build()).await;
    env.add_endpoint(
        EndpointBuilder::new(server.uri()).events(&[EventType::ReleaseLive]).build(),
    )
    .await;
    env.add_endpoint(EndpointBuilder::new(server.uri()).status(EndpointStatus::Suspended).build())
        .await;

    let series =
        env.dispatcher.process_event(&domain_event(EventType::DeliveryComplete)).await.unwrap();

    assert_eq!(series.len(), 1);
    assert_eq!(series[0].endpoint_id, subscribed.id);
    assert_eq!(series[0].status, WebhookEventStatus::Sent);
}

#[tokio::test]
async fn endpoint_disabled_after_enqueue_fails_the_series_without_a_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let env = WebhookTestEnv::new().unwrap();
    let mut endpoint = env.add_endpoint(EndpointBuilder::new(server.uri()).build()).await;

    let series = env.dispatcher.enqueue(&domain_event(EventType::DeliveryComplete)).await.unwrap();
    assert_eq!(series[0].status, WebhookEventStatus::Pending);

    endpoint.status = EndpointStatus::Inactive;
    env.add_endpoint(endpoint).await;

    let settled = env.dispatcher.dispatch(series[0].id).await.unwrap();
    assert_eq!(settled.status, WebhookEventStatus::Failed);
    assert_eq!(settled.attempt_count, 0);
    assert_eq!(settled.error_message.as_deref(), Some("endpoint is inactive"));
}

#[tokio::test]
async fn event_handler_entry_point_dispatches() {
    let server = endpoint_server(200).await;
    let env = WebhookTestEnv::new().unwrap();
    env.add_endpoint(EndpointBuilder::new(format!("{}/hooks", server.uri())).build()).await;
    let event = domain_event(EventType::DeliverySuspended);

    env.dispatcher.handle_event(event.clone()).await;

    let series = env.dispatcher.events_for(event.id).await.unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].status, WebhookEventStatus::Sent);
}

#[tokio::test]
async fn consumer_processes_channel_until_publishers_are_gone() {
    let server = endpoint_server(200).await;
    let env = WebhookTestEnv::new().unwrap();
    env.add_endpoint(EndpointBuilder::new(format!("{}/hooks", server.uri())).build()).await;

    let (bus, receiver) = event_channel(8);
    bus.handle_event(domain_event(EventType::DeliveryComplete)).await;
    bus.handle_event(domain_event(EventType::ReleaseLive)).await;
    drop(bus);

    let consumer = EventConsumer::new(receiver, env.dispatcher.clone(), CancellationToken::new());
    assert_eq!(consumer.run().await, 2);

    let events = env.storage.events().await;
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.status == WebhookEventStatus::Sent));
}

#[tokio::test]
async fn cancelled_consumer_enqueues_buffered_events_for_the_sweeper() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let env = WebhookTestEnv::new().unwrap();
    env.add_endpoint(EndpointBuilder::new(server.uri()).build()).await;

    let (bus, receiver) = event_channel(8);
    bus.handle_event(domain_event(EventType::DeliveryComplete)).await;

    // The bus stays open, so the consumer gives up waiting at the drain timeout.
    let token = CancellationToken::new();
    token.cancel();
    let consumer = EventConsumer::new(receiver, env.dispatcher.clone(), token)
        .with_drain_timeout(Duration::from_millis(100));
    let consumed = tokio::time::timeout(Duration::from_secs(5), consumer.run()).await.unwrap();
    assert_eq!(consumed, 0);

    let events = env.storage.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, WebhookEventStatus::Pending);
    assert_eq!(events[0].attempt_count, 0);

    assert_eq!(env.dispatcher.dispatch_due().await.unwrap(), 1);
    assert_eq!(env.event(&events[0]).await.unwrap().status, WebhookEventStatus::Sent);
    drop(bus);
}

#[tokio::test]
async fn cancelled_consumer_keeps_events_published_until_the_bus_closes() {
    let env = WebhookTestEnv::new().unwrap();
    env.add_endpoint(EndpointBuilder::new("http://127.0.0.1:9/hooks").build()).await;

    let (bus, receiver) = event_channel(8);
    let token = CancellationToken::new();
    token.cancel();
    let consumer = EventConsumer::new(receiver, env.dispatcher.clone(), token);
    let handle = tokio::spawn(consumer.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.handle_event(domain_event(EventType::ReleaseLive)).await;
    bus.handle_event(domain_event(EventType::TakedownComplete)).await;
    drop(bus);

    let consumed = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert_eq!(consumed, 0);

    let events = env.storage.events().await;
    assert_eq!(events.len(), 2);
    for event_type in [EventType::ReleaseLive, EventType::TakedownComplete] {
        assert!(events.iter().any(|e| e.event_type == event_type), "{event_type:?} was dropped");
    }
    assert!(events.iter().all(|e| e.status == WebhookEventStatus::Pending && e.attempt_count == 0));
}

#[tokio::test]
async fn dispatch_worker_sweeps_until_cancelled() {
    let server = endpoint_server(200).await;
    let env = WebhookTestEnv::new().unwrap();
    env.add_endpoint(EndpointBuilder::new(format!("{}/hooks", server.uri())).build()).await;
    let series = env.dispatcher.enqueue(&domain_event(EventType::DeliveryComplete)).await.unwrap();

    let token = CancellationToken::new();
    let worker = DispatchWorker::new(env.dispatcher.clone(), Duration::from_secs(5), token.clone());
    let handle = tokio::spawn(async move { worker.run().await });

    let sent = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = env.event(&series[0]).await.unwrap();
            if current.status == WebhookEventStatus::Sent {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker should deliver the pending event");
    assert_eq!(sent.attempt_count, 1);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
}
