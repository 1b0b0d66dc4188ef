//! Assembles the delivery and webhook subsystems into one running service.
//!
//! The state machine publishes domain events onto a bounded channel; the
//! webhook consumer drains it. The retry sweeper and the webhook dispatch
//! worker run beside it on the same cancellation token.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use cadenza_core::{
    events::{event_channel, DomainEvent},
    models::PartnerId,
    time::Clock,
};
use cadenza_delivery::{
    AdapterRegistry, Catalog, DeliveryOrchestrator, DeliveryStateMachine, DeliveryStorage,
    HttpPartnerAdapter, RetrySweeper,
};
use cadenza_webhooks::{
    DispatchWorker, EventConsumer, WebhookClient, WebhookDispatcher, WebhookStorage,
};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;

/// Storage and time sources the service runs over.
pub struct Backends {
    /// Release and partner reference data.
    pub catalog: Arc<dyn Catalog>,
    /// Delivery rows and attempt log.
    pub delivery_storage: Arc<dyn DeliveryStorage>,
    /// Subscriber endpoints and webhook series.
    pub webhook_storage: Arc<dyn WebhookStorage>,
    /// Time source shared by every component.
    pub clock: Arc<dyn Clock>,
}

/// A fully wired service, ready to [`run`](Self::run).
pub struct Service {
    orchestrator: Arc<DeliveryOrchestrator>,
    dispatcher: Arc<WebhookDispatcher>,
    sweeper: RetrySweeper,
    worker: DispatchWorker,
    events: mpsc::Receiver<DomainEvent>,
    shutdown_grace: Duration,
    cancellation_token: CancellationToken,
}

impl Service {
    /// Builds the service, creating one HTTP adapter per configured partner.
    ///
    /// # Errors
    ///
    /// Fails if an HTTP client cannot be built.
    pub fn build(config: &Config, backends: Backends) -> Result<Self> {
        let mut adapters = AdapterRegistry::new();
        for partner in &config.partners {
            let partner_id = PartnerId::new(&partner.id);
            let adapter = HttpPartnerAdapter::new(
                partner_id.clone(),
                partner.to_adapter_config(config.attempt_timeout()),
            )
            .with_context(|| format!("failed to create adapter for partner {}", partner.id))?;
            adapters.register(partner_id, Arc::new(adapter));
        }

        Self::with_adapters(config, backends, adapters)
    }

    /// Builds the service around an existing adapter registry.
    ///
    /// # Errors
    ///
    /// Fails if the webhook HTTP client cannot be built.
    pub fn with_adapters(
        config: &Config,
        backends: Backends,
        adapters: AdapterRegistry,
    ) -> Result<Self> {
        let cancellation_token = CancellationToken::new();
        let (publisher, events) = event_channel(config.webhooks.event_buffer);

        let machine = Arc::new(DeliveryStateMachine::new(
            backends.delivery_storage,
            Arc::new(adapters),
            Arc::new(publisher),
            backends.clock.clone(),
            config.to_machine_config(),
        ));
        let orchestrator = Arc::new(
            DeliveryOrchestrator::new(
                backends.catalog.clone(),
                machine.clone(),
                config.to_orchestrator_config(),
            )
            .with_cancellation_token(cancellation_token.clone()),
        );
        let sweeper = RetrySweeper::new(
            backends.catalog,
            machine,
            config.to_sweeper_config(),
            cancellation_token.clone(),
        );

        let client =
            WebhookClient::new(config.to_client_config())
                .context("failed to create webhook client")?;
        let dispatcher = Arc::new(WebhookDispatcher::new(
            backends.webhook_storage,
            Arc::new(client),
            backends.clock,
            config.to_dispatcher_config(),
        ));
        let worker = DispatchWorker::new(
            dispatcher.clone(),
            config.webhook_poll_interval(),
            cancellation_token.clone(),
        );

        Ok(Self {
            orchestrator,
            dispatcher,
            sweeper,
            worker,
            events,
            shutdown_grace: config.shutdown_grace(),
            cancellation_token,
        })
    }

    /// Entry point for delivery operations.
    pub fn orchestrator(&self) -> Arc<DeliveryOrchestrator> {
        self.orchestrator.clone()
    }

    /// The webhook dispatcher fed by the event bus.
    pub fn dispatcher(&self) -> Arc<WebhookDispatcher> {
        self.dispatcher.clone()
    }

    /// Token that stops the service when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Runs the background tasks until the token is cancelled, then waits up
    /// to the shutdown grace period for them to finish.
    ///
    /// Events published by requests still finishing after cancellation are
    /// stored for the webhook sweep. The consumer waits for them until every
    /// orchestrator handle is dropped or half the grace period has passed.
    pub async fn run(self) {
        let Self {
            orchestrator,
            dispatcher,
            sweeper,
            worker,
            events,
            shutdown_grace,
            cancellation_token,
        } = self;

        drop(orchestrator);

        let mut tasks = JoinSet::new();
        tasks.spawn(async move { sweeper.run().await });
        tasks.spawn(async move { worker.run().await });
        let consumer = EventConsumer::new(events, dispatcher, cancellation_token.clone())
            .with_drain_timeout(shutdown_grace / 2);
        tasks.spawn(async move {
            consumer.run().await;
        });

        info!("cadenza service running");
        cancellation_token.cancelled().await;
        info!("shutdown requested, waiting for background tasks");

        let drained = tokio::time::timeout(shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "background task ended abnormally");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                grace_ms = u64::try_from(shutdown_grace.as_millis()).unwrap_or(u64::MAX),
                "shutdown grace period expired, aborting background tasks"
            );
            tasks.abort_all();
        }

        info!("cadenza service stopped");
    }
}
