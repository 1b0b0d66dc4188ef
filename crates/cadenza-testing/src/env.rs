//! Ready-wired test environments.
//!
//! [`TestEnv`] runs the delivery orchestrator over in-memory storage, an
//! in-memory catalog and scripted adapters. [`WebhookTestEnv`] runs the
//! webhook dispatcher over in-memory storage against real HTTP endpoints
//! (usually wiremock servers). Both share one [`TestClock`], so retry
//! schedules are driven by advancing virtual time.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use cadenza_core::{
    events::{EventHandler, MulticastEventHandler},
    models::{DeliveryPartner, PartnerId, Release, ReleaseId, WebhookEndpoint, WebhookEvent},
    TestClock,
};
use cadenza_delivery::{
    catalog::mock::InMemoryCatalog, storage::mock::MockDeliveryStorage, AdapterRegistry, Catalog,
    DeliveryHistory, DeliveryOrchestrator, DeliveryStateMachine, MachineConfig,
    OrchestratorConfig, RateLimiter, RetrySweeper, SweeperConfig,
};
use cadenza_webhooks::{
    storage::mock::MockWebhookStorage, ClientConfig, DispatcherConfig, WebhookClient,
    WebhookDispatcher,
};
use tokio_util::sync::CancellationToken;

use crate::{
    adapter::ScriptedAdapter,
    events::RecordingEventHandler,
    fixtures::{epoch, ReleaseBuilder},
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
        )
        .with_test_writer()
        .try_init();
}

/// Builder for [`TestEnv`].
pub struct TestEnvBuilder {
    clock: TestClock,
    partners: Vec<(DeliveryPartner, Option<Arc<ScriptedAdapter>>)>,
    machine_config: MachineConfig,
    orchestrator_config: OrchestratorConfig,
    subscribers: Vec<Arc<dyn EventHandler>>,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            clock: TestClock::starting_at(epoch()),
            partners: Vec::new(),
            machine_config: MachineConfig::default(),
            orchestrator_config: OrchestratorConfig::default(),
            subscribers: Vec::new(),
        }
    }
}

impl TestEnvBuilder {
    /// Creates a builder with default configuration and no partners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the clock the environment will use.
    ///
    /// Handy for building adapters with latency before `build`.
    pub fn clock(&self) -> TestClock {
        self.clock.clone()
    }

    /// Registers a partner served by `adapter`.
    #[must_use]
    pub fn partner(mut self, partner: DeliveryPartner, adapter: Arc<ScriptedAdapter>) -> Self {
        self.partners.push((partner, Some(adapter)));
        self
    }

    /// Registers a partner that is known to the catalog but has no adapter.
    #[must_use]
    pub fn partner_without_adapter(mut self, partner: DeliveryPartner) -> Self {
        self.partners.push((partner, None));
        self
    }

    /// Overrides the state machine configuration.
    #[must_use]
    pub fn machine_config(mut self, config: MachineConfig) -> Self {
        self.machine_config = config;
        self
    }

    /// Overrides the orchestrator configuration.
    #[must_use]
    pub fn orchestrator_config(mut self, config: OrchestratorConfig) -> Self {
        self.orchestrator_config = config;
        self
    }

    /// Sets the per-call adapter deadline.
    #[must_use]
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.machine_config.attempt_timeout = timeout;
        self
    }

    /// Sets how long a request drives retries before handing off.
    #[must_use]
    pub fn settle_timeout(mut self, timeout: Duration) -> Self {
        self.orchestrator_config.settle_timeout = timeout;
        self
    }

    /// Sets the partner fan-out concurrency.
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.orchestrator_config.concurrency = concurrency;
        self
    }

    /// Forwards every domain event to `handler` as well as the recorder.
    #[must_use]
    pub fn subscriber(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.subscribers.push(handler);
        self
    }

    /// Builds the environment and seeds the catalog with the partners.
    pub async fn build(self) -> TestEnv {
        init_tracing();

        let catalog = Arc::new(InMemoryCatalog::new());
        let storage = Arc::new(MockDeliveryStorage::new());
        let recorder = Arc::new(RecordingEventHandler::new());

        let mut events = MulticastEventHandler::new();
        events.add_subscriber(recorder.clone());
        for subscriber in self.subscribers {
            events.add_subscriber(subscriber);
        }

        let mut registry = AdapterRegistry::new();
        let mut adapters = Vec::with_capacity(self.partners.len());
        for (partner, adapter) in self.partners {
            if let Some(adapter) = adapter {
                registry.register(partner.id.clone(), adapter.clone());
                adapters.push((partner.id.clone(), adapter));
            }
            catalog.add_partner(partner).await;
        }

        let rate_limiter = Arc::new(RateLimiter::new());
        let machine = Arc::new(
            DeliveryStateMachine::new(
                storage.clone(),
                Arc::new(registry),
                Arc::new(events),
                Arc::new(self.clock.clone()),
                self.machine_config,
            )
            .with_rate_limiter(rate_limiter.clone()),
        );
        let cancellation_token = CancellationToken::new();
        let orchestrator = DeliveryOrchestrator::new(
            catalog.clone(),
            machine.clone(),
            self.orchestrator_config,
        )
        .with_cancellation_token(cancellation_token.clone());

        TestEnv {
            clock: self.clock,
            catalog,
            storage,
            events: recorder,
            rate_limiter,
            machine,
            orchestrator,
            cancellation_token,
            adapters,
        }
    }
}

/// Delivery environment over in-memory backends.
pub struct TestEnv {
    /// Virtual clock shared by every component.
    pub clock: TestClock,
    /// Release and partner reference data.
    pub catalog: Arc<InMemoryCatalog>,
    /// Delivery rows and attempt log.
    pub storage: Arc<MockDeliveryStorage>,
    /// Every published domain event.
    pub events: Arc<RecordingEventHandler>,
    /// Rate limiter shared by the state machine.
    pub rate_limiter: Arc<RateLimiter>,
    /// The state machine under test.
    pub machine: Arc<DeliveryStateMachine>,
    /// The orchestrator under test.
    pub orchestrator: DeliveryOrchestrator,
    /// Token observed by the orchestrator.
    pub cancellation_token: CancellationToken,
    adapters: Vec<(PartnerId, Arc<ScriptedAdapter>)>,
}

impl TestEnv {
    /// Starts a [`TestEnvBuilder`].
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Adds a default release to the catalog.
    pub async fn release(&self) -> Release {
        self.add_release(ReleaseBuilder::new().build()).await
    }

    /// Adds `release` to the catalog.
    pub async fn add_release(&self, release: Release) -> Release {
        self.catalog.add_release(release.clone()).await;
        release
    }

    /// Returns the adapter registered for `partner_id`.
    pub fn adapter(&self, partner_id: &str) -> Result<Arc<ScriptedAdapter>> {
        self.adapters
            .iter()
            .find(|(id, _)| id.as_str() == partner_id)
            .map(|(_, adapter)| adapter.clone())
            .with_context(|| format!("no adapter for partner {partner_id}"))
    }

    /// Returns a partner as stored in the catalog.
    pub async fn partner(&self, partner_id: &str) -> Result<DeliveryPartner> {
        self.catalog
            .find_partner(&PartnerId::new(partner_id))
            .await?
            .with_context(|| format!("unknown partner {partner_id}"))
    }

    /// Returns the row and attempt log for a pair.
    pub async fn history(
        &self,
        release_id: ReleaseId,
        partner_id: &str,
    ) -> Result<DeliveryHistory> {
        Ok(self.machine.history(release_id, &PartnerId::new(partner_id)).await?)
    }

    /// Creates a sweeper over this environment.
    pub fn sweeper(&self, config: SweeperConfig) -> RetrySweeper {
        RetrySweeper::new(
            self.catalog.clone(),
            self.machine.clone(),
            config,
            self.cancellation_token.clone(),
        )
    }

    /// Advances virtual time.
    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }
}

/// Webhook environment over in-memory storage.
pub struct WebhookTestEnv {
    /// Virtual clock used for retry scheduling.
    pub clock: TestClock,
    /// Endpoints and webhook series.
    pub storage: MockWebhookStorage,
    /// The dispatcher under test.
    pub dispatcher: Arc<WebhookDispatcher>,
}

impl WebhookTestEnv {
    /// Creates an environment with default client and dispatcher settings.
    pub fn new() -> Result<Self> {
        Self::with_config(DispatcherConfig::default())
    }

    /// Creates an environment with a custom dispatcher configuration.
    pub fn with_config(config: DispatcherConfig) -> Result<Self> {
        init_tracing();

        let clock = TestClock::starting_at(epoch());
        let storage = MockWebhookStorage::new();
        let client = WebhookClient::new(ClientConfig::default())?;
        let dispatcher = Arc::new(WebhookDispatcher::new(
            Arc::new(storage.clone()),
            Arc::new(client),
            Arc::new(clock.clone()),
            config,
        ));

        Ok(Self { clock, storage, dispatcher })
    }

    /// Registers `endpoint` and returns it.
    pub async fn add_endpoint(&self, endpoint: WebhookEndpoint) -> WebhookEndpoint {
        self.storage.add_endpoint(endpoint.clone()).await;
        endpoint
    }

    /// Returns the stored copy of a webhook series.
    pub async fn event(&self, webhook_event: &WebhookEvent) -> Result<WebhookEvent> {
        self.storage
            .events()
            .await
            .into_iter()
            .find(|e| e.id == webhook_event.id)
            .context("webhook event disappeared from storage")
    }

    /// Moves the clock to the series' next retry and sweeps due events.
    pub async fn run_next_retry(&self, webhook_event: &WebhookEvent) -> Result<WebhookEvent> {
        let current = self.event(webhook_event).await?;
        let next = current.next_retry_at.context("webhook event has no retry scheduled")?;
        self.clock.advance_to(next);
        self.dispatcher.dispatch_due().await?;
        self.event(webhook_event).await
    }
}
