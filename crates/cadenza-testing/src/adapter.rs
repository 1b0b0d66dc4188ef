//! Scripted partner adapter.
//!
//! Plays back a queue of outcomes per operation and counts calls. Once a
//! queue is empty every further call succeeds. Optional latency advances the
//! shared test clock, and an optional [`Gate`] holds calls in flight until
//! the test opens it.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use cadenza_core::TestClock;
use cadenza_delivery::{
    DeliveryError, PartnerAdapter, PartnerResponse, PublicationStatus, ReleasePayload, Result,
};
use tokio::sync::{watch, Mutex};

#[derive(Debug, Clone)]
enum Step {
    Accept(Option<String>),
    AcceptWithoutId,
    Fail(DeliveryError),
    Hang,
}

/// Holds adapter calls until opened.
#[derive(Debug)]
pub struct Gate {
    open: watch::Sender<bool>,
    entered: watch::Sender<usize>,
}

impl Gate {
    /// Creates a closed gate.
    pub fn new() -> Arc<Self> {
        Arc::new(Self { open: watch::Sender::new(false), entered: watch::Sender::new(0) })
    }

    /// Lets every waiting and future call through.
    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Waits until `count` calls reached the gate.
    pub async fn wait_entered(&self, count: usize) {
        let mut entered = self.entered.subscribe();
        let _ = entered.wait_for(|n| *n >= count).await;
    }

    async fn pass(&self) {
        self.entered.send_modify(|n| *n += 1);
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| *open).await;
    }
}

/// Partner adapter driven by a script.
#[derive(Debug)]
pub struct ScriptedAdapter {
    label: String,
    deliveries: Mutex<VecDeque<Step>>,
    takedowns: Mutex<VecDeque<Step>>,
    publications: Mutex<VecDeque<Result<PublicationStatus>>>,
    deliver_calls: AtomicUsize,
    takedown_calls: AtomicUsize,
    status_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Option<(TestClock, Duration)>,
    gate: Option<Arc<Gate>>,
}

impl ScriptedAdapter {
    /// Creates an adapter that accepts everything.
    ///
    /// `label` prefixes the external ids it hands out.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            deliveries: Mutex::new(VecDeque::new()),
            takedowns: Mutex::new(VecDeque::new()),
            publications: Mutex::new(VecDeque::new()),
            deliver_calls: AtomicUsize::new(0),
            takedown_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            latency: None,
            gate: None,
        }
    }

    /// Makes every call take `latency` of virtual time on `clock`.
    #[must_use]
    pub fn with_latency(mut self, clock: TestClock, latency: Duration) -> Self {
        self.latency = Some((clock, latency));
        self
    }

    /// Holds every call at `gate` until it opens.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Queues a successful delivery returning `external_id`.
    #[must_use]
    pub fn accept(self, external_id: impl Into<String>) -> Self {
        self.push_delivery(Step::Accept(Some(external_id.into())))
    }

    /// Queues a successful delivery for which the partner returns no id.
    #[must_use]
    pub fn accept_without_id(self) -> Self {
        self.push_delivery(Step::AcceptWithoutId)
    }

    /// Queues a failed delivery.
    #[must_use]
    pub fn fail(self, error: DeliveryError) -> Self {
        self.push_delivery(Step::Fail(error))
    }

    /// Queues `count` failed deliveries.
    #[must_use]
    pub fn fail_times(mut self, count: usize, error: &DeliveryError) -> Self {
        for _ in 0..count {
            self = self.fail(error.clone());
        }
        self
    }

    /// Queues a delivery that never answers.
    #[must_use]
    pub fn hang(self) -> Self {
        self.push_delivery(Step::Hang)
    }

    /// Queues a failed takedown.
    #[must_use]
    pub fn fail_takedown(mut self, error: DeliveryError) -> Self {
        self.takedowns.get_mut().push_back(Step::Fail(error));
        self
    }

    /// Queues a publication status answer.
    #[must_use]
    pub fn publication(mut self, status: PublicationStatus) -> Self {
        self.publications.get_mut().push_back(Ok(status));
        self
    }

    /// Queues a failed publication check.
    #[must_use]
    pub fn publication_error(mut self, error: DeliveryError) -> Self {
        self.publications.get_mut().push_back(Err(error));
        self
    }

    /// Number of `deliver` calls so far.
    pub fn deliver_calls(&self) -> usize {
        self.deliver_calls.load(Ordering::SeqCst)
    }

    /// Number of `takedown` calls so far.
    pub fn takedown_calls(&self) -> usize {
        self.takedown_calls.load(Ordering::SeqCst)
    }

    /// Number of `check_status` calls so far.
    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn push_delivery(mut self, step: Step) -> Self {
        self.deliveries.get_mut().push_back(step);
        self
    }

    async fn play(&self, step: Step, call_number: usize) -> Result<PartnerResponse> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.pass().await;
        }
        if let Some((clock, latency)) = &self.latency {
            clock.advance(*latency);
        }

        let outcome = match step {
            Step::Accept(external_id) => Ok(PartnerResponse {
                external_id: Some(
                    external_id.unwrap_or_else(|| format!("{}-{call_number}", self.label)),
                ),
                status_code: Some(200),
                body: None,
            }),
            Step::AcceptWithoutId => {
                Ok(PartnerResponse { external_id: None, status_code: Some(202), body: None })
            },
            Step::Fail(error) => Err(error),
            Step::Hang => std::future::pending().await,
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

#[async_trait]
impl PartnerAdapter for ScriptedAdapter {
    async fn deliver(&self, _payload: &ReleasePayload) -> Result<PartnerResponse> {
        let call_number = self.deliver_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let step = self.deliveries.lock().await.pop_front().unwrap_or(Step::Accept(None));
        self.play(step, call_number).await
    }

    async fn takedown(&self, _external_id: &str) -> Result<PartnerResponse> {
        let call_number = self.takedown_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let step = self.takedowns.lock().await.pop_front().unwrap_or(Step::Accept(None));
        self.play(step, call_number).await.map(|mut response| {
            response.external_id = None;
            response
        })
    }

    async fn check_status(&self, _external_id: &str) -> Result<PublicationStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.publications.lock().await.pop_front().unwrap_or(Ok(PublicationStatus::Processing))
    }
}
