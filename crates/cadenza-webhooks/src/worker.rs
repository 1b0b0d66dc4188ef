//! Background tasks feeding the dispatcher.
//!
//! `EventConsumer` drains the channel-backed event bus and dispatches new
//! events as they arrive. `DispatchWorker` sweeps series whose retry time has
//! come. Both stop on cancellation. After cancellation the consumer keeps
//! reading until every publisher is gone or the drain timeout passes, and
//! enqueues (not dispatches) what it reads so the next sweep delivers it.

use std::{sync::Arc, time::Duration};

use cadenza_core::{events::DomainEvent, time::Clock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dispatcher::WebhookDispatcher;

/// How long a cancelled consumer waits for publishers to finish by default.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Consumes domain events from a channel.
pub struct EventConsumer {
    receiver: mpsc::Receiver<DomainEvent>,
    dispatcher: Arc<WebhookDispatcher>,
    cancellation_token: CancellationToken,
    drain_timeout: Duration,
}

impl EventConsumer {
    /// Creates a consumer reading from `receiver`.
    pub fn new(
        receiver: mpsc::Receiver<DomainEvent>,
        dispatcher: Arc<WebhookDispatcher>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { receiver, dispatcher, cancellation_token, drain_timeout: DEFAULT_DRAIN_TIMEOUT }
    }

    /// Bounds how long a cancelled consumer keeps reading from publishers
    /// that are still finishing their work.
    #[must_use]
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Runs until the channel closes or the token is cancelled.
    ///
    /// Returns the number of events consumed.
    pub async fn run(mut self) -> usize {
        info!("webhook event consumer starting");
        let mut consumed = 0;

        loop {
            tokio::select! {
                biased;

                () = self.cancellation_token.cancelled() => {
                    self.drain().await;
                    break;
                },
                event = self.receiver.recv() => {
                    let Some(event) = event else { break };
                    consumed += 1;
                    if let Err(e) = self.dispatcher.process_event(&event).await {
                        error!(event_id = %event.id, error = %e, "failed to process domain event");
                    }
                },
            }
        }

        info!(consumed, "webhook event consumer stopped");
        consumed
    }

    async fn drain(&mut self) {
        let open = tokio::time::timeout(self.drain_timeout, async {
            while let Some(event) = self.receiver.recv().await {
                self.store_for_sweep(&event).await;
            }
        })
        .await;

        if open.is_err() {
            let drain_ms = u64::try_from(self.drain_timeout.as_millis()).unwrap_or(u64::MAX);
            warn!(
                drain_timeout_ms = drain_ms,
                "publishers still running at shutdown, closing the event bus"
            );
            self.receiver.close();
            while let Some(event) = self.receiver.recv().await {
                self.store_for_sweep(&event).await;
            }
        }
    }

    async fn store_for_sweep(&self, event: &DomainEvent) {
        if let Err(e) = self.dispatcher.enqueue(event).await {
            warn!(event_id = %event.id, error = %e, "dropping buffered event at shutdown");
        }
    }
}

/// Periodically dispatches due webhook series.
pub struct DispatchWorker {
    dispatcher: Arc<WebhookDispatcher>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    cancellation_token: CancellationToken,
}

impl DispatchWorker {
    /// Creates a worker polling every `poll_interval`.
    pub fn new(
        dispatcher: Arc<WebhookDispatcher>,
        poll_interval: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        let clock = dispatcher.clock();
        Self { dispatcher, clock, poll_interval, cancellation_token }
    }

    /// Sweeps until cancelled.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis(),
            "webhook dispatch worker starting"
        );

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let attempted = match self.dispatcher.dispatch_due().await {
                Ok(attempted) => attempted,
                Err(e) => {
                    error!(error = %e, "webhook sweep failed");
                    0
                },
            };

            if attempted == 0 {
                tokio::select! {
                    () = self.clock.sleep(self.poll_interval) => {},
                    () = self.cancellation_token.cancelled() => break,
                }
            }
        }

        info!("webhook dispatch worker stopped");
    }
}
