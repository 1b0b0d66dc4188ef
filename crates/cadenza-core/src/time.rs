//! Clock abstraction for retry scheduling and latency measurement.
//!
//! Every component that stamps a row or waits for a retry window takes an
//! `Arc<dyn Clock>`. Production wiring uses `RealClock`; tests inject a
//! `TestClock` whose `sleep` advances virtual time instead of waiting.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for latency measurement.
    fn now(&self) -> Instant;

    /// Returns the current wall-clock time used for persisted timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Sleeps until `deadline`, returning immediately if it already passed.
    fn sleep_until(
        &self,
        deadline: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let remaining = (deadline - self.now_utc()).to_std().unwrap_or_default();
        self.sleep(remaining)
    }
}

/// Production clock backed by the system clock and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Deterministic clock for tests.
///
/// Clones share the same virtual time, so a clock handed to the state
/// machine and one kept by the test observe the same advances.
#[derive(Debug, Clone)]
pub struct TestClock {
    start_utc: DateTime<Utc>,
    start_instant: Instant,
    elapsed_micros: Arc<AtomicU64>,
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a test clock starting at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            start_utc: start,
            start_instant: Instant::now(),
            elapsed_micros: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Advances virtual time by `duration`.
    pub fn advance(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.elapsed_micros.fetch_add(micros, Ordering::AcqRel);
    }

    /// Moves virtual time forward to `target`. Earlier targets are ignored.
    pub fn advance_to(&self, target: DateTime<Utc>) {
        if let Ok(gap) = (target - self.now_utc()).to_std() {
            self.advance(gap);
        }
    }

    /// Returns the virtual time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.elapsed_micros.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.start_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let elapsed =
            chrono::Duration::from_std(self.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.start_utc + elapsed
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
