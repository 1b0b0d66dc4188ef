//! Per-partner fixed-window request budgets.
//!
//! Each partner owns one `AtomicU64` packing the current window index and the
//! number of calls already granted in it. Granting a call is a single
//! compare-and-swap loop, so concurrent deliveries to the same partner never
//! serialize on a lock while the adapter call is in flight.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use cadenza_core::models::{DeliveryPartner, PartnerId};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

const COUNT_BITS: u32 = 24;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

/// Outcome of asking for a rate-limit token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The call may proceed.
    Granted,
    /// The window is spent; retry at `reset_at`.
    Deferred {
        /// Start of the next window.
        reset_at: DateTime<Utc>,
    },
}

#[derive(Debug, Default)]
struct WindowBudget {
    state: AtomicU64,
}

impl WindowBudget {
    fn try_take(&self, window: u64, limit: u64) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (current_window, used) = unpack(current);
            let used = if current_window == window { used } else { 0 };
            if used >= limit {
                return false;
            }

            match self.state.compare_exchange_weak(
                current,
                pack(window, used + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn used(&self, window: u64) -> u64 {
        let (current_window, used) = unpack(self.state.load(Ordering::Acquire));
        if current_window == window {
            used
        } else {
            0
        }
    }
}

const fn pack(window: u64, used: u64) -> u64 {
    (window << COUNT_BITS) | (used & COUNT_MASK)
}

const fn unpack(state: u64) -> (u64, u64) {
    (state >> COUNT_BITS, state & COUNT_MASK)
}

/// Shared registry of partner budgets.
#[derive(Debug, Default)]
pub struct RateLimiter {
    budgets: RwLock<HashMap<PartnerId, Arc<WindowBudget>>>,
}

impl RateLimiter {
    /// Creates an empty limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes one token from `partner`'s budget for the window containing `now`.
    ///
    /// A `rate_limit_requests` of zero disables limiting for the partner.
    pub async fn try_acquire(&self, partner: &DeliveryPartner, now: DateTime<Utc>) -> Admission {
        let Some((limit, window_secs)) = limits(partner) else {
            return Admission::Granted;
        };

        let window = window_index(now, window_secs);
        let budget = self.budget(&partner.id).await;

        if budget.try_take(window, limit) {
            Admission::Granted
        } else {
            Admission::Deferred { reset_at: window_start(window + 1, window_secs, now) }
        }
    }

    /// Returns how many calls `partner` may still make in the current window.
    pub async fn remaining(&self, partner: &DeliveryPartner, now: DateTime<Utc>) -> Option<u64> {
        let (limit, window_secs) = limits(partner)?;
        let window = window_index(now, window_secs);
        let used = match self.budgets.read().await.get(&partner.id) {
            Some(budget) => budget.used(window),
            None => 0,
        };
        Some(limit.saturating_sub(used))
    }

    async fn budget(&self, partner_id: &PartnerId) -> Arc<WindowBudget> {
        if let Some(budget) = self.budgets.read().await.get(partner_id) {
            return budget.clone();
        }

        self.budgets.write().await.entry(partner_id.clone()).or_default().clone()
    }
}

fn limits(partner: &DeliveryPartner) -> Option<(u64, u64)> {
    let limit = u64::try_from(partner.rate_limit_requests).ok().filter(|&l| l > 0)?;
    let window_secs = u64::try_from(partner.rate_limit_window_seconds).ok().filter(|&w| w > 0)?;
    Some((limit.min(COUNT_MASK), window_secs))
}

fn window_index(now: DateTime<Utc>, window_secs: u64) -> u64 {
    u64::try_from(now.timestamp()).unwrap_or(0) / window_secs
}

fn window_start(window: u64, window_secs: u64, fallback: DateTime<Utc>) -> DateTime<Utc> {
    i64::try_from(window.saturating_mul(window_secs))
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or(fallback)
}
