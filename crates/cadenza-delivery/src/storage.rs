//! Storage abstraction layer for the delivery state machine.
//!
//! Production code wraps `cadenza_core::storage::Storage`; tests use the
//! in-memory `mock::MockDeliveryStorage`, which implements the same lease
//! semantics so concurrency behaviour can be verified without Postgres.

use std::{future::Future, pin::Pin, sync::Arc};

use cadenza_core::{
    error::Result,
    models::{DeliveryAttempt, DeliveryId, DeliveryStatus, PartnerId, ReleaseId},
    storage::Storage,
};
use chrono::{DateTime, Utc};

/// Storage operations required by the delivery state machine.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Inserts `row` unless the (release, partner) pair already has one, and
    /// returns the stored row.
    fn find_or_create(
        &self,
        row: DeliveryStatus,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStatus>> + Send + '_>>;

    /// Finds the row for a (release, partner) pair.
    fn find(
        &self,
        release_id: ReleaseId,
        partner_id: &PartnerId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryStatus>>> + Send + '_>>;

    /// Lists every row of a release, ordered by partner id.
    fn find_for_release(
        &self,
        release_id: ReleaseId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryStatus>>> + Send + '_>>;

    /// Takes the in-flight lease on a row.
    ///
    /// Returns `None` when another caller holds a lease taken at or after
    /// `stale_before`.
    fn try_claim(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryStatus>>> + Send + '_>>;

    /// Persists every mutable field of `row`.
    fn save(&self, row: DeliveryStatus) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Records `attempt` and then persists `row`, atomically where the
    /// backend supports it.
    fn commit_attempt(
        &self,
        attempt: DeliveryAttempt,
        row: DeliveryStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Drops the lease on a row.
    fn release_claim(
        &self,
        delivery_id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Returns the number the next attempt on a row should carry.
    fn next_attempt_number(
        &self,
        delivery_id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + '_>>;

    /// Lists the attempts of a row in attempt order.
    fn find_attempts(
        &self,
        delivery_id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryAttempt>>> + Send + '_>>;

    /// Lists unclaimed rows whose `next_retry_at` has elapsed.
    fn find_due(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryStatus>>> + Send + '_>>;
}

/// Production storage implementation using PostgreSQL.
pub struct PostgresDeliveryStorage {
    storage: Arc<Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn find_or_create(
        &self,
        row: DeliveryStatus,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStatus>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_statuses.find_or_create(&row).await })
    }

    fn find(
        &self,
        release_id: ReleaseId,
        partner_id: &PartnerId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryStatus>>> + Send + '_>> {
        let storage = self.storage.clone();
        let partner_id = partner_id.clone();
        Box::pin(
            async move { storage.delivery_statuses.find_by_pair(release_id, &partner_id).await },
        )
    }

    fn find_for_release(
        &self,
        release_id: ReleaseId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryStatus>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_statuses.find_by_release(release_id).await })
    }

    fn try_claim(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryStatus>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.delivery_statuses.try_claim(delivery_id, now, stale_before).await
        })
    }

    fn save(&self, row: DeliveryStatus) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_statuses.update(&row).await })
    }

    fn commit_attempt(
        &self,
        attempt: DeliveryAttempt,
        row: DeliveryStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            let mut tx = storage.delivery_statuses.pool().begin().await?;
            storage.delivery_attempts.create_in_tx(&mut tx, &attempt).await?;
            storage.delivery_statuses.update_in_tx(&mut tx, &row).await?;
            tx.commit().await?;
            Ok(())
        })
    }

    fn release_claim(
        &self,
        delivery_id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_statuses.release_claim(delivery_id).await })
    }

    fn next_attempt_number(
        &self,
        delivery_id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_attempts.next_attempt_number(delivery_id).await })
    }

    fn find_attempts(
        &self,
        delivery_id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryAttempt>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_attempts.find_by_delivery(delivery_id).await })
    }

    fn find_due(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryStatus>>> + Send + '_>> {
        let storage = self.storage.clone();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Box::pin(async move { storage.delivery_statuses.find_due(now, stale_before, limit).await })
    }
}

pub mod mock {
    //! Mock storage implementation for testing.
    //!
    //! Keeps rows and attempts in memory behind one lock, which gives the
    //! same all-or-nothing lease acquisition as the conditional `UPDATE` used
    //! in production.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use cadenza_core::error::{CoreError, Result};
    use chrono::{DateTime, Utc};
    use tokio::sync::RwLock;

    use super::{DeliveryAttempt, DeliveryId, DeliveryStatus, DeliveryStorage, PartnerId, ReleaseId};

    #[derive(Default)]
    struct State {
        rows: HashMap<DeliveryId, DeliveryStatus>,
        attempts: Vec<DeliveryAttempt>,
    }

    /// In-memory delivery storage.
    #[derive(Default)]
    pub struct MockDeliveryStorage {
        state: Arc<RwLock<State>>,
        claim_error: Arc<RwLock<Option<String>>>,
    }

    impl MockDeliveryStorage {
        /// Creates a new mock storage with empty state.
        pub fn new() -> Self {
            Self::default()
        }

        /// Injects an error for the next claim operation.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            *self.claim_error.write().await = Some(error.into());
        }

        /// Returns every row.
        pub async fn rows(&self) -> Vec<DeliveryStatus> {
            self.state.read().await.rows.values().cloned().collect()
        }

        /// Returns every recorded attempt in insertion order.
        pub async fn recorded_attempts(&self) -> Vec<DeliveryAttempt> {
            self.state.read().await.attempts.clone()
        }

        /// Overwrites a stored row, bypassing the state machine.
        pub async fn put_row(&self, row: DeliveryStatus) {
            self.state.write().await.rows.insert(row.id, row);
        }
    }

    fn pair_matches(row: &DeliveryStatus, release_id: ReleaseId, partner_id: &PartnerId) -> bool {
        row.release_id == release_id && &row.partner_id == partner_id
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn find_or_create(
            &self,
            row: DeliveryStatus,
        ) -> Pin<Box<dyn Future<Output = Result<DeliveryStatus>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if let Some(existing) = state
                    .rows
                    .values()
                    .find(|existing| pair_matches(existing, row.release_id, &row.partner_id))
                {
                    return Ok(existing.clone());
                }
                state.rows.insert(row.id, row.clone());
                Ok(row)
            })
        }

        fn find(
            &self,
            release_id: ReleaseId,
            partner_id: &PartnerId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryStatus>>> + Send + '_>> {
            let partner_id = partner_id.clone();
            Box::pin(async move {
                Ok(self
                    .state
                    .read()
                    .await
                    .rows
                    .values()
                    .find(|row| pair_matches(row, release_id, &partner_id))
                    .cloned())
            })
        }

        fn find_for_release(
            &self,
            release_id: ReleaseId,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryStatus>>> + Send + '_>> {
            Box::pin(async move {
                let mut rows: Vec<_> = self
                    .state
                    .read()
                    .await
                    .rows
                    .values()
                    .filter(|row| row.release_id == release_id)
                    .cloned()
                    .collect();
                rows.sort_by(|a, b| a.partner_id.cmp(&b.partner_id));
                Ok(rows)
            })
        }

        fn try_claim(
            &self,
            delivery_id: DeliveryId,
            now: DateTime<Utc>,
            stale_before: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryStatus>>> + Send + '_>> {
            Box::pin(async move {
                if let Some(error) = self.claim_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }

                let mut state = self.state.write().await;
                let Some(row) = state.rows.get_mut(&delivery_id) else {
                    return Ok(None);
                };
                if row.claimed_at.is_some_and(|claimed| claimed >= stale_before) {
                    return Ok(None);
                }
                row.claimed_at = Some(now);
                Ok(Some(row.clone()))
            })
        }

        fn save(
            &self,
            row: DeliveryStatus,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                match state.rows.get_mut(&row.id) {
                    Some(stored) => {
                        *stored = row;
                        Ok(())
                    },
                    None => Err(CoreError::NotFound(format!("delivery {} not found", row.id))),
                }
            })
        }

        fn commit_attempt(
            &self,
            attempt: DeliveryAttempt,
            row: DeliveryStatus,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let duplicate = state.attempts.iter().any(|existing| {
                    existing.delivery_id == attempt.delivery_id
                        && existing.attempt_number == attempt.attempt_number
                });
                if duplicate {
                    return Err(CoreError::ConstraintViolation(format!(
                        "attempt {} already recorded for delivery {}",
                        attempt.attempt_number, attempt.delivery_id
                    )));
                }
                if !state.rows.contains_key(&row.id) {
                    return Err(CoreError::NotFound(format!("delivery {} not found", row.id)));
                }

                state.attempts.push(attempt);
                state.rows.insert(row.id, row);
                Ok(())
            })
        }

        fn release_claim(
            &self,
            delivery_id: DeliveryId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                if let Some(row) = self.state.write().await.rows.get_mut(&delivery_id) {
                    row.claimed_at = None;
                }
                Ok(())
            })
        }

        fn next_attempt_number(
            &self,
            delivery_id: DeliveryId,
        ) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + '_>> {
            Box::pin(async move {
                let state = self.state.read().await;
                let last = state
                    .attempts
                    .iter()
                    .filter(|attempt| attempt.delivery_id == delivery_id)
                    .map(|attempt| attempt.attempt_number)
                    .max()
                    .unwrap_or(0);
                Ok(last + 1)
            })
        }

        fn find_attempts(
            &self,
            delivery_id: DeliveryId,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryAttempt>>> + Send + '_>> {
            Box::pin(async move {
                let mut attempts: Vec<_> = self
                    .state
                    .read()
                    .await
                    .attempts
                    .iter()
                    .filter(|attempt| attempt.delivery_id == delivery_id)
                    .cloned()
                    .collect();
                attempts.sort_by_key(|attempt| attempt.attempt_number);
                Ok(attempts)
            })
        }

        fn find_due(
            &self,
            now: DateTime<Utc>,
            stale_before: DateTime<Utc>,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryStatus>>> + Send + '_>> {
            Box::pin(async move {
                let mut due: Vec<_> = self
                    .state
                    .read()
                    .await
                    .rows
                    .values()
                    .filter(|row| row.next_retry_at.is_some_and(|at| at <= now))
                    .filter(|row| row.claimed_at.map_or(true, |claimed| claimed < stale_before))
                    .cloned()
                    .collect();
                due.sort_by_key(|row| row.next_retry_at);
                due.truncate(limit);
                Ok(due)
            })
        }
    }
}
