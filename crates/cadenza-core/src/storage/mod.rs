//! Postgres persistence for the dispatch core.
//!
//! Each table has one repository. Delivery status rows and webhook events are
//! the only mutable shared state in the system; their repositories expose a
//! lease (`try_claim`/`release_claim`) that serializes work on a single row
//! while leaving different rows fully parallel.

use std::sync::Arc;

use sqlx::PgPool;

pub mod delivery_attempts;
pub mod delivery_statuses;
pub mod partners;
pub mod releases;
pub mod webhook_endpoints;
pub mod webhook_events;

use crate::error::Result;

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Release reference data.
    pub releases: Arc<releases::Repository>,

    /// Partner reference data.
    pub partners: Arc<partners::Repository>,

    /// Delivery status rows.
    pub delivery_statuses: Arc<delivery_statuses::Repository>,

    /// Append-only attempt log.
    pub delivery_attempts: Arc<delivery_attempts::Repository>,

    /// Subscriber endpoints.
    pub webhook_endpoints: Arc<webhook_endpoints::Repository>,

    /// Webhook delivery series.
    pub webhook_events: Arc<webhook_events::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            releases: Arc::new(releases::Repository::new(pool.clone())),
            partners: Arc::new(partners::Repository::new(pool.clone())),
            delivery_statuses: Arc::new(delivery_statuses::Repository::new(pool.clone())),
            delivery_attempts: Arc::new(delivery_attempts::Repository::new(pool.clone())),
            webhook_endpoints: Arc::new(webhook_endpoints::Repository::new(pool.clone())),
            webhook_events: Arc::new(webhook_events::Repository::new(pool)),
        }
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) =
            sqlx::query_as("SELECT 1").fetch_one(&*self.delivery_statuses.pool()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_from_lazy_pool() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://localhost/cadenza").unwrap();
        let _storage = Storage::new(pool);
    }
}
