//! Repository for delivery status rows.
//!
//! One row per (release, partner) pair, enforced by a unique constraint.
//! Mutual exclusion between concurrent attempts on the same pair uses the
//! `claimed_at` lease: a conditional `UPDATE` sets it only when it is free or
//! stale, so at most one caller wins while different pairs proceed in
//! parallel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{DeliveryId, DeliveryStatus, PartnerId, ReleaseId},
};

/// Repository for delivery status database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts `row` unless a row for the same pair exists, then returns the
    /// stored row.
    ///
    /// # Errors
    ///
    /// Returns error if the insert or the follow-up select fails.
    pub async fn find_or_create(&self, row: &DeliveryStatus) -> Result<DeliveryStatus> {
        sqlx::query(
            r#"
            INSERT INTO delivery_statuses (
                id, release_id, partner_id, operation, status, retry_count, max_retries,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (release_id, partner_id) DO NOTHING
            "#,
        )
        .bind(row.id)
        .bind(row.release_id)
        .bind(&row.partner_id)
        .bind(row.operation)
        .bind(row.status)
        .bind(row.retry_count)
        .bind(row.max_retries)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&*self.pool)
        .await?;

        let stored = sqlx::query_as::<_, DeliveryStatus>(
            "SELECT * FROM delivery_statuses WHERE release_id = $1 AND partner_id = $2",
        )
        .bind(row.release_id)
        .bind(&row.partner_id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(stored)
    }

    /// Finds the row for a (release, partner) pair.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_pair(
        &self,
        release_id: ReleaseId,
        partner_id: &PartnerId,
    ) -> Result<Option<DeliveryStatus>> {
        let row = sqlx::query_as::<_, DeliveryStatus>(
            "SELECT * FROM delivery_statuses WHERE release_id = $1 AND partner_id = $2",
        )
        .bind(release_id)
        .bind(partner_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row)
    }

    /// Lists every row of a release, ordered by partner.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_release(&self, release_id: ReleaseId) -> Result<Vec<DeliveryStatus>> {
        let rows = sqlx::query_as::<_, DeliveryStatus>(
            "SELECT * FROM delivery_statuses WHERE release_id = $1 ORDER BY partner_id ASC",
        )
        .bind(release_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }

    /// Takes the in-flight lease on a row.
    ///
    /// Succeeds when the row is unclaimed or its lease started before
    /// `stale_before`. Returns the claimed row, or `None` when another caller
    /// holds the lease.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn try_claim(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<DeliveryStatus>> {
        let row = sqlx::query_as::<_, DeliveryStatus>(
            r#"
            UPDATE delivery_statuses
            SET claimed_at = $2
            WHERE id = $1
              AND (claimed_at IS NULL OR claimed_at < $3)
            RETURNING *
            "#,
        )
        .bind(delivery_id)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row)
    }

    /// Writes every mutable field of `row`, including its lease.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update(&self, row: &DeliveryStatus) -> Result<()> {
        self.update_impl(&*self.pool, row).await
    }

    /// Writes `row` within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        row: &DeliveryStatus,
    ) -> Result<()> {
        self.update_impl(&mut **tx, row).await
    }

    async fn update_impl<'e, E>(&self, executor: E, row: &DeliveryStatus) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            UPDATE delivery_statuses SET
                operation = $2,
                status = $3,
                external_id = $4,
                external_status = $5,
                error_message = $6,
                retry_count = $7,
                max_retries = $8,
                next_retry_at = $9,
                claimed_at = $10,
                delivered_at = $11,
                live_at = $12,
                failed_at = $13,
                takedown_at = $14,
                suspended_at = $15,
                updated_at = $16
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(row.operation)
        .bind(row.status)
        .bind(&row.external_id)
        .bind(&row.external_status)
        .bind(&row.error_message)
        .bind(row.retry_count)
        .bind(row.max_retries)
        .bind(row.next_retry_at)
        .bind(row.claimed_at)
        .bind(row.delivered_at)
        .bind(row.live_at)
        .bind(row.failed_at)
        .bind(row.takedown_at)
        .bind(row.suspended_at)
        .bind(row.updated_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Drops the lease without touching any other field.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release_claim(&self, delivery_id: DeliveryId) -> Result<()> {
        sqlx::query("UPDATE delivery_statuses SET claimed_at = NULL WHERE id = $1")
            .bind(delivery_id)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    /// Lists unclaimed rows whose scheduled retry has come due, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_due(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeliveryStatus>> {
        let rows = sqlx::query_as::<_, DeliveryStatus>(
            r#"
            SELECT * FROM delivery_statuses
            WHERE next_retry_at IS NOT NULL
              AND next_retry_at <= $1
              AND (claimed_at IS NULL OR claimed_at < $2)
            ORDER BY next_retry_at ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }
}
