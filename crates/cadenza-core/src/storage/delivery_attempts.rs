//! Repository for the append-only delivery attempt log.
//!
//! Attempts are inserted once and never updated or deleted; the unique
//! `(delivery_id, attempt_number)` constraint keeps numbering contiguous even
//! if a stale lease lets two writers race.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{AttemptId, DeliveryAttempt, DeliveryId},
};

/// Repository for delivery attempt database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Records a delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the attempt number is already taken.
    pub async fn create(&self, attempt: &DeliveryAttempt) -> Result<AttemptId> {
        self.create_impl(&*self.pool, attempt).await
    }

    /// Records a delivery attempt within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        attempt: &DeliveryAttempt,
    ) -> Result<AttemptId> {
        self.create_impl(&mut **tx, attempt).await
    }

    async fn create_impl<'e, E>(&self, executor: E, attempt: &DeliveryAttempt) -> Result<AttemptId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO delivery_attempts (
                id, delivery_id, release_id, partner_id, operation, attempt_number,
                outcome, request_payload, response_payload, status_code, latency_ms,
                error_kind, error_message, started_at, completed_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
            )
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.delivery_id)
        .bind(attempt.release_id)
        .bind(&attempt.partner_id)
        .bind(attempt.operation)
        .bind(attempt.attempt_number)
        .bind(attempt.outcome)
        .bind(&attempt.request_payload)
        .bind(&attempt.response_payload)
        .bind(attempt.status_code)
        .bind(attempt.latency_ms)
        .bind(&attempt.error_kind)
        .bind(&attempt.error_message)
        .bind(attempt.started_at)
        .bind(attempt.completed_at)
        .execute(executor)
        .await?;

        Ok(attempt.id)
    }

    /// Returns the number the next attempt on `delivery_id` should carry.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn next_attempt_number(&self, delivery_id: DeliveryId) -> Result<i32> {
        let next: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM delivery_attempts \
             WHERE delivery_id = $1",
        )
        .bind(delivery_id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(next)
    }

    /// Lists the attempts of a delivery row in attempt order.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_delivery(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(
            "SELECT * FROM delivery_attempts WHERE delivery_id = $1 ORDER BY attempt_number ASC",
        )
        .bind(delivery_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }
}
