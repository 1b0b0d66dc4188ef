//! Repository for webhook delivery series.
//!
//! The `(endpoint_id, event_id)` unique constraint makes enqueueing
//! idempotent: a domain event replayed by the bus finds its existing series
//! instead of creating a second one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{EndpointId, EventId, WebhookEvent, WebhookEventId},
};

/// Repository for webhook event database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts `event` unless a series for the same (endpoint, event) exists.
    ///
    /// Returns the stored series and whether this call created it.
    ///
    /// # Errors
    ///
    /// Returns error if the insert or the follow-up select fails.
    pub async fn find_or_create(&self, event: &WebhookEvent) -> Result<(WebhookEvent, bool)> {
        let mut tx = self.pool.begin().await?;
        let inserted = self.insert_impl(&mut *tx, event).await?;

        let stored = sqlx::query_as::<_, WebhookEvent>(
            "SELECT * FROM webhook_events WHERE endpoint_id = $1 AND event_id = $2",
        )
        .bind(event.endpoint_id)
        .bind(event.event_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok((stored, inserted))
    }

    /// Inserts `event` within a transaction, returning whether a row was
    /// written.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &WebhookEvent,
    ) -> Result<bool> {
        self.insert_impl(&mut **tx, event).await
    }

    async fn insert_impl<'e, E>(&self, executor: E, event: &WebhookEvent) -> Result<bool>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_events (
                id, endpoint_id, event_id, event_type, idempotency_key, payload, status,
                attempt_count, max_attempts, next_retry_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (endpoint_id, event_id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(event.endpoint_id)
        .bind(event.event_id)
        .bind(event.event_type)
        .bind(&event.idempotency_key)
        .bind(&event.payload)
        .bind(event.status)
        .bind(event.attempt_count)
        .bind(event.max_attempts)
        .bind(event.next_retry_at)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Finds a series by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: WebhookEventId) -> Result<Option<WebhookEvent>> {
        let event = sqlx::query_as::<_, WebhookEvent>("SELECT * FROM webhook_events WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(event)
    }

    /// Lists every series created for a domain event.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_event(&self, event_id: EventId) -> Result<Vec<WebhookEvent>> {
        let events = sqlx::query_as::<_, WebhookEvent>(
            "SELECT * FROM webhook_events WHERE event_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(event_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }

    /// Lists every series targeting an endpoint, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_endpoint(&self, endpoint_id: EndpointId) -> Result<Vec<WebhookEvent>> {
        let events = sqlx::query_as::<_, WebhookEvent>(
            "SELECT * FROM webhook_events WHERE endpoint_id = $1 ORDER BY created_at DESC",
        )
        .bind(endpoint_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }

    /// Takes the in-flight lease on a non-terminal series.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn try_claim(
        &self,
        id: WebhookEventId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>> {
        let event = sqlx::query_as::<_, WebhookEvent>(
            r#"
            UPDATE webhook_events
            SET claimed_at = $2
            WHERE id = $1
              AND status IN ('pending', 'retrying')
              AND (claimed_at IS NULL OR claimed_at < $3)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Writes every mutable field of `event`, including its lease.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn update(&self, event: &WebhookEvent) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events SET
                status = $2,
                attempt_count = $3,
                next_retry_at = $4,
                claimed_at = $5,
                http_status_code = $6,
                response_body = $7,
                response_time_ms = $8,
                error_message = $9,
                sent_at = $10,
                updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(event.id)
        .bind(event.status)
        .bind(event.attempt_count)
        .bind(event.next_retry_at)
        .bind(event.claimed_at)
        .bind(event.http_status_code)
        .bind(&event.response_body)
        .bind(event.response_time_ms)
        .bind(&event.error_message)
        .bind(event.sent_at)
        .bind(event.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Drops the lease without touching any other field.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn release_claim(&self, id: WebhookEventId) -> Result<()> {
        sqlx::query("UPDATE webhook_events SET claimed_at = NULL WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    /// Lists unclaimed `pending`/`retrying` series that are due, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_due(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookEvent>> {
        let events = sqlx::query_as::<_, WebhookEvent>(
            r#"
            SELECT * FROM webhook_events
            WHERE status IN ('pending', 'retrying')
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
              AND (claimed_at IS NULL OR claimed_at < $2)
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }
}
