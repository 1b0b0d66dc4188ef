//! Repository for subscriber webhook endpoints.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{EndpointId, EventType, WebhookEndpoint},
};

/// Repository for webhook endpoint database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Registers an endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, endpoint: &WebhookEndpoint) -> Result<EndpointId> {
        sqlx::query(
            r#"
            INSERT INTO webhook_endpoints (
                id, name, url, secret, event_types, status, headers, retry_count,
                retry_delay_seconds, timeout_seconds, last_success, last_failure,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(endpoint.id)
        .bind(&endpoint.name)
        .bind(&endpoint.url)
        .bind(&endpoint.secret)
        .bind(&endpoint.event_types)
        .bind(endpoint.status)
        .bind(&endpoint.headers)
        .bind(endpoint.retry_count)
        .bind(endpoint.retry_delay_seconds)
        .bind(endpoint.timeout_seconds)
        .bind(endpoint.last_success)
        .bind(endpoint.last_failure)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(endpoint.id)
    }

    /// Finds an endpoint by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: EndpointId) -> Result<Option<WebhookEndpoint>> {
        let endpoint =
            sqlx::query_as::<_, WebhookEndpoint>("SELECT * FROM webhook_endpoints WHERE id = $1")
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?;

        Ok(endpoint)
    }

    /// Lists active endpoints subscribed to `event_type`.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_subscribed(&self, event_type: EventType) -> Result<Vec<WebhookEndpoint>> {
        let endpoints = sqlx::query_as::<_, WebhookEndpoint>(
            r#"
            SELECT * FROM webhook_endpoints
            WHERE status = 'active' AND event_types ? $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(event_type.as_str())
        .fetch_all(&*self.pool)
        .await?;

        Ok(endpoints)
    }

    /// Stamps a successful callback.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn record_success(&self, id: EndpointId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE webhook_endpoints SET last_success = $2, updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    /// Stamps a delivery series that ended in failure.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn record_failure(&self, id: EndpointId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE webhook_endpoints SET last_failure = $2, updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }
}
