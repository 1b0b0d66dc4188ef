//! Repository for delivery partner configuration.
//!
//! Partners are externally managed reference data: priority, auto-deliver
//! flag, rate-limit budget and retry budget.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{DeliveryPartner, PartnerId},
};

/// Repository for partner database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds a partner by slug.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, partner_id: &PartnerId) -> Result<Option<DeliveryPartner>> {
        let partner =
            sqlx::query_as::<_, DeliveryPartner>("SELECT * FROM delivery_partners WHERE id = $1")
                .bind(partner_id)
                .fetch_optional(&*self.pool)
                .await?;

        Ok(partner)
    }

    /// Lists all partners, highest priority first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_all(&self) -> Result<Vec<DeliveryPartner>> {
        let partners = sqlx::query_as::<_, DeliveryPartner>(
            "SELECT * FROM delivery_partners ORDER BY priority DESC, id ASC",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(partners)
    }

    /// Inserts or replaces a partner's configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn upsert(&self, partner: &DeliveryPartner) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_partners (
                id, name, partner_type, status, priority, auto_deliver,
                rate_limit_requests, rate_limit_window_seconds, max_retries,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                partner_type = EXCLUDED.partner_type,
                status = EXCLUDED.status,
                priority = EXCLUDED.priority,
                auto_deliver = EXCLUDED.auto_deliver,
                rate_limit_requests = EXCLUDED.rate_limit_requests,
                rate_limit_window_seconds = EXCLUDED.rate_limit_window_seconds,
                max_retries = EXCLUDED.max_retries,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&partner.id)
        .bind(&partner.name)
        .bind(partner.partner_type)
        .bind(partner.status)
        .bind(partner.priority)
        .bind(partner.auto_deliver)
        .bind(partner.rate_limit_requests)
        .bind(partner.rate_limit_window_seconds)
        .bind(partner.max_retries)
        .bind(partner.created_at)
        .bind(partner.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
