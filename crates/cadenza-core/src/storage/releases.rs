//! Repository for release reference data.
//!
//! Releases are owned by the catalog subsystem. The dispatch core reads them
//! to build partner payloads; `create` exists for seeding and tests.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Release, ReleaseId},
};

/// Repository for release database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds a release by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, release_id: ReleaseId) -> Result<Option<Release>> {
        let release = sqlx::query_as::<_, Release>("SELECT * FROM releases WHERE id = $1")
            .bind(release_id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(release)
    }

    /// Inserts a release.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the id already exists.
    pub async fn create(&self, release: &Release) -> Result<ReleaseId> {
        sqlx::query(
            r#"
            INSERT INTO releases (id, title, artist, upc, status, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(release.id)
        .bind(&release.title)
        .bind(&release.artist)
        .bind(&release.upc)
        .bind(release.status)
        .bind(&release.metadata)
        .bind(release.created_at)
        .bind(release.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(release.id)
    }
}
