//! Read access to release and partner reference data.
//!
//! Releases and partners belong to the catalog subsystem; the delivery core
//! only needs to resolve ids and list partners. The trait keeps the
//! orchestrator testable without a database.

use std::{future::Future, pin::Pin, sync::Arc};

use cadenza_core::{
    error::Result,
    models::{DeliveryPartner, PartnerId, Release, ReleaseId},
    storage::Storage,
};

/// Reference data lookups required by the orchestrator.
pub trait Catalog: Send + Sync + 'static {
    /// Finds a release by id.
    fn find_release(
        &self,
        release_id: ReleaseId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Release>>> + Send + '_>>;

    /// Finds a partner by id.
    fn find_partner(
        &self,
        partner_id: &PartnerId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryPartner>>> + Send + '_>>;

    /// Lists every registered partner.
    fn list_partners(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryPartner>>> + Send + '_>>;
}

/// Catalog backed by the Postgres repositories.
pub struct PostgresCatalog {
    storage: Arc<Storage>,
}

impl PostgresCatalog {
    /// Creates a new PostgreSQL catalog adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl Catalog for PostgresCatalog {
    fn find_release(
        &self,
        release_id: ReleaseId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Release>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.releases.find_by_id(release_id).await })
    }

    fn find_partner(
        &self,
        partner_id: &PartnerId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryPartner>>> + Send + '_>> {
        let storage = self.storage.clone();
        let partner_id = partner_id.clone();
        Box::pin(async move { storage.partners.find_by_id(&partner_id).await })
    }

    fn list_partners(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryPartner>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.partners.list_all().await })
    }
}

pub mod mock {
    //! In-memory catalog for tests.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use cadenza_core::error::Result;
    use tokio::sync::RwLock;

    use super::{Catalog, DeliveryPartner, PartnerId, Release, ReleaseId};

    /// Catalog holding releases and partners in memory.
    #[derive(Default)]
    pub struct InMemoryCatalog {
        releases: Arc<RwLock<HashMap<ReleaseId, Release>>>,
        partners: Arc<RwLock<HashMap<PartnerId, DeliveryPartner>>>,
    }

    impl InMemoryCatalog {
        /// Creates an empty catalog.
        pub fn new() -> Self {
            Self::default()
        }

        /// Adds or replaces a release.
        pub async fn add_release(&self, release: Release) {
            self.releases.write().await.insert(release.id, release);
        }

        /// Adds or replaces a partner.
        pub async fn add_partner(&self, partner: DeliveryPartner) {
            self.partners.write().await.insert(partner.id.clone(), partner);
        }
    }

    impl Catalog for InMemoryCatalog {
        fn find_release(
            &self,
            release_id: ReleaseId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Release>>> + Send + '_>> {
            Box::pin(async move { Ok(self.releases.read().await.get(&release_id).cloned()) })
        }

        fn find_partner(
            &self,
            partner_id: &PartnerId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryPartner>>> + Send + '_>> {
            let partner_id = partner_id.clone();
            Box::pin(async move { Ok(self.partners.read().await.get(&partner_id).cloned()) })
        }

        fn list_partners(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryPartner>>> + Send + '_>> {
            Box::pin(async move {
                let mut partners: Vec<_> = self.partners.read().await.values().cloned().collect();
                partners.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
                Ok(partners)
            })
        }
    }
}
