//! Release delivery to distribution partners.
//!
//! This crate moves a release through its per-partner lifecycle: submit it
//! through a partner adapter, classify the outcome, schedule retries with
//! exponential backoff and record every attempt.
//!
//! # Architecture
//!
//! - [`DeliveryStateMachine`] owns the transitions of one (release, partner)
//!   row. It holds the row's lease for the duration of an attempt, which keeps
//!   attempts on a pair strictly sequential.
//! - [`DeliveryOrchestrator`] fans a request out across partners in priority
//!   order with bounded concurrency and drives scheduled retries until the
//!   rows settle.
//! - [`RetrySweeper`] picks up retries that came due outside a request.
//! - [`RateLimiter`] enforces each partner's request budget.
//!
//! Status transitions are published as [`cadenza_core::DomainEvent`]s; this
//! crate never talks to the webhook dispatcher directly.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cadenza_core::{NoOpEventHandler, RealClock, ReleaseId, PartnerId};
//! use cadenza_delivery::{
//!     catalog::mock::InMemoryCatalog, storage::mock::MockDeliveryStorage, AdapterRegistry,
//!     DeliveryOrchestrator, DeliveryStateMachine, MachineConfig, OrchestratorConfig,
//! };
//!
//! # async fn example(release_id: ReleaseId) -> cadenza_delivery::Result<()> {
//! let machine = DeliveryStateMachine::new(
//!     Arc::new(MockDeliveryStorage::new()),
//!     Arc::new(AdapterRegistry::new()),
//!     Arc::new(NoOpEventHandler::new()),
//!     Arc::new(RealClock::new()),
//!     MachineConfig::default(),
//! );
//! let orchestrator = DeliveryOrchestrator::new(
//!     Arc::new(InMemoryCatalog::new()),
//!     Arc::new(machine),
//!     OrchestratorConfig::default(),
//! );
//!
//! for result in orchestrator.deliver(release_id, &[PartnerId::new("spotify")]).await? {
//!     println!("{}: {:?}", result.partner_id, result.final_status);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod catalog;
pub mod error;
pub mod machine;
pub mod orchestrator;
pub mod rate_limit;
pub mod storage;
pub mod sweeper;

pub use adapter::{
    AdapterRegistry, HttpAdapterConfig, HttpPartnerAdapter, PartnerAdapter, PartnerResponse,
    PublicationStatus, ReleasePayload,
};
pub use catalog::{Catalog, PostgresCatalog};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use machine::{DeliveryHistory, DeliveryStateMachine, MachineConfig};
pub use orchestrator::{DeliveryOrchestrator, OrchestratorConfig, PartnerResult};
pub use rate_limit::{Admission, RateLimiter};
pub use storage::{DeliveryStorage, PostgresDeliveryStorage};
pub use sweeper::{RetrySweeper, SweepStats, SweeperConfig};
