//! Test infrastructure for the delivery and webhook crates.
//!
//! Provides fixture builders, a scripted partner adapter, an event recorder,
//! invariant checks and ready-wired environments running on the in-memory
//! storage backends and a deterministic clock. Nothing here needs a database.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod adapter;
pub mod env;
pub mod events;
pub mod fixtures;
pub mod invariants;

pub use adapter::{Gate, ScriptedAdapter};
pub use cadenza_core::{Clock, TestClock};
pub use env::{TestEnv, TestEnvBuilder, WebhookTestEnv};
pub use events::RecordingEventHandler;
pub use fixtures::{domain_event, epoch, EndpointBuilder, PartnerBuilder, ReleaseBuilder};
pub use invariants::Invariants;
