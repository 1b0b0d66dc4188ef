//! Cadenza release delivery and notification dispatch service.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod service;

pub use config::{Config, LogFormat, PartnerConfig};
pub use service::{Backends, Service};
