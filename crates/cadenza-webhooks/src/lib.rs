//! Signed webhook notifications for delivery status changes.
//!
//! Domain events published by the delivery core are matched against
//! subscriber endpoints and delivered as HMAC-SHA256 signed JSON callbacks.
//! Every (endpoint, event) pair is one idempotent series with the endpoint's
//! own attempt cap and exponential backoff.
//!
//! The dispatcher can be plugged into the event bus directly (it implements
//! [`cadenza_core::EventHandler`]) or fed through a channel by
//! [`EventConsumer`]. [`DispatchWorker`] picks up scheduled retries.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod payload;
pub mod signing;
pub mod storage;
pub mod worker;

pub use client::{ClientConfig, WebhookClient, WebhookRequest, WebhookResponse};
pub use dispatcher::{DispatcherConfig, WebhookDispatcher};
pub use error::{ErrorCategory, Result, WebhookError};
pub use payload::WebhookPayload;
pub use signing::{canonical_json, idempotency_key, sign, verify_signature};
pub use storage::{PostgresWebhookStorage, WebhookStorage};
pub use worker::{DispatchWorker, EventConsumer};
