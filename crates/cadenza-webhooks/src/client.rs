//! HTTP client for signed webhook callbacks.
//!
//! Builds the callback request (signature, idempotency and event headers plus
//! the endpoint's static headers), enforces the endpoint timeout and turns
//! non-2xx responses into classified errors.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use cadenza_core::models::{EventType, WebhookEventId};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{Result, WebhookError};

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "X-Signature";
/// Header carrying the idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";
/// Header carrying the event type.
pub const EVENT_HEADER: &str = "X-Cadenza-Event";
/// Header carrying the 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Cadenza-Delivery-Attempt";

const MAX_AUDIT_BODY: usize = 1024;

/// Configuration for the webhook client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// User agent sent with every callback.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
    /// Timeout used when an endpoint does not configure one.
    pub default_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: "Cadenza-Webhooks/1.0".to_string(),
            max_redirects: 3,
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// A single callback to send.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// Series this attempt belongs to.
    pub webhook_event_id: WebhookEventId,
    /// Destination URL.
    pub url: String,
    /// Canonical JSON body.
    pub body: Bytes,
    /// `sha256=<hex>` signature of `body`.
    pub signature: String,
    /// Idempotency key of the series.
    pub idempotency_key: String,
    /// Event type label.
    pub event_type: EventType,
    /// 1-based attempt number.
    pub attempt_number: i32,
    /// Endpoint-configured static headers.
    pub headers: HashMap<String, String>,
    /// Request timeout; zero uses the client default.
    pub timeout: Duration,
}

/// Successful (2xx) endpoint response.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated for storage.
    pub body: String,
}

/// HTTP client used by the dispatcher.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl WebhookClient {
    /// Creates a client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| WebhookError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Creates a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Sends one callback.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the endpoint does not answer in time
    /// - `Transport` for connection failures
    /// - `Http` for any non-2xx response
    pub async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse> {
        let timeout = if request.timeout.is_zero() {
            self.config.default_timeout
        } else {
            request.timeout
        };

        let span = info_span!(
            "webhook_callback",
            webhook_event_id = %request.webhook_event_id,
            url = %request.url,
            attempt = request.attempt_number,
        );

        async move {
            let mut http_request = self
                .client
                .post(&request.url)
                .timeout(timeout)
                .header("content-type", "application/json");

            for (key, value) in &request.headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key, value);
                }
            }

            http_request = http_request
                .header(SIGNATURE_HEADER, &request.signature)
                .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
                .header(EVENT_HEADER, request.event_type.as_str())
                .header(ATTEMPT_HEADER, request.attempt_number.to_string())
                .body(request.body.clone());

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    warn!(timeout_ms = timeout.as_millis(), "webhook callback timed out");
                    return Err(WebhookError::timeout(timeout));
                },
                Err(e) => {
                    warn!(error = %e, "webhook callback failed");
                    return Err(WebhookError::transport(e.to_string()));
                },
            };

            let status = response.status();
            let retry_after = extract_retry_after_seconds(response.headers());
            let body = read_body(response).await;
            debug!(status = status.as_u16(), "received endpoint response");

            if status.is_success() {
                Ok(WebhookResponse { status_code: status.as_u16(), body })
            } else {
                Err(WebhookError::http(status.as_u16(), body, retry_after))
            }
        }
        .instrument(span)
        .await
    }
}

async fn read_body(response: reqwest::Response) -> String {
    match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_AUDIT_BODY => {
            let suffix = "... (truncated)";
            let head = String::from_utf8_lossy(&bytes[..MAX_AUDIT_BODY - suffix.len()]);
            format!("{head}{suffix}")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => format!("[failed to read response body: {e}]"),
    }
}

/// Headers set by the dispatcher that endpoint configuration may not
/// override.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "content-type"
            | "host"
            | "user-agent"
            | "connection"
            | "transfer-encoding"
            | "x-signature"
            | "x-idempotency-key"
            | "x-cadenza-event"
            | "x-cadenza-delivery-attempt"
    )
}

/// Reads a `Retry-After` header given in seconds.
pub fn extract_retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{header, header_exists, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn request(url: String) -> WebhookRequest {
        let mut headers = HashMap::new();
        headers.insert("X-Team".to_string(), "catalog-ops".to_string());
        headers.insert("X-Signature".to_string(), "forged".to_string());

        WebhookRequest {
            webhook_event_id: WebhookEventId::new(),
            url,
            body: Bytes::from_static(br#"{"a":1}"#),
            signature: "sha256=abc".to_string(),
            idempotency_key: "key-1".to_string(),
            event_type: EventType::DeliveryComplete,
            attempt_number: 2,
            headers,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn sends_signed_request_with_custom_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("X-Signature", "sha256=abc"))
            .and(header("X-Idempotency-Key", "key-1"))
            .and(header("X-Cadenza-Event", "delivery_complete"))
            .and(header("X-Cadenza-Delivery-Attempt", "2"))
            .and(header("X-Team", "catalog-ops"))
            .and(header_exists("user-agent"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let client = WebhookClient::with_defaults().unwrap();
        let response = client.send(&request(format!("{}/hook", server.uri()))).await.unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, "ok");
    }

    #[tokio::test]
    async fn non_success_status_becomes_classified_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
            .mount(&server)
            .await;

        let client = WebhookClient::with_defaults().unwrap();
        let err = client.send(&request(server.uri())).await.unwrap_err();

        assert_eq!(err.status_code(), Some(429));
        assert!(err.is_retryable());
        assert!(matches!(err, WebhookError::Http { retry_after_seconds: Some(30), .. }));
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = WebhookClient::with_defaults().unwrap();
        let mut req = request(server.uri());
        req.timeout = Duration::from_millis(50);

        let err = client.send(&req).await.unwrap_err();
        assert!(matches!(err, WebhookError::Timeout { timeout_ms: 50 }));
    }

    #[tokio::test]
    async fn long_bodies_are_truncated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(10_000)))
            .mount(&server)
            .await;

        let client = WebhookClient::with_defaults().unwrap();
        let err = client.send(&request(server.uri())).await.unwrap_err();
        let WebhookError::Http { body, .. } = err else {
            panic!("expected HTTP error");
        };
        assert_eq!(body.len(), MAX_AUDIT_BODY);
        assert!(body.ends_with("(truncated)"));
    }
}
