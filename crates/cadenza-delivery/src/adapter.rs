//! Partner adapter contract and the generic HTTP adapter.
//!
//! Every partner integration implements `PartnerAdapter`. Adapters classify
//! their own failures into `DeliveryError` variants so the state machine can
//! apply the retry policy without knowing any partner wire protocol.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use cadenza_core::models::{PartnerId, Release, ReleaseId};
use reqwest::{header::HeaderMap, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// Largest response body kept in attempt records.
const MAX_RECORDED_BODY_BYTES: usize = 1024;

/// Release document handed to partner adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleasePayload {
    /// Release identifier.
    pub release_id: ReleaseId,
    /// Release title.
    pub title: String,
    /// Primary artist.
    pub artist: String,
    /// Universal Product Code, when assigned.
    pub upc: Option<String>,
    /// Catalog metadata, forwarded untouched.
    pub metadata: Value,
}

impl ReleasePayload {
    /// Builds the payload for `release`.
    pub fn from_release(release: &Release) -> Self {
        Self {
            release_id: release.id,
            title: release.title.clone(),
            artist: release.artist.clone(),
            upc: release.upc.clone(),
            metadata: release.metadata.0.clone(),
        }
    }

    /// Returns the payload as a JSON document for attempt records.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Successful partner response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartnerResponse {
    /// Partner-side reference for the release, when the partner returns one.
    pub external_id: Option<String>,
    /// HTTP-equivalent status code.
    pub status_code: Option<u16>,
    /// Response document.
    pub body: Option<Value>,
}

impl PartnerResponse {
    /// Creates a response carrying only an external id.
    pub fn accepted(external_id: impl Into<String>) -> Self {
        Self { external_id: Some(external_id.into()), status_code: Some(200), body: None }
    }
}

/// Publication state reported by a partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationStatus {
    /// Accepted, not yet visible to listeners.
    Processing,
    /// Visible to listeners.
    Published,
    /// Removed from the partner's catalog.
    Removed,
}

impl PublicationStatus {
    /// Returns the label stored as the row's external status.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Published => "published",
            Self::Removed => "removed",
        }
    }

    /// Maps a partner's free-form status label.
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "live" | "published" | "available" => Self::Published,
            "removed" | "taken_down" | "takedown" | "deleted" => Self::Removed,
            _ => Self::Processing,
        }
    }
}

impl fmt::Display for PublicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform contract every partner integration implements.
///
/// Implementations must return a classified `DeliveryError` on failure:
/// transport, timeout, server and rate-limit variants are retried, every
/// other variant is permanent.
#[async_trait]
pub trait PartnerAdapter: Send + Sync + fmt::Debug {
    /// Sends a release to the partner.
    async fn deliver(&self, payload: &ReleasePayload) -> Result<PartnerResponse>;

    /// Removes a previously delivered release.
    async fn takedown(&self, external_id: &str) -> Result<PartnerResponse>;

    /// Asks the partner whether the release is visible to listeners.
    async fn check_status(&self, external_id: &str) -> Result<PublicationStatus>;
}

/// Lookup table from partner id to its adapter.
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<PartnerId, Arc<dyn PartnerAdapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the adapter for `partner_id`.
    pub fn register(&mut self, partner_id: PartnerId, adapter: Arc<dyn PartnerAdapter>) {
        self.adapters.insert(partner_id, adapter);
    }

    /// Returns the adapter for `partner_id`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::AdapterMissing` if none is registered.
    pub fn get(&self, partner_id: &PartnerId) -> Result<Arc<dyn PartnerAdapter>> {
        self.adapters
            .get(partner_id)
            .cloned()
            .ok_or_else(|| DeliveryError::AdapterMissing { partner_id: partner_id.to_string() })
    }

    /// Returns the number of registered adapters.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Returns whether no adapter is registered.
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Configuration for `HttpPartnerAdapter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpAdapterConfig {
    /// Base URL of the partner API, without trailing slash.
    pub base_url: String,
    /// Bearer token sent with every request.
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl HttpAdapterConfig {
    /// Creates a configuration for `base_url` with default timeout and agent.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            user_agent: format!("Cadenza-Delivery/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// JSON-over-HTTP adapter for partners exposing a REST release resource.
///
/// - `POST {base}/releases` delivers, expecting `{"external_id": ..}` or
///   `{"id": ..}` back.
/// - `DELETE {base}/releases/{external_id}` takes down; 404 counts as done.
/// - `GET {base}/releases/{external_id}` reports `{"status": ..}`.
#[derive(Debug, Clone)]
pub struct HttpPartnerAdapter {
    partner_id: PartnerId,
    client: reqwest::Client,
    config: HttpAdapterConfig,
}

impl HttpPartnerAdapter {
    /// Creates an adapter for `partner_id`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(partner_id: PartnerId, config: HttpAdapterConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { partner_id, client, config })
    }

    fn release_url(&self, external_id: Option<&str>) -> String {
        match external_id {
            Some(id) => format!("{}/releases/{id}", self.config.base_url),
            None => format!("{}/releases", self.config.base_url),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        self.authorize(request).send().await.map_err(|e| {
            warn!(partner_id = %self.partner_id, error = %e, "partner request failed");
            if e.is_timeout() {
                DeliveryError::timeout(self.config.timeout)
            } else if e.is_connect() {
                DeliveryError::transport(format!("connection failed: {e}"))
            } else {
                DeliveryError::transport(e.to_string())
            }
        })
    }
}

#[async_trait]
impl PartnerAdapter for HttpPartnerAdapter {
    async fn deliver(&self, payload: &ReleasePayload) -> Result<PartnerResponse> {
        let span = info_span!(
            "partner_deliver",
            partner_id = %self.partner_id,
            release_id = %payload.release_id,
        );

        async move {
            let response =
                self.send(self.client.post(self.release_url(None)).json(payload)).await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = read_body(response).await;

            if !status.is_success() {
                return Err(classify_failure(status, &headers, body));
            }

            let document = serde_json::from_str::<Value>(&body).ok();
            let external_id = document.as_ref().and_then(extract_external_id);
            debug!(
                status = status.as_u16(),
                external_id = ?external_id,
                "partner accepted release"
            );

            Ok(PartnerResponse { external_id, status_code: Some(status.as_u16()), body: document })
        }
        .instrument(span)
        .await
    }

    async fn takedown(&self, external_id: &str) -> Result<PartnerResponse> {
        let span = info_span!("partner_takedown", partner_id = %self.partner_id, external_id);

        async move {
            let request = self.client.delete(self.release_url(Some(external_id)));
            let response = self.send(request).await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = read_body(response).await;

            // Already gone on the partner side.
            if status.is_success() || status == StatusCode::NOT_FOUND {
                return Ok(PartnerResponse {
                    external_id: Some(external_id.to_string()),
                    status_code: Some(status.as_u16()),
                    body: serde_json::from_str(&body).ok(),
                });
            }

            Err(classify_failure(status, &headers, body))
        }
        .instrument(span)
        .await
    }

    async fn check_status(&self, external_id: &str) -> Result<PublicationStatus> {
        let response = self.send(self.client.get(self.release_url(Some(external_id)))).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = read_body(response).await;

        if status == StatusCode::NOT_FOUND {
            return Ok(PublicationStatus::Removed);
        }
        if !status.is_success() {
            return Err(classify_failure(status, &headers, body));
        }

        let label = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|doc| doc.get("status").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();

        Ok(PublicationStatus::from_label(&label))
    }
}

/// Maps a non-success partner response onto the retry taxonomy.
pub fn classify_failure(status: StatusCode, headers: &HeaderMap, body: String) -> DeliveryError {
    let code = status.as_u16();
    match code {
        429 => DeliveryError::rate_limited(extract_retry_after_seconds(headers).unwrap_or(60)),
        // Request timeout is the partner's problem, not a rejection.
        408 => DeliveryError::server_error(code, body),
        400..=499 => DeliveryError::client_error(code, body),
        _ => DeliveryError::server_error(code, body),
    }
}

/// Extracts a retry-after delay in seconds from response headers.
///
/// Supports both the delta-seconds and the HTTP-date format. Unparseable
/// values fall back to 60 seconds.
pub fn extract_retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    const DEFAULT_RETRY_AFTER: u64 = 60;

    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(seconds);
    }

    if let Ok(date_time) = chrono::DateTime::parse_from_rfc2822(value) {
        let remaining = date_time.with_timezone(&chrono::Utc) - chrono::Utc::now();
        if let Ok(remaining) = remaining.to_std() {
            return Some(remaining.as_secs());
        }
    }

    Some(DEFAULT_RETRY_AFTER)
}

fn extract_external_id(document: &Value) -> Option<String> {
    ["external_id", "id"].iter().find_map(|key| match document.get(key)? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    })
}

async fn read_body(response: Response) -> String {
    match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_RECORDED_BODY_BYTES => {
            let suffix = "... (truncated)";
            let kept = String::from_utf8_lossy(&bytes[..MAX_RECORDED_BODY_BYTES - suffix.len()]);
            format!("{kept}{suffix}")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => format!("[failed to read response body: {e}]"),
    }
}

#[cfg(test)]
mod tests {
    use cadenza_core::models::ReleaseId;
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn payload() -> ReleasePayload {
        ReleasePayload {
            release_id: ReleaseId::new(),
            title: "Blue Hour".to_string(),
            artist: "Nadia Reyes".to_string(),
            upc: Some("0602445123456".to_string()),
            metadata: json!({"tracks": 11}),
        }
    }

    fn adapter(server: &MockServer) -> HttpPartnerAdapter {
        let mut config = HttpAdapterConfig::new(server.uri());
        config.api_key = Some("partner-key".to_string());
        HttpPartnerAdapter::new(PartnerId::new("spotify"), config).unwrap()
    }

    #[tokio::test]
    async fn deliver_returns_external_id() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/releases"))
            .and(matchers::header("authorization", "Bearer partner-key"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"external_id": "sp-42"})))
            .expect(1)
            .mount(&server)
            .await;

        let response = adapter(&server).deliver(&payload()).await.unwrap();

        assert_eq!(response.external_id.as_deref(), Some("sp-42"));
        assert_eq!(response.status_code, Some(201));
    }

    #[tokio::test]
    async fn deliver_classifies_server_and_client_errors() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid upc"))
            .mount(&server)
            .await;

        let adapter = adapter(&server);

        let first = adapter.deliver(&payload()).await.unwrap_err();
        assert!(first.is_retryable());
        assert_eq!(first.status_code(), Some(503));

        let second = adapter.deliver(&payload()).await.unwrap_err();
        assert!(!second.is_retryable());
        assert_eq!(second.response_body(), Some("invalid upc"));
    }

    #[tokio::test]
    async fn deliver_honors_retry_after() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(429).append_header("Retry-After", "900"))
            .mount(&server)
            .await;

        let err = adapter(&server).deliver(&payload()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::RateLimited { retry_after_seconds: 900 }));
    }

    #[tokio::test]
    async fn takedown_treats_missing_release_as_done() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("DELETE"))
            .and(matchers::path("/releases/sp-42"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let response = adapter(&server).takedown("sp-42").await.unwrap();
        assert_eq!(response.status_code, Some(404));
    }

    #[tokio::test]
    async fn check_status_maps_partner_labels() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/releases/sp-42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "LIVE"})))
            .mount(&server)
            .await;

        let status = adapter(&server).check_status("sp-42").await.unwrap();
        assert_eq!(status, PublicationStatus::Published);
    }

    #[tokio::test]
    async fn unreachable_partner_is_retryable() {
        let config = HttpAdapterConfig {
            timeout: Duration::from_millis(200),
            ..HttpAdapterConfig::new("http://127.0.0.1:1")
        };
        let adapter = HttpPartnerAdapter::new(PartnerId::new("closed"), config).unwrap();

        let err = adapter.deliver(&payload()).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }

    #[test]
    fn retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_retry_after_seconds(&headers), None);

        headers.insert(reqwest::header::RETRY_AFTER, HeaderValue::from_static("120"));
        assert_eq!(extract_retry_after_seconds(&headers), Some(120));

        headers.insert(reqwest::header::RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(extract_retry_after_seconds(&headers), Some(60));
    }

    #[test]
    fn registry_reports_missing_adapter() {
        let registry = AdapterRegistry::new();
        let err = registry.get(&PartnerId::new("tidal")).unwrap_err();
        assert!(matches!(err, DeliveryError::AdapterMissing { .. }));
        assert!(registry.is_empty());
    }
}
