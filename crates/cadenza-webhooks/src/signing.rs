//! Payload canonicalization and HMAC-SHA256 signing.
//!
//! Receivers verify `X-Signature: sha256=<hex>` by recomputing the HMAC over
//! the exact request body. The body is the canonical form of the payload:
//! object keys sorted, no insignificant whitespace. Two payloads that are
//! equal as JSON values therefore always carry the same signature.

use cadenza_core::models::{EndpointId, EventId};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Result, WebhookError};

type HmacSha256 = Hmac<Sha256>;

/// Prefix of the signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Serializes `value` with sorted object keys and no whitespace.
pub fn canonical_json(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out)?;
                }
            }
            out.push('}');
        },
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        },
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

/// Computes the lowercase hex HMAC-SHA256 of `body` under `secret`.
pub fn hmac_hex(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::signing(format!("invalid secret: {e}")))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Returns the `X-Signature` header value for `body`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    Ok(format!("{SIGNATURE_PREFIX}{}", hmac_hex(secret, body)?))
}

/// Checks an `X-Signature` header value against `body`.
///
/// Accepts the value with or without the `sha256=` prefix. The comparison is
/// constant-time.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let hex_signature = header.trim().strip_prefix(SIGNATURE_PREFIX).unwrap_or(header.trim());
    let Ok(expected) = hex::decode(hex_signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Derives the idempotency key of an (endpoint, event) pair.
///
/// The key is stable across retries and process restarts.
pub fn idempotency_key(endpoint_id: EndpointId, event_id: EventId) -> String {
    hex::encode(Sha256::digest(format!("{endpoint_id}:{event_id}").as_bytes()))
}
