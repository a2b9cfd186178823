//! Request signing for the platform API.
//!
//! The platform authenticates a call by recomputing an HMAC over the query
//! string. Both sides must agree on a canonical form: parameters sorted by
//! key (case-insensitively), percent-encoded, joined with `&`, and the whole
//! string lowercased before hashing.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::ApiError;

type HmacSha1 = Hmac<Sha1>;

/// Name of the query parameter that carries the signature.
pub const SIGNATURE_PARAM: &str = "signature";

/// Query parameters in the order they were added. Signing never relies on
/// this order.
pub type QueryParams = Vec<(String, String)>;

/// Sign `params` with `secret` and return the base64 signature.
pub fn sign(secret: &str, params: &[(String, String)]) -> Result<String, ApiError> {
    let canonical = canonical_query_string(params).to_lowercase();
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|e| ApiError::Signing(e.to_string()))?;
    mac.update(canonical.as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(base64::engine::general_purpose::STANDARD.encode(digest))
}

/// Build the canonical (sorted, encoded, not yet lowercased) query string.
/// The same string is sent on the wire so the platform sees exactly what was
/// signed.
pub fn canonical_query_string(params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|(a, _), (b, _)| {
        a.to_lowercase()
            .cmp(&b.to_lowercase())
            .then_with(|| a.cmp(b))
    });
    sorted
        .into_iter()
        .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Percent-encode a query component, keeping only RFC 3986 unreserved
/// characters. Spaces become `%20`, never `+`.
pub fn encode_component(value: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    value
        .bytes()
        .fold(String::with_capacity(value.len()), |mut encoded, byte| {
            if byte.is_ascii_alphanumeric() || b"-_.~".contains(&byte) {
                encoded.push(char::from(byte));
            } else {
                encoded.push('%');
                encoded.push(char::from(HEX[usize::from(byte >> 4)]));
                encoded.push(char::from(HEX[usize::from(byte & 0x0f)]));
            }
            encoded
        })
}
