//! Canonical JSON and Ed25519 signature verification.
//!
//! Signatures over structured data are made on the *canonical* form:
//! object keys sorted recursively, compact separators, no insignificant
//! whitespace. Sign and verify sides must canonicalise byte-identically
//! or signatures silently fail to round-trip, so both
//! `AccountManager::sign_json` and [`verify_signature_json`] go through
//! [`canonical_json`].

use serde_json::Value;
use vodozemac::{Ed25519PublicKey, Ed25519Signature};

use crate::error::CryptoError;

/// Deterministic serialisation of a JSON value.
///
/// Keys are sorted at every nesting level; array order is significant and
/// preserved. Output is compact (`{"a":1,"b":[2,3]}`).
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let ordered: std::collections::BTreeMap<String, Value> =
                    map.iter().map(|(k, v)| (k.clone(), sorted(v))).collect();
                Value::Object(ordered.into_iter().collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

/// Check an Ed25519 signature over raw bytes.
///
/// Returns `Ok(false)` when key and signature are well-formed but the
/// signature does not match — that is an expected, security-relevant
/// outcome, not an error. Malformed input is a caller bug and fails with
/// [`CryptoError::InvalidKeyEncoding`] or
/// [`CryptoError::MalformedSignature`].
pub fn verify_signature(
    key: &str,
    message: &[u8],
    signature: &str,
) -> Result<bool, CryptoError> {
    let key = Ed25519PublicKey::from_base64(key)
        .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
    let signature = Ed25519Signature::from_base64(signature)
        .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;

    Ok(key.verify(message, &signature).is_ok())
}

/// Check an Ed25519 signature over the canonical form of a JSON value.
pub fn verify_signature_json(
    key: &str,
    value: &Value,
    signature: &str,
) -> Result<bool, CryptoError> {
    verify_signature(key, canonical_json(value).as_bytes(), signature)
}
