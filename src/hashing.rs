//! Hash primitive and canonical serialization
//!
//! Everything that gets hashed (record checksums, audit entries) goes through
//! [`to_canonical_bytes`] first: object keys sorted at every nesting level,
//! no insignificant whitespace, so key order never changes a digest.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Result, SyncError};

/// `previous_hash` of the first entry in an audit stream
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Length of a hex-encoded 256-bit digest
pub const DIGEST_HEX_LEN: usize = 64;

/// Deterministic digest over arbitrary bytes
pub trait Hasher: Send + Sync {
    /// Lowercase hex digest of `bytes`
    fn digest_hex(&self, bytes: &[u8]) -> String;
}

/// SHA-256, lowercase hex
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl Hasher for Sha256Hasher {
    fn digest_hex(&self, bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(&map[*key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

/// Canonical UTF-8 bytes of a JSON value
pub fn to_canonical_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out.into_bytes())
}

/// Digest of the canonical form of `value`
pub fn hash_canonical(hasher: &dyn Hasher, value: &Value) -> Result<String> {
    let bytes = to_canonical_bytes(value)?;
    Ok(hasher.digest_hex(&bytes))
}

/// Check that `s` is a 64-character lowercase hex digest
pub fn validate_digest(s: &str) -> Result<()> {
    if s.len() != DIGEST_HEX_LEN || !s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
        return Err(SyncError::Validation(format!(
            "invalid digest '{}': expected {} lowercase hex characters",
            s, DIGEST_HEX_LEN
        )));
    }
    Ok(())
}
