//! Content hashing and record identifiers.
//!
//! Content hashes are SHA-256 over a canonical JSON rendering: the value is
//! converted to a `serde_json::Value` first, whose object keys are sorted,
//! so field order in the Rust type never affects the hash.
//!
//! Record ids (operation history, resolution history) are short base36
//! strings derived from a SHA-256 of the record's seed, a sequence number
//! and the current time.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

const BASE36_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of generated record ids, excluding the prefix.
pub const RECORD_ID_LENGTH: usize = 10;

/// Compute the SHA-256 of arbitrary bytes as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Render `value` as canonical JSON (sorted object keys, no whitespace).
///
/// # Errors
///
/// Returns an error if `value` cannot be represented as JSON.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    serde_json::to_value(value).map(|v| sort_keys(v).to_string())
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// SHA-256 of the canonical JSON rendering of `value`.
///
/// Values that cannot be rendered as JSON (maps with non-string keys) hash
/// as the empty document.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> String {
    let canonical = canonical_json(value).unwrap_or_default();
    sha256_hex(canonical.as_bytes())
}

/// Generate a record id such as `op-3k9x0a7q1z`.
pub fn record_id(prefix: &str, seed: &str, sequence: u64) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let digest = Sha256::digest(format!("{seed}|{sequence}|{nanos}").as_bytes());
    format!("{prefix}-{}", encode_base36(&digest[..8], RECORD_ID_LENGTH))
}

/// Encode up to 8 bytes as a fixed-length base36 string.
fn encode_base36(bytes: &[u8], length: usize) -> String {
    let mut num: u64 = 0;
    for &byte in bytes.iter().take(8) {
        num = num.wrapping_shl(8).wrapping_add(u64::from(byte));
    }

    let mut chars = Vec::with_capacity(length);
    for _ in 0..length {
        // `num % 36` is always < 36
        let idx = usize::try_from(num % 36).unwrap_or(0);
        chars.push(BASE36_CHARS[idx]);
        num /= 36;
    }
    chars.reverse();
    chars.into_iter().map(char::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_content_hash_ignores_key_order() {
        let a = json!({"title": "x", "labels": ["a"]});
        let b = json!({"labels": ["a"], "title": "x"});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_content_hash_detects_changes() {
        assert_ne!(content_hash(&json!({"title": "x"})), content_hash(&json!({"title": "y"})));
    }

    #[test]
    fn test_record_id_format() {
        let id = record_id("op", "task-1", 0);
        let (prefix, body) = id.split_once('-').unwrap();
        assert_eq!(prefix, "op");
        assert_eq!(body.len(), RECORD_ID_LENGTH);
        assert!(body.bytes().all(|b| BASE36_CHARS.contains(&b)));
    }

    #[test]
    fn test_record_ids_differ_by_sequence() {
        assert_ne!(record_id("op", "t", 1), record_id("op", "t", 2));
    }
}
