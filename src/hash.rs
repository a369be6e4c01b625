//! Content digest used for block tamper detection.
//!
//! The digest input is the decimal index, the decimal timestamp, the compact
//! JSON encoding of the entries and the previous hash, concatenated. The JSON
//! encoding is the same `serde_json` representation the stores write, so a
//! block read back from disk re-hashes to the value it was sealed with.

use crate::blockchain::Entry;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of a block's contents.
pub fn calculate_hash(index: u64, timestamp: u64, data: &[Entry], previous_hash: &str) -> String {
    // Entry serialization cannot fail: every field is a string, number, bool
    // or a JSON value.
    let encoded = serde_json::to_string(data).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(index.to_string().as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update(encoded.as_bytes());
    hasher.update(previous_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hex-encoded SHA-256 of an arbitrary string.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::CertificateEntry;
    use serde_json::json;

    #[test]
    fn test_hash_is_deterministic() {
        let data = vec![Entry::Certificate(CertificateEntry {
            certificate: json!({"id": "c-1", "course": "Rust"}),
            timestamp: 42,
        })];
        let a = calculate_hash(1, 100, &data, "abc");
        let b = calculate_hash(1, 100, &data, "abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hash_changes_with_each_field() {
        let data = vec![Entry::Certificate(CertificateEntry {
            certificate: json!({"id": "c-1"}),
            timestamp: 42,
        })];
        let base = calculate_hash(1, 100, &data, "abc");
        assert_ne!(base, calculate_hash(2, 100, &data, "abc"));
        assert_ne!(base, calculate_hash(1, 101, &data, "abc"));
        assert_ne!(base, calculate_hash(1, 100, &[], "abc"));
        assert_ne!(base, calculate_hash(1, 100, &data, "abd"));
    }

    #[test]
    fn test_reloaded_payload_rehashes_identically() {
        // Key order in the source document must not matter.
        let data = vec![Entry::Certificate(CertificateEntry {
            certificate: json!({"b": 2.5, "a": {"z": true, "y": null}}),
            timestamp: 7,
        })];
        let hash = calculate_hash(3, 9, &data, "prev");

        let pretty = serde_json::to_string_pretty(&data).unwrap();
        let reloaded: Vec<Entry> = serde_json::from_str(&pretty).unwrap();
        assert_eq!(hash, calculate_hash(3, 9, &reloaded, "prev"));
    }
}
