//! Content-hash identity for collected messages.
//!
//! The dedup key is a SHA-256 digest over the identity-relevant subset of a
//! message payload. Peripheral payload differences (read receipts, categories,
//! change keys) must not affect identity, and the digest must be stable across
//! processes and runs — global dedup correctness depends on it.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// The fields that define a message's identity for deduplication.
pub const IDENTITY_FIELDS: [&str; 6] = ["subject", "from", "to", "cc", "bcc", "receivedDateTime"];

/// Compute the dedup hash for a message payload.
///
/// The payload is reduced to [`IDENTITY_FIELDS`]; a missing field becomes a
/// JSON `null` rather than being omitted, so "absent" and "empty string" hash
/// differently. The reduced record is serialized with lexicographically
/// sorted keys at every level (serde_json's default map ordering) and the
/// UTF-8 bytes are digested with SHA-256, yielding a 64-char lowercase hex
/// string.
pub fn message_hash(payload: &Value) -> String {
    let mut reduced = serde_json::Map::new();
    for key in IDENTITY_FIELDS {
        let value = payload.get(key).cloned().unwrap_or(Value::Null);
        reduced.insert(key.to_string(), value);
    }

    let canonical = serde_json::to_string(&Value::Object(reduced))
        .expect("JSON value serialization is infallible");

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_payload() -> Value {
        json!({
            "subject": "Invoice",
            "from": {"emailAddress": {"address": "a@x.com"}},
            "to": [{"emailAddress": {"address": "b@x.com"}}],
            "cc": [],
            "bcc": [],
            "receivedDateTime": "2024-01-01T00:00:00Z",
        })
    }

    #[test]
    fn deterministic_across_key_order() {
        // Same identity fields, different textual key order and extra
        // peripheral fields.
        let a: Value = serde_json::from_str(
            r#"{"subject":"Invoice","from":{"emailAddress":{"address":"a@x.com"}},
                "receivedDateTime":"2024-01-01T00:00:00Z","to":[],"cc":null,"bcc":null}"#,
        )
        .unwrap();
        let b: Value = serde_json::from_str(
            r#"{"receivedDateTime":"2024-01-01T00:00:00Z","bcc":null,"cc":null,
                "to":[],"from":{"emailAddress":{"address":"a@x.com"}},"subject":"Invoice",
                "isRead":true,"categories":["red"]}"#,
        )
        .unwrap();
        assert_eq!(message_hash(&a), message_hash(&b));
    }

    #[test]
    fn peripheral_fields_excluded() {
        let a = base_payload();
        let mut b = base_payload();
        b["isRead"] = json!(true);
        b["changeKey"] = json!("CQAAABYAAA==");
        b["id"] = json!("AAMkAGI2...");
        assert_eq!(message_hash(&a), message_hash(&b));
    }

    #[test]
    fn each_identity_field_changes_hash() {
        let base = message_hash(&base_payload());
        for (key, value) in [
            ("subject", json!("Invoice 2")),
            ("from", json!({"emailAddress": {"address": "c@x.com"}})),
            ("to", json!([{"emailAddress": {"address": "d@x.com"}}])),
            ("cc", json!([{"emailAddress": {"address": "e@x.com"}}])),
            ("bcc", json!([{"emailAddress": {"address": "f@x.com"}}])),
            ("receivedDateTime", json!("2024-01-02T00:00:00Z")),
        ] {
            let mut payload = base_payload();
            payload[key] = value;
            assert_ne!(message_hash(&payload), base, "field {} did not affect hash", key);
        }
    }

    #[test]
    fn absent_and_empty_are_distinct() {
        let mut absent = base_payload();
        absent.as_object_mut().unwrap().remove("subject");
        let mut empty = base_payload();
        empty["subject"] = json!("");
        assert_ne!(message_hash(&absent), message_hash(&empty));
    }

    #[test]
    fn hash_is_hex_sha256() {
        let hash = message_hash(&base_payload());
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
