//! Canonicalization and keyed signatures
//!
//! A document is signed in two steps:
//!
//! 1. [`canonicalize`] rebuilds it with sorted keys, drops volatile top-level
//!    fields (`_id`, `sign`, `ok`) and rewrites timestamps to UTC with
//!    millisecond precision, so equal content always serializes to the same
//!    bytes
//! 2. [`sign`] computes an HMAC over SHA3-224 of the canonical JSON, extended
//!    with the previous signature when the document is part of a chain
//!
//! Signatures are base64 encoded with the standard alphabet.
//!
//! # Example
//!
//! ```
//! use chatbot_storage::signing::{canonicalize, sign, verify, DEFAULT_EXCLUDED};
//! use serde_json::json;
//!
//! let form = canonicalize(&json!({ "b": 1, "a": 2, "_id": "x" }), DEFAULT_EXCLUDED);
//! assert_eq!(form.to_json(), r#"{"a":2,"b":1}"#);
//!
//! let first = sign(&form, "secret", None).unwrap();
//! let second = sign(&form, "secret", Some(&first)).unwrap();
//! assert!(verify(&form, "secret", Some(&first), &second));
//! assert!(!verify(&form, "secret", None, &second));
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha3::Sha3_224;

use crate::error::{Error, Result};

type HmacSha3 = Hmac<Sha3_224>;

/// Top-level fields never covered by a signature
pub const DEFAULT_EXCLUDED: &[&str] = &["_id", "sign", "ok"];

/// Deterministic snapshot of a document, the input to signing
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalForm(Value);

impl CanonicalForm {
    /// The canonical JSON bytes that get signed
    pub fn to_json(&self) -> String {
        self.0.to_string()
    }

    /// The canonical value
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Take the canonical value
    pub fn into_value(self) -> Value {
        self.0
    }
}

/// Canonical form of a document, without the `excluded` top-level fields
pub fn canonicalize(doc: &Value, excluded: &[&str]) -> CanonicalForm {
    let value = match doc {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !excluded.contains(&k.as_str()))
                .collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), normalize(&map[key]));
            }
            Value::Object(out)
        }
        other => normalize(other),
    };
    CanonicalForm(value)
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), normalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(date) => Value::String(format_date(&date.with_timezone(&Utc))),
            Err(_) => value.clone(),
        },
        other => other.clone(),
    }
}

/// ISO-8601 in UTC with milliseconds, the form dates take in canonical documents
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn mac(form: &CanonicalForm, secret: &str, previous: Option<&str>) -> Result<HmacSha3> {
    let mut mac = HmacSha3::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Internal(format!("invalid signing key: {}", e)))?;
    mac.update(form.to_json().as_bytes());
    if let Some(previous) = previous {
        mac.update(previous.as_bytes());
    }
    Ok(mac)
}

/// Sign a canonical form, chained to the previous signature when given
pub fn sign(form: &CanonicalForm, secret: &str, previous: Option<&str>) -> Result<String> {
    let mac = mac(form, secret, previous)?;
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Check a signature in constant time
pub fn verify(form: &CanonicalForm, secret: &str, previous: Option<&str>, signature: &str) -> bool {
    let Ok(bytes) = STANDARD.decode(signature) else {
        return false;
    };
    match mac(form, secret, previous) {
        Ok(mac) => mac.verify_slice(&bytes).is_ok(),
        Err(_) => false,
    }
}

/// Something that can be signed
pub trait Signable {
    /// The document whose canonical form gets signed
    fn signing_document(&self) -> Value;

    /// Canonical form with the default exclusions
    fn canonical_form(&self) -> CanonicalForm {
        canonicalize(&self.signing_document(), DEFAULT_EXCLUDED)
    }

    /// Signature, chained to `previous` when given
    fn signature(&self, secret: &str, previous: Option<&str>) -> Result<String> {
        sign(&self.canonical_form(), secret, previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"z":1,"a":{"y":[1,{"d":2,"c":3}],"b":null}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"b":null,"y":[1,{"c":3,"d":2}]},"z":1}"#).unwrap();

        let ca = canonicalize(&a, DEFAULT_EXCLUDED);
        assert_eq!(ca.to_json(), canonicalize(&b, DEFAULT_EXCLUDED).to_json());
        assert_eq!(ca.to_json(), canonicalize(&a, DEFAULT_EXCLUDED).to_json());
        assert_eq!(ca.to_json(), r#"{"a":{"b":null,"y":[1,{"c":3,"d":2}]},"z":1}"#);
    }

    #[test]
    fn excluded_fields_only_at_top_level() {
        let doc = json!({ "_id": "1", "sign": "s", "ok": true, "user": { "ok": 1 } });
        assert_eq!(
            canonicalize(&doc, DEFAULT_EXCLUDED).to_json(),
            r#"{"user":{"ok":1}}"#
        );
    }

    #[test]
    fn dates_are_normalized_to_utc_millis() {
        let doc = json!({ "date": "2024-01-02T03:04:05+01:00", "at": ["2024-01-02T02:04:05.123456Z"], "name": "not a date" });
        let form = canonicalize(&doc, DEFAULT_EXCLUDED);
        assert_eq!(form.as_value()["date"], json!("2024-01-02T02:04:05.000Z"));
        assert_eq!(form.as_value()["at"][0], json!("2024-01-02T02:04:05.123Z"));
        assert_eq!(form.as_value()["name"], json!("not a date"));
    }

    #[test]
    fn signature_is_deterministic_and_chained() {
        let form = canonicalize(&json!({ "seq": 0, "wid": "w" }), DEFAULT_EXCLUDED);
        let first = sign(&form, "secret", None).unwrap();
        assert_eq!(first, sign(&form, "secret", None).unwrap());
        assert_eq!(first.len(), 40);

        assert_ne!(first, sign(&form, "other", None).unwrap());
        assert_ne!(first, sign(&form, "secret", Some("prev")).unwrap());
    }

    #[test]
    fn verify_detects_tampering() {
        let form = canonicalize(&json!({ "seq": 1, "action": "x" }), DEFAULT_EXCLUDED);
        let signature = sign(&form, "secret", Some("prev")).unwrap();
        assert!(verify(&form, "secret", Some("prev"), &signature));

        let tampered = canonicalize(&json!({ "seq": 1, "action": "y" }), DEFAULT_EXCLUDED);
        assert!(!verify(&tampered, "secret", Some("prev"), &signature));
        assert!(!verify(&form, "secret", Some("other"), &signature));
        assert!(!verify(&form, "secret", Some("prev"), "not base64!"));
    }

    struct Entry(Value);

    impl Signable for Entry {
        fn signing_document(&self) -> Value {
            self.0.clone()
        }
    }

    #[test]
    fn signable_uses_default_exclusions() {
        let entry = Entry(json!({ "a": 1, "sign": "old" }));
        let bare = Entry(json!({ "a": 1 }));
        assert_eq!(
            entry.signature("k", None).unwrap(),
            bare.signature("k", None).unwrap()
        );
    }
}
