//! Canonical form stability

use chatbot_storage::signing::{canonicalize, sign, DEFAULT_EXCLUDED};
use serde_json::{json, Map, Value};

fn reversed(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map.iter().rev() {
                out.insert(k.clone(), reversed(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(reversed).collect()),
        other => other.clone(),
    }
}

#[test]
fn same_content_same_bytes() {
    let doc = json!({
        "wid": "0",
        "date": "2024-05-06T09:08:09.5+02:00",
        "user": { "id": "a", "roles": ["x", { "b": 1, "a": [true, null] }] },
        "meta": {},
        "seq": 3,
        "_id": "0000000000000001",
        "sign": "abc",
        "ok": true
    });

    let once = canonicalize(&doc, DEFAULT_EXCLUDED);
    let twice = canonicalize(once.as_value(), DEFAULT_EXCLUDED);
    assert_eq!(once.to_json(), twice.to_json());
    assert_eq!(once.to_json(), canonicalize(&reversed(&doc), DEFAULT_EXCLUDED).to_json());

    let canonical = once.into_value();
    assert_eq!(canonical["date"], json!("2024-05-06T07:08:09.500Z"));
    assert!(canonical.get("_id").is_none());
    assert!(canonical.get("sign").is_none());
    assert!(canonical.get("ok").is_none());
    // arrays keep their order
    assert_eq!(canonical["user"]["roles"][0], json!("x"));
}

#[test]
fn excluded_fields_do_not_change_the_signature() {
    let plain = json!({ "a": 1, "nested": { "z": 2, "y": [1, 2] } });
    let mut decorated = plain.clone();
    decorated["_id"] = json!("id");
    decorated["ok"] = json!(false);

    let a = sign(&canonicalize(&plain, DEFAULT_EXCLUDED), "k", Some("prev")).unwrap();
    let b = sign(&canonicalize(&decorated, DEFAULT_EXCLUDED), "k", Some("prev")).unwrap();
    assert_eq!(a, b);

    let mut changed = plain;
    changed["nested"]["y"] = json!([2, 1]);
    let c = sign(&canonicalize(&changed, DEFAULT_EXCLUDED), "k", Some("prev")).unwrap();
    assert_ne!(a, c);
}
