//! Ordering, equality and path lookup for document values
//!
//! Values of different kinds never compare equal. Sorting uses a fixed order
//! between kinds: null, numbers, strings, objects, arrays, booleans.

use serde_json::{Number, Value};
use std::cmp::Ordering;

use super::Document;

fn bracket(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

fn cmp_numbers(a: &Number, b: &Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
}

/// Total order over all values, used for sorting
pub fn total_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Number(x), Value::Number(y)) => cmp_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = total_cmp(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| total_cmp(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => bracket(a).cmp(&bracket(b)),
    }
}

/// Ordering between two values of the same kind, `None` across kinds
pub fn bracket_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    if bracket(a) == bracket(b) {
        Some(total_cmp(a, b))
    } else {
        None
    }
}

/// Equality that treats `1` and `1.0` as the same number
pub fn values_equal(a: &Value, b: &Value) -> bool {
    bracket_cmp(a, b) == Some(Ordering::Equal)
}

/// Resolve a dotted path (`meta.tag`) inside a document
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}
