//! Document model and identifier-tolerant key matching.
//!
//! Documents are JSON objects. Backends that use native identifier types
//! surface them in extended-JSON form (`{"$oid": "..."}`), so every
//! comparison that fans results back out to callers goes through
//! [`MatchKey`], which collapses those wrappers onto their plain scalar.

use serde_json::{Map, Number};

pub use serde_json::Value;

/// A document stored in or returned from the document store.
pub type Document = Map<String, Value>;

/// Normalized, hashable form of a value used for exact-match comparison.
///
/// - `{"$oid": "abc"}` and `"abc"` produce the same key.
/// - `1` and `1.0` produce the same key.
/// - Objects and arrays compare by their canonical JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatchKey {
    Null,
    Bool(bool),
    Int(i64),
    /// Non-integral float, stored as raw bits.
    Float(u64),
    Str(String),
    Composite(String),
}

impl MatchKey {
    /// Computes the match key of a value.
    #[must_use]
    pub fn of(value: &Value) -> MatchKey {
        match value {
            Value::Null => MatchKey::Null,
            Value::Bool(b) => MatchKey::Bool(*b),
            Value::Number(n) => number_key(n),
            Value::String(s) => MatchKey::Str(s.clone()),
            Value::Object(map) => {
                identifier_key(map).unwrap_or_else(|| MatchKey::Composite(value.to_string()))
            }
            Value::Array(_) => MatchKey::Composite(value.to_string()),
        }
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn number_key(n: &Number) -> MatchKey {
    if let Some(i) = n.as_i64() {
        return MatchKey::Int(i);
    }
    if n.is_u64() {
        return MatchKey::Composite(n.to_string());
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
            MatchKey::Int(f as i64)
        }
        Some(f) => MatchKey::Float(f.to_bits()),
        None => MatchKey::Composite(n.to_string()),
    }
}

/// Unwraps single-key extended-JSON identifier wrappers.
fn identifier_key(map: &Map<String, Value>) -> Option<MatchKey> {
    if map.len() != 1 {
        return None;
    }
    let (tag, inner) = map.iter().next()?;
    match (tag.as_str(), inner) {
        ("$oid" | "$uuid", Value::String(s)) => Some(MatchKey::Str(s.clone())),
        ("$numberLong" | "$numberInt", Value::String(s)) => s.parse().ok().map(MatchKey::Int),
        _ => None,
    }
}

/// Returns `true` if `value` is an extended-JSON identifier wrapper.
#[must_use]
pub fn is_identifier(value: &Value) -> bool {
    match value {
        Value::Object(map) => identifier_key(map).is_some(),
        _ => false,
    }
}

/// Returns `true` if a stored field value satisfies an equality match.
///
/// Array fields match when any element matches, as document stores do.
#[must_use]
pub fn field_equals(stored: &Value, key: &MatchKey) -> bool {
    if MatchKey::of(stored) == *key {
        return true;
    }
    match stored {
        Value::Array(items) => items.iter().any(|item| MatchKey::of(item) == *key),
        _ => false,
    }
}

/// Looks up a dotted path (`"address.city"`) in a document.
#[must_use]
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Sets a dotted path, creating intermediate objects as needed.
///
/// Returns `false` if an intermediate segment exists but is not an object.
pub fn set_path(doc: &mut Document, path: &str, value: Value) -> bool {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
            true
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match child.as_object_mut() {
                Some(obj) => set_path(obj, rest, value),
                None => false,
            }
        }
    }
}

/// Removes a dotted path, returning the removed value.
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => doc.remove(path),
        Some((head, rest)) => remove_path(doc.get_mut(head)?.as_object_mut()?, rest),
    }
}
