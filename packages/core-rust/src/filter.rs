//! Filter evaluation and ordering for the document model.
//!
//! Supports the filter subset the engine and the in-memory document store
//! rely on: field equality, `$eq`, `$ne`, `$in`, `$nin`, `$gt`, `$gte`,
//! `$lt`, `$lte`, `$exists`, and the `$and` / `$or` combinators.

use std::cmp::Ordering;

use crate::document::{field_equals, get_path, is_identifier, Document, MatchKey, Value};

/// Returns the single `(field, value)` pair of a plain equality filter.
///
/// Only filters with exactly one non-operator field whose value is a
/// non-null scalar (or an identifier wrapper) qualify. These are the
/// lookups the executor can collapse into one lookup-in-set query.
#[must_use]
pub fn equality_key(filter: &Document) -> Option<(&str, &Value)> {
    if filter.len() != 1 {
        return None;
    }
    let (field, value) = filter.iter().next()?;
    if field.starts_with('$') {
        return None;
    }
    match value {
        // `null` also matches documents missing the field, which a
        // lookup-in-set cannot express.
        Value::Null | Value::Array(_) => None,
        Value::Object(_) if !is_identifier(value) => None,
        _ => Some((field.as_str(), value)),
    }
}

/// Returns `true` if `doc` satisfies every clause of `filter`.
#[must_use]
pub fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(field, condition)| match field.as_str() {
        "$and" => sub_filters(condition).all(|f| matches(doc, f)),
        "$or" => sub_filters(condition).any(|f| matches(doc, f)),
        _ => field_matches(get_path(doc, field), condition),
    })
}

fn sub_filters(condition: &Value) -> impl Iterator<Item = &Document> {
    condition
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            !map.is_empty() && !is_identifier(value) && map.keys().all(|k| k.starts_with('$'))
        }
        _ => false,
    }
}

fn field_matches(stored: Option<&Value>, condition: &Value) -> bool {
    let Some(operators) = condition.as_object().filter(|_| is_operator_object(condition)) else {
        return equals(stored, condition);
    };
    operators.iter().all(|(op, operand)| match op.as_str() {
        "$eq" => equals(stored, operand),
        "$ne" => !equals(stored, operand),
        "$in" => operand
            .as_array()
            .is_some_and(|items| items.iter().any(|item| equals(stored, item))),
        "$nin" => operand
            .as_array()
            .map_or(true, |items| !items.iter().any(|item| equals(stored, item))),
        "$gt" => ordered(stored, operand, |o| o == Ordering::Greater),
        "$gte" => ordered(stored, operand, |o| o != Ordering::Less),
        "$lt" => ordered(stored, operand, |o| o == Ordering::Less),
        "$lte" => ordered(stored, operand, |o| o != Ordering::Greater),
        "$exists" => operand.as_bool().unwrap_or(true) == stored.is_some(),
        _ => false,
    })
}

fn equals(stored: Option<&Value>, expected: &Value) -> bool {
    match stored {
        Some(value) => field_equals(value, &MatchKey::of(expected)),
        None => expected.is_null(),
    }
}

fn ordered(stored: Option<&Value>, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    stored
        .and_then(|value| compare_same_type(value, operand))
        .is_some_and(accept)
}

/// Compares two values of the same type. Mixed types are incomparable.
fn compare_same_type(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Total order used for sorting query results.
///
/// Missing fields sort with nulls, then numbers, strings, objects, arrays
/// and booleans, matching the usual document-store type ordering.
#[must_use]
pub fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let by_rank = type_rank(a).cmp(&type_rank(b));
    if by_rank != Ordering::Equal {
        return by_rank;
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_same_type(x, y)
            .unwrap_or_else(|| x.to_string().cmp(&y.to_string())),
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn equality_key_accepts_single_scalar_field() {
        let filter = doc(json!({"sku": "A-1"}));
        assert_eq!(equality_key(&filter), Some(("sku", &json!("A-1"))));

        let by_id = doc(json!({"_id": {"$oid": "65a1f0c2e4b0a1b2c3d4e5f6"}}));
        assert!(equality_key(&by_id).is_some());
    }

    #[test]
    fn equality_key_rejects_compound_and_operator_filters() {
        assert!(equality_key(&doc(json!({"a": 1, "b": 2}))).is_none());
        assert!(equality_key(&doc(json!({"a": {"$gt": 1}}))).is_none());
        assert!(equality_key(&doc(json!({"$or": [{"a": 1}]}))).is_none());
        assert!(equality_key(&doc(json!({"a": [1, 2]}))).is_none());
        assert!(equality_key(&doc(json!({}))).is_none());
    }

    #[test]
    fn equality_key_rejects_null_which_also_matches_missing_fields() {
        let filter = doc(json!({"deleted_at": null}));
        assert!(equality_key(&filter).is_none());
        assert!(matches(&doc(json!({"n": 1})), &filter));
        assert!(matches(&doc(json!({"n": 2, "deleted_at": null})), &filter));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(matches(&doc(json!({"a": 1})), &Document::new()));
    }

    #[test]
    fn equality_and_identifier_tolerance() {
        let d = doc(json!({"_id": {"$oid": "abc"}, "qty": 5}));
        assert!(matches(&d, &doc(json!({"_id": "abc"}))));
        assert!(matches(&d, &doc(json!({"qty": 5.0}))));
        assert!(!matches(&d, &doc(json!({"qty": 6}))));
    }

    #[test]
    fn comparison_operators() {
        let d = doc(json!({"price": 10, "name": "lamp"}));
        assert!(matches(&d, &doc(json!({"price": {"$gte": 10, "$lt": 11}}))));
        assert!(!matches(&d, &doc(json!({"price": {"$gt": 10}}))));
        assert!(matches(&d, &doc(json!({"name": {"$in": ["desk", "lamp"]}}))));
        assert!(matches(&d, &doc(json!({"name": {"$nin": ["desk"]}}))));
        assert!(matches(&d, &doc(json!({"name": {"$ne": "desk"}}))));
        assert!(matches(&d, &doc(json!({"color": {"$exists": false}}))));
        assert!(!matches(&d, &doc(json!({"price": {"$gt": "1"}}))));
    }

    #[test]
    fn missing_field_equals_null() {
        let d = doc(json!({"a": 1}));
        assert!(matches(&d, &doc(json!({"b": null}))));
        assert!(!matches(&d, &doc(json!({"b": 1}))));
    }

    #[test]
    fn combinators() {
        let d = doc(json!({"a": 1, "b": 2}));
        assert!(matches(&d, &doc(json!({"$or": [{"a": 9}, {"b": 2}]}))));
        assert!(!matches(&d, &doc(json!({"$and": [{"a": 1}, {"b": 3}]}))));
    }

    #[test]
    fn sort_orders_types_then_values() {
        let mut values = [json!("b"), json!(2), Value::Null, json!(1), json!("a")];
        values.sort_by(|a, b| sort_cmp(Some(a), Some(b)));
        assert_eq!(
            values.to_vec(),
            vec![Value::Null, json!(1), json!(2), json!("a"), json!("b")]
        );
        assert_eq!(sort_cmp(None, Some(&Value::Null)), Ordering::Equal);
    }

    proptest! {
        #[test]
        fn equality_filter_matches_own_value(field in "[a-z]{1,8}", n in any::<i64>()) {
            let mut d = Document::new();
            d.insert(field.clone(), json!(n));
            let f = d.clone();
            prop_assert!(matches(&d, &f));
            prop_assert!(equality_key(&f).is_some());
        }
    }
}
