//! Dynamically-typed row values.
//!
//! Rows cross the engine boundary as loosely-shaped records (think JSON documents). Internally
//! they are converted once into the [`Value`] sum type; filters, statistics, the variant codec
//! and the columnar conversion all operate on this type directly.

use std::cmp::Ordering;

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

/// An ordered field-name → value mapping. Field order is preserved so written files and
/// round-tripped rows keep a stable column order.
pub type Row = IndexMap<String, Value>;

/// A single dynamically-typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Microseconds since the unix epoch.
    Ts(i64),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view used for cross-width comparisons. Timestamps compare as their raw
    /// microsecond value so range filters written with integer literals work.
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::I32(v) => Some(*v as f64),
            Value::I64(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            Value::Ts(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::I32(_) | Value::I64(_) | Value::F64(_))
    }

    /// Ordering between two values, if they are comparable. Comparable pairs are numbers
    /// (including timestamps), strings, booleans and byte strings; everything else - and any
    /// pair involving null - has no ordering.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }

    /// Strict equality with numeric coercion: `1 == 1.0`, but `1 != "1"`.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|w| v.equals(w)))
            }
            (a, b) => match a.compare(b) {
                Some(ord) => ord == Ordering::Equal,
                None => a == b,
            },
        }
    }

    /// Convert into the JSON representation used for file statistics and the wire-facing
    /// filter/aggregation forms. Timestamps map to their microsecond integer; byte strings map
    /// to an integer array.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::I32(v) => JsonValue::from(*v),
            Value::I64(v) => JsonValue::from(*v),
            Value::F64(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Str(s) => JsonValue::String(s.clone()),
            Value::Bytes(b) => JsonValue::Array(b.iter().map(|v| JsonValue::from(*v)).collect()),
            Value::Ts(v) => JsonValue::from(*v),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Parse a JSON value. Integers become `I32` when they fit, `I64` otherwise.
    pub fn from_json(json: &JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if let Ok(v) = i32::try_from(i) {
                        Value::I32(v)
                    } else {
                        Value::I64(i)
                    }
                } else {
                    Value::F64(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => Value::Str(s.clone()),
            JsonValue::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Stable textual key used for grouping and duplicate detection. Two values that
    /// [`Value::equals`] each other canonicalize identically (numbers render through f64).
    pub fn canonical_key(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => format!("b:{b}"),
            Value::I32(_) | Value::I64(_) | Value::F64(_) | Value::Ts(_) => {
                // NaN never groups with itself, matching equality
                format!("n:{}", self.as_f64().unwrap_or(f64::NAN))
            }
            Value::Str(s) => format!("s:{s}"),
            Value::Bytes(b) => format!("x:{b:02x?}"),
            Value::Array(items) => {
                let inner: Vec<String> = items.iter().map(Value::canonical_key).collect();
                format!("a:[{}]", inner.join(","))
            }
            Value::Object(map) => {
                let mut entries: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{k}={}", v.canonical_key()))
                    .collect();
                entries.sort();
                format!("o:{{{}}}", entries.join(","))
            }
        }
    }

    /// Render for Hive-style partition paths. `None` for null.
    pub fn partition_string(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::I32(v) => Some(v.to_string()),
            Value::I64(v) => Some(v.to_string()),
            Value::F64(v) => Some(v.to_string()),
            Value::Str(s) => Some(s.clone()),
            Value::Ts(v) => Some(v.to_string()),
            Value::Bytes(_) | Value::Array(_) | Value::Object(_) => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// Convert a JSON object into a [`Row`]. Non-object input yields an empty row.
pub fn row_from_json(json: &JsonValue) -> Row {
    match json {
        JsonValue::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect(),
        _ => Row::new(),
    }
}

/// Convert a [`Row`] into a JSON object.
pub fn row_to_json(row: &Row) -> JsonValue {
    JsonValue::Object(row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

/// Resolve a (possibly dot-separated) path against a row. Intermediate non-objects terminate
/// the walk with `None`.
pub fn resolve_path<'a>(row: &'a Row, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = row.get(first)?;
    for segment in segments {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_coercion_compares_across_widths() {
        assert_eq!(
            Value::I32(1).compare(&Value::F64(1.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::I64(5).compare(&Value::I32(3)),
            Some(Ordering::Greater)
        );
        assert!(Value::I32(1).equals(&Value::F64(1.0)));
        assert!(!Value::I32(1).equals(&Value::Str("1".into())));
    }

    #[test]
    fn null_is_never_ordered() {
        assert_eq!(Value::Null.compare(&Value::I32(0)), None);
        assert_eq!(Value::Str("a".into()).compare(&Value::Null), None);
        assert!(Value::Null.equals(&Value::Null));
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let v = Value::Object(
            [
                ("a".to_string(), Value::I32(1)),
                (
                    "b".to_string(),
                    Value::Array(vec![Value::Str("x".into()), Value::Null]),
                ),
            ]
            .into_iter()
            .collect(),
        );
        assert!(Value::from_json(&v.to_json()).equals(&v));
    }

    #[test]
    fn resolve_path_walks_nested_objects() {
        let row: Row = [(
            "a".to_string(),
            Value::Object([("b".to_string(), Value::I32(7))].into_iter().collect()),
        )]
        .into_iter()
        .collect();
        assert_eq!(resolve_path(&row, "a.b"), Some(&Value::I32(7)));
        assert_eq!(resolve_path(&row, "a.c"), None);
        assert_eq!(resolve_path(&row, "a.b.c"), None);
    }

    #[test]
    fn canonical_key_is_order_insensitive_for_objects() {
        let a = Value::Object(
            [
                ("x".to_string(), Value::I32(1)),
                ("y".to_string(), Value::I32(2)),
            ]
            .into_iter()
            .collect(),
        );
        let b = Value::Object(
            [
                ("y".to_string(), Value::I32(2)),
                ("x".to_string(), Value::I32(1)),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(a.canonical_key(), b.canonical_key());
    }
}
