//! MongoDB-style filters.
//!
//! The wire form (a JSON document) is parsed once into the recursive [`Filter`] tree; all
//! evaluation and pushdown walks the tree. Unknown `$`-prefixed operator keys are dropped
//! silently, so a filter written against a newer engine degrades to its understood remainder.

use std::collections::HashSet;

use regex::Regex;
use serde_json::Value as JsonValue;

use crate::error::{DeltaResult, Error};
use crate::row::{resolve_path, Row, Value};
use crate::utils::require;

/// Patterns longer than this fail with a validation error.
pub const MAX_REGEX_PATTERN_BYTES: usize = 1024;
/// Inputs longer than this silently do not match. Bounds pathological regex cost.
pub const MAX_REGEX_INPUT_BYTES: usize = 10 * 1024;

#[derive(Debug, Clone)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Not(Box<Filter>),
    Field {
        path: String,
        predicates: Vec<Predicate>,
    },
    /// The empty filter; matches every row.
    True,
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
}

impl Filter {
    /// Parse the external JSON form. `null` or an empty object is the match-everything filter.
    pub fn parse(json: &JsonValue) -> DeltaResult<Filter> {
        match json {
            JsonValue::Null => Ok(Filter::True),
            JsonValue::Object(map) => {
                let mut parts = Vec::new();
                for (key, value) in map {
                    match key.as_str() {
                        "$and" => parts.push(Filter::And(Self::parse_list(key, value)?)),
                        "$or" => parts.push(Filter::Or(Self::parse_list(key, value)?)),
                        "$nor" => parts.push(Filter::Nor(Self::parse_list(key, value)?)),
                        "$not" => parts.push(Filter::Not(Box::new(Filter::parse(value)?))),
                        k if k.starts_with('$') => {} // unknown operator: ignored
                        field => {
                            let predicates = parse_condition(value)?;
                            if !predicates.is_empty() {
                                parts.push(Filter::Field {
                                    path: field.to_string(),
                                    predicates,
                                });
                            }
                        }
                    }
                }
                Ok(match parts.len() {
                    0 => Filter::True,
                    1 => parts.pop().expect("len checked"),
                    _ => Filter::And(parts),
                })
            }
            _ => Err(Error::validation("filter must be a JSON object")),
        }
    }

    fn parse_list(op: &str, value: &JsonValue) -> DeltaResult<Vec<Filter>> {
        let JsonValue::Array(items) = value else {
            return Err(Error::validation_for(
                op,
                value.to_string(),
                "logical operator expects an array of filters",
            ));
        };
        items.iter().map(Filter::parse).collect()
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::True => true,
            Filter::And(parts) => parts.iter().all(|f| f.matches(row)),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(row)),
            Filter::Nor(parts) => !parts.iter().any(|f| f.matches(row)),
            Filter::Not(inner) => !inner.matches(row),
            Filter::Field { path, predicates } => {
                let value = resolve_path(row, path);
                predicates.iter().all(|p| p.matches(value))
            }
        }
    }

    /// Root columns this filter touches; the reader materializes at least these.
    pub fn referenced_columns(&self, out: &mut HashSet<String>) {
        match self {
            Filter::True => {}
            Filter::And(parts) | Filter::Or(parts) | Filter::Nor(parts) => {
                for part in parts {
                    part.referenced_columns(out);
                }
            }
            Filter::Not(inner) => inner.referenced_columns(out),
            Filter::Field { path, .. } => {
                let root = path.split('.').next().unwrap_or(path);
                out.insert(root.to_string());
            }
        }
    }

    pub fn is_trivial(&self) -> bool {
        matches!(self, Filter::True)
    }
}

fn parse_condition(value: &JsonValue) -> DeltaResult<Vec<Predicate>> {
    let operator_object = matches!(value, JsonValue::Object(map) if map.keys().any(|k| k.starts_with('$')));
    if !operator_object {
        return Ok(vec![Predicate::Eq(Value::from_json(value))]);
    }
    let JsonValue::Object(map) = value else {
        unreachable!("checked above");
    };
    let mut predicates = Vec::new();
    for (op, operand) in map {
        match op.as_str() {
            "$eq" => predicates.push(Predicate::Eq(Value::from_json(operand))),
            "$ne" => predicates.push(Predicate::Ne(Value::from_json(operand))),
            "$gt" => predicates.push(Predicate::Gt(Value::from_json(operand))),
            "$gte" => predicates.push(Predicate::Gte(Value::from_json(operand))),
            "$lt" => predicates.push(Predicate::Lt(Value::from_json(operand))),
            "$lte" => predicates.push(Predicate::Lte(Value::from_json(operand))),
            "$in" => predicates.push(Predicate::In(parse_value_list(op, operand)?)),
            "$nin" => predicates.push(Predicate::Nin(parse_value_list(op, operand)?)),
            "$exists" => predicates.push(Predicate::Exists(operand.as_bool().ok_or_else(
                || Error::validation_for(op, operand.to_string(), "$exists expects a boolean"),
            )?)),
            "$regex" => {
                let pattern = operand.as_str().ok_or_else(|| {
                    Error::validation_for(op, operand.to_string(), "$regex expects a string")
                })?;
                require!(
                    pattern.len() <= MAX_REGEX_PATTERN_BYTES,
                    Error::validation_for(op, "", "regex pattern too long")
                );
                let compiled = Regex::new(pattern).map_err(|e| {
                    Error::validation_for(op, pattern, format!("invalid regex: {e}"))
                })?;
                predicates.push(Predicate::Regex(compiled));
            }
            _ => {} // unknown operator (or stray non-$ key): ignored
        }
    }
    Ok(predicates)
}

fn parse_value_list(op: &str, operand: &JsonValue) -> DeltaResult<Vec<Value>> {
    let JsonValue::Array(items) = operand else {
        return Err(Error::validation_for(
            op,
            operand.to_string(),
            "membership operator expects an array",
        ));
    };
    Ok(items.iter().map(Value::from_json).collect())
}

impl Predicate {
    pub fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            // equality family treats a missing field as null
            Predicate::Eq(operand) => value.unwrap_or(&Value::Null).equals(operand),
            Predicate::Ne(operand) => !value.unwrap_or(&Value::Null).equals(operand),
            Predicate::In(operands) => {
                let value = value.unwrap_or(&Value::Null);
                operands.iter().any(|operand| value.equals(operand))
            }
            Predicate::Nin(operands) => {
                let value = value.unwrap_or(&Value::Null);
                !operands.iter().any(|operand| value.equals(operand))
            }
            Predicate::Exists(expected) => value.is_some() == *expected,
            Predicate::Regex(re) => match value {
                Some(Value::Str(s)) if s.len() <= MAX_REGEX_INPUT_BYTES => re.is_match(s),
                _ => false,
            },
            // ordered comparisons require both sides comparable; null/missing never matches
            Predicate::Gt(operand) => ordered(value, operand, |o| o.is_gt()),
            Predicate::Gte(operand) => ordered(value, operand, |o| o.is_ge()),
            Predicate::Lt(operand) => ordered(value, operand, |o| o.is_lt()),
            Predicate::Lte(operand) => ordered(value, operand, |o| o.is_le()),
        }
    }
}

fn ordered(
    value: Option<&Value>,
    operand: &Value,
    check: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    match value {
        Some(v) if !v.is_null() && !operand.is_null() => {
            v.compare(operand).is_some_and(check)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::row::row_from_json;

    fn matches(filter: JsonValue, row: JsonValue) -> bool {
        Filter::parse(&filter).unwrap().matches(&row_from_json(&row))
    }

    #[test]
    fn implicit_equality() {
        assert!(matches(json!({"a": 1}), json!({"a": 1, "b": 2})));
        assert!(matches(json!({"a": 1}), json!({"a": 1.0})));
        assert!(!matches(json!({"a": 1}), json!({"a": "1"})));
        assert!(!matches(json!({"a": 1}), json!({"b": 2})));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(matches(json!({}), json!({"a": 1})));
        assert!(Filter::parse(&JsonValue::Null).unwrap().matches(&Row::new()));
    }

    #[test]
    fn range_operators() {
        let filter = json!({"v": {"$gte": 2, "$lte": 3}});
        assert!(matches(filter.clone(), json!({"v": 2})));
        assert!(matches(filter.clone(), json!({"v": 3})));
        assert!(!matches(filter.clone(), json!({"v": 1})));
        assert!(!matches(filter.clone(), json!({"v": 4})));
        // null never satisfies an ordered comparison
        assert!(!matches(filter.clone(), json!({"v": null})));
        assert!(!matches(filter, json!({})));
    }

    #[test]
    fn ordered_comparison_needs_comparable_types() {
        assert!(!matches(json!({"v": {"$gt": 1}}), json!({"v": "x"})));
        assert!(matches(json!({"v": {"$gt": "a"}}), json!({"v": "b"})));
    }

    #[test]
    fn logical_operators() {
        assert!(matches(
            json!({"$or": [{"a": 1}, {"a": 2}]}),
            json!({"a": 2})
        ));
        assert!(!matches(
            json!({"$nor": [{"a": 1}, {"a": 2}]}),
            json!({"a": 2})
        ));
        assert!(matches(
            json!({"$not": {"a": {"$gt": 5}}}),
            json!({"a": 3})
        ));
        assert!(matches(
            json!({"$and": [{"a": {"$gte": 1}}, {"b": "x"}]}),
            json!({"a": 1, "b": "x"})
        ));
    }

    #[test]
    fn nested_paths_traverse_objects() {
        assert!(matches(json!({"a.b": 1}), json!({"a": {"b": 1}})));
        assert!(!matches(json!({"a.b": 1}), json!({"a": 5})));
    }

    #[test]
    fn membership_uses_strict_element_equality() {
        assert!(matches(json!({"a": {"$in": [1, 2]}}), json!({"a": 2})));
        assert!(!matches(json!({"a": {"$in": [1, 2]}}), json!({"a": 3})));
        assert!(matches(json!({"a": {"$nin": [1, 2]}}), json!({"a": 3})));
        // an array-valued field matches only if the array itself is a member
        assert!(!matches(json!({"a": {"$in": [1, 2]}}), json!({"a": [1, 9]})));
        assert!(matches(json!({"a": {"$in": [[1, 9]]}}), json!({"a": [1, 9]})));
    }

    #[test]
    fn exists_distinguishes_null_from_missing() {
        assert!(matches(json!({"a": {"$exists": true}}), json!({"a": null})));
        assert!(!matches(json!({"a": {"$exists": true}}), json!({})));
        assert!(matches(json!({"a": {"$exists": false}}), json!({})));
    }

    #[test]
    fn eq_null_matches_missing() {
        assert!(matches(json!({"a": null}), json!({})));
        assert!(matches(json!({"a": null}), json!({"a": null})));
        assert!(!matches(json!({"a": null}), json!({"a": 1})));
    }

    #[test]
    fn regex_matches_with_bounds() {
        assert!(matches(json!({"s": {"$regex": "^ab+c$"}}), json!({"s": "abbc"})));
        assert!(!matches(json!({"s": {"$regex": "^ab+c$"}}), json!({"s": "ac"})));
        // oversize input silently does not match
        let big = "a".repeat(MAX_REGEX_INPUT_BYTES + 1);
        assert!(!matches(json!({"s": {"$regex": "^a+$"}}), json!({"s": big})));
        // oversize pattern fails at parse time
        let pattern = "a".repeat(MAX_REGEX_PATTERN_BYTES + 1);
        assert!(Filter::parse(&json!({"s": {"$regex": pattern}})).is_err());
    }

    #[test]
    fn unknown_operators_are_ignored() {
        let filter = json!({"a": {"$frobnicate": 1, "$gte": 2}});
        assert!(matches(filter.clone(), json!({"a": 3})));
        assert!(!matches(filter, json!({"a": 1})));
        // a condition reduced to nothing matches everything
        assert!(matches(json!({"a": {"$frobnicate": 1}}), json!({"b": 2})));
        assert!(matches(json!({"$mystery": [1]}), json!({"b": 2})));
    }

    #[test]
    fn referenced_columns_collects_roots() {
        let filter = Filter::parse(&json!({
            "$or": [{"a.b": 1}, {"c": {"$gt": 2}}],
            "d": 3
        }))
        .unwrap();
        let mut cols = HashSet::new();
        filter.referenced_columns(&mut cols);
        assert_eq!(
            cols,
            HashSet::from(["a".to_string(), "c".to_string(), "d".to_string()])
        );
    }
}
