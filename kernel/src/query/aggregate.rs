//! Aggregation pipelines.
//!
//! A pipeline is an ordered list of stages interpreted over an in-memory row set. Stages and
//! accumulators are parsed once into sum types; `$group` owns a hash map keyed by the group
//! key's canonical serialization.

use std::time::Instant;

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::error::{DeltaResult, Error};
use crate::query::filter::Filter;
use crate::query::projection::Projection;
use crate::row::{resolve_path, Row, Value};
use crate::utils::require;

#[derive(Debug, Clone)]
pub enum Stage {
    Match(Filter),
    Group {
        key: GroupKeySpec,
        accumulators: Vec<(String, Accumulator)>,
    },
    Project(Projection),
    Sort(Vec<(String, SortOrder)>),
    Limit(usize),
    Skip(usize),
    Unwind {
        path: String,
        preserve_null_and_empty: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone)]
pub enum GroupKeySpec {
    /// `_id: null` - a single group over all input rows.
    Constant(Value),
    /// `_id: "$field"`.
    Field(String),
    /// `_id: {name: "$field", ...}`.
    Compound(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
pub enum Operand {
    Field(String),
    Literal(Value),
}

#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum(Operand),
    Avg(Operand),
    Min(Operand),
    Max(Operand),
    First(Operand),
    Last(Operand),
    Push(Operand),
    AddToSet(Operand),
    Count,
    StdDevPop(Operand),
    StdDevSamp(Operand),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationResult {
    pub documents: Vec<Row>,
    pub documents_processed: u64,
    pub groups_created: Option<u64>,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn parse(stages: &[JsonValue]) -> DeltaResult<Pipeline> {
        let stages = stages.iter().map(parse_stage).collect::<DeltaResult<_>>()?;
        Ok(Pipeline { stages })
    }

    pub fn run(&self, rows: Vec<Row>) -> DeltaResult<AggregationResult> {
        let started = Instant::now();
        let documents_processed = rows.len() as u64;
        let mut groups_created = None;
        let mut current = rows;
        for stage in &self.stages {
            current = match stage {
                Stage::Match(filter) => current
                    .into_iter()
                    .filter(|row| filter.matches(row))
                    .collect(),
                Stage::Group { key, accumulators } => {
                    let (rows, group_count) = run_group(current, key, accumulators);
                    *groups_created.get_or_insert(0) += group_count;
                    rows
                }
                Stage::Project(projection) => {
                    current.iter().map(|row| projection.apply(row)).collect()
                }
                Stage::Sort(keys) => {
                    let mut rows = current;
                    rows.sort_by(|a, b| {
                        for (path, order) in keys {
                            let ord = compare_for_sort(resolve_path(a, path), resolve_path(b, path));
                            let ord = match order {
                                SortOrder::Ascending => ord,
                                SortOrder::Descending => ord.reverse(),
                            };
                            if ord != std::cmp::Ordering::Equal {
                                return ord;
                            }
                        }
                        std::cmp::Ordering::Equal // stable sort keeps insertion order on ties
                    });
                    rows
                }
                Stage::Limit(n) => {
                    let mut rows = current;
                    rows.truncate(*n);
                    rows
                }
                Stage::Skip(n) => current.into_iter().skip(*n).collect(),
                Stage::Unwind {
                    path,
                    preserve_null_and_empty,
                } => run_unwind(current, path, *preserve_null_and_empty),
            };
        }
        Ok(AggregationResult {
            documents: current,
            documents_processed,
            groups_created,
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn parse_stage(json: &JsonValue) -> DeltaResult<Stage> {
    let JsonValue::Object(map) = json else {
        return Err(Error::validation("pipeline stage must be an object"));
    };
    require!(
        map.len() == 1,
        Error::validation("pipeline stage must have exactly one operator key")
    );
    let (op, body) = map.iter().next().expect("len checked");
    match op.as_str() {
        "$match" => Ok(Stage::Match(Filter::parse(body)?)),
        "$group" => parse_group(body),
        "$project" => Ok(Stage::Project(Projection::parse(body)?)),
        "$sort" => {
            let JsonValue::Object(keys) = body else {
                return Err(Error::validation("$sort expects a field->direction object"));
            };
            let keys = keys
                .iter()
                .map(|(path, direction)| {
                    let order = match direction.as_i64() {
                        Some(1) => SortOrder::Ascending,
                        Some(-1) => SortOrder::Descending,
                        _ => {
                            return Err(Error::validation_for(
                                path.clone(),
                                direction.to_string(),
                                "sort direction must be 1 or -1",
                            ))
                        }
                    };
                    Ok((path.clone(), order))
                })
                .collect::<DeltaResult<_>>()?;
            Ok(Stage::Sort(keys))
        }
        "$limit" => Ok(Stage::Limit(parse_count(op, body)?)),
        "$skip" => Ok(Stage::Skip(parse_count(op, body)?)),
        "$unwind" => match body {
            JsonValue::String(path) => Ok(Stage::Unwind {
                path: strip_field_ref(path)?,
                preserve_null_and_empty: false,
            }),
            JsonValue::Object(opts) => {
                let path = opts
                    .get("path")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| Error::validation("$unwind expects a path"))?;
                Ok(Stage::Unwind {
                    path: strip_field_ref(path)?,
                    preserve_null_and_empty: opts
                        .get("preserveNullAndEmptyArrays")
                        .and_then(JsonValue::as_bool)
                        .unwrap_or(false),
                })
            }
            _ => Err(Error::validation("$unwind expects a path or options object")),
        },
        other => Err(Error::validation(format!("unknown pipeline stage '{other}'"))),
    }
}

fn parse_count(op: &str, body: &JsonValue) -> DeltaResult<usize> {
    body.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| Error::validation_for(op, body.to_string(), "expects a nonnegative integer"))
}

fn strip_field_ref(raw: &str) -> DeltaResult<String> {
    raw.strip_prefix('$')
        .map(str::to_string)
        .ok_or_else(|| Error::validation_for("", raw, "field references must start with '$'"))
}

fn parse_group(body: &JsonValue) -> DeltaResult<Stage> {
    let JsonValue::Object(map) = body else {
        return Err(Error::validation("$group expects an object"));
    };
    let key = match map.get("_id") {
        None | Some(JsonValue::Null) => GroupKeySpec::Constant(Value::Null),
        Some(JsonValue::String(s)) if s.starts_with('$') => {
            GroupKeySpec::Field(strip_field_ref(s)?)
        }
        Some(JsonValue::Object(fields)) => {
            let fields = fields
                .iter()
                .map(|(name, reference)| {
                    let reference = reference.as_str().ok_or_else(|| {
                        Error::validation("compound group keys must be field references")
                    })?;
                    Ok((name.clone(), strip_field_ref(reference)?))
                })
                .collect::<DeltaResult<_>>()?;
            GroupKeySpec::Compound(fields)
        }
        Some(other) => GroupKeySpec::Constant(Value::from_json(other)),
    };
    let mut accumulators = Vec::new();
    for (name, spec) in map {
        if name == "_id" {
            continue;
        }
        let JsonValue::Object(acc) = spec else {
            return Err(Error::validation_for(
                name.clone(),
                spec.to_string(),
                "accumulator must be an operator object",
            ));
        };
        require!(
            acc.len() == 1,
            Error::validation_for(name.clone(), "", "accumulator must have exactly one operator")
        );
        let (op, operand_json) = acc.iter().next().expect("len checked");
        let operand = parse_operand(operand_json)?;
        let accumulator = match op.as_str() {
            "$sum" => Accumulator::Sum(operand),
            "$avg" => Accumulator::Avg(operand),
            "$min" => Accumulator::Min(operand),
            "$max" => Accumulator::Max(operand),
            "$first" => Accumulator::First(operand),
            "$last" => Accumulator::Last(operand),
            "$push" => Accumulator::Push(operand),
            "$addToSet" => Accumulator::AddToSet(operand),
            "$count" => Accumulator::Count,
            "$stdDevPop" => Accumulator::StdDevPop(operand),
            "$stdDevSamp" => Accumulator::StdDevSamp(operand),
            other => {
                return Err(Error::validation(format!(
                    "unknown accumulator '{other}'"
                )))
            }
        };
        accumulators.push((name.clone(), accumulator));
    }
    Ok(Stage::Group { key, accumulators })
}

fn parse_operand(json: &JsonValue) -> DeltaResult<Operand> {
    match json {
        JsonValue::String(s) if s.starts_with('$') => Ok(Operand::Field(strip_field_ref(s)?)),
        other => Ok(Operand::Literal(Value::from_json(other))),
    }
}

impl Operand {
    fn resolve(&self, row: &Row) -> Option<Value> {
        match self {
            Operand::Field(path) => resolve_path(row, path).cloned(),
            Operand::Literal(v) => Some(v.clone()),
        }
    }
}

#[derive(Default)]
struct NumericAgg {
    int_sum: i64,
    float_sum: f64,
    saw_float: bool,
    count: u64,
    values: Vec<f64>,
}

impl NumericAgg {
    fn observe(&mut self, value: &Value) {
        let (as_f64, is_float) = match value {
            Value::I32(v) => (*v as f64, false),
            Value::I64(v) => (*v as f64, false),
            Value::F64(v) => (*v, true),
            _ => return,
        };
        if is_float {
            self.saw_float = true;
            self.float_sum += as_f64;
        } else {
            self.int_sum = match value {
                Value::I32(v) => self.int_sum.wrapping_add(*v as i64),
                Value::I64(v) => self.int_sum.wrapping_add(*v),
                _ => unreachable!(),
            };
        }
        self.count += 1;
        self.values.push(as_f64);
    }

    fn sum(&self) -> Value {
        if self.saw_float {
            Value::F64(self.float_sum + self.int_sum as f64)
        } else {
            Value::I64(self.int_sum)
        }
    }

    fn avg(&self) -> Value {
        if self.count == 0 {
            Value::Null
        } else {
            Value::F64((self.float_sum + self.int_sum as f64) / self.count as f64)
        }
    }

    fn std_dev(&self, population: bool) -> Value {
        let n = self.values.len();
        let denominator = if population { n } else { n.saturating_sub(1) };
        if denominator == 0 {
            return Value::Null;
        }
        let mean = self.values.iter().sum::<f64>() / n as f64;
        let variance = self
            .values
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / denominator as f64;
        Value::F64(variance.sqrt())
    }
}

#[derive(Default)]
struct AccumulatorState {
    numeric: NumericAgg,
    min: Option<Value>,
    max: Option<Value>,
    first: Option<Value>,
    last: Option<Value>,
    pushed: Vec<Value>,
    set: IndexMap<String, Value>,
    docs: u64,
}

impl AccumulatorState {
    fn observe(&mut self, accumulator: &Accumulator, row: &Row) {
        self.docs += 1;
        let operand = match accumulator {
            Accumulator::Count => None,
            Accumulator::Sum(op)
            | Accumulator::Avg(op)
            | Accumulator::Min(op)
            | Accumulator::Max(op)
            | Accumulator::First(op)
            | Accumulator::Last(op)
            | Accumulator::Push(op)
            | Accumulator::AddToSet(op)
            | Accumulator::StdDevPop(op)
            | Accumulator::StdDevSamp(op) => op.resolve(row),
        };
        match accumulator {
            Accumulator::Count => {}
            Accumulator::Sum(_)
            | Accumulator::Avg(_)
            | Accumulator::StdDevPop(_)
            | Accumulator::StdDevSamp(_) => {
                if let Some(value) = &operand {
                    self.numeric.observe(value);
                }
            }
            Accumulator::Min(_) => {
                if let Some(value) = operand.filter(|v| !v.is_null()) {
                    self.min = Some(match self.min.take() {
                        Some(current)
                            if current.compare(&value) != Some(std::cmp::Ordering::Greater) =>
                        {
                            current
                        }
                        _ => value,
                    });
                }
            }
            Accumulator::Max(_) => {
                if let Some(value) = operand.filter(|v| !v.is_null()) {
                    self.max = Some(match self.max.take() {
                        Some(current)
                            if current.compare(&value) != Some(std::cmp::Ordering::Less) =>
                        {
                            current
                        }
                        _ => value,
                    });
                }
            }
            Accumulator::First(_) => {
                if self.first.is_none() {
                    self.first = Some(operand.unwrap_or(Value::Null));
                }
            }
            Accumulator::Last(_) => {
                self.last = Some(operand.unwrap_or(Value::Null));
            }
            Accumulator::Push(_) => {
                if let Some(value) = operand {
                    self.pushed.push(value);
                }
            }
            Accumulator::AddToSet(_) => {
                if let Some(value) = operand {
                    self.set.entry(value.canonical_key()).or_insert(value);
                }
            }
        }
    }

    fn finish(self, accumulator: &Accumulator) -> Value {
        match accumulator {
            Accumulator::Sum(_) => self.numeric.sum(),
            Accumulator::Avg(_) => self.numeric.avg(),
            Accumulator::Min(_) => self.min.unwrap_or(Value::Null),
            Accumulator::Max(_) => self.max.unwrap_or(Value::Null),
            Accumulator::First(_) => self.first.unwrap_or(Value::Null),
            Accumulator::Last(_) => self.last.unwrap_or(Value::Null),
            Accumulator::Push(_) => Value::Array(self.pushed),
            Accumulator::AddToSet(_) => Value::Array(self.set.into_values().collect()),
            Accumulator::Count => Value::I64(self.docs as i64),
            Accumulator::StdDevPop(_) => self.numeric.std_dev(true),
            Accumulator::StdDevSamp(_) => self.numeric.std_dev(false),
        }
    }
}

fn group_key_value(spec: &GroupKeySpec, row: &Row) -> Value {
    match spec {
        GroupKeySpec::Constant(v) => v.clone(),
        GroupKeySpec::Field(path) => resolve_path(row, path).cloned().unwrap_or(Value::Null),
        GroupKeySpec::Compound(fields) => Value::Object(
            fields
                .iter()
                .map(|(name, path)| {
                    (
                        name.clone(),
                        resolve_path(row, path).cloned().unwrap_or(Value::Null),
                    )
                })
                .collect(),
        ),
    }
}

fn run_group(
    rows: Vec<Row>,
    key: &GroupKeySpec,
    accumulators: &[(String, Accumulator)],
) -> (Vec<Row>, u64) {
    let mut groups: IndexMap<String, (Value, Vec<AccumulatorState>)> = IndexMap::new();
    for row in rows {
        let key_value = group_key_value(key, &row);
        let entry = groups.entry(key_value.canonical_key()).or_insert_with(|| {
            (
                key_value,
                accumulators.iter().map(|_| AccumulatorState::default()).collect(),
            )
        });
        for ((_, accumulator), state) in accumulators.iter().zip(entry.1.iter_mut()) {
            state.observe(accumulator, &row);
        }
    }
    let group_count = groups.len() as u64;
    let documents = groups
        .into_values()
        .map(|(key_value, states)| {
            let mut out = Row::new();
            out.insert("_id".to_string(), key_value);
            for ((name, accumulator), state) in accumulators.iter().zip(states) {
                out.insert(name.clone(), state.finish(accumulator));
            }
            out
        })
        .collect();
    (documents, group_count)
}

/// Total order for `$sort`: nulls (and missing) sort less-than any value; incomparable pairs
/// fall back to a type-rank order so the sort is total and deterministic.
fn compare_for_sort(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => {}
    }
    if let Some(ord) = a.compare(b) {
        return ord;
    }
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::I32(_) | Value::I64(_) | Value::F64(_) | Value::Ts(_) => 1,
            Value::Str(_) => 2,
            Value::Bool(_) => 3,
            Value::Bytes(_) => 4,
            Value::Array(_) => 5,
            Value::Object(_) => 6,
        }
    }
    rank(a)
        .cmp(&rank(b))
        .then_with(|| a.canonical_key().cmp(&b.canonical_key()))
}

fn run_unwind(rows: Vec<Row>, path: &str, preserve: bool) -> Vec<Row> {
    let mut out = Vec::new();
    for row in rows {
        match resolve_path(&row, path).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut unwound = row.clone();
                    set_path(&mut unwound, path, item);
                    out.push(unwound);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve {
                    let mut unwound = row.clone();
                    set_path(&mut unwound, path, Value::Null);
                    out.push(unwound);
                }
            }
            // a non-array scalar passes through as a single element
            Some(_) => out.push(row),
        }
    }
    out
}

fn set_path(row: &mut Row, path: &str, value: Value) {
    let mut segments = path.split('.');
    let Some(root) = segments.next() else {
        return;
    };
    let rest: Vec<&str> = segments.collect();
    if rest.is_empty() {
        row.insert(root.to_string(), value);
        return;
    }
    let mut current = row
        .entry(root.to_string())
        .or_insert_with(|| Value::Object(IndexMap::new()));
    for segment in &rest[..rest.len() - 1] {
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(IndexMap::new()));
    }
    if let Value::Object(map) = current {
        map.insert(rest[rest.len() - 1].to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::row::{row_from_json, row_to_json};

    fn rows(values: &[JsonValue]) -> Vec<Row> {
        values.iter().map(row_from_json).collect()
    }

    fn run(pipeline: &[JsonValue], input: &[JsonValue]) -> AggregationResult {
        Pipeline::parse(pipeline).unwrap().run(rows(input)).unwrap()
    }

    #[test]
    fn match_group_sum_avg() {
        let result = run(
            &[
                json!({"$match": {"dept": {"$ne": "x"}}}),
                json!({"$group": {
                    "_id": "$dept",
                    "total": {"$sum": "$salary"},
                    "mean": {"$avg": "$salary"},
                    "headcount": {"$sum": 1},
                }}),
                json!({"$sort": {"_id": 1}}),
            ],
            &[
                json!({"dept": "a", "salary": 10}),
                json!({"dept": "b", "salary": 30}),
                json!({"dept": "a", "salary": 20}),
                json!({"dept": "x", "salary": 99}),
            ],
        );
        assert_eq!(result.documents_processed, 4);
        assert_eq!(result.groups_created, Some(2));
        assert_eq!(
            result
                .documents
                .iter()
                .map(row_to_json)
                .collect::<Vec<_>>(),
            vec![
                json!({"_id": "a", "total": 30, "mean": 15.0, "headcount": 2}),
                json!({"_id": "b", "total": 30, "mean": 30.0, "headcount": 1}),
            ]
        );
    }

    #[test]
    fn compound_group_key() {
        let result = run(
            &[json!({"$group": {"_id": {"d": "$dept", "r": "$role"}, "n": {"$count": {}}}})],
            &[
                json!({"dept": "a", "role": "x"}),
                json!({"dept": "a", "role": "x"}),
                json!({"dept": "a", "role": "y"}),
            ],
        );
        assert_eq!(result.documents.len(), 2);
    }

    #[test]
    fn min_max_first_last_push_add_to_set() {
        let result = run(
            &[json!({"$group": {
                "_id": null,
                "lo": {"$min": "$v"},
                "hi": {"$max": "$v"},
                "first": {"$first": "$v"},
                "last": {"$last": "$v"},
                "all": {"$push": "$v"},
                "distinct": {"$addToSet": "$v"},
            }})],
            &[json!({"v": 3}), json!({"v": 1}), json!({"v": 3})],
        );
        let doc = row_to_json(&result.documents[0]);
        assert_eq!(doc["lo"], json!(1));
        assert_eq!(doc["hi"], json!(3));
        assert_eq!(doc["first"], json!(3));
        assert_eq!(doc["last"], json!(3));
        assert_eq!(doc["all"], json!([3, 1, 3]));
        assert_eq!(doc["distinct"], json!([3, 1]));
    }

    #[test]
    fn std_dev() {
        let result = run(
            &[json!({"$group": {
                "_id": null,
                "pop": {"$stdDevPop": "$v"},
                "samp": {"$stdDevSamp": "$v"},
            }})],
            &[json!({"v": 2}), json!({"v": 4}), json!({"v": 6})],
        );
        let doc = row_to_json(&result.documents[0]);
        let pop = doc["pop"].as_f64().unwrap();
        let samp = doc["samp"].as_f64().unwrap();
        assert!((pop - 1.632993).abs() < 1e-5);
        assert!((samp - 2.0).abs() < 1e-9);
    }

    #[test]
    fn sort_is_stable_with_null_first_ascending() {
        let result = run(
            &[json!({"$sort": {"v": 1, "tag": 1}})],
            &[
                json!({"v": 2, "tag": "a"}),
                json!({"tag": "b"}),
                json!({"v": 1, "tag": "c"}),
                json!({"v": null, "tag": "a"}),
            ],
        );
        let tags: Vec<_> = result
            .documents
            .iter()
            .map(|r| row_to_json(r)["tag"].clone())
            .collect();
        // nulls (missing included) first, tie broken by the second key
        assert_eq!(tags, vec![json!("a"), json!("b"), json!("c"), json!("a")]);
    }

    #[test]
    fn skip_and_limit() {
        let result = run(
            &[
                json!({"$sort": {"v": 1}}),
                json!({"$skip": 1}),
                json!({"$limit": 2}),
            ],
            &[json!({"v": 3}), json!({"v": 1}), json!({"v": 2}), json!({"v": 4})],
        );
        let vs: Vec<_> = result
            .documents
            .iter()
            .map(|r| row_to_json(r)["v"].clone())
            .collect();
        assert_eq!(vs, vec![json!(2), json!(3)]);
    }

    #[test]
    fn unwind_flattens_arrays() {
        let result = run(
            &[json!({"$unwind": "$tags"})],
            &[
                json!({"id": 1, "tags": ["a", "b"]}),
                json!({"id": 2, "tags": []}),
                json!({"id": 3}),
            ],
        );
        assert_eq!(result.documents.len(), 2);
        assert_eq!(row_to_json(&result.documents[0])["tags"], json!("a"));

        let preserved = run(
            &[json!({"$unwind": {"path": "$tags", "preserveNullAndEmptyArrays": true}})],
            &[json!({"id": 2, "tags": []}), json!({"id": 3})],
        );
        assert_eq!(preserved.documents.len(), 2);
        assert_eq!(row_to_json(&preserved.documents[0])["tags"], json!(null));
    }

    #[test]
    fn unknown_stage_is_rejected() {
        assert!(Pipeline::parse(&[json!({"$teleport": 1})]).is_err());
        assert!(Pipeline::parse(&[json!({"$group": {"_id": null, "x": {"$median": "$v"}}})]).is_err());
    }
}
