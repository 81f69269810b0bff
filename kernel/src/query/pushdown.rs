//! Predicate pushdown: translating filters into zone-map predicates.
//!
//! Pruning is sound but deliberately incomplete: a row group (or file) is skipped only when
//! at least one predicate *proves* disjointness with its zone map. Anything not provably
//! disjoint is read and re-filtered at row level, so conservative zone maps cost time, never
//! correctness.

use crate::actions::FileStats;
use crate::columnar::ZoneMapEntry;
use crate::query::filter::{Filter, Predicate};
use crate::row::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Between,
}

#[derive(Debug, Clone)]
pub struct ZonePredicate {
    pub column: String,
    pub op: ZoneOp,
    pub value: Value,
    /// Upper bound for `Between`; the single value doubles as the list for `In`.
    pub value2: Option<Value>,
    pub values: Vec<Value>,
}

impl ZonePredicate {
    fn simple(column: &str, op: ZoneOp, value: Value) -> Self {
        ZonePredicate {
            column: column.to_string(),
            op,
            value,
            value2: None,
            values: Vec::new(),
        }
    }
}

/// Translate a filter into its pushable zone-map predicates. Only conjunctive structure is
/// pushable: `$and` recurses, field-level comparisons map directly, and the `$gte`+`$lte`
/// pair on one field additionally emits a `Between`. `$or`/`$not`/`$nor`/`$regex`/`$exists`/
/// `$nin` contribute nothing and are evaluated only at row level.
pub fn to_zone_predicates(filter: &Filter) -> Vec<ZonePredicate> {
    let mut out = Vec::new();
    collect(filter, &mut out);
    out
}

fn collect(filter: &Filter, out: &mut Vec<ZonePredicate>) {
    match filter {
        Filter::And(parts) => {
            for part in parts {
                collect(part, out);
            }
        }
        Filter::Field { path, predicates } => {
            let mut lower = None;
            let mut upper = None;
            for predicate in predicates {
                match predicate {
                    Predicate::Eq(v) => out.push(ZonePredicate::simple(path, ZoneOp::Eq, v.clone())),
                    Predicate::Ne(v) => out.push(ZonePredicate::simple(path, ZoneOp::Ne, v.clone())),
                    Predicate::Gt(v) => out.push(ZonePredicate::simple(path, ZoneOp::Gt, v.clone())),
                    Predicate::Gte(v) => {
                        lower = Some(v.clone());
                        out.push(ZonePredicate::simple(path, ZoneOp::Gte, v.clone()));
                    }
                    Predicate::Lt(v) => out.push(ZonePredicate::simple(path, ZoneOp::Lt, v.clone())),
                    Predicate::Lte(v) => {
                        upper = Some(v.clone());
                        out.push(ZonePredicate::simple(path, ZoneOp::Lte, v.clone()));
                    }
                    Predicate::In(vs) => out.push(ZonePredicate {
                        column: path.clone(),
                        op: ZoneOp::In,
                        value: Value::Null,
                        value2: None,
                        values: vs.clone(),
                    }),
                    Predicate::Nin(_) | Predicate::Exists(_) | Predicate::Regex(_) => {}
                }
            }
            if let (Some(lower), Some(upper)) = (lower, upper) {
                if lower.compare(&upper).is_some() {
                    out.push(ZonePredicate {
                        column: path.clone(),
                        op: ZoneOp::Between,
                        value: lower,
                        value2: Some(upper),
                        values: Vec::new(),
                    });
                }
            }
        }
        Filter::Or(_) | Filter::Nor(_) | Filter::Not(_) | Filter::True => {}
    }
}

/// Whether a row group with this zone map can be skipped. True iff at least one predicate is
/// provably disjoint from the group.
pub fn row_group_can_skip(predicates: &[ZonePredicate], zone_map: &[ZoneMapEntry]) -> bool {
    predicates.iter().any(|predicate| {
        zone_map
            .iter()
            .find(|entry| entry.column == predicate.column)
            .is_some_and(|entry| {
                disjoint(
                    predicate,
                    entry.min.as_ref().map(Value::from_json),
                    entry.max.as_ref().map(Value::from_json),
                )
            })
    })
}

/// File-level variant of [`row_group_can_skip`], driven by an Add action's stats.
pub fn file_can_skip(predicates: &[ZonePredicate], stats: &FileStats) -> bool {
    predicates.iter().any(|predicate| {
        let min = stats.min_values.get(&predicate.column).map(Value::from_json);
        let max = stats.max_values.get(&predicate.column).map(Value::from_json);
        if min.is_none() && max.is_none() {
            return false; // column absent from stats: conservatively kept
        }
        disjoint(predicate, min, max)
    })
}

fn disjoint(predicate: &ZonePredicate, min: Option<Value>, max: Option<Value>) -> bool {
    let (Some(min), Some(max)) = (min, max) else {
        return false;
    };
    let cmp_min = |v: &Value| min.compare(v);
    let cmp_max = |v: &Value| max.compare(v);
    match predicate.op {
        ZoneOp::Eq => {
            cmp_min(&predicate.value).is_some_and(|o| o.is_gt())
                || cmp_max(&predicate.value).is_some_and(|o| o.is_lt())
        }
        ZoneOp::Ne => {
            // every row equals the value only when the range collapses onto it
            cmp_min(&predicate.value).is_some_and(|o| o.is_eq())
                && cmp_max(&predicate.value).is_some_and(|o| o.is_eq())
        }
        ZoneOp::Gt => cmp_max(&predicate.value).is_some_and(|o| o.is_le()),
        ZoneOp::Gte => cmp_max(&predicate.value).is_some_and(|o| o.is_lt()),
        ZoneOp::Lt => cmp_min(&predicate.value).is_some_and(|o| o.is_ge()),
        ZoneOp::Lte => cmp_min(&predicate.value).is_some_and(|o| o.is_gt()),
        ZoneOp::In => {
            !predicate.values.is_empty()
                && predicate.values.iter().all(|v| {
                    cmp_min(v).is_some_and(|o| o.is_gt()) || cmp_max(v).is_some_and(|o| o.is_lt())
                })
        }
        ZoneOp::Between => {
            let Some(upper) = &predicate.value2 else {
                return false;
            };
            cmp_max(&predicate.value).is_some_and(|o| o.is_lt())
                || cmp_min(upper).is_some_and(|o| o.is_gt())
        }
    }
}
