//! Projections: inclusion/exclusion of (possibly nested) field paths.
//!
//! Two wire forms: an ordered array of paths (inclusion), or a path → 0/1 map. Mixing 0s and
//! 1s in the map form is ambiguous; the first entry's value decides the mode and the rest are
//! coerced, matching the behavior queries already rely on.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::error::{DeltaResult, Error};
use crate::row::{Row, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl Projection {
    pub fn parse(json: &JsonValue) -> DeltaResult<Projection> {
        match json {
            JsonValue::Array(items) => {
                let paths = items
                    .iter()
                    .map(|item| {
                        item.as_str().map(str::to_string).ok_or_else(|| {
                            Error::validation("projection array entries must be strings")
                        })
                    })
                    .collect::<DeltaResult<Vec<_>>>()?;
                Ok(Projection::Include(paths))
            }
            JsonValue::Object(map) => {
                let mut include_mode = None;
                let mut paths = Vec::new();
                for (path, flag) in map {
                    let included = match flag {
                        JsonValue::Number(n) => n.as_f64() != Some(0.0),
                        JsonValue::Bool(b) => *b,
                        other => {
                            return Err(Error::validation_for(
                                path.clone(),
                                other.to_string(),
                                "projection values must be 0/1 or booleans",
                            ))
                        }
                    };
                    // first entry decides the mode
                    let mode = *include_mode.get_or_insert(included);
                    if included == mode {
                        paths.push(path.clone());
                    }
                }
                match include_mode {
                    Some(true) | None => Ok(Projection::Include(paths)),
                    Some(false) => Ok(Projection::Exclude(paths)),
                }
            }
            _ => Err(Error::validation(
                "projection must be an array of paths or a path->0/1 object",
            )),
        }
    }

    /// Apply to a row, producing a new row. Inclusion rebuilds only the named paths
    /// (reconstructing intermediate objects); exclusion clones and deletes, cloning nested
    /// parents along each deletion path so the input is never mutated.
    pub fn apply(&self, row: &Row) -> Row {
        match self {
            Projection::Include(paths) => {
                let mut out = Row::new();
                for path in paths {
                    include_path(row, path, &mut out);
                }
                out
            }
            Projection::Exclude(paths) => {
                let mut out = row.clone();
                for path in paths {
                    exclude_path(&mut out, path);
                }
                out
            }
        }
    }

    /// The minimal root-column set the columnar reader must materialize, or `None` when every
    /// column is needed (exclusion mode cannot narrow the read set).
    pub fn required_columns(&self) -> Option<Vec<String>> {
        match self {
            Projection::Include(paths) => {
                let mut roots: Vec<String> = Vec::new();
                for path in paths {
                    let root = path.split('.').next().unwrap_or(path).to_string();
                    if !roots.contains(&root) {
                        roots.push(root);
                    }
                }
                Some(roots)
            }
            Projection::Exclude(_) => None,
        }
    }
}

fn include_path(source: &Row, path: &str, out: &mut Row) {
    let mut segments = path.split('.');
    let root = match segments.next() {
        Some(root) if !root.is_empty() => root,
        _ => return,
    };
    let Some(value) = source.get(root) else {
        return;
    };
    let rest: Vec<&str> = segments.collect();
    if rest.is_empty() {
        out.insert(root.to_string(), value.clone());
        return;
    }
    // walk down the source and rebuild the spine in the output
    let Some(leaf) = walk(value, &rest) else {
        return;
    };
    let slot = out
        .entry(root.to_string())
        .or_insert_with(|| Value::Object(IndexMap::new()));
    let mut current = slot;
    for segment in &rest[..rest.len() - 1] {
        let Value::Object(map) = current else {
            return; // an earlier inclusion put a scalar here; nothing sane to merge
        };
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(IndexMap::new()));
    }
    if let Value::Object(map) = current {
        map.insert(rest[rest.len() - 1].to_string(), leaf.clone());
    }
}

fn walk<'a>(value: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments {
        match current {
            Value::Object(map) => current = map.get(*segment)?,
            _ => return None,
        }
    }
    Some(current)
}

fn exclude_path(row: &mut Row, path: &str) {
    let mut segments = path.split('.');
    let Some(root) = segments.next() else {
        return;
    };
    let rest: Vec<&str> = segments.collect();
    if rest.is_empty() {
        row.shift_remove(root);
        return;
    }
    let Some(value) = row.get_mut(root) else {
        return;
    };
    exclude_in_value(value, &rest);
}

fn exclude_in_value(value: &mut Value, segments: &[&str]) {
    let Value::Object(map) = value else {
        return;
    };
    if segments.len() == 1 {
        map.shift_remove(segments[0]);
        return;
    }
    if let Some(child) = map.get_mut(segments[0]) {
        exclude_in_value(child, &segments[1..]);
    }
}
