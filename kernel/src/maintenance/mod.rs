//! Background maintenance: compaction, deduplication, Z-order clustering and vacuum.
//!
//! Every operator except vacuum is expressed as a single atomic commit of Remove+Add
//! actions through the [`crate::table::MaintenanceContext`]; a failure before that commit
//! leaves the table untouched (orphaned data files are reclaimed by the next vacuum).
//! Vacuum is the one physical operator: it deletes bytes, not log state.

use std::collections::HashMap;

use crate::actions::Add;

pub mod compact;
pub mod dedup;
pub mod vacuum;
pub mod zorder;

pub use compact::{compact, CompactionOptions, CompactionResult, CompactionStrategy};
pub use dedup::{dedup, DedupMode, DedupOptions, DedupResult, KeepStrategy};
pub use vacuum::{vacuum, VacuumOptions, VacuumResult};
pub use zorder::{zorder, CurveType, ZOrderOptions, ZOrderResult};

/// Group files by their partition values; maintenance never mixes partitions in one output
/// file.
pub(crate) fn group_by_partition_values(files: Vec<Add>) -> Vec<Vec<Add>> {
    let mut groups: indexmap::IndexMap<String, Vec<Add>> = indexmap::IndexMap::new();
    for add in files {
        let mut entries: Vec<(String, Option<String>)> = add
            .partition_values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort();
        let key = entries
            .iter()
            .map(|(k, v)| format!("{k}={}", v.as_deref().unwrap_or("\0")))
            .collect::<Vec<_>>()
            .join("/");
        groups.entry(key).or_default().push(add);
    }
    groups.into_values().collect()
}

/// Typed partition values of a file, in table partition-column order.
pub(crate) fn typed_partition_values(
    add: &Add,
    partition_columns: &[String],
    schema: &crate::schema::Schema,
) -> Vec<crate::row::Value> {
    partition_columns
        .iter()
        .map(|col| {
            let data_type = schema
                .field(col)
                .map(|f| f.data_type)
                .unwrap_or(crate::schema::PrimitiveType::String);
            crate::table::parse_partition_value(
                add.partition_values.get(col).and_then(|v| v.as_deref()),
                data_type,
            )
        })
        .collect()
}

/// Multiset equality on canonical row keys.
pub(crate) fn same_row_multiset(a: &[crate::row::Row], b: &[crate::row::Row]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut counts: HashMap<String, i64> = HashMap::new();
    for row in a {
        *counts
            .entry(crate::row::Value::Object(row.clone()).canonical_key())
            .or_insert(0) += 1;
    }
    for row in b {
        let key = crate::row::Value::Object(row.clone()).canonical_key();
        match counts.get_mut(&key) {
            Some(count) => *count -= 1,
            None => return false,
        }
    }
    counts.values().all(|c| *c == 0)
}
