//! A number of utilities useful for testing that we want to use in multiple crates

use std::sync::Arc;

use delta_table::{row_from_json, DeltaTable, InMemoryBackend, Row};
use serde_json::Value as JsonValue;

/// Fresh in-memory storage plus an open (empty) table handle rooted at `table_name`.
pub async fn setup_table(table_name: &str) -> (Arc<InMemoryBackend>, DeltaTable) {
    let storage = Arc::new(InMemoryBackend::new());
    let table = DeltaTable::open(storage.clone(), table_name)
        .await
        .expect("open empty table");
    (storage, table)
}

/// Build rows from JSON object literals.
pub fn rows(values: &[JsonValue]) -> Vec<Row> {
    values.iter().map(row_from_json).collect()
}

/// A batch of `count` rows `{_id: "<start+i>", n: <start+i>}`, handy for bulk writes.
pub fn sequential_rows(start: i64, count: i64) -> Vec<Row> {
    (start..start + count)
        .map(|i| row_from_json(&serde_json::json!({"_id": i.to_string(), "n": i})))
        .collect()
}

/// Path of a delta log entry for a version, relative to the table root.
pub fn delta_path_for_version(version: u64, suffix: &str) -> String {
    format!("_delta_log/{version:020}.{suffix}")
}

/// Sorted multiset of canonicalized rows for order-insensitive comparison.
pub fn canonical_multiset(rows: &[Row]) -> Vec<String> {
    let mut keys: Vec<String> = rows
        .iter()
        .map(|row| {
            let mut entries: Vec<String> = row
                .iter()
                .map(|(k, v)| format!("{k}={}", serde_json::to_string(&v.to_json()).unwrap()))
                .collect();
            entries.sort();
            entries.join(",")
        })
        .collect();
    keys.sort();
    keys
}

/// Assert two row sets are equal as multisets, ignoring row and field order.
pub fn assert_same_rows(actual: &[Row], expected: &[Row]) {
    assert_eq!(
        canonical_multiset(actual),
        canonical_multiset(expected),
        "row multisets differ"
    );
}
