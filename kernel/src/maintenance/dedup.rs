//! Deduplication.
//!
//! Two modes: primary-key (group on a caller-supplied key, keep one survivor per group) and
//! exact-duplicate (two rows are duplicates iff they agree on every field). Files that lose
//! rows are rewritten; the whole result lands in one commit.

use std::collections::HashMap;

use crate::actions::{Action, Remove};
use crate::error::{DeltaResult, Error};
use crate::maintenance::typed_partition_values;
use crate::row::{resolve_path, Row, Value};
use crate::table::MaintenanceContext;
use crate::utils::{current_time_millis, require};
use crate::Version;

#[derive(Debug, Clone, PartialEq)]
pub enum KeepStrategy {
    /// Keep the first row of each group, in input order.
    First,
    /// Keep the row with the greatest value of `order_by`; ties fall back to input order
    /// (earliest wins).
    Latest { order_by: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DedupMode {
    PrimaryKey {
        columns: Vec<String>,
        keep: KeepStrategy,
    },
    ExactDuplicate,
}

#[derive(Debug, Clone)]
pub struct DedupOptions {
    pub mode: DedupMode,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DedupResult {
    pub version: Option<Version>,
    pub rows_removed: u64,
    pub groups_with_duplicates: u64,
}

fn group_key(row: &Row, mode: &DedupMode) -> String {
    match mode {
        DedupMode::PrimaryKey { columns, .. } => columns
            .iter()
            .map(|col| {
                resolve_path(row, col)
                    .map(Value::canonical_key)
                    .unwrap_or_else(|| "null".to_string())
            })
            .collect::<Vec<_>>()
            .join("|"),
        DedupMode::ExactDuplicate => Value::Object(row.clone()).canonical_key(),
    }
}

pub async fn dedup(ctx: &MaintenanceContext, opts: DedupOptions) -> DeltaResult<DedupResult> {
    if let DedupMode::PrimaryKey { columns, .. } = &opts.mode {
        require!(
            !columns.is_empty(),
            Error::validation("primary-key deduplication needs at least one key column")
        );
    }

    let snapshot = ctx.snapshot(None).await?;
    let Some(schema) = snapshot.schema()? else {
        return Ok(DedupResult::default());
    };
    let partition_columns = snapshot.properties().partition_columns;
    let files = ctx.query_all().await?;

    // global input order: file order, then row order within the file
    #[derive(Clone, Copy)]
    struct Survivor {
        file_idx: usize,
        row_idx: usize,
    }
    let mut survivors: HashMap<String, Survivor> = HashMap::new();
    let mut group_sizes: HashMap<String, u64> = HashMap::new();
    for (file_idx, (_, rows)) in files.iter().enumerate() {
        for (row_idx, row) in rows.iter().enumerate() {
            let key = group_key(row, &opts.mode);
            *group_sizes.entry(key.clone()).or_insert(0) += 1;
            let candidate = Survivor { file_idx, row_idx };
            match survivors.get(&key) {
                None => {
                    survivors.insert(key, candidate);
                }
                Some(current) => {
                    if let DedupMode::PrimaryKey {
                        keep: KeepStrategy::Latest { order_by },
                        ..
                    } = &opts.mode
                    {
                        let current_row = &files[current.file_idx].1[current.row_idx];
                        let current_key = resolve_path(current_row, order_by);
                        let candidate_key = resolve_path(row, order_by);
                        let replace = match (current_key, candidate_key) {
                            (Some(a), Some(b)) => {
                                b.compare(a) == Some(std::cmp::Ordering::Greater)
                            }
                            (None, Some(_)) => true,
                            _ => false,
                        };
                        if replace {
                            survivors.insert(key, candidate);
                        }
                    }
                    // First / ExactDuplicate: the earliest occurrence already won
                }
            }
        }
    }

    let mut result = DedupResult {
        groups_with_duplicates: group_sizes.values().filter(|n| **n > 1).count() as u64,
        ..Default::default()
    };
    if result.groups_with_duplicates == 0 {
        result.version = snapshot.version();
        return Ok(result);
    }

    let mut actions: Vec<Action> = Vec::new();
    let mut rewrite_counter = 0usize;
    for (file_idx, (add, rows)) in files.iter().enumerate() {
        let kept: Vec<Row> = rows
            .iter()
            .enumerate()
            .filter(|(row_idx, row)| {
                let key = group_key(row, &opts.mode);
                let survivor = survivors[&key];
                survivor.file_idx == file_idx && survivor.row_idx == *row_idx
            })
            .map(|(_, row)| row.clone())
            .collect();
        if kept.len() == rows.len() {
            continue;
        }
        result.rows_removed += (rows.len() - kept.len()) as u64;
        if opts.dry_run {
            continue;
        }
        ctx.uncache_file(&add.path).await;
        actions.push(Action::Remove(Remove::for_add(
            add,
            current_time_millis(),
            true,
        )));
        if !kept.is_empty() {
            let values = typed_partition_values(add, &partition_columns, &schema);
            let new_add = crate::table::write::write_data_file(
                &ctx.table().inner,
                &schema,
                &partition_columns,
                &values,
                kept,
                rewrite_counter,
                None,
            )
            .await?;
            rewrite_counter += 1;
            actions.push(Action::Add(new_add));
        }
    }

    if opts.dry_run || actions.is_empty() {
        result.version = snapshot.version();
        return Ok(result);
    }
    result.version = Some(ctx.commit("DEDUPLICATE", actions).await?);
    Ok(result)
}
