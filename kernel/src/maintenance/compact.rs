//! Small-file compaction.
//!
//! Bins undersized live files per partition with a selectable strategy, rewrites each bin
//! into one file, and commits every Remove+Add in a single version. The table's row multiset
//! is invariant under compaction; deletion vectors are materialized away in the process.

use strum::{Display as StrumDisplay, EnumString};

use crate::actions::{Action, Remove};
use crate::error::{DeltaResult, Error};
use crate::maintenance::{group_by_partition_values, same_row_multiset, typed_partition_values};
use crate::row::Row;
use crate::table::MaintenanceContext;
use crate::utils::{current_time_millis, require};
use crate::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, StrumDisplay)]
#[strum(serialize_all = "kebab-case")]
pub enum CompactionStrategy {
    /// First-fit-decreasing by file size.
    #[default]
    BinPacking,
    /// Largest files first, closing each bin once it reaches the target.
    Greedy,
    /// Ascending by size, concatenating until the target.
    SortBySize,
}

#[derive(Debug, Clone)]
pub struct CompactionOptions {
    /// Output files aim at this size; files already at or above it are left alone.
    pub target_file_bytes: u64,
    pub strategy: CompactionStrategy,
    /// Plan only; commit nothing.
    pub dry_run: bool,
    /// Read each output back and require row-multiset equality before committing.
    pub verify_integrity: bool,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        CompactionOptions {
            target_file_bytes: 128 * 1024 * 1024,
            strategy: CompactionStrategy::default(),
            dry_run: false,
            verify_integrity: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompactionResult {
    /// `None` when nothing needed compacting or `dry_run` was set.
    pub version: Option<Version>,
    pub files_compacted: usize,
    pub files_created: usize,
    pub bytes_in: u64,
    /// The planned bins, as input path lists.
    pub plan: Vec<Vec<String>>,
}

fn plan_bins(
    mut files: Vec<crate::actions::Add>,
    target: u64,
    strategy: CompactionStrategy,
) -> Vec<Vec<crate::actions::Add>> {
    files.retain(|add| (add.size as u64) < target);
    let mut bins: Vec<(u64, Vec<crate::actions::Add>)> = Vec::new();
    match strategy {
        CompactionStrategy::BinPacking => {
            files.sort_by_key(|add| std::cmp::Reverse(add.size));
            for add in files {
                let size = add.size as u64;
                match bins.iter_mut().find(|(total, _)| total + size <= target) {
                    Some((total, bin)) => {
                        *total += size;
                        bin.push(add);
                    }
                    None => bins.push((size, vec![add])),
                }
            }
        }
        CompactionStrategy::Greedy => {
            files.sort_by_key(|add| std::cmp::Reverse(add.size));
            for add in files {
                let size = add.size as u64;
                match bins.last_mut() {
                    Some((total, bin)) if *total < target => {
                        *total += size;
                        bin.push(add);
                    }
                    _ => bins.push((size, vec![add])),
                }
            }
        }
        CompactionStrategy::SortBySize => {
            files.sort_by_key(|add| add.size);
            for add in files {
                let size = add.size as u64;
                match bins.last_mut() {
                    Some((total, bin)) if *total < target => {
                        *total += size;
                        bin.push(add);
                    }
                    _ => bins.push((size, vec![add])),
                }
            }
        }
    }
    bins.into_iter()
        .map(|(_, bin)| bin)
        .filter(|bin| bin.len() >= 2)
        .collect()
}

pub async fn compact(
    ctx: &MaintenanceContext,
    opts: CompactionOptions,
) -> DeltaResult<CompactionResult> {
    require!(
        opts.target_file_bytes > 0,
        Error::validation("compaction target size must be positive")
    );
    let snapshot = ctx.snapshot(None).await?;
    let Some(schema) = snapshot.schema()? else {
        return Ok(CompactionResult::default());
    };
    let partition_columns = snapshot.properties().partition_columns;

    let mut result = CompactionResult::default();
    let mut planned: Vec<Vec<crate::actions::Add>> = Vec::new();
    for partition_files in group_by_partition_values(snapshot.files().cloned().collect()) {
        for bin in plan_bins(partition_files, opts.target_file_bytes, opts.strategy) {
            result.plan.push(bin.iter().map(|a| a.path.clone()).collect());
            planned.push(bin);
        }
    }
    if planned.is_empty() || opts.dry_run {
        return Ok(result);
    }

    let mut actions: Vec<Action> = Vec::new();
    for (counter, bin) in planned.iter().enumerate() {
        let mut rows: Vec<Row> = Vec::new();
        for add in bin {
            result.bytes_in += add.size as u64;
            rows.extend(ctx.read_file(add).await?);
        }
        let values = typed_partition_values(&bin[0], &partition_columns, &schema);
        let new_add = crate::table::write::write_data_file(
            &ctx.table().inner,
            &schema,
            &partition_columns,
            &values,
            rows.clone(),
            counter,
            None,
        )
        .await?;

        if opts.verify_integrity {
            let schema_opt = Some(schema.clone());
            let written =
                crate::table::read_file_rows(&ctx.table().inner, &new_add, &[], None, &schema_opt)
                    .await?;
            require!(
                same_row_multiset(&rows, &written),
                Error::internal(format!(
                    "compaction integrity check failed for '{}'",
                    new_add.path
                ))
            );
        }

        for add in bin {
            ctx.uncache_file(&add.path).await;
            actions.push(Action::Remove(Remove::for_add(
                add,
                current_time_millis(),
                false,
            )));
        }
        result.files_compacted += bin.len();
        result.files_created += 1;
        actions.push(Action::Add(crate::actions::Add {
            data_change: false,
            ..new_add
        }));
    }

    result.version = Some(ctx.commit("OPTIMIZE", actions).await?);
    Ok(result)
}
