//! Vacuum: physical reclamation of unreferenced storage.
//!
//! Deletes data files whose only references are Remove actions older than the retention
//! horizon, plus unreferenced orphans older than the horizon (aborted writes, failed
//! maintenance). Never touches a file referenced by any live Add, a deletion-vector file a
//! live Add points at, the `_delta_log` itself, or `_change_data` (CDC history stays
//! readable). Deletion is idempotent: a file already gone is not an error.

use std::collections::HashSet;

use crate::dv::DV_STORAGE_UUID;
use crate::error::DeltaResult;
use crate::log::checkpoint::cleanup_checkpoints;
use crate::path::{deletion_vector_file_name, CHANGE_DATA_DIR, DELTA_LOG_DIR};
use crate::table::MaintenanceContext;
use crate::table_properties::DEFAULT_VACUUM_RETENTION_MS;
use crate::utils::current_time_millis;

#[derive(Debug, Clone, Default)]
pub struct VacuumOptions {
    /// Override the table's `delta.vacuum.retentionDuration` (milliseconds). Must cover the
    /// longest time-travel window readers rely on.
    pub retention_ms: Option<i64>,
    /// Report what would be deleted without deleting it.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VacuumResult {
    pub files_deleted: Vec<String>,
    pub bytes_freed: u64,
    pub checkpoints_deleted: usize,
    pub dry_run: bool,
}

pub async fn vacuum(ctx: &MaintenanceContext, opts: VacuumOptions) -> DeltaResult<VacuumResult> {
    let snapshot = ctx.snapshot(None).await?;
    let retention_ms = opts
        .retention_ms
        .unwrap_or_else(|| {
            if snapshot.metadata().is_some() {
                snapshot.properties().vacuum_retention_ms
            } else {
                DEFAULT_VACUUM_RETENTION_MS
            }
        })
        .max(0);
    let horizon = current_time_millis() - retention_ms;

    fn dv_file_of(dv: &crate::actions::DeletionVectorDescriptor) -> Option<String> {
        (dv.storage_type == DV_STORAGE_UUID)
            .then(|| dv.path_or_inline_dv.parse().ok())
            .flatten()
            .map(|uuid| deletion_vector_file_name(&uuid))
    }

    // everything a reader inside the retention window may still need
    let mut protected: HashSet<String> = HashSet::new();
    // paths whose only reference is a Remove older than the horizon
    let mut expired: HashSet<String> = HashSet::new();
    for add in snapshot.files() {
        protected.insert(add.path.clone());
        if let Some(path) = add.deletion_vector.as_ref().and_then(dv_file_of) {
            protected.insert(path);
        }
    }
    for remove in snapshot.tombstones() {
        let target = if remove.deletion_timestamp.is_some_and(|ts| ts < horizon) {
            &mut expired
        } else {
            &mut protected
        };
        target.insert(remove.path.clone());
        if let Some(path) = remove.deletion_vector.as_ref().and_then(dv_file_of) {
            target.insert(path);
        }
    }
    expired.retain(|path| !protected.contains(path));

    let root = ctx.table_path();
    let root_prefix = if root.is_empty() {
        String::new()
    } else {
        format!("{}/", root.trim_end_matches('/'))
    };
    let listed = ctx.storage().list(&root_prefix).await?;

    let mut result = VacuumResult {
        dry_run: opts.dry_run,
        ..Default::default()
    };
    for full_path in listed {
        let rel = full_path
            .strip_prefix(&root_prefix)
            .unwrap_or(&full_path)
            .to_string();
        if rel.starts_with(DELTA_LOG_DIR) || rel.starts_with(CHANGE_DATA_DIR) {
            continue;
        }
        if protected.contains(&rel) {
            continue;
        }
        let Some(stat) = ctx.storage().stat(&full_path).await? else {
            continue;
        };
        // files with an expired Remove go; unreferenced orphans additionally wait out the
        // horizon so an in-flight writer's fresh file is never reclaimed under it
        if !expired.contains(&rel) && stat.last_modified >= horizon {
            continue;
        }
        result.bytes_freed += stat.size;
        result.files_deleted.push(rel);
        if !opts.dry_run {
            ctx.storage().delete(&full_path).await?;
        }
    }

    if !opts.dry_run {
        let log = crate::log::LogStore::new(ctx.storage().clone(), root.to_string());
        let retain = ctx.table().inner.opts.checkpoint_retention_count;
        result.checkpoints_deleted = cleanup_checkpoints(&log, retain).await?;
    }
    Ok(result)
}
