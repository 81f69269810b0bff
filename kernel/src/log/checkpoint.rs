//! Checkpoints: columnar snapshots of the action set at a version.
//!
//! A checkpoint row carries exactly one action in one-of-N form: four nullable string
//! columns (`add`, `remove`, `metaData`, `protocol`), one of which holds the action's JSON
//! body. CommitInfo is never checkpointed. Removes still inside the retention window ride
//! along as tombstones so vacuum does not need the full log back to zero.
//!
//! Checkpoint creation is best-effort by contract: callers log and swallow failures here; a
//! reader that finds a missing or corrupt checkpoint falls back to full log replay.

use crate::actions::{Action, Add, Metadata, Protocol, Remove};
use crate::columnar::{ColumnarWriteOptions, FileReader, StreamingFileWriter};
use crate::error::{DeltaResult, Error};
use crate::log::{LastCheckpointHint, LogStore};
use crate::path::{checkpoint_path, multipart_checkpoint_path, ParsedLogPath};
use crate::row::{Row, Value};
use crate::schema::{PrimitiveType, Schema, SchemaField};
use crate::Version;

pub const ADD_COLUMN: &str = "add";
pub const REMOVE_COLUMN: &str = "remove";
pub const METADATA_COLUMN: &str = "metaData";
pub const PROTOCOL_COLUMN: &str = "protocol";

/// Actions per part before a checkpoint splits into the multi-part form.
pub const DEFAULT_MAX_ACTIONS_PER_PART: usize = 50_000;

fn checkpoint_schema() -> Schema {
    Schema::new(vec![
        SchemaField::nullable(ADD_COLUMN, PrimitiveType::String),
        SchemaField::nullable(REMOVE_COLUMN, PrimitiveType::String),
        SchemaField::nullable(METADATA_COLUMN, PrimitiveType::String),
        SchemaField::nullable(PROTOCOL_COLUMN, PrimitiveType::String),
    ])
}

fn action_to_row(action: &Action) -> DeltaResult<Row> {
    let (column, body) = match action {
        Action::Add(a) => (ADD_COLUMN, serde_json::to_string(a)?),
        Action::Remove(r) => (REMOVE_COLUMN, serde_json::to_string(r)?),
        Action::Metadata(m) => (METADATA_COLUMN, serde_json::to_string(m)?),
        Action::Protocol(p) => (PROTOCOL_COLUMN, serde_json::to_string(p)?),
        Action::CommitInfo(_) => {
            return Err(Error::internal("commitInfo actions are never checkpointed"))
        }
    };
    Ok([(column.to_string(), Value::Str(body))].into_iter().collect())
}

fn row_to_action(row: &Row) -> DeltaResult<Action> {
    for (column, value) in row {
        let Value::Str(body) = value else { continue };
        return Ok(match column.as_str() {
            ADD_COLUMN => Action::Add(serde_json::from_str::<Add>(body)?),
            REMOVE_COLUMN => Action::Remove(serde_json::from_str::<Remove>(body)?),
            METADATA_COLUMN => Action::Metadata(serde_json::from_str::<Metadata>(body)?),
            PROTOCOL_COLUMN => Action::Protocol(serde_json::from_str::<Protocol>(body)?),
            other => {
                return Err(Error::validation(format!(
                    "unknown checkpoint column '{other}'"
                )))
            }
        });
    }
    Err(Error::validation("checkpoint row carries no action"))
}

/// Write a checkpoint for `actions` at `version`, splitting when a part would exceed
/// `max_actions_per_part`. Returns the hint to store in `_last_checkpoint`.
pub async fn write_checkpoint(
    log: &LogStore,
    version: Version,
    actions: &[Action],
    max_actions_per_part: usize,
) -> DeltaResult<LastCheckpointHint> {
    let max_per_part = max_actions_per_part.max(1);
    let parts: Vec<&[Action]> = if actions.is_empty() {
        vec![&[]]
    } else {
        actions.chunks(max_per_part).collect()
    };
    let multipart = parts.len() > 1;
    let total = parts.len() as u32;
    let num_add_files = actions
        .iter()
        .filter(|a| matches!(a, Action::Add(_)))
        .count() as i64;

    let mut size_in_bytes = 0i64;
    for (idx, part_actions) in parts.iter().enumerate() {
        let path = if multipart {
            multipart_checkpoint_path(log.table_root(), version, idx as u32 + 1, total)
        } else {
            checkpoint_path(log.table_root(), version)
        };
        let mut writer =
            StreamingFileWriter::new(Some(checkpoint_schema()), ColumnarWriteOptions::default());
        for action in *part_actions {
            writer.write_row(action_to_row(action)?).await?;
        }
        let finished = writer.finish().await?;
        size_in_bytes += finished.bytes.len() as i64;
        log.storage().write(&path, finished.bytes).await?;
    }

    Ok(LastCheckpointHint {
        version,
        size: actions.len() as i64,
        parts: multipart.then_some(total),
        size_in_bytes: Some(size_in_bytes),
        num_of_add_files: Some(num_add_files),
    })
}

/// Read the checkpoint a hint names. Any missing or unparsable part is an error; the caller
/// treats that as "no usable checkpoint" and falls back to log replay. When several
/// multi-part checkpoints share the version, the part total named by the hint wins.
pub async fn read_checkpoint(
    log: &LogStore,
    hint: &LastCheckpointHint,
) -> DeltaResult<Vec<Action>> {
    let paths: Vec<String> = match hint.parts {
        None => vec![checkpoint_path(log.table_root(), hint.version)],
        Some(total) => {
            let total = total.max(1);
            (1..=total)
                .map(|part| multipart_checkpoint_path(log.table_root(), hint.version, part, total))
                .collect()
        }
    };
    let mut actions = Vec::new();
    for path in paths {
        let bytes = log.storage().read(&path).await?;
        let reader = FileReader::try_new(bytes)?;
        for row in reader.read_all()? {
            actions.push(row_to_action(&row)?);
        }
    }
    Ok(actions)
}

/// Delete checkpoint files for all but the newest `retain_count` checkpoint versions. The
/// version named by `_last_checkpoint` is always kept, whatever the count says.
pub async fn cleanup_checkpoints(log: &LogStore, retain_count: usize) -> DeltaResult<usize> {
    let retain_count = retain_count.max(1);
    let protected = log.read_last_checkpoint().await?.map(|h| h.version);
    let checkpoints: Vec<ParsedLogPath> = log
        .list_log_files()
        .await?
        .into_iter()
        .filter(|p| p.is_checkpoint())
        .collect();
    let mut versions: Vec<Version> = checkpoints.iter().map(|p| p.version).collect();
    versions.sort_unstable();
    versions.dedup();
    if versions.len() <= retain_count {
        return Ok(0);
    }
    let cutoff = versions[versions.len() - retain_count];
    let mut deleted = 0;
    for checkpoint in checkpoints {
        if checkpoint.version >= cutoff || Some(checkpoint.version) == protected {
            continue;
        }
        let full_path = crate::storage::join_path(log.table_root(), &checkpoint.path);
        log.storage().delete(&full_path).await?;
        deleted += 1;
    }
    Ok(deleted)
}
