//! Change data capture.
//!
//! When CDC is enabled on a table, every mutating commit also writes one columnar file under
//! `_change_data/` keyed by the commit version, with one record per affected row. Records
//! carry a per-producer monotonic `_seq`, so consumers can deduplicate on
//! `(commit version, _seq)`. The [`ChangeReader`] replays records by version range, by
//! timestamp range, or as a polled subscription.

use std::sync::Arc;
use std::time::Duration;

use strum::{AsRefStr, Display as StrumDisplay, EnumString};

use crate::columnar::{ColumnarWriteOptions, FileReader, StreamingFileWriter};
use crate::error::{CdcErrorCode, DeltaResult, Error};
use crate::log::LogStore;
use crate::path::{cdc_path, parse_cdc_path, CHANGE_DATA_DIR};
use crate::retry::{abort_pair, AbortHandle};
use crate::row::{Row, Value};
use crate::schema::{PrimitiveType, Schema, SchemaField};
use crate::storage::{join_path, StorageBackend};
use crate::utils::require;
use crate::Version;

/// Compact operation code: create / update / delete / read (snapshot replication).
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, StrumDisplay, AsRefStr)]
pub enum CdcOp {
    #[strum(serialize = "c")]
    Create,
    #[strum(serialize = "u")]
    Update,
    #[strum(serialize = "d")]
    Delete,
    #[strum(serialize = "r")]
    Read,
}

/// The `_change_type` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, StrumDisplay, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ChangeType {
    Insert,
    UpdatePreimage,
    UpdatePostimage,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CdcRecord {
    pub id: String,
    /// Monotonic per producer; strictly increasing within one commit.
    pub seq: i64,
    pub op: CdcOp,
    pub change_type: ChangeType,
    pub before: Option<Row>,
    pub after: Option<Row>,
    /// Nanoseconds since the unix epoch.
    pub ts: i64,
    pub source: String,
    pub txn: Option<String>,
    pub commit_version: Version,
}

fn row_id(row: &Row) -> String {
    match row.get("_id") {
        Some(Value::Str(s)) => s.clone(),
        Some(v) if !v.is_null() => v.canonical_key(),
        _ => uuid::Uuid::new_v4().to_string(),
    }
}

impl CdcRecord {
    pub fn insert(after: Row, seq: i64, ts: i64, source: &str, commit_version: Version) -> Self {
        CdcRecord {
            id: row_id(&after),
            seq,
            op: CdcOp::Create,
            change_type: ChangeType::Insert,
            before: None,
            after: Some(after),
            ts,
            source: source.to_string(),
            txn: None,
            commit_version,
        }
    }

    pub fn delete(before: Row, seq: i64, ts: i64, source: &str, commit_version: Version) -> Self {
        CdcRecord {
            id: row_id(&before),
            seq,
            op: CdcOp::Delete,
            change_type: ChangeType::Delete,
            before: Some(before),
            after: None,
            ts,
            source: source.to_string(),
            txn: None,
            commit_version,
        }
    }

    /// The paired preimage/postimage records for one updated row. The preimage takes `seq`,
    /// the postimage `seq + 1`.
    pub fn update_pair(
        before: Row,
        after: Row,
        seq: i64,
        ts: i64,
        source: &str,
        commit_version: Version,
    ) -> [Self; 2] {
        let id = row_id(&before);
        [
            CdcRecord {
                id: id.clone(),
                seq,
                op: CdcOp::Update,
                change_type: ChangeType::UpdatePreimage,
                before: Some(before),
                after: None,
                ts,
                source: source.to_string(),
                txn: None,
                commit_version,
            },
            CdcRecord {
                id,
                seq: seq + 1,
                op: CdcOp::Update,
                change_type: ChangeType::UpdatePostimage,
                before: None,
                after: Some(after),
                ts,
                source: source.to_string(),
                txn: None,
                commit_version,
            },
        ]
    }

    fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("_id".to_string(), Value::Str(self.id.clone()));
        row.insert("_seq".to_string(), Value::I64(self.seq));
        row.insert("_op".to_string(), Value::Str(self.op.to_string()));
        row.insert(
            "_change_type".to_string(),
            Value::Str(self.change_type.to_string()),
        );
        row.insert(
            "_before".to_string(),
            self.before
                .as_ref()
                .map(|r| Value::Object(r.clone()))
                .unwrap_or(Value::Null),
        );
        row.insert(
            "_after".to_string(),
            self.after
                .as_ref()
                .map(|r| Value::Object(r.clone()))
                .unwrap_or(Value::Null),
        );
        row.insert("_ts".to_string(), Value::I64(self.ts));
        row.insert("_source".to_string(), Value::Str(self.source.clone()));
        row.insert(
            "_txn".to_string(),
            self.txn
                .as_ref()
                .map(|t| Value::Str(t.clone()))
                .unwrap_or(Value::Null),
        );
        row.insert(
            "_commit_version".to_string(),
            Value::I64(self.commit_version as i64),
        );
        row
    }

    fn from_row(row: &Row) -> DeltaResult<CdcRecord> {
        let parse_err = |field: &str| {
            Error::cdc(
                CdcErrorCode::ParseError,
                format!("cdc record missing or malformed field '{field}'"),
            )
        };
        let str_field = |name: &str| match row.get(name) {
            Some(Value::Str(s)) => Ok(s.clone()),
            _ => Err(parse_err(name)),
        };
        let i64_field = |name: &str| match row.get(name) {
            Some(Value::I64(v)) => Ok(*v),
            Some(Value::I32(v)) => Ok(*v as i64),
            _ => Err(parse_err(name)),
        };
        let row_field = |name: &str| match row.get(name) {
            Some(Value::Object(map)) => Some(map.clone()),
            _ => None,
        };
        Ok(CdcRecord {
            id: str_field("_id")?,
            seq: i64_field("_seq")?,
            op: str_field("_op")?
                .parse()
                .map_err(|_| parse_err("_op"))?,
            change_type: str_field("_change_type")?
                .parse()
                .map_err(|_| parse_err("_change_type"))?,
            before: row_field("_before"),
            after: row_field("_after"),
            ts: i64_field("_ts")?,
            source: str_field("_source")?,
            txn: match row.get("_txn") {
                Some(Value::Str(s)) => Some(s.clone()),
                _ => None,
            },
            commit_version: i64_field("_commit_version")? as Version,
        })
    }
}

fn cdc_schema() -> Schema {
    Schema::new(vec![
        SchemaField::new("_id", PrimitiveType::String, false),
        SchemaField::new("_seq", PrimitiveType::Long, false),
        SchemaField::new("_op", PrimitiveType::String, false),
        SchemaField::new("_change_type", PrimitiveType::String, false),
        SchemaField::nullable("_before", PrimitiveType::Variant),
        SchemaField::nullable("_after", PrimitiveType::Variant),
        SchemaField::new("_ts", PrimitiveType::Long, false),
        SchemaField::new("_source", PrimitiveType::String, false),
        SchemaField::nullable("_txn", PrimitiveType::String),
        SchemaField::new("_commit_version", PrimitiveType::Long, false),
    ])
}

/// Persist one commit's CDC records to `_change_data/cdc-<version>.parquet`.
pub async fn write_cdc_file(
    storage: &dyn StorageBackend,
    table_root: &str,
    version: Version,
    records: &[CdcRecord],
) -> DeltaResult<()> {
    require!(
        !records.is_empty(),
        Error::cdc(CdcErrorCode::EmptyWrite, "no cdc records to write")
    );
    let mut writer =
        StreamingFileWriter::new(Some(cdc_schema()), ColumnarWriteOptions::default());
    for record in records {
        writer.write_row(record.to_row()).await?;
    }
    let finished = writer.finish().await?;
    storage
        .write(&cdc_path(table_root, version), finished.bytes)
        .await
}

/// Replays change records from the `_change_data` directory.
#[derive(Debug, Clone)]
pub struct ChangeReader {
    log: LogStore,
}

impl ChangeReader {
    pub fn new(storage: Arc<dyn StorageBackend>, table_root: impl Into<String>) -> Self {
        ChangeReader {
            log: LogStore::new(storage, table_root),
        }
    }

    pub(crate) fn from_log(log: LogStore) -> Self {
        ChangeReader { log }
    }

    /// All CDC file versions currently present, ascending.
    async fn cdc_versions(&self) -> DeltaResult<Vec<Version>> {
        let prefix = format!("{}/", join_path(self.log.table_root(), CHANGE_DATA_DIR));
        let root_prefix = if self.log.table_root().is_empty() {
            String::new()
        } else {
            format!("{}/", self.log.table_root().trim_end_matches('/'))
        };
        let mut versions: Vec<Version> = self
            .log
            .storage()
            .list(&prefix)
            .await?
            .iter()
            .filter_map(|path| parse_cdc_path(path.strip_prefix(&root_prefix).unwrap_or(path)))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    async fn read_one(&self, version: Version) -> DeltaResult<Vec<CdcRecord>> {
        let path = cdc_path(self.log.table_root(), version);
        let bytes = self.log.storage().read(&path).await.map_err(|e| {
            if e.is_not_found() {
                e
            } else {
                Error::cdc(CdcErrorCode::StorageError, e.to_string())
            }
        })?;
        let reader = FileReader::try_new(bytes)?;
        let mut records = reader
            .read_all()?
            .iter()
            .map(CdcRecord::from_row)
            .collect::<DeltaResult<Vec<_>>>()?;
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }

    /// Records for commits in `[from_version, to_version]`, ordered by commit version then
    /// `_seq`.
    pub async fn read_by_version(
        &self,
        from_version: Version,
        to_version: Version,
    ) -> DeltaResult<Vec<CdcRecord>> {
        require!(
            from_version <= to_version,
            Error::cdc(
                CdcErrorCode::InvalidVersionRange,
                format!("from {from_version} is after to {to_version}")
            )
        );
        let latest = self.log.latest_version().await?.ok_or_else(|| {
            Error::cdc(CdcErrorCode::TableNotFound, "table has no commits")
        })?;
        require!(
            to_version <= latest,
            Error::cdc(
                CdcErrorCode::InvalidVersionRange,
                format!("to {to_version} is newer than latest version {latest}")
            )
        );
        let mut out = Vec::new();
        for version in self.cdc_versions().await? {
            if version < from_version || version > to_version {
                continue;
            }
            out.extend(self.read_one(version).await?);
        }
        Ok(out)
    }

    /// Records for commits whose `commitInfo.timestamp` (milliseconds) falls inside
    /// `[from_ts, to_ts]`.
    pub async fn read_by_timestamp(&self, from_ts: i64, to_ts: i64) -> DeltaResult<Vec<CdcRecord>> {
        require!(
            from_ts <= to_ts,
            Error::cdc(
                CdcErrorCode::InvalidTimeRange,
                format!("from {from_ts} is after to {to_ts}")
            )
        );
        let mut out = Vec::new();
        for version in self.cdc_versions().await? {
            let Some(ts) = self.commit_timestamp(version).await? else {
                continue;
            };
            if ts >= from_ts && ts <= to_ts {
                out.extend(self.read_one(version).await?);
            }
        }
        Ok(out)
    }

    async fn commit_timestamp(&self, version: Version) -> DeltaResult<Option<i64>> {
        match self.log.read_commit(version).await {
            Ok(actions) => Ok(actions.iter().find_map(|a| match a {
                crate::actions::Action::CommitInfo(info) => Some(info.timestamp),
                _ => None,
            })),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Poll for new commits and invoke `callback` once per new record, in
    /// `(commit version, _seq)` order, starting after the current latest version. `_seq` is
    /// strictly increasing per producer, so a consumer observing one subscription sees a
    /// strictly increasing sequence.
    pub async fn subscribe<F>(&self, callback: F, poll_interval: Duration) -> DeltaResult<Subscription>
    where
        F: Fn(CdcRecord) + Send + Sync + 'static,
    {
        let mut last_seen = self.log.latest_version().await?;
        let reader = self.clone();
        let (handle, signal) = abort_pair();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = signal.cancelled() => return,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                let Ok(versions) = reader.cdc_versions().await else {
                    continue;
                };
                for version in versions {
                    if last_seen.is_some_and(|seen| version <= seen) {
                        continue;
                    }
                    if let Ok(records) = reader.read_one(version).await {
                        for record in records {
                            callback(record);
                        }
                    }
                    last_seen = Some(version);
                }
            }
        });
        Ok(Subscription {
            handle,
            task: Some(task),
        })
    }
}

/// Handle for an active CDC subscription; cancels its poll task on [`Subscription::cancel`]
/// or drop.
#[derive(Debug)]
pub struct Subscription {
    handle: AbortHandle,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    pub async fn cancel(mut self) {
        self.handle.abort();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryBackend;

    fn sample_row(id: &str, age: i32) -> Row {
        [
            ("_id".to_string(), Value::Str(id.to_string())),
            ("age".to_string(), Value::I32(age)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn op_codes_render_compact() {
        assert_eq!(CdcOp::Create.to_string(), "c");
        assert_eq!(CdcOp::Update.to_string(), "u");
        assert_eq!(CdcOp::Delete.to_string(), "d");
        assert_eq!(CdcOp::Read.to_string(), "r");
        assert_eq!(ChangeType::UpdatePreimage.to_string(), "update_preimage");
    }

    #[tokio::test]
    async fn records_round_trip_through_a_cdc_file() {
        let storage = Arc::new(InMemoryBackend::new());
        let [pre, post] =
            CdcRecord::update_pair(sample_row("1", 30), sample_row("1", 31), 5, 99, "tbl", 3);
        let insert = CdcRecord::insert(sample_row("2", 7), 7, 100, "tbl", 3);
        let records = vec![pre, post, insert];
        write_cdc_file(storage.as_ref(), "t", 3, &records)
            .await
            .unwrap();

        let reader = ChangeReader::new(storage.clone(), "t");
        let read = reader.read_one(3).await.unwrap();
        assert_eq!(read, records);
        assert_eq!(read[0].change_type, ChangeType::UpdatePreimage);
        assert_eq!(read[1].change_type, ChangeType::UpdatePostimage);
        assert!(read[0].seq < read[1].seq);
    }

    #[tokio::test]
    async fn empty_write_is_rejected() {
        let storage = InMemoryBackend::new();
        let err = write_cdc_file(&storage, "t", 0, &[]).await.unwrap_err();
        let Error::Cdc { code, .. } = err else {
            panic!("expected cdc error")
        };
        assert_eq!(code, CdcErrorCode::EmptyWrite);
    }

    #[tokio::test]
    async fn version_range_is_validated() {
        let storage = Arc::new(InMemoryBackend::new());
        let reader = ChangeReader::new(storage, "t");
        let err = reader.read_by_version(3, 1).await.unwrap_err();
        let Error::Cdc { code, .. } = err else {
            panic!("expected cdc error")
        };
        assert_eq!(code, CdcErrorCode::InvalidVersionRange);

        // no commits at all
        let err = reader.read_by_version(0, 0).await.unwrap_err();
        let Error::Cdc { code, .. } = err else {
            panic!("expected cdc error")
        };
        assert_eq!(code, CdcErrorCode::TableNotFound);
    }
}
