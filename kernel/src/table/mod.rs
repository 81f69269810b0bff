//! The `DeltaTable` facade.
//!
//! Everything user-facing funnels through here: writes, DML, queries, time travel, history,
//! configuration changes and the maintenance entry points. A table instance owns a cached
//! snapshot, its CDC sequence counter and a small file-content cache; all of it sits behind
//! one per-table mutex, and cross-process safety comes only from the log store's conditional
//! write.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::actions::{Action, Add, CommitInfo};
use crate::cdc::{write_cdc_file, CdcRecord, ChangeReader};
use crate::columnar::{ColumnarWriteOptions, FileReader};
use crate::dv::DeletionVector;
use crate::error::{DeltaResult, Error};
use crate::log::checkpoint::{cleanup_checkpoints, write_checkpoint, DEFAULT_MAX_ACTIONS_PER_PART};
use crate::log::LogStore;
use crate::query::{file_can_skip, row_group_can_skip, to_zone_predicates, Filter, Projection};
use crate::query::{AggregationResult, Pipeline, ZonePredicate};
use crate::row::{Row, Value};
use crate::schema::{ColumnMappingMode, PrimitiveType, Schema};
use crate::snapshot::Snapshot;
use crate::storage::{join_path, StorageBackend};
use crate::table_properties::TableProperties;
use crate::utils::current_time_millis;
use crate::Version;

mod create;
mod dml;
mod maintenance_ctx;
pub(crate) mod write;

pub use create::CreateTableBuilder;
pub use dml::{DeleteResult, MergeResult, Mutation, UpdateResult};
pub use maintenance_ctx::MaintenanceContext;
pub use write::WriteResult;

/// Instance-level options. Anything persisted (partition columns, CDC, column mapping) lives
/// in the table Metadata instead; these only shape how *this* handle behaves, plus the
/// bootstrap configuration used if this handle creates the table on first write.
#[derive(Debug, Clone)]
pub struct DeltaTableOptions {
    pub writer: ColumnarWriteOptions,
    /// Use deletion vectors for update/delete instead of rewriting files (requires the table
    /// protocol to carry the feature).
    pub deletion_vectors: bool,
    pub max_actions_per_checkpoint_part: usize,
    pub checkpoint_retention_count: usize,
    /// Bootstrap configuration applied when the first write creates the table.
    pub bootstrap: BootstrapConfig,
    /// `_source` tag stamped on CDC records; defaults to the table path.
    pub cdc_source: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BootstrapConfig {
    pub partition_columns: Vec<String>,
    pub enable_change_data_feed: bool,
    pub enable_deletion_vectors: bool,
    pub column_mapping_mode: ColumnMappingMode,
    pub table_name: Option<String>,
    pub extra_configuration: HashMap<String, String>,
}

impl Default for DeltaTableOptions {
    fn default() -> Self {
        DeltaTableOptions {
            writer: ColumnarWriteOptions::default(),
            deletion_vectors: false,
            max_actions_per_checkpoint_part: DEFAULT_MAX_ACTIONS_PER_PART,
            checkpoint_retention_count: 2,
            bootstrap: BootstrapConfig::default(),
            cdc_source: None,
        }
    }
}

/// Options for a single query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Time travel to this exact version.
    pub version: Option<Version>,
    /// Query an explicitly captured snapshot (wins over `version`).
    pub snapshot: Option<Arc<Snapshot>>,
    /// Wire-form projection (array of paths or path->0/1 map).
    pub projection: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub version: Version,
    pub timestamp: Option<i64>,
    pub operation: Option<String>,
    pub parameters: Option<HashMap<String, JsonValue>>,
    pub read_version: Option<i64>,
}

pub(crate) struct TableState {
    pub(crate) snapshot: Snapshot,
    pub(crate) cdc_seq: i64,
    pub(crate) file_cache: HashMap<String, Vec<Row>>,
}

pub(crate) struct TableInner {
    pub(crate) storage: Arc<dyn StorageBackend>,
    pub(crate) table_root: String,
    pub(crate) log: LogStore,
    pub(crate) opts: DeltaTableOptions,
    pub(crate) state: Mutex<TableState>,
}

#[derive(Clone)]
pub struct DeltaTable {
    pub(crate) inner: Arc<TableInner>,
}

impl std::fmt::Debug for DeltaTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaTable")
            .field("table_root", &self.inner.table_root)
            .finish_non_exhaustive()
    }
}

impl DeltaTable {
    /// Open a table handle, loading the latest snapshot. A table that does not exist yet
    /// opens as empty and is created by its first write.
    pub async fn open(
        storage: Arc<dyn StorageBackend>,
        table_root: impl Into<String>,
    ) -> DeltaResult<Self> {
        Self::open_with_options(storage, table_root, DeltaTableOptions::default()).await
    }

    pub async fn open_with_options(
        storage: Arc<dyn StorageBackend>,
        table_root: impl Into<String>,
        opts: DeltaTableOptions,
    ) -> DeltaResult<Self> {
        let table_root = table_root.into();
        let log = LogStore::new(storage.clone(), table_root.clone());
        let snapshot = Snapshot::build(&log, None).await?;
        Ok(DeltaTable {
            inner: Arc::new(TableInner {
                storage,
                table_root,
                log,
                opts,
                state: Mutex::new(TableState {
                    snapshot,
                    cdc_seq: 0,
                    file_cache: HashMap::new(),
                }),
            }),
        })
    }

    /// Start building a brand-new table at `table_root` (commit 0 carries only Protocol,
    /// Metadata and CommitInfo).
    pub fn create(table_root: impl Into<String>) -> CreateTableBuilder {
        CreateTableBuilder::new(table_root.into())
    }

    pub fn table_path(&self) -> &str {
        &self.inner.table_root
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.inner.storage
    }

    /// The cached version; `None` until the table has a first commit.
    pub async fn version(&self) -> Option<Version> {
        self.inner.state.lock().await.snapshot.version()
    }

    /// Re-read the log tail and refresh the cached snapshot. Returns the new version.
    pub async fn refresh_version(&self) -> DeltaResult<Option<Version>> {
        let snapshot = Snapshot::build(&self.inner.log, None).await?;
        let mut state = self.inner.state.lock().await;
        let version = snapshot.version();
        state.snapshot = snapshot;
        Ok(version)
    }

    /// Snapshot at `version`, or a clone of the cached latest when `None`.
    pub async fn snapshot(&self, version: Option<Version>) -> DeltaResult<Snapshot> {
        match version {
            Some(v) => Snapshot::build(&self.inner.log, Some(v)).await,
            None => Ok(self.inner.state.lock().await.snapshot.clone()),
        }
    }

    /// A capability object for the maintenance operators.
    pub fn get_compaction_context(&self) -> MaintenanceContext {
        MaintenanceContext::new(self.clone())
    }

    /// Reader for this table's change data feed.
    pub fn change_reader(&self) -> ChangeReader {
        ChangeReader::from_log(self.inner.log.clone())
    }

    /// Commit history, newest first. `CommitInfo` is surfaced here and nowhere else.
    pub async fn history(&self, limit: Option<usize>) -> DeltaResult<Vec<HistoryEntry>> {
        let mut versions: Vec<Version> = self
            .inner
            .log
            .list_log_files()
            .await?
            .iter()
            .filter(|p| p.is_commit())
            .map(|p| p.version)
            .collect();
        versions.sort_unstable_by(|a, b| b.cmp(a));
        if let Some(limit) = limit {
            versions.truncate(limit);
        }
        let mut entries = Vec::with_capacity(versions.len());
        for version in versions {
            let actions = self.inner.log.read_commit(version).await?;
            let info = actions.iter().find_map(|a| match a {
                Action::CommitInfo(info) => Some(info.clone()),
                _ => None,
            });
            entries.push(HistoryEntry {
                version,
                timestamp: info.as_ref().map(|i| i.timestamp),
                operation: info.as_ref().map(|i| i.operation.clone()),
                parameters: info.as_ref().and_then(|i| i.operation_parameters.clone()),
                read_version: info.as_ref().and_then(|i| i.read_version),
            });
        }
        Ok(entries)
    }

    /// Merge configuration entries into the table Metadata (a commit of its own).
    pub async fn update_configuration(
        &self,
        entries: HashMap<String, String>,
    ) -> DeltaResult<Version> {
        let mut state = self.inner.state.lock().await;
        let mut metadata = state
            .snapshot
            .metadata()
            .cloned()
            .ok_or_else(|| Error::validation("cannot configure a table with no metadata"))?;
        metadata.configuration.extend(entries);

        let mut actions = vec![Action::Metadata(metadata.clone())];
        // configuration may switch on features the current protocol does not carry yet
        let props = TableProperties::from(&metadata.configuration);
        let schema = metadata.parse_schema()?;
        let required = write::required_protocol(
            &schema,
            props.enable_change_data_feed,
            self.inner.opts.deletion_vectors
                || state
                    .snapshot
                    .protocol()
                    .is_some_and(|p| p.has_writer_feature(&crate::table_features::WriterFeature::DeletionVectors)),
            props.column_mapping_mode,
        );
        if state.snapshot.protocol() != Some(&required) {
            actions.push(Action::Protocol(required));
        }
        self.commit_actions(&mut state, "SET TBLPROPERTIES", actions, false, Vec::new())
            .await
    }

    /// Switch the change data feed on or off. Enabling does not backfill prior history.
    pub async fn set_change_data_feed(&self, enabled: bool) -> DeltaResult<Version> {
        self.update_configuration(HashMap::from([(
            crate::table_properties::ENABLE_CHANGE_DATA_FEED_KEY.to_string(),
            enabled.to_string(),
        )]))
        .await
    }

    /// Lazily evaluate `filter` against the chosen snapshot. The returned stream is finite
    /// and forward-only; re-invoke with the same captured snapshot to restart it.
    pub async fn query(
        &self,
        filter: JsonValue,
        opts: QueryOptions,
    ) -> DeltaResult<BoxStream<'static, DeltaResult<Row>>> {
        let filter = Filter::parse(&filter)?;
        let projection = opts
            .projection
            .as_ref()
            .map(Projection::parse)
            .transpose()?;
        let snapshot: Arc<Snapshot> = match (&opts.snapshot, opts.version) {
            (Some(snapshot), _) => snapshot.clone(),
            (None, Some(version)) => Arc::new(self.snapshot(Some(version)).await?),
            (None, None) => Arc::new(self.inner.state.lock().await.snapshot.clone()),
        };

        let predicates = to_zone_predicates(&filter);
        let candidates: Vec<Add> = snapshot
            .files()
            .filter(|add| match add.parsed_stats() {
                Some(stats) => !file_can_skip(&predicates, &stats),
                None => true,
            })
            .cloned()
            .collect();

        let columns = read_columns(&filter, projection.as_ref());
        let schema = snapshot.schema()?;
        let inner = self.inner.clone();
        let predicates = Arc::new(predicates);
        let filter = Arc::new(filter);
        let projection = Arc::new(projection);
        let schema = Arc::new(schema);

        let stream = stream::iter(candidates.into_iter())
            .then(move |add| {
                let inner = inner.clone();
                let predicates = predicates.clone();
                let columns = columns.clone();
                let schema = schema.clone();
                async move {
                    read_file_rows(&inner, &add, &predicates, columns.as_deref(), &schema).await
                }
            })
            .map_ok(|rows| stream::iter(rows.into_iter().map(Ok)))
            .try_flatten()
            .try_filter_map(move |row| {
                let filter = filter.clone();
                let projection = projection.clone();
                async move {
                    if !filter.matches(&row) {
                        return Ok(None);
                    }
                    Ok(Some(match projection.as_ref() {
                        Some(projection) => projection.apply(&row),
                        None => row,
                    }))
                }
            });
        Ok(stream.boxed())
    }

    /// Convenience: run a query and collect every row.
    pub async fn query_all(&self, filter: JsonValue, opts: QueryOptions) -> DeltaResult<Vec<Row>> {
        self.query(filter, opts).await?.try_collect().await
    }

    /// Run an aggregation pipeline over the table (the pipeline's own `$match` stages do the
    /// filtering).
    pub async fn aggregate(&self, stages: &[JsonValue]) -> DeltaResult<AggregationResult> {
        let pipeline = Pipeline::parse(stages)?;
        let rows = self
            .query_all(JsonValue::Object(Default::default()), QueryOptions::default())
            .await?;
        pipeline.run(rows)
    }

    /// Central commit path: stamps CommitInfo, performs the conditional write, updates the
    /// cached snapshot, emits the CDC file, and best-effort checkpoints on the configured
    /// interval.
    pub(crate) async fn commit_actions(
        &self,
        state: &mut TableState,
        operation: &str,
        actions: Vec<Action>,
        data_change: bool,
        cdc_records: Vec<CdcRecord>,
    ) -> DeltaResult<Version> {
        let read_version = state.snapshot.version();
        let target = read_version.map(|v| v + 1).unwrap_or(0);

        let mut commit = Vec::with_capacity(actions.len() + 1);
        let mut info = CommitInfo::new(current_time_millis(), operation)
            .with_blind_append(data_change && actions.iter().all(|a| !matches!(a, Action::Remove(_))));
        if let Some(read_version) = read_version {
            info = info.with_read_version(read_version as i64);
        }
        commit.push(Action::CommitInfo(info));
        commit.extend(actions);

        self.inner.log.try_commit(target, &commit).await?;
        state.snapshot.apply(target, &commit);

        let properties = state.snapshot.properties();
        if properties.enable_change_data_feed && !cdc_records.is_empty() {
            let records: Vec<CdcRecord> = cdc_records
                .into_iter()
                .map(|mut record| {
                    record.commit_version = target;
                    record
                })
                .collect();
            if let Err(e) =
                write_cdc_file(self.inner.storage.as_ref(), &self.inner.table_root, target, &records)
                    .await
            {
                tracing::warn!(version = target, "failed to write change data file: {e}");
            }
        }

        self.maybe_checkpoint(state, target, properties.checkpoint_interval)
            .await;
        Ok(target)
    }

    /// Checkpoint creation is best-effort: a failure must not fail the commit that
    /// triggered it.
    async fn maybe_checkpoint(&self, state: &TableState, version: Version, interval: u64) {
        if interval == 0 || version % interval != interval - 1 {
            return;
        }
        let actions = state.snapshot.checkpoint_actions();
        match write_checkpoint(
            &self.inner.log,
            version,
            &actions,
            self.inner.opts.max_actions_per_checkpoint_part,
        )
        .await
        {
            Ok(hint) => {
                self.inner.log.write_last_checkpoint(&hint).await;
                if let Err(e) =
                    cleanup_checkpoints(&self.inner.log, self.inner.opts.checkpoint_retention_count)
                        .await
                {
                    tracing::warn!("checkpoint cleanup failed: {e}");
                }
            }
            Err(e) => tracing::warn!(version, "checkpoint creation failed: {e}"),
        }
    }

    pub(crate) fn cdc_source(&self) -> String {
        self.inner
            .opts
            .cdc_source
            .clone()
            .unwrap_or_else(|| self.inner.table_root.clone())
    }
}

/// The root columns a query must materialize: filter columns plus projected columns, or
/// everything when the projection cannot narrow the set.
fn read_columns(filter: &Filter, projection: Option<&Projection>) -> Option<Vec<String>> {
    let projected = projection.and_then(|p| p.required_columns())?;
    let mut columns = projected;
    let mut filter_columns = std::collections::HashSet::new();
    filter.referenced_columns(&mut filter_columns);
    for column in filter_columns {
        if !columns.contains(&column) {
            columns.push(column);
        }
    }
    Some(columns)
}

/// Parse a stringified partition value back into its typed form.
pub(crate) fn parse_partition_value(raw: Option<&str>, data_type: PrimitiveType) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    match data_type {
        PrimitiveType::Boolean => raw.parse().map(Value::Bool).unwrap_or(Value::Null),
        PrimitiveType::Integer => raw.parse().map(Value::I32).unwrap_or(Value::Null),
        PrimitiveType::Long => raw.parse().map(Value::I64).unwrap_or(Value::Null),
        PrimitiveType::Double => raw.parse().map(Value::F64).unwrap_or(Value::Null),
        PrimitiveType::Timestamp => raw.parse().map(Value::Ts).unwrap_or(Value::Null),
        PrimitiveType::String
        | PrimitiveType::Binary
        | PrimitiveType::Variant => Value::Str(raw.to_string()),
    }
}

/// Read one data file's surviving rows: fetch, prune row groups, decode, apply the deletion
/// vector, and re-inject partition values.
pub(crate) async fn read_file_rows(
    inner: &Arc<TableInner>,
    add: &Add,
    predicates: &[ZonePredicate],
    columns: Option<&[String]>,
    schema: &Option<Schema>,
) -> DeltaResult<Vec<Row>> {
    let full_path = join_path(&inner.table_root, &add.path);
    let bytes = inner.storage.read(&full_path).await?;
    let reader = FileReader::try_new(bytes)?;

    let mut rows = if add.deletion_vector.is_some() {
        // deletion-vector indices are file-global, so the whole file is read and filtered
        let dv = DeletionVector::from_descriptor(
            add.deletion_vector.as_ref().expect("checked above"),
            inner.storage.as_ref(),
            &inner.table_root,
        )
        .await?;
        dv.filter_rows(reader.read_rows(columns, None)?)
    } else if !predicates.is_empty() && !reader.zone_maps().is_empty() {
        let selected: Vec<usize> = reader
            .zone_maps()
            .iter()
            .enumerate()
            .filter(|(_, zone_map)| !row_group_can_skip(predicates, zone_map))
            .map(|(idx, _)| idx)
            .collect();
        if selected.len() == reader.num_row_groups() {
            reader.read_rows(columns, None)?
        } else if selected.is_empty() {
            Vec::new()
        } else {
            reader.read_rows(columns, Some(&selected))?
        }
    } else {
        reader.read_rows(columns, None)?
    };

    // partition columns live in the path, not the file
    if !add.partition_values.is_empty() {
        if let Some(schema) = schema {
            for row in &mut rows {
                for (column, raw) in &add.partition_values {
                    if columns.is_some_and(|cols| !cols.iter().any(|c| c == column)) {
                        continue;
                    }
                    let data_type = schema
                        .field(column)
                        .map(|f| f.data_type)
                        .unwrap_or(PrimitiveType::String);
                    row.insert(
                        column.clone(),
                        parse_partition_value(raw.as_deref(), data_type),
                    );
                }
            }
        }
    }
    Ok(rows)
}
