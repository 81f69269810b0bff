//! The append path: rows in, data files plus a commit out.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::actions::{Action, Add, Metadata, Protocol};
use crate::cdc::CdcRecord;
use crate::columnar::StreamingFileWriter;
use crate::error::{DeltaResult, Error};
use crate::path::{data_file_name, partition_prefix};
use crate::retry::AbortSignal;
use crate::row::{Row, Value};
use crate::schema::{
    assign_physical_names, ColumnMappingMode, PrimitiveType, Schema, SchemaBuilder, SchemaField,
};
use crate::storage::join_path;
use crate::table::{DeltaTable, TableInner};
use crate::table_features::{ReaderFeature, WriterFeature};
use crate::table_properties::{
    COLUMN_MAPPING_MODE_KEY, ENABLE_CHANGE_DATA_FEED_KEY, PARTITION_COLUMNS_KEY,
};
use crate::utils::{current_time_millis, current_time_nanos, require};
use crate::Version;

#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    /// `None` only for the empty-write no-op on a table that has no commits yet.
    pub version: Option<Version>,
    pub rows_written: u64,
    pub files_added: usize,
}

impl DeltaTable {
    /// Append rows. An empty batch is a no-op: no commit is produced and the current version
    /// is returned unchanged.
    pub async fn write(&self, rows: Vec<Row>) -> DeltaResult<WriteResult> {
        self.write_opts(rows, None).await
    }

    pub async fn write_opts(
        &self,
        rows: Vec<Row>,
        signal: Option<&AbortSignal>,
    ) -> DeltaResult<WriteResult> {
        let mut state = self.inner.state.lock().await;
        if rows.is_empty() {
            return Ok(WriteResult {
                version: state.snapshot.version(),
                rows_written: 0,
                files_added: 0,
            });
        }
        if let Some(signal) = signal {
            signal.check()?;
        }

        let mut bootstrap_actions: Vec<Action> = Vec::new();
        let (schema, partition_columns) = match state.snapshot.metadata() {
            Some(metadata) => {
                let existing = metadata.parse_schema()?;
                let widened = widen_for_batch(&existing, &rows)?;
                for row in &rows {
                    widened.validate_row(row)?;
                }
                if widened != existing {
                    let mut metadata = metadata.clone();
                    metadata.schema_string = widened.to_schema_string()?;
                    bootstrap_actions.push(Action::Metadata(metadata));
                }
                (widened, state.snapshot.properties().partition_columns)
            }
            None => {
                // first write creates the table
                let config = &self.inner.opts.bootstrap;
                let mut builder = SchemaBuilder::new();
                for row in &rows {
                    builder.observe_row(row)?;
                }
                let mut schema = builder.finish()?;
                // table columns are always nullable: later batches and field-removing
                // updates may leave any of them unset
                for field in &mut schema.fields {
                    field.nullable = true;
                }
                if config.column_mapping_mode != ColumnMappingMode::None {
                    assign_physical_names(&mut schema);
                }
                let mut configuration = config.extra_configuration.clone();
                if !config.partition_columns.is_empty() {
                    configuration.insert(
                        PARTITION_COLUMNS_KEY.to_string(),
                        config.partition_columns.join(","),
                    );
                }
                if config.enable_change_data_feed {
                    configuration
                        .insert(ENABLE_CHANGE_DATA_FEED_KEY.to_string(), "true".to_string());
                }
                if config.column_mapping_mode != ColumnMappingMode::None {
                    configuration.insert(
                        COLUMN_MAPPING_MODE_KEY.to_string(),
                        config.column_mapping_mode.to_string(),
                    );
                }
                let metadata = Metadata::try_new(
                    config.table_name.clone(),
                    &schema,
                    config.partition_columns.clone(),
                    current_time_millis(),
                    configuration,
                )?;
                let protocol = required_protocol(
                    &schema,
                    config.enable_change_data_feed,
                    config.enable_deletion_vectors || self.inner.opts.deletion_vectors,
                    config.column_mapping_mode,
                );
                protocol.ensure_write_supported()?;
                bootstrap_actions.push(Action::Protocol(protocol));
                bootstrap_actions.push(Action::Metadata(metadata));
                (schema, config.partition_columns.clone())
            }
        };

        // group by partition values, preserving first-seen group order
        let groups = group_by_partition(&rows, &partition_columns)?;

        let mut actions = bootstrap_actions;
        let mut files_added = 0;
        for (counter, (partition_values, group_rows)) in groups.into_iter().enumerate() {
            if let Some(signal) = signal {
                signal.check()?;
            }
            let add = write_data_file(
                &self.inner,
                &schema,
                &partition_columns,
                &partition_values,
                group_rows,
                counter,
                signal,
            )
            .await?;
            actions.push(Action::Add(add));
            files_added += 1;
        }

        let mut cdc_records = Vec::new();
        if state.snapshot.properties().enable_change_data_feed
            || self.inner.opts.bootstrap.enable_change_data_feed
        {
            let ts = current_time_nanos();
            let source = self.cdc_source();
            for row in &rows {
                let seq = state.cdc_seq;
                state.cdc_seq += 1;
                cdc_records.push(CdcRecord::insert(row.clone(), seq, ts, &source, 0));
            }
        }

        let rows_written = rows.len() as u64;
        let version = self
            .commit_actions(&mut state, "WRITE", actions, true, cdc_records)
            .await?;
        Ok(WriteResult {
            version: Some(version),
            rows_written,
            files_added,
        })
    }
}

/// Widen int32 columns to double where this batch carries doubles. Any other evolution is
/// rejected later by row validation.
fn widen_for_batch(schema: &Schema, rows: &[Row]) -> DeltaResult<Schema> {
    let mut widened: Vec<SchemaField> = schema.fields.clone();
    for row in rows {
        for (name, value) in row {
            if !matches!(value, Value::F64(_)) {
                continue;
            }
            if let Some(field) = widened.iter_mut().find(|f| f.name == *name) {
                if field.data_type == PrimitiveType::Integer {
                    field.data_type = PrimitiveType::Double;
                }
            }
        }
    }
    Ok(Schema::new(widened))
}

/// Group rows by their partition-column values, first-seen order. Unpartitioned tables get a
/// single group.
pub(crate) fn group_by_partition(
    rows: &[Row],
    partition_columns: &[String],
) -> DeltaResult<Vec<(Vec<Value>, Vec<Row>)>> {
    if partition_columns.is_empty() {
        return Ok(vec![(Vec::new(), rows.to_vec())]);
    }
    let mut groups: IndexMap<String, (Vec<Value>, Vec<Row>)> = IndexMap::new();
    for row in rows {
        let values: Vec<Value> = partition_columns
            .iter()
            .map(|col| row.get(col).cloned().unwrap_or(Value::Null))
            .collect();
        for (col, value) in partition_columns.iter().zip(&values) {
            require!(
                matches!(
                    value,
                    Value::Null
                        | Value::Bool(_)
                        | Value::I32(_)
                        | Value::I64(_)
                        | Value::F64(_)
                        | Value::Str(_)
                        | Value::Ts(_)
                ),
                Error::validation_for(
                    col.clone(),
                    format!("{value:?}"),
                    "partition values must be scalars"
                )
            );
        }
        let key = values
            .iter()
            .map(Value::canonical_key)
            .collect::<Vec<_>>()
            .join("|");
        groups
            .entry(key)
            .or_insert_with(|| (values.clone(), Vec::new()))
            .1
            .push(row.clone());
    }
    Ok(groups.into_values().collect())
}

/// Write one group of rows to a fresh data file and return its Add action. Partition columns
/// are carried in the path and the Add, never in the file itself.
pub(crate) async fn write_data_file(
    inner: &std::sync::Arc<TableInner>,
    schema: &Schema,
    partition_columns: &[String],
    partition_values: &[Value],
    rows: Vec<Row>,
    counter: usize,
    signal: Option<&AbortSignal>,
) -> DeltaResult<Add> {
    let file_schema = Schema::new(
        schema
            .fields
            .iter()
            .filter(|f| !partition_columns.contains(&f.name))
            .cloned()
            .collect::<Vec<_>>(),
    );
    let prefix = partition_prefix(partition_columns, partition_values);
    let rel_path = data_file_name(&prefix, counter);

    let mut writer = StreamingFileWriter::new(Some(file_schema), inner.opts.writer.clone());
    if let Some(signal) = signal {
        writer = writer.with_abort_signal(signal.clone());
    }
    for mut row in rows {
        for col in partition_columns {
            row.shift_remove(col);
        }
        writer.write_row(row).await?;
    }
    let finished = writer.finish().await?;

    let full_path = join_path(&inner.table_root, &rel_path);
    let size = finished.bytes.len() as i64;
    inner.storage.write(&full_path, finished.bytes).await?;

    let partition_value_map: HashMap<String, Option<String>> = partition_columns
        .iter()
        .zip(partition_values)
        .map(|(col, value)| (col.clone(), value.partition_string()))
        .collect();

    Ok(Add {
        path: rel_path,
        partition_values: partition_value_map,
        size,
        modification_time: current_time_millis(),
        data_change: true,
        stats: Some(finished.file_stats.to_json_string()?),
        tags: None,
        deletion_vector: None,
    })
}

/// The protocol a table needs for the features it uses.
pub(crate) fn required_protocol(
    schema: &Schema,
    change_data_feed: bool,
    deletion_vectors: bool,
    column_mapping: ColumnMappingMode,
) -> Protocol {
    let mut reader_features = Vec::new();
    let mut writer_features = Vec::new();
    if column_mapping != ColumnMappingMode::None {
        reader_features.push(ReaderFeature::ColumnMapping);
        writer_features.push(WriterFeature::ColumnMapping);
    }
    if deletion_vectors {
        reader_features.push(ReaderFeature::DeletionVectors);
        writer_features.push(WriterFeature::DeletionVectors);
    }
    if change_data_feed {
        writer_features.push(WriterFeature::ChangeDataFeed);
    }
    if schema
        .fields
        .iter()
        .any(|f| f.data_type == PrimitiveType::Variant)
    {
        reader_features.push(ReaderFeature::VariantType);
        writer_features.push(WriterFeature::VariantType);
    }
    Protocol::with_features(reader_features, writer_features)
}
