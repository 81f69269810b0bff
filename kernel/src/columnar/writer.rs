//! Streaming columnar writer.
//!
//! Buffers rows, flushes them as explicit row groups (bounded by rows and by estimated
//! bytes), and collects per-group statistics and zone maps as it goes. The zone maps and the
//! logical schema are stamped into the parquet footer so readers can prune without a second
//! metadata source.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use serde_json::Value as JsonValue;
use strum::{Display as StrumDisplay, EnumString};
use tokio::sync::Semaphore;

use crate::actions::FileStats;
use crate::columnar::convert::{arrow_schema_of, rows_to_batch};
use crate::columnar::{ZoneMapEntry, SCHEMA_METADATA_KEY, ZONE_MAP_METADATA_KEY};
use crate::error::{DeltaResult, Error};
use crate::retry::AbortSignal;
use crate::row::{Row, Value};
use crate::schema::{Schema, SchemaBuilder};
use crate::utils::require;
use crate::variant::variant_get;

/// Compression codecs the writer understands, by their conventional names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, StrumDisplay)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionCodec {
    None,
    #[default]
    Snappy,
    Lz4,
    Lz4Raw,
    Gzip,
    Zstd,
}

impl From<CompressionCodec> for Compression {
    fn from(codec: CompressionCodec) -> Compression {
        match codec {
            CompressionCodec::None => Compression::UNCOMPRESSED,
            CompressionCodec::Snappy => Compression::SNAPPY,
            CompressionCodec::Lz4 => Compression::LZ4,
            CompressionCodec::Lz4Raw => Compression::LZ4_RAW,
            CompressionCodec::Gzip => Compression::GZIP(GzipLevel::default()),
            CompressionCodec::Zstd => Compression::ZSTD(ZstdLevel::default()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnarWriteOptions {
    /// Row count that triggers a row-group flush.
    pub row_group_rows: usize,
    /// Estimated in-memory byte size that triggers a row-group flush.
    pub row_group_bytes: usize,
    /// Hard cap on buffered bytes; `write_row` will not return until below it.
    pub max_buffer_bytes: usize,
    /// Flush slots; when exhausted, `write_row` suspends until one frees.
    pub max_pending_flushes: usize,
    pub compression: CompressionCodec,
    pub collect_stats: bool,
    pub estimate_distinct: bool,
    /// Variant sub-paths (e.g. `payload.kind`) to cover in statistics.
    pub shredded_variant_paths: Vec<String>,
    /// Caller key/value metadata stamped into the footer.
    pub key_value_metadata: Vec<(String, String)>,
}

impl Default for ColumnarWriteOptions {
    fn default() -> Self {
        ColumnarWriteOptions {
            row_group_rows: 10_000,
            row_group_bytes: 8 * 1024 * 1024,
            max_buffer_bytes: 32 * 1024 * 1024,
            max_pending_flushes: 2,
            compression: CompressionCodec::default(),
            collect_stats: true,
            estimate_distinct: false,
            shredded_variant_paths: Vec::new(),
            key_value_metadata: Vec::new(),
        }
    }
}

/// Statistics for one column of one row group.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStats {
    pub column: String,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub null_count: u64,
    pub distinct_count: Option<u64>,
}

/// Statistics for one finished row group.
#[derive(Debug, Clone)]
pub struct RowGroupStats {
    pub num_rows: usize,
    pub byte_range: Option<(u64, u64)>,
    pub compressed_size: i64,
    pub uncompressed_size: i64,
    pub columns: Vec<ColumnStats>,
}

/// Everything the writer hands back after finalization.
#[derive(Debug)]
pub struct FinishedFile {
    pub bytes: Bytes,
    pub num_rows: u64,
    pub schema: Schema,
    pub row_groups: Vec<RowGroupStats>,
    /// One zone-map list per row group, in row-group order.
    pub zone_maps: Vec<Vec<ZoneMapEntry>>,
    /// File-level aggregation of the row-group stats.
    pub file_stats: FileStats,
}

enum WriterSchema {
    Inferring(SchemaBuilder),
    Locked(Schema),
}

pub struct StreamingFileWriter {
    opts: ColumnarWriteOptions,
    schema: WriterSchema,
    buffer: Vec<Row>,
    buffered_bytes: usize,
    writer: Option<ArrowWriter<Vec<u8>>>,
    row_groups: Vec<RowGroupStats>,
    zone_maps: Vec<Vec<ZoneMapEntry>>,
    flush_slots: Arc<Semaphore>,
    total_rows: u64,
    aborted: bool,
    signal: Option<AbortSignal>,
}

impl StreamingFileWriter {
    pub fn new(schema: Option<Schema>, opts: ColumnarWriteOptions) -> Self {
        let slots = opts.max_pending_flushes.max(1);
        StreamingFileWriter {
            opts,
            schema: match schema {
                Some(s) => WriterSchema::Locked(s),
                None => WriterSchema::Inferring(SchemaBuilder::new()),
            },
            buffer: Vec::new(),
            buffered_bytes: 0,
            writer: None,
            row_groups: Vec::new(),
            zone_maps: Vec::new(),
            flush_slots: Arc::new(Semaphore::new(slots)),
            total_rows: 0,
            aborted: false,
            signal: None,
        }
    }

    pub fn with_abort_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    fn check_live(&self) -> DeltaResult<()> {
        require!(!self.aborted, Error::generic("writer has been aborted"));
        if let Some(signal) = &self.signal {
            signal.check()?;
        }
        Ok(())
    }

    pub async fn write_row(&mut self, row: Row) -> DeltaResult<()> {
        self.check_live()?;
        let observed = match &mut self.schema {
            WriterSchema::Inferring(builder) => builder.observe_row(&row),
            WriterSchema::Locked(schema) => schema.validate_row(&row),
        };
        if let Err(err) = observed {
            // roll back the in-memory accumulation for this batch
            self.buffer.clear();
            self.buffered_bytes = 0;
            return Err(err);
        }
        self.buffered_bytes += estimate_row_bytes(&row);
        self.buffer.push(row);
        self.total_rows += 1;
        if self.buffer.len() >= self.opts.row_group_rows
            || self.buffered_bytes >= self.opts.row_group_bytes
            || self.buffered_bytes >= self.opts.max_buffer_bytes
        {
            self.flush_row_group().await?;
        }
        Ok(())
    }

    pub async fn write_rows(&mut self, rows: impl IntoIterator<Item = Row>) -> DeltaResult<()> {
        for row in rows {
            self.write_row(row).await?;
        }
        Ok(())
    }

    /// Abort is terminal: buffered rows are dropped and the writer refuses further use.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.buffer.clear();
        self.buffered_bytes = 0;
        self.writer = None;
    }

    fn locked_schema(&mut self) -> DeltaResult<&Schema> {
        if let WriterSchema::Inferring(builder) = &mut self.schema {
            let built = std::mem::take(builder).finish()?;
            self.schema = WriterSchema::Locked(built);
        }
        match &self.schema {
            WriterSchema::Locked(schema) => Ok(schema),
            WriterSchema::Inferring(_) => unreachable!("locked above"),
        }
    }

    async fn flush_row_group(&mut self) -> DeltaResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.check_live()?;
        // back-pressure: wait for a flush slot, suspending cooperatively
        let permit = self
            .flush_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::internal("flush semaphore closed"))?;

        let result = self.flush_inner();
        drop(permit);
        tokio::task::yield_now().await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.abort();
                Err(err)
            }
        }
    }

    fn flush_inner(&mut self) -> DeltaResult<()> {
        let opts = self.opts.clone();
        let schema = self.locked_schema()?.clone();
        let rows = std::mem::take(&mut self.buffer);
        self.buffered_bytes = 0;

        let batch = rows_to_batch(&schema, &rows)?;
        if self.writer.is_none() {
            let props = WriterProperties::builder()
                .set_compression(opts.compression.into())
                .set_max_row_group_size(opts.row_group_rows.max(1))
                .build();
            self.writer = Some(ArrowWriter::try_new(
                Vec::new(),
                arrow_schema_of(&schema),
                Some(props),
            )?);
        }
        let writer = self.writer.as_mut().expect("created above");
        let groups_before = writer.flushed_row_groups().len();
        writer.write(&batch)?;
        writer.flush()?;

        let stats = if opts.collect_stats {
            compute_column_stats(&schema, &rows, &opts)
        } else {
            Vec::new()
        };
        let flushed = writer.flushed_row_groups();
        // the explicit flush above ends exactly one row group
        let (byte_range, compressed, uncompressed) = flushed[groups_before..]
            .iter()
            .fold((None::<(u64, u64)>, 0i64, 0i64), |(range, c, u), group| {
                let group_range = group
                    .columns()
                    .iter()
                    .map(|col| {
                        let (start, len) = col.byte_range();
                        (start, start + len)
                    })
                    .fold(None, |acc: Option<(u64, u64)>, (start, end)| match acc {
                        Some((s, e)) => Some((s.min(start), e.max(end))),
                        None => Some((start, end)),
                    });
                let merged = match (range, group_range) {
                    (Some((s1, e1)), Some((s2, e2))) => Some((s1.min(s2), e1.max(e2))),
                    (r, None) => r,
                    (None, r) => r,
                };
                (merged, c + group.compressed_size(), u + group.total_byte_size())
            });

        let zone_map = stats
            .iter()
            .map(|s| ZoneMapEntry {
                column: s.column.clone(),
                min: s.min.as_ref().map(Value::to_json),
                max: s.max.as_ref().map(Value::to_json),
                null_count: s.null_count,
            })
            .collect();
        self.zone_maps.push(zone_map);
        self.row_groups.push(RowGroupStats {
            num_rows: rows.len(),
            byte_range,
            compressed_size: compressed,
            uncompressed_size: uncompressed,
            columns: stats,
        });
        Ok(())
    }

    pub async fn finish(mut self) -> DeltaResult<FinishedFile> {
        self.check_live()?;
        self.flush_row_group().await?;
        let schema = self.locked_schema()?.clone();
        let mut writer = match self.writer.take() {
            Some(writer) => writer,
            // zero rows: still emit a valid (empty) file for the locked schema
            None => ArrowWriter::try_new(
                Vec::new(),
                arrow_schema_of(&schema),
                Some(
                    WriterProperties::builder()
                        .set_compression(self.opts.compression.into())
                        .build(),
                ),
            )?,
        };

        writer.append_key_value_metadata(KeyValue::new(
            ZONE_MAP_METADATA_KEY.to_string(),
            Some(serde_json::to_string(&self.zone_maps)?),
        ));
        writer.append_key_value_metadata(KeyValue::new(
            SCHEMA_METADATA_KEY.to_string(),
            Some(schema.to_schema_string()?),
        ));
        for (key, value) in &self.opts.key_value_metadata {
            writer.append_key_value_metadata(KeyValue::new(key.clone(), Some(value.clone())));
        }

        let bytes = Bytes::from(writer.into_inner()?);
        let file_stats = aggregate_file_stats(self.total_rows, &self.row_groups);
        Ok(FinishedFile {
            bytes,
            num_rows: self.total_rows,
            schema,
            row_groups: self.row_groups,
            zone_maps: self.zone_maps,
            file_stats,
        })
    }
}

fn estimate_row_bytes(row: &Row) -> usize {
    row.iter()
        .map(|(k, v)| k.len() + estimate_value_bytes(v))
        .sum::<usize>()
        + 16
}

fn estimate_value_bytes(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::I32(_) => 4,
        Value::I64(_) | Value::F64(_) | Value::Ts(_) => 8,
        Value::Str(s) => s.len() + 4,
        Value::Bytes(b) => b.len() + 4,
        Value::Array(items) => items.iter().map(estimate_value_bytes).sum::<usize>() + 8,
        Value::Object(map) => {
            map.iter()
                .map(|(k, v)| k.len() + estimate_value_bytes(v))
                .sum::<usize>()
                + 8
        }
    }
}

fn stats_worthy(value: &Value) -> bool {
    matches!(
        value,
        Value::Bool(_) | Value::I32(_) | Value::I64(_) | Value::F64(_) | Value::Str(_) | Value::Ts(_)
    )
}

fn compute_column_stats(
    schema: &Schema,
    rows: &[Row],
    opts: &ColumnarWriteOptions,
) -> Vec<ColumnStats> {
    let mut out = Vec::new();
    for field in &schema.fields {
        out.push(stats_over(&field.name, rows.iter().map(|r| r.get(&field.name)), opts));
    }
    // shredded variant sub-paths get their own zone-map entries
    for path in &opts.shredded_variant_paths {
        let Some((root, rest)) = path.split_once('.') else {
            continue;
        };
        if schema.field(root).is_none() {
            continue;
        }
        out.push(stats_over(
            path,
            rows.iter()
                .map(|r| r.get(root).and_then(|v| variant_get(v, rest))),
            opts,
        ));
    }
    out
}

fn stats_over<'a>(
    column: &str,
    values: impl Iterator<Item = Option<&'a Value>>,
    opts: &ColumnarWriteOptions,
) -> ColumnStats {
    let mut min: Option<Value> = None;
    let mut max: Option<Value> = None;
    let mut null_count = 0u64;
    let mut distinct: Option<HashSet<String>> = opts.estimate_distinct.then(HashSet::new);
    for value in values {
        let value = value.unwrap_or(&Value::Null);
        if value.is_null() {
            null_count += 1;
            continue;
        }
        if let Some(set) = &mut distinct {
            set.insert(value.canonical_key());
        }
        if !stats_worthy(value) {
            continue;
        }
        match &min {
            Some(current) if current.compare(value) != Some(std::cmp::Ordering::Greater) => {}
            _ => min = Some(value.clone()),
        }
        match &max {
            Some(current) if current.compare(value) != Some(std::cmp::Ordering::Less) => {}
            _ => max = Some(value.clone()),
        }
    }
    ColumnStats {
        column: column.to_string(),
        min,
        max,
        null_count,
        distinct_count: distinct.map(|s| s.len() as u64),
    }
}

fn aggregate_file_stats(num_records: u64, row_groups: &[RowGroupStats]) -> FileStats {
    let mut min_values: serde_json::Map<String, JsonValue> = serde_json::Map::new();
    let mut max_values: serde_json::Map<String, JsonValue> = serde_json::Map::new();
    let mut null_count: HashMap<String, i64> = HashMap::new();
    let mut mins: HashMap<String, Value> = HashMap::new();
    let mut maxs: HashMap<String, Value> = HashMap::new();
    for group in row_groups {
        for stats in &group.columns {
            *null_count.entry(stats.column.clone()).or_insert(0) += stats.null_count as i64;
            if let Some(group_min) = &stats.min {
                match mins.get(&stats.column) {
                    Some(current)
                        if current.compare(group_min) != Some(std::cmp::Ordering::Greater) => {}
                    _ => {
                        mins.insert(stats.column.clone(), group_min.clone());
                    }
                }
            }
            if let Some(group_max) = &stats.max {
                match maxs.get(&stats.column) {
                    Some(current)
                        if current.compare(group_max) != Some(std::cmp::Ordering::Less) => {}
                    _ => {
                        maxs.insert(stats.column.clone(), group_max.clone());
                    }
                }
            }
        }
    }
    for (column, value) in mins {
        min_values.insert(column, value.to_json());
    }
    for (column, value) in maxs {
        max_values.insert(column, value.to_json());
    }
    FileStats {
        num_records: num_records as i64,
        min_values,
        max_values,
        null_count,
    }
}
