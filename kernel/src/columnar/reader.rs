//! Columnar file reader.
//!
//! Wraps the parquet record-batch reader with zone-map awareness: the footer metadata written
//! by [`crate::columnar::StreamingFileWriter`] is surfaced for pruning, reads can be narrowed
//! to a set of row groups and root columns, and record batches come back as rows with
//! variant/timestamp decoding and logical column names applied.

use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ProjectionMask;

use crate::columnar::convert::batch_to_rows;
use crate::columnar::{ZoneMapEntry, SCHEMA_METADATA_KEY, ZONE_MAP_METADATA_KEY};
use crate::error::{DeltaResult, Error};
use crate::row::Row;
use crate::schema::Schema;

pub struct FileReader {
    bytes: Bytes,
    zone_maps: Vec<Vec<ZoneMapEntry>>,
    logical_schema: Option<Schema>,
    num_row_groups: usize,
}

impl FileReader {
    pub fn try_new(bytes: Bytes) -> DeltaResult<Self> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes.clone())?;
        let metadata = builder.metadata();
        let num_row_groups = metadata.num_row_groups();
        let mut zone_maps = Vec::new();
        let mut logical_schema = None;
        if let Some(kv) = metadata.file_metadata().key_value_metadata() {
            for entry in kv {
                let Some(value) = &entry.value else { continue };
                if entry.key == ZONE_MAP_METADATA_KEY {
                    zone_maps = serde_json::from_str(value).map_err(|e| {
                        Error::validation(format!("corrupt zone-map footer metadata: {e}"))
                    })?;
                } else if entry.key == SCHEMA_METADATA_KEY {
                    logical_schema = Some(Schema::from_schema_string(value)?);
                }
            }
        }
        Ok(FileReader {
            bytes,
            zone_maps,
            logical_schema,
            num_row_groups,
        })
    }

    pub fn num_row_groups(&self) -> usize {
        self.num_row_groups
    }

    /// Zone maps in row-group order; empty when the file carries none (foreign writer).
    pub fn zone_maps(&self) -> &[Vec<ZoneMapEntry>] {
        &self.zone_maps
    }

    pub fn logical_schema(&self) -> Option<&Schema> {
        self.logical_schema.as_ref()
    }

    /// Read rows. `columns` narrows the materialized root columns (logical names);
    /// `row_groups` narrows to the given groups. `None` means all.
    pub fn read_rows(
        &self,
        columns: Option<&[String]>,
        row_groups: Option<&[usize]>,
    ) -> DeltaResult<Vec<Row>> {
        let mut builder = ParquetRecordBatchReaderBuilder::try_new(self.bytes.clone())?;
        if let Some(columns) = columns {
            let physical: Vec<String> = columns
                .iter()
                .map(|logical| {
                    self.logical_schema
                        .as_ref()
                        .and_then(|s| s.field(logical))
                        .map(|f| f.physical_name().to_string())
                        .unwrap_or_else(|| logical.clone())
                })
                .collect();
            let arrow_schema = builder.schema().clone();
            let indices: Vec<usize> = arrow_schema
                .fields()
                .iter()
                .enumerate()
                .filter(|(_, f)| physical.iter().any(|p| p == f.name()))
                .map(|(idx, _)| idx)
                .collect();
            let mask = ProjectionMask::roots(builder.parquet_schema(), indices);
            builder = builder.with_projection(mask);
        }
        if let Some(row_groups) = row_groups {
            builder = builder.with_row_groups(row_groups.to_vec());
        }
        let reader = builder.build()?;
        let mut rows = Vec::new();
        for batch in reader {
            rows.extend(batch_to_rows(&batch?, self.logical_schema.as_ref())?);
        }
        Ok(rows)
    }

    /// Read everything: every row group, every column.
    pub fn read_all(&self) -> DeltaResult<Vec<Row>> {
        self.read_rows(None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columnar::writer::{ColumnarWriteOptions, StreamingFileWriter};
    use crate::row::Value;

    async fn sample_file(rows: usize, per_group: usize) -> Bytes {
        let mut writer = StreamingFileWriter::new(
            None,
            ColumnarWriteOptions {
                row_group_rows: per_group,
                ..Default::default()
            },
        );
        for i in 0..rows {
            let row: Row = [
                ("id".to_string(), Value::I32(i as i32)),
                ("name".to_string(), Value::Str(format!("row-{i}"))),
            ]
            .into_iter()
            .collect();
            writer.write_row(row).await.unwrap();
        }
        writer.finish().await.unwrap().bytes
    }

    #[tokio::test]
    async fn column_pruning_drops_unrequested_columns() {
        let bytes = sample_file(4, 10).await;
        let reader = FileReader::try_new(bytes).unwrap();
        let rows = reader
            .read_rows(Some(&["id".to_string()]), None)
            .unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows[0].contains_key("id"));
        assert!(!rows[0].contains_key("name"));
    }

    #[tokio::test]
    async fn row_group_selection_reads_a_subset() {
        let bytes = sample_file(6, 2).await;
        let reader = FileReader::try_new(bytes).unwrap();
        assert_eq!(reader.num_row_groups(), 3);
        let rows = reader.read_rows(None, Some(&[1])).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].get("id").unwrap().equals(&Value::I32(2)));
    }

    #[tokio::test]
    async fn unknown_columns_project_to_nothing() {
        let bytes = sample_file(2, 10).await;
        let reader = FileReader::try_new(bytes).unwrap();
        let rows = reader
            .read_rows(Some(&["missing".to_string()]), None)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].is_empty());
    }
}
