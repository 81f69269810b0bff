//! Row ↔ arrow conversion.
//!
//! Variant columns are stored as a single binary column: a 4-byte LE metadata length, the
//! variant metadata buffer, then the value buffer. Timestamps are microsecond-precision.
//! Legacy files that stored nested data as JSON text decode transparently: a string column
//! whose logical type is variant is parsed back into its tree form.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BinaryBuilder, BooleanArray, BooleanBuilder, Float64Array,
    Float64Builder, Int32Array, Int32Builder, Int64Array, Int64Builder, StringArray,
    StringBuilder, TimestampMicrosecondArray, TimestampMicrosecondBuilder,
};
use arrow::datatypes::{DataType as ArrowDataType, Field as ArrowField, Schema as ArrowSchema, TimeUnit};
use arrow::record_batch::RecordBatch;

use crate::error::{DeltaResult, Error};
use crate::row::{Row, Value};
use crate::schema::{PrimitiveType, Schema, SchemaField};
use crate::variant::{decode_variant, encode_variant};

pub fn arrow_type_of(data_type: PrimitiveType) -> ArrowDataType {
    match data_type {
        PrimitiveType::Boolean => ArrowDataType::Boolean,
        PrimitiveType::Integer => ArrowDataType::Int32,
        PrimitiveType::Long => ArrowDataType::Int64,
        PrimitiveType::Double => ArrowDataType::Float64,
        PrimitiveType::String => ArrowDataType::Utf8,
        PrimitiveType::Binary | PrimitiveType::Variant => ArrowDataType::Binary,
        PrimitiveType::Timestamp => ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
    }
}

/// Build the physical arrow schema for a logical schema. Field names are the physical names,
/// so column mapping is applied here and undone in [`batch_to_rows`].
pub fn arrow_schema_of(schema: &Schema) -> Arc<ArrowSchema> {
    let fields: Vec<ArrowField> = schema
        .fields
        .iter()
        .map(|f| {
            ArrowField::new(
                f.physical_name(),
                arrow_type_of(f.data_type),
                // always physically nullable: a later batch may relax nullability
                true,
            )
        })
        .collect();
    Arc::new(ArrowSchema::new(fields))
}

fn encode_variant_cell(value: &Value) -> Vec<u8> {
    let (metadata, body) = encode_variant(value);
    let mut out = Vec::with_capacity(4 + metadata.len() + body.len());
    out.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
    out.extend_from_slice(&metadata);
    out.extend_from_slice(&body);
    out
}

fn decode_variant_cell(bytes: &[u8]) -> DeltaResult<Value> {
    if bytes.len() < 4 {
        return Err(Error::validation("variant cell shorter than its header"));
    }
    let metadata_len = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
    if 4 + metadata_len > bytes.len() {
        return Err(Error::validation("variant cell metadata overruns the cell"));
    }
    decode_variant(&bytes[4..4 + metadata_len], &bytes[4 + metadata_len..])
}

/// Convert a slice of rows into a record batch laid out per `schema`.
pub fn rows_to_batch(schema: &Schema, rows: &[Row]) -> DeltaResult<RecordBatch> {
    let arrow_schema = arrow_schema_of(schema);
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields.len());
    for field in &schema.fields {
        columns.push(build_column(field, rows)?);
    }
    Ok(RecordBatch::try_new(arrow_schema, columns)?)
}

fn build_column(field: &SchemaField, rows: &[Row]) -> DeltaResult<ArrayRef> {
    let values = rows.iter().map(|row| row.get(&field.name));
    let type_error = |value: &Value| {
        Error::validation_for(
            field.name.clone(),
            format!("{value:?}"),
            format!("value does not fit column type {:?}", field.data_type),
        )
    };
    Ok(match field.data_type {
        PrimitiveType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(rows.len());
            for value in values {
                match value {
                    Some(Value::Bool(b)) => builder.append_value(*b),
                    None | Some(Value::Null) => builder.append_null(),
                    Some(other) => return Err(type_error(other)),
                }
            }
            Arc::new(builder.finish())
        }
        PrimitiveType::Integer => {
            let mut builder = Int32Builder::with_capacity(rows.len());
            for value in values {
                match value {
                    Some(Value::I32(v)) => builder.append_value(*v),
                    None | Some(Value::Null) => builder.append_null(),
                    Some(other) => return Err(type_error(other)),
                }
            }
            Arc::new(builder.finish())
        }
        PrimitiveType::Long => {
            let mut builder = Int64Builder::with_capacity(rows.len());
            for value in values {
                match value {
                    Some(Value::I64(v)) => builder.append_value(*v),
                    Some(Value::I32(v)) => builder.append_value(*v as i64),
                    None | Some(Value::Null) => builder.append_null(),
                    Some(other) => return Err(type_error(other)),
                }
            }
            Arc::new(builder.finish())
        }
        PrimitiveType::Double => {
            let mut builder = Float64Builder::with_capacity(rows.len());
            for value in values {
                match value {
                    Some(Value::F64(v)) => builder.append_value(*v),
                    // the permitted int32 -> double widening lands here
                    Some(Value::I32(v)) => builder.append_value(*v as f64),
                    None | Some(Value::Null) => builder.append_null(),
                    Some(other) => return Err(type_error(other)),
                }
            }
            Arc::new(builder.finish())
        }
        PrimitiveType::String => {
            let mut builder = StringBuilder::new();
            for value in values {
                match value {
                    Some(Value::Str(s)) => builder.append_value(s),
                    None | Some(Value::Null) => builder.append_null(),
                    Some(other) => return Err(type_error(other)),
                }
            }
            Arc::new(builder.finish())
        }
        PrimitiveType::Binary => {
            let mut builder = BinaryBuilder::new();
            for value in values {
                match value {
                    Some(Value::Bytes(b)) => builder.append_value(b),
                    None | Some(Value::Null) => builder.append_null(),
                    Some(other) => return Err(type_error(other)),
                }
            }
            Arc::new(builder.finish())
        }
        PrimitiveType::Timestamp => {
            let mut builder = TimestampMicrosecondBuilder::with_capacity(rows.len());
            for value in values {
                match value {
                    Some(Value::Ts(v)) => builder.append_value(*v),
                    None | Some(Value::Null) => builder.append_null(),
                    Some(other) => return Err(type_error(other)),
                }
            }
            Arc::new(builder.finish())
        }
        PrimitiveType::Variant => {
            let mut builder = BinaryBuilder::new();
            for value in values {
                match value {
                    None | Some(Value::Null) => builder.append_null(),
                    Some(v) => builder.append_value(encode_variant_cell(v)),
                }
            }
            Arc::new(builder.finish())
        }
    })
}

/// Convert a record batch back into rows. When a logical schema is supplied, physical column
/// names are mapped back to logical ones and variant/timestamp columns are decoded per the
/// schema; without one the arrow types alone drive the conversion.
pub fn batch_to_rows(batch: &RecordBatch, logical_schema: Option<&Schema>) -> DeltaResult<Vec<Row>> {
    let arrow_schema = batch.schema();
    let mut rows = vec![Row::new(); batch.num_rows()];
    for (col_idx, arrow_field) in arrow_schema.fields().iter().enumerate() {
        let logical_field = logical_schema
            .and_then(|s| s.fields.iter().find(|f| f.physical_name() == arrow_field.name()));
        let name = logical_field
            .map(|f| f.name.clone())
            .unwrap_or_else(|| arrow_field.name().clone());
        let column = batch.column(col_idx);
        for (row_idx, row) in rows.iter_mut().enumerate() {
            let value = extract_value(column, row_idx, arrow_field.data_type(), logical_field)?;
            row.insert(name.clone(), value);
        }
    }
    Ok(rows)
}

fn extract_value(
    column: &ArrayRef,
    row_idx: usize,
    arrow_type: &ArrowDataType,
    logical_field: Option<&SchemaField>,
) -> DeltaResult<Value> {
    if column.is_null(row_idx) {
        return Ok(Value::Null);
    }
    let downcast_err = || Error::internal("arrow column type does not match its schema");
    let logical_type = logical_field.map(|f| f.data_type);
    Ok(match arrow_type {
        ArrowDataType::Boolean => {
            let array = column
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(downcast_err)?;
            Value::Bool(array.value(row_idx))
        }
        ArrowDataType::Int32 => {
            let array = column
                .as_any()
                .downcast_ref::<Int32Array>()
                .ok_or_else(downcast_err)?;
            Value::I32(array.value(row_idx))
        }
        ArrowDataType::Int64 => {
            let array = column
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(downcast_err)?;
            // schemas written before timestamps became a physical type store micros as int64
            if logical_type == Some(PrimitiveType::Timestamp) {
                Value::Ts(array.value(row_idx))
            } else {
                Value::I64(array.value(row_idx))
            }
        }
        ArrowDataType::Float64 => {
            let array = column
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(downcast_err)?;
            Value::F64(array.value(row_idx))
        }
        ArrowDataType::Utf8 => {
            let array = column
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(downcast_err)?;
            let s = array.value(row_idx);
            // backward compatibility: nested data written as JSON text
            if logical_type == Some(PrimitiveType::Variant) {
                let json: serde_json::Value = serde_json::from_str(s).map_err(|e| {
                    Error::validation(format!("legacy JSON variant cell failed to parse: {e}"))
                })?;
                Value::from_json(&json)
            } else {
                Value::Str(s.to_string())
            }
        }
        ArrowDataType::Binary => {
            let array = column
                .as_any()
                .downcast_ref::<BinaryArray>()
                .ok_or_else(downcast_err)?;
            let bytes = array.value(row_idx);
            if logical_type == Some(PrimitiveType::Variant) {
                decode_variant_cell(bytes)?
            } else {
                Value::Bytes(bytes.to_vec())
            }
        }
        ArrowDataType::Timestamp(TimeUnit::Microsecond, _) => {
            let array = column
                .as_any()
                .downcast_ref::<TimestampMicrosecondArray>()
                .ok_or_else(downcast_err)?;
            Value::Ts(array.value(row_idx))
        }
        other => {
            return Err(Error::validation(format!(
                "unsupported arrow column type {other}"
            )))
        }
    })
}
