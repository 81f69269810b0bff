//! Variant: a self-describing binary encoding for heterogeneous values.
//!
//! Lets schema-free trees (arrays, objects, mixed primitives) live inside a fixed columnar
//! schema. A variant is two buffers: a *metadata* buffer holding a dictionary of every distinct
//! field name used anywhere in the value, and a *value* buffer holding the tree itself with
//! field names replaced by dictionary ids.
//!
//! Every value node starts with one header byte; the low two bits select the shape:
//! `0` primitive, `1` short string, `2` object, `3` array.

use indexmap::IndexMap;
use indexmap::IndexSet;

use crate::error::{DeltaResult, Error};
use crate::row::Value;

const BASIC_PRIMITIVE: u8 = 0;
const BASIC_SHORT_STR: u8 = 1;
const BASIC_OBJECT: u8 = 2;
const BASIC_ARRAY: u8 = 3;

const PRIM_NULL: u8 = 0;
const PRIM_TRUE: u8 = 1;
const PRIM_FALSE: u8 = 2;
const PRIM_INT8: u8 = 3;
const PRIM_INT16: u8 = 4;
const PRIM_INT32: u8 = 5;
const PRIM_INT64: u8 = 6;
const PRIM_DOUBLE: u8 = 7;
const PRIM_TIMESTAMP: u8 = 8;
const PRIM_BINARY: u8 = 9;
const PRIM_LONG_STR: u8 = 10;

/// Encode a value into its `(metadata, value)` buffer pair.
pub fn encode_variant(value: &Value) -> (Vec<u8>, Vec<u8>) {
    let mut dictionary = IndexSet::new();
    collect_field_names(value, &mut dictionary);
    let metadata = encode_metadata(&dictionary);
    let mut out = Vec::new();
    encode_value(value, &dictionary, &mut out);
    (metadata, out)
}

/// Decode a `(metadata, value)` buffer pair. Malformed input fails with a validation error
/// naming the offending byte position.
pub fn decode_variant(metadata: &[u8], value: &[u8]) -> DeltaResult<Value> {
    let dictionary = decode_metadata(metadata)?;
    let mut cursor = Cursor::new(value);
    let decoded = decode_value(&mut cursor, &dictionary)?;
    Ok(decoded)
}

/// Resolve a dot-separated sub-path inside a decoded variant value. Used for shredded
/// statistics over variant columns.
pub fn variant_get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

fn collect_field_names(value: &Value, dictionary: &mut IndexSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                dictionary.insert(key.clone());
                collect_field_names(child, dictionary);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_field_names(item, dictionary);
            }
        }
        _ => {}
    }
}

/// Width in bytes needed to represent `max` as an unsigned LE integer (1, 2 or 4).
fn width_for(max: usize) -> usize {
    if max <= u8::MAX as usize {
        1
    } else if max <= u16::MAX as usize {
        2
    } else {
        4
    }
}

fn push_uint(out: &mut Vec<u8>, v: usize, width: usize) {
    out.extend_from_slice(&(v as u32).to_le_bytes()[..width]);
}

fn encode_metadata(dictionary: &IndexSet<String>) -> Vec<u8> {
    let total_bytes: usize = dictionary.iter().map(|s| s.len()).sum();
    let offset_size = width_for(total_bytes.max(dictionary.len()));
    let mut out = Vec::with_capacity(1 + (dictionary.len() + 2) * offset_size + total_bytes);
    out.push(0x01 | (((offset_size as u8) - 1) << 6));
    push_uint(&mut out, dictionary.len(), offset_size);
    let mut offset = 0usize;
    push_uint(&mut out, 0, offset_size);
    for name in dictionary {
        offset += name.len();
        push_uint(&mut out, offset, offset_size);
    }
    for name in dictionary {
        out.extend_from_slice(name.as_bytes());
    }
    out
}

fn encode_value(value: &Value, dictionary: &IndexSet<String>, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(PRIM_NULL << 2),
        Value::Bool(true) => out.push(PRIM_TRUE << 2),
        Value::Bool(false) => out.push(PRIM_FALSE << 2),
        Value::I32(v) => {
            // smallest fixed width that fits; all sub-int32 widths decode back to int32
            if let Ok(b) = i8::try_from(*v) {
                out.push(PRIM_INT8 << 2);
                out.extend_from_slice(&b.to_le_bytes());
            } else if let Ok(s) = i16::try_from(*v) {
                out.push(PRIM_INT16 << 2);
                out.extend_from_slice(&s.to_le_bytes());
            } else {
                out.push(PRIM_INT32 << 2);
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        Value::I64(v) => {
            out.push(PRIM_INT64 << 2);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::F64(v) => {
            out.push(PRIM_DOUBLE << 2);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Ts(v) => {
            out.push(PRIM_TIMESTAMP << 2);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Bytes(bytes) => {
            out.push(PRIM_BINARY << 2);
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        Value::Str(s) if s.len() < 64 => {
            out.push(((s.len() as u8) << 2) | BASIC_SHORT_STR);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Str(s) => {
            out.push(PRIM_LONG_STR << 2);
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            let mut children = Vec::with_capacity(items.len());
            let mut total = 0usize;
            for item in items {
                let mut buf = Vec::new();
                encode_value(item, dictionary, &mut buf);
                total += buf.len();
                children.push(buf);
            }
            let offset_size = width_for(total);
            let large = items.len() > u8::MAX as usize;
            out.push(((large as u8) << 4) | (((offset_size as u8) - 1) << 2) | BASIC_ARRAY);
            if large {
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            } else {
                out.push(items.len() as u8);
            }
            let mut offset = 0usize;
            push_uint(out, 0, offset_size);
            for child in &children {
                offset += child.len();
                push_uint(out, offset, offset_size);
            }
            for child in &children {
                out.extend_from_slice(child);
            }
        }
        Value::Object(map) => {
            // entries ordered by dictionary id
            let mut entries: Vec<(usize, &Value)> = map
                .iter()
                .map(|(key, child)| {
                    let id = dictionary
                        .get_index_of(key.as_str())
                        .expect("dictionary covers every object key");
                    (id, child)
                })
                .collect();
            entries.sort_by_key(|(id, _)| *id);

            let mut children = Vec::with_capacity(entries.len());
            let mut total = 0usize;
            for (_, child) in &entries {
                let mut buf = Vec::new();
                encode_value(child, dictionary, &mut buf);
                total += buf.len();
                children.push(buf);
            }
            let offset_size = width_for(total);
            let field_id_size = width_for(entries.iter().map(|(id, _)| *id).max().unwrap_or(0));
            let large = entries.len() > u8::MAX as usize;
            out.push(
                ((large as u8) << 6)
                    | (((field_id_size as u8) - 1) << 4)
                    | (((offset_size as u8) - 1) << 2)
                    | BASIC_OBJECT,
            );
            if large {
                out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            } else {
                out.push(entries.len() as u8);
            }
            for (id, _) in &entries {
                push_uint(out, *id, field_id_size);
            }
            let mut offset = 0usize;
            push_uint(out, 0, offset_size);
            for child in &children {
                offset += child.len();
                push_uint(out, offset, offset_size);
            }
            for child in &children {
                out.extend_from_slice(child);
            }
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> DeltaResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::validation(format!(
                "malformed variant at byte {}: need {} bytes, have {}",
                self.pos,
                n,
                self.buf.len() - self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_byte(&mut self) -> DeltaResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_uint(&mut self, width: usize) -> DeltaResult<usize> {
        let bytes = self.take(width)?;
        let mut buf = [0u8; 4];
        buf[..width].copy_from_slice(bytes);
        Ok(u32::from_le_bytes(buf) as usize)
    }
}

fn decode_metadata(metadata: &[u8]) -> DeltaResult<Vec<String>> {
    let mut cursor = Cursor::new(metadata);
    let header = cursor.take_byte()?;
    if header & 0x3F != 0x01 {
        return Err(Error::validation(format!(
            "malformed variant metadata: unsupported header {header:#04x}"
        )));
    }
    let offset_size = ((header >> 6) & 0x03) as usize + 1;
    let count = cursor.take_uint(offset_size)?;
    let mut offsets = Vec::with_capacity(count + 1);
    for _ in 0..=count {
        offsets.push(cursor.take_uint(offset_size)?);
    }
    let strings_start = cursor.pos;
    let mut names = Vec::with_capacity(count);
    for pair in offsets.windows(2) {
        let (start, end) = (pair[0], pair[1]);
        if end < start || strings_start + end > metadata.len() {
            return Err(Error::validation(format!(
                "malformed variant metadata: offset {end} out of bounds"
            )));
        }
        let raw = &metadata[strings_start + start..strings_start + end];
        names.push(
            std::str::from_utf8(raw)
                .map_err(|_| Error::validation("malformed variant metadata: non-utf8 field name"))?
                .to_string(),
        );
    }
    Ok(names)
}

fn decode_value(cursor: &mut Cursor<'_>, dictionary: &[String]) -> DeltaResult<Value> {
    let header = cursor.take_byte()?;
    match header & 0x03 {
        BASIC_PRIMITIVE => decode_primitive(header >> 2, cursor),
        BASIC_SHORT_STR => {
            let len = (header >> 2) as usize;
            let bytes = cursor.take(len)?;
            Ok(Value::Str(
                std::str::from_utf8(bytes)
                    .map_err(|_| Error::validation("malformed variant: non-utf8 string"))?
                    .to_string(),
            ))
        }
        BASIC_OBJECT => {
            let offset_size = ((header >> 2) & 0x03) as usize + 1;
            let field_id_size = ((header >> 4) & 0x03) as usize + 1;
            let large = header & 0x40 != 0;
            let count = if large {
                cursor.take_uint(4)?
            } else {
                cursor.take_byte()? as usize
            };
            let mut field_ids = Vec::with_capacity(count);
            for _ in 0..count {
                field_ids.push(cursor.take_uint(field_id_size)?);
            }
            let mut offsets = Vec::with_capacity(count + 1);
            for _ in 0..=count {
                offsets.push(cursor.take_uint(offset_size)?);
            }
            let values_start = cursor.pos;
            let mut map = IndexMap::with_capacity(count);
            for (idx, field_id) in field_ids.iter().enumerate() {
                let name = dictionary.get(*field_id).ok_or_else(|| {
                    Error::validation(format!(
                        "malformed variant: field id {field_id} outside dictionary"
                    ))
                })?;
                let mut child = Cursor {
                    buf: cursor.buf,
                    pos: values_start + offsets[idx],
                };
                map.insert(name.clone(), decode_value(&mut child, dictionary)?);
            }
            cursor.pos = values_start + offsets[count];
            Ok(Value::Object(map))
        }
        BASIC_ARRAY => {
            let offset_size = ((header >> 2) & 0x03) as usize + 1;
            let large = header & 0x10 != 0;
            let count = if large {
                cursor.take_uint(4)?
            } else {
                cursor.take_byte()? as usize
            };
            let mut offsets = Vec::with_capacity(count + 1);
            for _ in 0..=count {
                offsets.push(cursor.take_uint(offset_size)?);
            }
            let values_start = cursor.pos;
            let mut items = Vec::with_capacity(count);
            for offset in offsets.iter().take(count) {
                let mut child = Cursor {
                    buf: cursor.buf,
                    pos: values_start + offset,
                };
                items.push(decode_value(&mut child, dictionary)?);
            }
            cursor.pos = values_start + offsets[count];
            Ok(Value::Array(items))
        }
        _ => unreachable!("two-bit shape"),
    }
}

fn decode_primitive(type_id: u8, cursor: &mut Cursor<'_>) -> DeltaResult<Value> {
    match type_id {
        PRIM_NULL => Ok(Value::Null),
        PRIM_TRUE => Ok(Value::Bool(true)),
        PRIM_FALSE => Ok(Value::Bool(false)),
        PRIM_INT8 => Ok(Value::I32(i8::from_le_bytes(
            cursor.take(1)?.try_into().unwrap(),
        ) as i32)),
        PRIM_INT16 => Ok(Value::I32(i16::from_le_bytes(
            cursor.take(2)?.try_into().unwrap(),
        ) as i32)),
        PRIM_INT32 => Ok(Value::I32(i32::from_le_bytes(
            cursor.take(4)?.try_into().unwrap(),
        ))),
        PRIM_INT64 => Ok(Value::I64(i64::from_le_bytes(
            cursor.take(8)?.try_into().unwrap(),
        ))),
        PRIM_DOUBLE => Ok(Value::F64(f64::from_le_bytes(
            cursor.take(8)?.try_into().unwrap(),
        ))),
        PRIM_TIMESTAMP => Ok(Value::Ts(i64::from_le_bytes(
            cursor.take(8)?.try_into().unwrap(),
        ))),
        PRIM_BINARY => {
            let len = cursor.take_uint(4)?;
            Ok(Value::Bytes(cursor.take(len)?.to_vec()))
        }
        PRIM_LONG_STR => {
            let len = cursor.take_uint(4)?;
            let bytes = cursor.take(len)?;
            Ok(Value::Str(
                std::str::from_utf8(bytes)
                    .map_err(|_| Error::validation("malformed variant: non-utf8 string"))?
                    .to_string(),
            ))
        }
        other => Err(Error::validation(format!(
            "malformed variant: unknown primitive type {other}"
        ))),
    }
}
