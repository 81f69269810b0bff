//! Columnar file I/O.
//!
//! The engine does not implement the columnar format itself; parquet is the external codec.
//! This module wraps it with a streaming writer that delimits row groups explicitly, computes
//! per-group statistics and zone maps (persisted in the footer key-value metadata), and a
//! reader that prunes row groups and columns and converts record batches back into rows.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub mod convert;
pub mod reader;
pub mod writer;

pub use reader::FileReader;
pub use writer::{ColumnarWriteOptions, CompressionCodec, FinishedFile, StreamingFileWriter};

/// Footer key under which the per-row-group zone maps are stored (JSON, one list per group).
pub const ZONE_MAP_METADATA_KEY: &str = "delta.zoneMaps";
/// Footer key under which the logical schema is stored.
pub const SCHEMA_METADATA_KEY: &str = "delta.schema";

/// Per-column min/max/null summary of one row group. `column` is the *logical* column name
/// (or a shredded variant sub-path like `payload.kind`), so zone maps line up with filters
/// regardless of column mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneMapEntry {
    pub column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<JsonValue>,
    #[serde(rename = "nullCount")]
    pub null_count: u64,
}
