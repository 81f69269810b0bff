//! # delta_table
//!
//! An embeddable, storage-backend-agnostic implementation of the Delta Lake table format:
//! ACID writes, snapshot-isolated reads, time travel, change data capture and background
//! maintenance over any blob store that can do read, write, list, delete and one conditional
//! (compare-and-set) write per object.
//!
//! The persistent form is the Delta Lake protocol: parquet data files plus an append-only
//! JSON transaction log with periodic columnar checkpoints under `_delta_log/`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use delta_table::{DeltaTable, InMemoryBackend, QueryOptions};
//! use serde_json::json;
//!
//! # async fn example() -> delta_table::DeltaResult<()> {
//! let storage = Arc::new(InMemoryBackend::new());
//! let table = DeltaTable::open(storage, "my_table").await?;
//!
//! table
//!     .write(vec![delta_table::row_from_json(&json!({"_id": "1", "v": 1}))])
//!     .await?;
//!
//! let rows = table
//!     .query_all(json!({"v": {"$gte": 1}}), QueryOptions::default())
//!     .await?;
//! assert_eq!(rows.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod actions;
pub mod cdc;
pub mod columnar;
pub mod dv;
pub mod error;
pub mod log;
pub mod maintenance;
pub mod path;
pub mod query;
pub mod retry;
pub mod row;
pub mod schema;
pub mod snapshot;
pub mod storage;
pub mod table;
pub mod table_features;
pub mod table_properties;
pub mod variant;

pub(crate) mod utils;

/// A table version: a dense nonnegative commit counter.
pub type Version = u64;

pub use error::{CdcErrorCode, DeltaResult, Error};
pub use row::{row_from_json, row_to_json, Row, Value};
pub use schema::{ColumnMappingMode, PrimitiveType, Schema, SchemaField};
pub use snapshot::Snapshot;
pub use storage::{FileSystemBackend, InMemoryBackend, StorageBackend};
pub use table::{
    CreateTableBuilder, DeltaTable, DeltaTableOptions, HistoryEntry, MaintenanceContext, Mutation,
    QueryOptions,
};
pub use variant::{decode_variant, encode_variant};
