//! Path construction and parsing for everything the engine lays out on storage.
//!
//! Layout relative to the table root:
//! - `_delta_log/<20-digit version>.json` - commits
//! - `_delta_log/<20-digit version>.checkpoint.parquet` (or `.<part>.<total>.parquet`)
//! - `_delta_log/_last_checkpoint`
//! - `part-<counter>-<uuid>.parquet`, under `col=value/` prefixes when partitioned
//! - `_change_data/cdc-<20-digit version>.parquet`
//! - `deletion_vector_<uuid>.bin`

use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use crate::row::Value;
use crate::storage::join_path;
use crate::Version;

pub const DELTA_LOG_DIR: &str = "_delta_log";
pub const CHANGE_DATA_DIR: &str = "_change_data";
pub const LAST_CHECKPOINT_FILE_NAME: &str = "_last_checkpoint";
/// Literal used for null partition values in Hive-style paths.
pub const HIVE_DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

static COMMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{20})\.json$").unwrap());
static CHECKPOINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{20})\.checkpoint\.parquet$").unwrap());
static MULTIPART_CHECKPOINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{20})\.checkpoint\.(\d+)\.(\d+)\.parquet$").unwrap());
static CDC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^cdc-(\d{20})\.parquet$").unwrap());

/// What kind of log file a parsed name denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFileType {
    Commit,
    Checkpoint,
    MultiPartCheckpoint { part: u32, total: u32 },
}

/// A successfully parsed `_delta_log` file name.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLogPath {
    /// Path relative to the table root.
    pub path: String,
    pub version: Version,
    pub file_type: LogFileType,
}

impl ParsedLogPath {
    /// Parse a path relative to the table root. Non-log files return `None`.
    pub fn try_parse(path: &str) -> Option<ParsedLogPath> {
        let file_name = path.strip_prefix(&format!("{DELTA_LOG_DIR}/"))?;
        if let Some(caps) = COMMIT_RE.captures(file_name) {
            return Some(ParsedLogPath {
                path: path.to_string(),
                version: caps[1].parse().ok()?,
                file_type: LogFileType::Commit,
            });
        }
        if let Some(caps) = CHECKPOINT_RE.captures(file_name) {
            return Some(ParsedLogPath {
                path: path.to_string(),
                version: caps[1].parse().ok()?,
                file_type: LogFileType::Checkpoint,
            });
        }
        if let Some(caps) = MULTIPART_CHECKPOINT_RE.captures(file_name) {
            return Some(ParsedLogPath {
                path: path.to_string(),
                version: caps[1].parse().ok()?,
                file_type: LogFileType::MultiPartCheckpoint {
                    part: caps[2].parse().ok()?,
                    total: caps[3].parse().ok()?,
                },
            });
        }
        None
    }

    pub fn is_commit(&self) -> bool {
        self.file_type == LogFileType::Commit
    }

    pub fn is_checkpoint(&self) -> bool {
        !self.is_commit()
    }
}

pub fn log_dir(table_root: &str) -> String {
    join_path(table_root, DELTA_LOG_DIR)
}

pub fn commit_path(table_root: &str, version: Version) -> String {
    join_path(table_root, &format!("{DELTA_LOG_DIR}/{version:020}.json"))
}

pub fn checkpoint_path(table_root: &str, version: Version) -> String {
    join_path(
        table_root,
        &format!("{DELTA_LOG_DIR}/{version:020}.checkpoint.parquet"),
    )
}

pub fn multipart_checkpoint_path(
    table_root: &str,
    version: Version,
    part: u32,
    total: u32,
) -> String {
    join_path(
        table_root,
        &format!("{DELTA_LOG_DIR}/{version:020}.checkpoint.{part}.{total}.parquet"),
    )
}

pub fn last_checkpoint_path(table_root: &str) -> String {
    join_path(
        table_root,
        &format!("{DELTA_LOG_DIR}/{LAST_CHECKPOINT_FILE_NAME}"),
    )
}

pub fn cdc_path(table_root: &str, version: Version) -> String {
    join_path(
        table_root,
        &format!("{CHANGE_DATA_DIR}/cdc-{version:020}.parquet"),
    )
}

/// Parse `cdc-<version>.parquet` file names (path relative to the table root).
pub fn parse_cdc_path(path: &str) -> Option<Version> {
    let file_name = path.strip_prefix(&format!("{CHANGE_DATA_DIR}/"))?;
    CDC_RE.captures(file_name)?[1].parse().ok()
}

/// A fresh data file name: `part-<counter>-<uuid>.parquet`, optionally under a partition
/// prefix (which must already end in `/` or be empty).
pub fn data_file_name(partition_prefix: &str, counter: usize) -> String {
    format!(
        "{partition_prefix}part-{counter:05}-{}.parquet",
        Uuid::new_v4()
    )
}

pub fn deletion_vector_file_name(uuid: &Uuid) -> String {
    format!("deletion_vector_{uuid}.bin")
}

/// Render one `col=value/` Hive-style path segment. Values are percent-encoded so the result
/// is URL-safe; nulls use the Hive default-partition literal.
pub fn partition_segment(column: &str, value: &Value) -> String {
    match value.partition_string() {
        Some(v) => format!("{column}={}/", urlencoding::encode(&v)),
        None => format!("{column}={HIVE_DEFAULT_PARTITION}/"),
    }
}

/// Render the full nested partition prefix for a row's partition values, in column order.
pub fn partition_prefix(columns: &[String], values: &[Value]) -> String {
    columns
        .iter()
        .zip(values)
        .map(|(col, v)| partition_segment(col, v))
        .collect()
}

/// The stringified partition value stored in an Add action's `partitionValues` map.
pub fn partition_value_string(value: &Value) -> Option<String> {
    value.partition_string()
}
