//! Typed view over the `delta.*` keys of Metadata `configuration`.

use std::collections::HashMap;

use crate::schema::ColumnMappingMode;

pub const PARTITION_COLUMNS_KEY: &str = "delta.partitionColumns";
pub const ENABLE_CHANGE_DATA_FEED_KEY: &str = "delta.enableChangeDataFeed";
pub const COLUMN_MAPPING_MODE_KEY: &str = "delta.columnMapping.mode";
pub const CHECKPOINT_INTERVAL_KEY: &str = "delta.checkpointInterval";
pub const VACUUM_RETENTION_KEY: &str = "delta.vacuum.retentionDuration";

pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10;
/// Seven days, in milliseconds.
pub const DEFAULT_VACUUM_RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct TableProperties {
    /// Comma-separated in the configuration; also mirrored in Metadata.partitionColumns.
    pub partition_columns: Vec<String>,
    pub enable_change_data_feed: bool,
    pub column_mapping_mode: ColumnMappingMode,
    pub checkpoint_interval: u64,
    pub vacuum_retention_ms: i64,
}

impl Default for TableProperties {
    fn default() -> Self {
        TableProperties {
            partition_columns: Vec::new(),
            enable_change_data_feed: false,
            column_mapping_mode: ColumnMappingMode::None,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            vacuum_retention_ms: DEFAULT_VACUUM_RETENTION_MS,
        }
    }
}

impl From<&HashMap<String, String>> for TableProperties {
    fn from(configuration: &HashMap<String, String>) -> Self {
        let defaults = TableProperties::default();
        TableProperties {
            partition_columns: configuration
                .get(PARTITION_COLUMNS_KEY)
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            enable_change_data_feed: configuration
                .get(ENABLE_CHANGE_DATA_FEED_KEY)
                .is_some_and(|v| v == "true"),
            column_mapping_mode: configuration
                .get(COLUMN_MAPPING_MODE_KEY)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            checkpoint_interval: configuration
                .get(CHECKPOINT_INTERVAL_KEY)
                .and_then(|v| v.parse().ok())
                .filter(|interval| *interval > 0)
                .unwrap_or(defaults.checkpoint_interval),
            vacuum_retention_ms: configuration
                .get(VACUUM_RETENTION_KEY)
                .and_then(|v| v.parse().ok())
                .filter(|ms| *ms >= 0)
                .unwrap_or(defaults.vacuum_retention_ms),
        }
    }
}
