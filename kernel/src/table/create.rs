//! Builder for creating a delta table.
//!
//! Writes commit 0 (Protocol, Metadata, CommitInfo) to `_delta_log/` and hands back an open
//! handle. Validation is lazy: it happens on `create()`, not while configuring the builder.

use std::collections::HashMap;
use std::sync::Arc;

use crate::actions::{Action, CommitInfo, Metadata};
use crate::error::{DeltaResult, Error};
use crate::schema::{assign_physical_names, ColumnMappingMode, Schema};
use crate::storage::StorageBackend;
use crate::table::write::required_protocol;
use crate::table::{BootstrapConfig, DeltaTable, DeltaTableOptions};
use crate::table_properties::{
    COLUMN_MAPPING_MODE_KEY, ENABLE_CHANGE_DATA_FEED_KEY, PARTITION_COLUMNS_KEY,
};
use crate::utils::current_time_millis;

const CREATE_OPERATION: &str = "CREATE TABLE";

#[derive(Debug)]
pub struct CreateTableBuilder {
    table_root: String,
    schema: Option<Schema>,
    partition_columns: Vec<String>,
    table_name: Option<String>,
    configuration: HashMap<String, String>,
    change_data_feed: bool,
    deletion_vectors: bool,
    column_mapping: ColumnMappingMode,
    timestamp: Option<i64>,
    options: DeltaTableOptions,
}

impl CreateTableBuilder {
    pub(crate) fn new(table_root: String) -> Self {
        CreateTableBuilder {
            table_root,
            schema: None,
            partition_columns: Vec::new(),
            table_name: None,
            configuration: HashMap::new(),
            change_data_feed: false,
            deletion_vectors: false,
            column_mapping: ColumnMappingMode::None,
            timestamp: None,
            options: DeltaTableOptions::default(),
        }
    }

    /// Declare the schema up front. Without one, the first write infers it and emits the
    /// Metadata then.
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_partition_columns(
        mut self,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.partition_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = Some(name.into());
        self
    }

    pub fn with_configuration(mut self, configuration: HashMap<String, String>) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_change_data_feed(mut self, enabled: bool) -> Self {
        self.change_data_feed = enabled;
        self
    }

    pub fn with_deletion_vectors(mut self, enabled: bool) -> Self {
        self.deletion_vectors = enabled;
        self
    }

    pub fn with_column_mapping(mut self, mode: ColumnMappingMode) -> Self {
        self.column_mapping = mode;
        self
    }

    /// Commit timestamp override (ms since epoch); defaults to now.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_options(mut self, options: DeltaTableOptions) -> Self {
        self.options = options;
        self
    }

    /// Create the table and return an open handle at version 0 (or, with no schema declared,
    /// a handle whose first write will bootstrap the table).
    pub async fn create(self, storage: Arc<dyn StorageBackend>) -> DeltaResult<DeltaTable> {
        let mut options = self.options;
        options.deletion_vectors = options.deletion_vectors || self.deletion_vectors;
        options.bootstrap = BootstrapConfig {
            partition_columns: self.partition_columns.clone(),
            enable_change_data_feed: self.change_data_feed,
            enable_deletion_vectors: self.deletion_vectors,
            column_mapping_mode: self.column_mapping,
            table_name: self.table_name.clone(),
            extra_configuration: self.configuration.clone(),
        };

        let Some(mut schema) = self.schema else {
            // deferred creation: just hand back a handle carrying the bootstrap config
            return DeltaTable::open_with_options(storage, self.table_root, options).await;
        };

        if self.column_mapping != ColumnMappingMode::None {
            assign_physical_names(&mut schema);
        }
        let mut configuration = self.configuration;
        if !self.partition_columns.is_empty() {
            configuration.insert(
                PARTITION_COLUMNS_KEY.to_string(),
                self.partition_columns.join(","),
            );
        }
        if self.change_data_feed {
            configuration.insert(ENABLE_CHANGE_DATA_FEED_KEY.to_string(), "true".to_string());
        }
        if self.column_mapping != ColumnMappingMode::None {
            configuration.insert(
                COLUMN_MAPPING_MODE_KEY.to_string(),
                self.column_mapping.to_string(),
            );
        }

        let timestamp = self.timestamp.unwrap_or_else(current_time_millis);
        let metadata = Metadata::try_new(
            self.table_name,
            &schema,
            self.partition_columns.clone(),
            timestamp,
            configuration,
        )?;
        let protocol = required_protocol(
            &schema,
            self.change_data_feed,
            self.deletion_vectors,
            self.column_mapping,
        );
        protocol.ensure_read_supported()?;
        protocol.ensure_write_supported()?;

        let log = crate::log::LogStore::new(storage.clone(), self.table_root.clone());
        let actions = vec![
            Action::CommitInfo(CommitInfo::new(timestamp, CREATE_OPERATION)),
            Action::Protocol(protocol),
            Action::Metadata(metadata),
        ];
        log.try_commit(0, &actions).await.map_err(|e| {
            if e.is_concurrency() {
                Error::validation(format!(
                    "table already exists at '{}'",
                    self.table_root
                ))
            } else {
                e
            }
        })?;

        DeltaTable::open_with_options(storage, self.table_root, options).await
    }
}
