//! Transaction-log actions.
//!
//! Each committed version is a line-delimited JSON file; every line is a single one-key object
//! whose key names the action: `add`, `remove`, `metaData`, `protocol` or `commitInfo`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::{DeltaResult, Error};
use crate::schema::Schema;
use crate::table_features::{
    ReaderFeature, WriterFeature, SUPPORTED_READER_FEATURES, SUPPORTED_WRITER_FEATURES,
};
use crate::utils::require;

/// Describes a deletion vector attached to an Add or Remove.
///
/// `storage_type` is one of `"u"` (uuid-relative external file), `"p"` (absolute external
/// file) or `"i"` (inline: `path_or_inline_dv` holds the z85-encoded bitmap).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeletionVectorDescriptor {
    pub storage_type: String,
    pub path_or_inline_dv: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i32>,
    pub size_in_bytes: i32,
    pub cardinality: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Add {
    /// Table-relative path of the data file.
    pub path: String,
    #[serde(default)]
    pub partition_values: HashMap<String, Option<String>>,
    pub size: i64,
    pub modification_time: i64,
    pub data_change: bool,
    /// JSON-encoded [`FileStats`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_vector: Option<DeletionVectorDescriptor>,
}

impl Add {
    pub fn parsed_stats(&self) -> Option<FileStats> {
        self.stats
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }

    /// Rows remaining after the deletion vector is applied.
    pub fn live_records(&self) -> Option<i64> {
        let stats = self.parsed_stats()?;
        let deleted = self
            .deletion_vector
            .as_ref()
            .map(|dv| dv.cardinality)
            .unwrap_or(0);
        Some(stats.num_records - deleted)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Remove {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<i64>,
    pub data_change: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended_file_metadata: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_values: Option<HashMap<String, Option<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_vector: Option<DeletionVectorDescriptor>,
}

impl Remove {
    /// The conventional Remove emitted when `add`'s file is retired.
    pub fn for_add(add: &Add, deletion_timestamp: i64, data_change: bool) -> Self {
        Remove {
            path: add.path.clone(),
            deletion_timestamp: Some(deletion_timestamp),
            data_change,
            extended_file_metadata: Some(true),
            partition_values: Some(add.partition_values.clone()),
            size: Some(add.size),
            deletion_vector: add.deletion_vector.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Format {
    pub provider: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Default for Format {
    fn default() -> Self {
        Format {
            provider: "parquet".to_string(),
            options: HashMap::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub format: Format,
    pub schema_string: String,
    #[serde(default)]
    pub partition_columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_time: Option<i64>,
    #[serde(default)]
    pub configuration: HashMap<String, String>,
}

impl Metadata {
    pub fn try_new(
        name: Option<String>,
        schema: &Schema,
        partition_columns: Vec<String>,
        created_time: i64,
        configuration: HashMap<String, String>,
    ) -> DeltaResult<Self> {
        for col in &partition_columns {
            require!(
                schema.field(col).is_some(),
                Error::validation_for(col.clone(), "", "partition column missing from schema")
            );
        }
        Ok(Metadata {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            description: None,
            format: Format::default(),
            schema_string: schema.to_schema_string()?,
            partition_columns,
            created_time: Some(created_time),
            configuration,
        })
    }

    pub fn parse_schema(&self) -> DeltaResult<Schema> {
        Schema::from_schema_string(&self.schema_string)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    pub min_reader_version: i32,
    pub min_writer_version: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reader_features: Option<Vec<ReaderFeature>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writer_features: Option<Vec<WriterFeature>>,
}

impl Protocol {
    /// The baseline protocol for tables using no optional features.
    pub fn base() -> Self {
        Protocol {
            min_reader_version: 1,
            min_writer_version: 2,
            reader_features: None,
            writer_features: None,
        }
    }

    /// A feature-bearing protocol. Reader features require reader version 3; writer features
    /// require writer version 7.
    pub fn with_features(
        reader_features: Vec<ReaderFeature>,
        writer_features: Vec<WriterFeature>,
    ) -> Self {
        Protocol {
            min_reader_version: if reader_features.is_empty() { 1 } else { 3 },
            min_writer_version: if writer_features.is_empty() { 2 } else { 7 },
            reader_features: (!reader_features.is_empty()).then_some(reader_features),
            writer_features: (!writer_features.is_empty()).then_some(writer_features),
        }
    }

    pub fn has_writer_feature(&self, feature: &WriterFeature) -> bool {
        self.writer_features
            .as_ref()
            .is_some_and(|fs| fs.contains(feature))
    }

    pub fn ensure_read_supported(&self) -> DeltaResult<()> {
        if let Some(features) = &self.reader_features {
            for feature in features {
                require!(
                    SUPPORTED_READER_FEATURES.contains(feature),
                    Error::validation(format!("unsupported reader feature '{feature}'"))
                );
            }
        }
        require!(
            self.min_reader_version <= 3,
            Error::validation(format!(
                "unsupported minReaderVersion {}",
                self.min_reader_version
            ))
        );
        Ok(())
    }

    pub fn ensure_write_supported(&self) -> DeltaResult<()> {
        if let Some(features) = &self.writer_features {
            for feature in features {
                require!(
                    SUPPORTED_WRITER_FEATURES.contains(feature),
                    Error::validation(format!("unsupported writer feature '{feature}'"))
                );
            }
        }
        require!(
            self.min_writer_version <= 7,
            Error::validation(format!(
                "unsupported minWriterVersion {}",
                self.min_writer_version
            ))
        );
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub timestamp: i64,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_parameters: Option<HashMap<String, JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_blind_append: Option<bool>,
}

impl CommitInfo {
    pub fn new(timestamp: i64, operation: impl Into<String>) -> Self {
        CommitInfo {
            timestamp,
            operation: operation.into(),
            operation_parameters: None,
            read_version: None,
            isolation_level: Some("Serializable".to_string()),
            is_blind_append: None,
        }
    }

    pub fn with_parameters(mut self, parameters: HashMap<String, JsonValue>) -> Self {
        self.operation_parameters = Some(parameters);
        self
    }

    pub fn with_read_version(mut self, version: i64) -> Self {
        self.read_version = Some(version);
        self
    }

    pub fn with_blind_append(mut self, blind: bool) -> Self {
        self.is_blind_append = Some(blind);
        self
    }
}

/// One transaction-log line. Externally tagged, so the serde representation is exactly the
/// one-key wire object.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Action {
    #[serde(rename = "add")]
    Add(Add),
    #[serde(rename = "remove")]
    Remove(Remove),
    #[serde(rename = "metaData")]
    Metadata(Metadata),
    #[serde(rename = "protocol")]
    Protocol(Protocol),
    #[serde(rename = "commitInfo")]
    CommitInfo(CommitInfo),
}

impl Action {
    pub fn as_add(&self) -> Option<&Add> {
        match self {
            Action::Add(add) => Some(add),
            _ => None,
        }
    }

    pub fn as_remove(&self) -> Option<&Remove> {
        match self {
            Action::Remove(remove) => Some(remove),
            _ => None,
        }
    }
}

/// Serialize a commit body: one JSON object per line.
pub fn serialize_actions(actions: &[Action]) -> DeltaResult<String> {
    let mut lines = Vec::with_capacity(actions.len());
    for action in actions {
        lines.push(serde_json::to_string(action)?);
    }
    Ok(lines.join("\n"))
}

/// Parse a commit body. Blank lines are tolerated.
pub fn parse_actions(body: &str) -> DeltaResult<Vec<Action>> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}

/// Per-file statistics serialized into `Add.stats`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    pub num_records: i64,
    #[serde(default)]
    pub min_values: JsonMap<String, JsonValue>,
    #[serde(default)]
    pub max_values: JsonMap<String, JsonValue>,
    #[serde(default)]
    pub null_count: HashMap<String, i64>,
}

impl FileStats {
    pub fn to_json_string(&self) -> DeltaResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
