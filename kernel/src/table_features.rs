//! Reader/writer table features.
//!
//! Features communicate capabilities that must be implemented in order to correctly read or
//! write a given table. Readers must respect every feature listed in a table's
//! `readerFeatures`; writers likewise for `writerFeatures`. Unknown entries survive
//! round-tripping via the `Unknown` variant so we never mangle another writer's protocol.

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display as StrumDisplay, EnumString};

#[derive(
    Serialize, Deserialize, Debug, Clone, Eq, PartialEq, EnumString, StrumDisplay, AsRefStr, Hash,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum ReaderFeature {
    /// Mapping of one column to another
    ColumnMapping,
    /// Deletion vectors for merge, update, delete
    DeletionVectors,
    /// Semi-structured values stored in variant encoding
    VariantType,
    #[serde(untagged)]
    #[strum(default)]
    Unknown(String),
}

#[derive(
    Serialize, Deserialize, Debug, Clone, Eq, PartialEq, EnumString, StrumDisplay, AsRefStr, Hash,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum WriterFeature {
    /// Mapping of one column to another
    ColumnMapping,
    /// Deletion vectors for merge, update, delete
    DeletionVectors,
    /// CDF on a table
    ChangeDataFeed,
    /// Semi-structured values stored in variant encoding
    VariantType,
    #[serde(untagged)]
    #[strum(default)]
    Unknown(String),
}

pub(crate) static SUPPORTED_READER_FEATURES: LazyLock<Vec<ReaderFeature>> = LazyLock::new(|| {
    vec![
        ReaderFeature::ColumnMapping,
        ReaderFeature::DeletionVectors,
        ReaderFeature::VariantType,
    ]
});

pub(crate) static SUPPORTED_WRITER_FEATURES: LazyLock<Vec<WriterFeature>> = LazyLock::new(|| {
    vec![
        WriterFeature::ColumnMapping,
        WriterFeature::DeletionVectors,
        WriterFeature::ChangeDataFeed,
        WriterFeature::VariantType,
    ]
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_and_unknown_features() {
        let features = vec![
            ReaderFeature::DeletionVectors,
            ReaderFeature::Unknown("cool_feature".to_string()),
            ReaderFeature::ColumnMapping,
        ];
        let s = serde_json::to_string(&features).unwrap();
        assert_eq!(s, r#"["deletionVectors","cool_feature","columnMapping"]"#);
        let parsed: Vec<ReaderFeature> = serde_json::from_str(&s).unwrap();
        assert_eq!(parsed, features);
    }

    #[test]
    fn strum_and_serde_agree() {
        assert_eq!(WriterFeature::ChangeDataFeed.to_string(), "changeDataFeed");
        let parsed: WriterFeature = "changeDataFeed".parse().unwrap();
        assert_eq!(parsed, WriterFeature::ChangeDataFeed);
    }
}
