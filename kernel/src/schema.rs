//! Table schemas.
//!
//! A schema is an ordered list of named, nullable, primitive-or-variant fields. It is either
//! declared by the caller on the first write or inferred from the first batch of rows; after
//! that, appends must match it up to the single permitted widening (int32 → double).
//!
//! The serialized form is the `schemaString` carried by Metadata actions:
//! `{"type":"struct","fields":[{"name":...,"type":...,"nullable":...,"metadata":{...}}]}`.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strum::{Display as StrumDisplay, EnumString};

use crate::error::{DeltaResult, Error};
use crate::row::{Row, Value};
use crate::utils::require;

/// Schema-field metadata key holding the physical column name under column mapping.
pub const COLUMN_MAPPING_PHYSICAL_NAME_KEY: &str = "delta.columnMapping.physicalName";
/// Schema-field metadata key holding the stable column id under column mapping.
pub const COLUMN_MAPPING_ID_KEY: &str = "delta.columnMapping.id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    Boolean,
    Integer,
    Long,
    Double,
    String,
    Binary,
    Timestamp,
    Variant,
}

impl PrimitiveType {
    /// The type a value naturally carries, or `None` for null.
    pub fn of_value(value: &Value) -> Option<PrimitiveType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(PrimitiveType::Boolean),
            Value::I32(_) => Some(PrimitiveType::Integer),
            Value::I64(_) => Some(PrimitiveType::Long),
            Value::F64(_) => Some(PrimitiveType::Double),
            Value::Str(_) => Some(PrimitiveType::String),
            Value::Bytes(_) => Some(PrimitiveType::Binary),
            Value::Ts(_) => Some(PrimitiveType::Timestamp),
            Value::Array(_) | Value::Object(_) => Some(PrimitiveType::Variant),
        }
    }

    /// Whether a value of type `incoming` may be stored in a column of type `self`.
    /// Exact matches always pass; int32 additionally widens into double.
    pub fn accepts(&self, incoming: PrimitiveType) -> bool {
        *self == incoming || (*self == PrimitiveType::Double && incoming == PrimitiveType::Integer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: PrimitiveType,
    pub nullable: bool,
    #[serde(default)]
    pub metadata: HashMap<String, JsonValue>,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, data_type: PrimitiveType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
            metadata: HashMap::new(),
        }
    }

    pub fn nullable(name: impl Into<String>, data_type: PrimitiveType) -> Self {
        Self::new(name, data_type, true)
    }

    /// Physical column name for this field: the mapped name when column mapping assigned one,
    /// the logical name otherwise.
    pub fn physical_name(&self) -> &str {
        match self.metadata.get(COLUMN_MAPPING_PHYSICAL_NAME_KEY) {
            Some(JsonValue::String(s)) => s,
            _ => &self.name,
        }
    }
}

fn struct_tag() -> String {
    "struct".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type", default = "struct_tag")]
    kind: String,
    pub fields: Vec<SchemaField>,
}

impl Schema {
    pub fn new(fields: impl Into<Vec<SchemaField>>) -> Self {
        Self {
            kind: struct_tag(),
            fields: fields.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn to_schema_string(&self) -> DeltaResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_schema_string(s: &str) -> DeltaResult<Schema> {
        let schema: Schema = serde_json::from_str(s)?;
        require!(
            schema.kind == "struct",
            Error::validation(format!("schema root must be a struct, got '{}'", schema.kind))
        );
        Ok(schema)
    }

    /// Validate a row against this schema for an append. Every row field must name a schema
    /// field of a compatible type; schema fields absent from the row must be nullable.
    pub fn validate_row(&self, row: &Row) -> DeltaResult<()> {
        for (name, value) in row {
            let field = self.field(name).ok_or_else(|| {
                Error::validation_for(name.clone(), "", "field does not exist in table schema")
            })?;
            match PrimitiveType::of_value(value) {
                None => require!(
                    field.nullable,
                    Error::validation_for(name.clone(), "null", "field is not nullable")
                ),
                Some(t) => require!(
                    field.data_type.accepts(t),
                    Error::validation_for(
                        name.clone(),
                        format!("{t:?}"),
                        format!("type mismatch: column is {:?}", field.data_type)
                    )
                ),
            }
        }
        for field in &self.fields {
            if !row.contains_key(&field.name) {
                require!(
                    field.nullable,
                    Error::validation_for(
                        field.name.clone(),
                        "",
                        "missing value for non-nullable field"
                    )
                );
            }
        }
        Ok(())
    }
}

/// Incrementally infers a schema from a batch of rows.
///
/// The first row fixes the field set; subsequent rows must carry exactly the same fields.
/// Nulls leave a field's type undecided until a later non-null value settles it; fields that
/// stay all-null end up as nullable variant columns.
#[derive(Debug, Clone, Default)]
pub struct SchemaBuilder {
    fields: IndexMap<String, (Option<PrimitiveType>, bool)>,
    initialized: bool,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the builder with an explicit schema; observed rows are then only validated.
    pub fn with_schema(schema: &Schema) -> Self {
        Self {
            fields: schema
                .fields
                .iter()
                .map(|f| (f.name.clone(), (Some(f.data_type), f.nullable)))
                .collect(),
            initialized: true,
        }
    }

    pub fn observe_row(&mut self, row: &Row) -> DeltaResult<()> {
        if !self.initialized {
            for (name, value) in row {
                let inferred = PrimitiveType::of_value(value);
                self.fields
                    .insert(name.clone(), (inferred, inferred.is_none()));
            }
            self.initialized = true;
            return Ok(());
        }

        require!(
            row.len() == self.fields.len() && row.keys().all(|k| self.fields.contains_key(k)),
            Error::validation("field set must be stable across rows within a single write batch")
        );

        for (name, value) in row {
            let (current, nullable) = self.fields.get_mut(name).expect("field set checked above");
            match PrimitiveType::of_value(value) {
                None => *nullable = true,
                Some(incoming) => match *current {
                    None => *current = Some(incoming),
                    Some(existing) if existing.accepts(incoming) => {}
                    // the single permitted widening: int32 observed first, double later
                    Some(PrimitiveType::Integer) if incoming == PrimitiveType::Double => {
                        *current = Some(PrimitiveType::Double)
                    }
                    Some(existing) => {
                        return Err(Error::validation_for(
                            name.clone(),
                            format!("{incoming:?}"),
                            format!("type mismatch: inferred {existing:?}"),
                        ))
                    }
                },
            }
        }
        Ok(())
    }

    pub fn finish(self) -> DeltaResult<Schema> {
        require!(
            self.initialized,
            Error::validation("cannot infer a schema from an empty batch")
        );
        let fields = self
            .fields
            .into_iter()
            .map(|(name, (data_type, nullable))| SchemaField {
                name,
                data_type: data_type.unwrap_or(PrimitiveType::Variant),
                nullable,
                metadata: HashMap::new(),
            })
            .collect::<Vec<_>>();
        Ok(Schema::new(fields))
    }
}

/// `delta.columnMapping.mode` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, StrumDisplay)]
#[strum(serialize_all = "lowercase")]
pub enum ColumnMappingMode {
    #[default]
    None,
    Name,
    Id,
}

/// Bidirectional logical ↔ physical column-name map derived from schema-field metadata.
#[derive(Debug, Clone, Default)]
pub struct ColumnMapping {
    logical_to_physical: HashMap<String, String>,
    physical_to_logical: HashMap<String, String>,
}

impl ColumnMapping {
    pub fn from_schema(schema: &Schema, mode: ColumnMappingMode) -> Self {
        if mode == ColumnMappingMode::None {
            return Self::default();
        }
        let mut mapping = Self::default();
        for field in &schema.fields {
            let physical = field.physical_name().to_string();
            mapping
                .logical_to_physical
                .insert(field.name.clone(), physical.clone());
            mapping.physical_to_logical.insert(physical, field.name.clone());
        }
        mapping
    }

    pub fn is_identity(&self) -> bool {
        self.logical_to_physical.is_empty()
    }

    pub fn physical<'a>(&'a self, logical: &'a str) -> &'a str {
        self.logical_to_physical
            .get(logical)
            .map(String::as_str)
            .unwrap_or(logical)
    }

    pub fn logical<'a>(&'a self, physical: &'a str) -> &'a str {
        self.physical_to_logical
            .get(physical)
            .map(String::as_str)
            .unwrap_or(physical)
    }

    /// Rename a row's physical keys back to their logical names.
    pub fn rename_to_logical(&self, row: Row) -> Row {
        if self.is_identity() {
            return row;
        }
        row.into_iter()
            .map(|(k, v)| (self.logical(&k).to_string(), v))
            .collect()
    }
}

/// Stamp fresh physical names and ids into a schema's field metadata. Used once, when a table
/// is created with `delta.columnMapping.mode` set.
pub fn assign_physical_names(schema: &mut Schema) {
    for (idx, field) in schema.fields.iter_mut().enumerate() {
        field.metadata.insert(
            COLUMN_MAPPING_PHYSICAL_NAME_KEY.to_string(),
            JsonValue::String(format!("col-{}", uuid::Uuid::new_v4())),
        );
        field
            .metadata
            .insert(COLUMN_MAPPING_ID_KEY.to_string(), JsonValue::from(idx as i64 + 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn infers_types_from_first_row() {
        let mut b = SchemaBuilder::new();
        b.observe_row(&row(&[
            ("flag", Value::Bool(true)),
            ("n", Value::I32(1)),
            ("big", Value::I64(i64::MAX)),
            ("f", Value::F64(1.5)),
            ("s", Value::Str("x".into())),
            ("nested", Value::Array(vec![Value::I32(1)])),
        ]))
        .unwrap();
        let schema = b.finish().unwrap();
        assert_eq!(schema.field("flag").unwrap().data_type, PrimitiveType::Boolean);
        assert_eq!(schema.field("n").unwrap().data_type, PrimitiveType::Integer);
        assert_eq!(schema.field("big").unwrap().data_type, PrimitiveType::Long);
        assert_eq!(schema.field("f").unwrap().data_type, PrimitiveType::Double);
        assert_eq!(schema.field("nested").unwrap().data_type, PrimitiveType::Variant);
    }

    #[test]
    fn widens_int32_to_double() {
        let mut b = SchemaBuilder::new();
        b.observe_row(&row(&[("v", Value::I32(1))])).unwrap();
        b.observe_row(&row(&[("v", Value::F64(2.5))])).unwrap();
        let schema = b.finish().unwrap();
        assert_eq!(schema.field("v").unwrap().data_type, PrimitiveType::Double);
    }

    #[test]
    fn rejects_field_set_mismatch() {
        let mut b = SchemaBuilder::new();
        b.observe_row(&row(&[("a", Value::I32(1))])).unwrap();
        let err = b
            .observe_row(&row(&[("a", Value::I32(1)), ("b", Value::I32(2))]))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn rejects_incompatible_types() {
        let mut b = SchemaBuilder::new();
        b.observe_row(&row(&[("a", Value::Str("x".into()))])).unwrap();
        let err = b.observe_row(&row(&[("a", Value::I32(1))])).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn nulls_relax_nullability() {
        let mut b = SchemaBuilder::new();
        b.observe_row(&row(&[("a", Value::I32(1))])).unwrap();
        assert!(!b.clone().finish().unwrap().field("a").unwrap().nullable);
        b.observe_row(&row(&[("a", Value::Null)])).unwrap();
        assert!(b.finish().unwrap().field("a").unwrap().nullable);
    }

    #[test]
    fn schema_string_round_trip() {
        let schema = Schema::new(vec![
            SchemaField::new("id", PrimitiveType::String, false),
            SchemaField::nullable("v", PrimitiveType::Integer),
        ]);
        let s = schema.to_schema_string().unwrap();
        assert_eq!(Schema::from_schema_string(&s).unwrap(), schema);
    }

    #[test]
    fn column_mapping_renames_physical_keys() {
        let mut schema = Schema::new(vec![SchemaField::nullable("id", PrimitiveType::String)]);
        assign_physical_names(&mut schema);
        let physical = schema.fields[0].physical_name().to_string();
        assert!(physical.starts_with("col-"));

        let mapping = ColumnMapping::from_schema(&schema, ColumnMappingMode::Name);
        let physical_row: Row = [(physical, Value::Str("a".into()))].into_iter().collect();
        let logical_row = mapping.rename_to_logical(physical_row);
        assert!(logical_row.contains_key("id"));
    }
}
