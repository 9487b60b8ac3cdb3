//! Table schemas and the built-in catalog of telemetry tables.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::types::{
    Category, DeviceTag, FieldType, TableName, COMMITTED_FIELD, OWNER_FIELD, TIMESTAMP_FIELD,
};

/// One declared column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Declared shape of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: TableName,
    pub device: DeviceTag,
    #[serde(default)]
    pub category: Category,
    pub fields: Vec<Field>,
    /// Column compared against a session's cutoff.
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    /// Key columns for tables that upsert instead of appending.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upsert_key: Vec<String>,
}

fn default_timestamp_field() -> String {
    TIMESTAMP_FIELD.to_string()
}

impl TableSchema {
    /// Start a schema with the mandatory `owner`, `timestamp` and `committed` columns.
    pub fn telemetry(name: &str, device: &str) -> Self {
        Self {
            name: TableName::from(name),
            device: DeviceTag::from(device),
            category: Category::Data,
            fields: vec![
                Field::new(OWNER_FIELD, FieldType::Text),
                Field::new(TIMESTAMP_FIELD, FieldType::Long),
                Field::new(COMMITTED_FIELD, FieldType::Boolean),
            ],
            timestamp_field: default_timestamp_field(),
            upsert_key: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.push(Field::new(name, field_type));
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn timestamp_field(mut self, name: &str) -> Self {
        self.timestamp_field = name.to_string();
        self
    }

    pub fn upsert_on(mut self, key: &[&str]) -> Self {
        self.upsert_key = key.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.field_type)
    }

    pub fn is_upsert(&self) -> bool {
        !self.upsert_key.is_empty()
    }

    /// Check the structural rules every pipeline table must satisfy.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let table = self.name.clone();
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField {
                    table,
                    field: field.name.clone(),
                });
            }
        }

        match self.field_type(OWNER_FIELD) {
            Some(t) if t.is_text() => {}
            _ => return Err(missing(&table, OWNER_FIELD, "text")),
        }
        match self.field_type(&self.timestamp_field) {
            Some(FieldType::Long | FieldType::Integer) => {}
            _ => return Err(missing(&table, &self.timestamp_field, "long")),
        }
        match self.field_type(COMMITTED_FIELD) {
            Some(FieldType::Boolean) => {}
            _ => return Err(missing(&table, COMMITTED_FIELD, "boolean")),
        }
        for key in &self.upsert_key {
            if self.field_type(key).is_none() {
                return Err(SchemaError::UnknownKeyField {
                    table,
                    field: key.clone(),
                });
            }
        }
        Ok(())
    }
}

fn missing(table: &TableName, field: &str, expected: &'static str) -> SchemaError {
    SchemaError::MissingField {
        table: table.clone(),
        field: field.to_string(),
        expected,
    }
}

// ---------------------------------------------------------------------------
// Built-in catalog
// ---------------------------------------------------------------------------

pub const RSSI: &str = "rssi";
pub const SENSORS: &str = "sensors";
pub const GPS: &str = "gps";
pub const GROUND_TRUTH: &str = "ground_truth";
pub const EXTERNAL_SENSOR: &str = "external_sensor";
pub const LOGS: &str = "logs";
pub const PROFILE: &str = "profile";

/// Every table the pipeline knows how to stage and upload.
pub fn builtin() -> Vec<TableSchema> {
    vec![
        TableSchema::telemetry(RSSI, "phone").field("rooms", FieldType::Text),
        TableSchema::telemetry(SENSORS, "watch")
            .field("accel_x", FieldType::Real)
            .field("accel_y", FieldType::Real)
            .field("accel_z", FieldType::Real)
            .field("azimuth", FieldType::Real)
            .field("pitch", FieldType::Real)
            .field("roll", FieldType::Real)
            .field("heart_rate", FieldType::Integer)
            .field("heart_rate_valid", FieldType::Boolean)
            .field("step_count", FieldType::Integer),
        TableSchema::telemetry(GPS, "phone")
            .field("latitude", FieldType::Real)
            .field("longitude", FieldType::Real),
        ground_truth(),
        TableSchema::telemetry(EXTERNAL_SENSOR, "tag")
            .field("device_id", FieldType::Text)
            .field("reading_type", FieldType::Text)
            .field("reading", FieldType::Real)
            .field("x", FieldType::Real)
            .field("y", FieldType::Real)
            .field("z", FieldType::Real),
        TableSchema::telemetry(LOGS, "phone").field("message", FieldType::Text),
        TableSchema::telemetry(PROFILE, "phone")
            .field("key", FieldType::Text)
            .field("value", FieldType::Text)
            .category(Category::Config)
            .upsert_on(&[OWNER_FIELD, "key"]),
    ]
}

/// Ground truth has no `timestamp` column; its `start` bound plays that role.
fn ground_truth() -> TableSchema {
    TableSchema {
        name: TableName::from(GROUND_TRUTH),
        device: DeviceTag::from("phone"),
        category: Category::Config,
        fields: vec![
            Field::new(OWNER_FIELD, FieldType::Text),
            Field::new("type", FieldType::Text),
            Field::new("label", FieldType::Text),
            Field::new("start", FieldType::Long),
            Field::new("end", FieldType::Long),
            Field::new(COMMITTED_FIELD, FieldType::Boolean),
        ],
        timestamp_field: "start".to_string(),
        upsert_key: Vec::new(),
    }
}

/// Look up a built-in schema by table name.
pub fn lookup(name: &str) -> Option<TableSchema> {
    builtin().into_iter().find(|s| s.name.0 == name)
}

/// Names of all built-in tables, in catalog order.
pub fn builtin_names() -> Vec<TableName> {
    builtin().into_iter().map(|s| s.name).collect()
}
