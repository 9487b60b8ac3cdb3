//! Domain types shared by the store, the sync pipeline and the daemon.
//!
//! Records are loosely typed maps (`field name -> Value`); the table schema
//! decides which fields exist and what type each one holds.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Field every telemetry table uses to scope rows to a subject.
pub const OWNER_FIELD: &str = "owner";
/// Default timestamp column (epoch milliseconds, `Long`).
pub const TIMESTAMP_FIELD: &str = "timestamp";
/// Commit flag column: `false` = pending upload, `true` = acknowledged.
pub const COMMITTED_FIELD: &str = "committed";

/// Upper bound on rows per uploaded batch.
pub const MAX_BATCH_SIZE: usize = 1000;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identifier scoping a subject's records within a shared table (e.g. a patient id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for OwnerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Table identity. Tables are created once and cached under this name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName(pub String);

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for TableName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TableName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Tag of the device (or body location) that produces a table's data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceTag(pub String);

impl fmt::Display for DeviceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for DeviceTag {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for DeviceTag {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Store-assigned row identifier, strictly increasing in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Declared column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    UniqueText,
    Integer,
    Real,
    Long,
    Blob,
    Boolean,
}

impl FieldType {
    /// Normalise `value` into the representation this column stores.
    ///
    /// Numeric widening (`Integer` <-> `Long`, either -> `Real`) is allowed;
    /// anything else returns `None`. `Null` is accepted by every column.
    pub fn normalize(self, value: Value) -> Option<Value> {
        match (self, value) {
            (_, Value::Null) => Some(Value::Null),
            (FieldType::Text | FieldType::UniqueText, Value::Text(s)) => Some(Value::Text(s)),
            (FieldType::Integer, Value::Integer(n) | Value::Long(n)) => Some(Value::Integer(n)),
            (FieldType::Long, Value::Integer(n) | Value::Long(n)) => Some(Value::Long(n)),
            (FieldType::Real, Value::Real(f)) => Some(Value::Real(f)),
            (FieldType::Real, Value::Integer(n) | Value::Long(n)) => Some(Value::Real(n as f64)),
            (FieldType::Blob, Value::Blob(b)) => Some(Value::Blob(b)),
            (FieldType::Boolean, Value::Boolean(b)) => Some(Value::Boolean(b)),
            _ => None,
        }
    }

    pub fn is_text(self) -> bool {
        matches!(self, FieldType::Text | FieldType::UniqueText)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Text => "text",
            FieldType::UniqueText => "unique_text",
            FieldType::Integer => "integer",
            FieldType::Real => "real",
            FieldType::Long => "long",
            FieldType::Blob => "blob",
            FieldType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// Upload destination category on the collection server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// One-time profile / ground-truth data.
    Config,
    #[default]
    Data,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Config => write!(f, "config"),
            Category::Data => write!(f, "data"),
        }
    }
}

// ---------------------------------------------------------------------------
// Values and records
// ---------------------------------------------------------------------------

/// A single typed cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Long(i64),
    Real(f64),
    Blob(Vec<u8>),
    Boolean(bool),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) | Value::Long(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(f) => Some(*f),
            Value::Integer(n) | Value::Long(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Ordering used by store conditions. Numbers compare across
    /// `Integer`/`Long`/`Real`; mismatched kinds are incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Blob(a), Value::Blob(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
            },
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Long(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Real(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Blob(b)
    }
}

/// A row's payload: field name -> value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The row's owner, if present and textual.
    pub fn owner(&self) -> Option<&str> {
        self.get(OWNER_FIELD).and_then(Value::as_str)
    }

    pub fn is_committed(&self) -> bool {
        self.get(COMMITTED_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A stored row: its store-assigned id plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub record: Record,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
