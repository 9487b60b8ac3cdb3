//! Ingestion of records relayed from companion devices.
//!
//! Wearables and tags hand their records to the primary device as small
//! JSON messages. Each one is staged into the local store first and only
//! then purged at its source, so a crash between the two steps leaves a
//! duplicate rather than a loss.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tether_core::{
    FieldType, Record, RowId, TableName, TableSchema, Value, COMMITTED_FIELD, OWNER_FIELD,
};
use tether_store::{Conditions, RecordStore};

use crate::error::{RelayError, SourceError};

/// Identifies a message at its source so it can be purged there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayToken {
    pub source_device: String,
    pub sequence: u64,
}

impl fmt::Display for RelayToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source_device, self.sequence)
    }
}

/// One relayed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub table: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub token: RelayToken,
}

impl RelayMessage {
    pub fn from_json(bytes: &[u8]) -> Result<Self, RelayError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Where a relayed message came from. Purging must be idempotent.
#[async_trait]
pub trait RelaySource: Send + Sync {
    async fn purge(&self, token: &RelayToken) -> Result<(), SourceError>;
}

/// A message delivered as a file in the relay inbox. Purging deletes it.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and decode the message file.
    pub async fn read(&self) -> Result<RelayMessage, RelayError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| RelayError::Io {
                path: self.path.clone(),
                source,
            })?;
        RelayMessage::from_json(&bytes)
    }
}

#[async_trait]
impl RelaySource for FileSource {
    async fn purge(&self, _token: &RelayToken) -> Result<(), SourceError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SourceError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Result of a successful ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub table: TableName,
    pub row: RowId,
    pub token: RelayToken,
}

/// Stages relayed messages and purges them at their source.
#[derive(Clone)]
pub struct RelayIngester {
    store: Arc<dyn RecordStore>,
}

impl RelayIngester {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Stage `message`, then purge it at `source`.
    ///
    /// Staging failure leaves the source untouched. Purge failure leaves the
    /// staged row in place, uncommitted; the caller may purge again later.
    pub async fn ingest(
        &self,
        message: RelayMessage,
        source: &dyn RelaySource,
    ) -> Result<RelayOutcome, RelayError> {
        let token = message.token.clone();
        let table = TableName::from(message.table.as_str());
        let schema = self.store.schema(&table).ok_or_else(|| RelayError::Routing {
            token: token.clone(),
            reason: format!("unknown table {table}"),
        })?;
        let record = to_record(&schema, message.fields).map_err(|reason| RelayError::Routing {
            token: token.clone(),
            reason,
        })?;

        let row = self.stage(&schema, record).await.map_err(|e| match e {
            StageFailure::Store(source) => RelayError::Staging {
                token: token.clone(),
                source,
            },
            StageFailure::Join(msg) => RelayError::Join(msg),
        })?;
        tracing::debug!(table = %table, row = %row, token = %token, "staged relay message");

        if let Err(err) = source.purge(&token).await {
            tracing::warn!(table = %table, row = %row, token = %token, error = %err, "relay purge failed");
            return Err(RelayError::Purge {
                token,
                row,
                source: err,
            });
        }

        Ok(RelayOutcome { table, row, token })
    }

    /// Ingest a message file; the file itself is the source and is deleted
    /// once staged.
    pub async fn ingest_file(&self, path: &Path) -> Result<RelayOutcome, RelayError> {
        let source = FileSource::new(path);
        let message = source.read().await?;
        self.ingest(message, &source).await
    }

    async fn stage(&self, schema: &TableSchema, record: Record) -> Result<RowId, StageFailure> {
        let store = self.store.clone();
        let table = schema.name.clone();
        let key = upsert_conditions(schema, &record);
        tokio::task::spawn_blocking(move || match key {
            Some(key) => store.upsert(&table, &key, record),
            None => store.insert(&table, record),
        })
        .await
        .map_err(|e| StageFailure::Join(e.to_string()))?
        .map_err(StageFailure::Store)
    }
}

enum StageFailure {
    Store(tether_store::StoreError),
    Join(String),
}

fn upsert_conditions(schema: &TableSchema, record: &Record) -> Option<Conditions> {
    if !schema.is_upsert() {
        return None;
    }
    let mut key = Conditions::new();
    for field in &schema.upsert_key {
        let value = record.get(field).cloned().unwrap_or(Value::Null);
        key = key.eq(field, value);
    }
    Some(key)
}

/// Convert a JSON payload into a typed record for `schema`.
///
/// The commit flag is never taken from the wire.
fn to_record(
    schema: &TableSchema,
    fields: serde_json::Map<String, serde_json::Value>,
) -> Result<Record, String> {
    let mut record = Record::new();
    for (name, json) in fields {
        if name == COMMITTED_FIELD {
            continue;
        }
        let field_type = schema
            .field_type(&name)
            .ok_or_else(|| format!("unknown field {name} for table {}", schema.name))?;
        let value = coerce(field_type, json)
            .ok_or_else(|| format!("field {name} is not a valid {field_type:?}"))?;
        record.set(name, value);
    }

    match record.owner() {
        Some(owner) if !owner.trim().is_empty() => {}
        _ => return Err(format!("missing {OWNER_FIELD}")),
    }
    if record.get(&schema.timestamp_field).map_or(true, Value::is_null) {
        return Err(format!("missing {}", schema.timestamp_field));
    }
    Ok(record)
}

fn coerce(field_type: FieldType, json: serde_json::Value) -> Option<Value> {
    use serde_json::Value as J;

    let value = match (field_type, json) {
        (_, J::Null) => Value::Null,
        (FieldType::Text | FieldType::UniqueText, J::String(s)) => Value::Text(s),
        (FieldType::Text | FieldType::UniqueText, other @ (J::Object(_) | J::Array(_))) => {
            Value::Text(other.to_string())
        }
        (FieldType::Text | FieldType::UniqueText, J::Number(n)) => Value::Text(n.to_string()),
        (FieldType::Boolean, J::Bool(b)) => Value::Boolean(b),
        (FieldType::Boolean, J::Number(n)) => Value::Boolean(n.as_i64()? != 0),
        (FieldType::Integer, J::Number(n)) => Value::Integer(n.as_i64()?),
        (FieldType::Long, J::Number(n)) => Value::Long(n.as_i64()?),
        (FieldType::Real, J::Number(n)) => Value::Real(n.as_f64()?),
        (FieldType::Blob, J::String(s)) => Value::Blob(s.into_bytes()),
        (FieldType::Blob, J::Array(items)) => Value::Blob(
            items
                .into_iter()
                .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect::<Option<Vec<u8>>>()?,
        ),
        _ => return None,
    };
    field_type.normalize(value)
}
