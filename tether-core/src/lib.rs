//! Tether core library: domain types, table catalog, configuration, errors.
//!
//! - [`types`]: newtypes, values and records
//! - [`schema`]: table schemas and the built-in catalog
//! - [`config`]: `~/.tether/config.yaml` load / save
//! - [`error`]: [`ConfigError`], [`SchemaError`]

pub mod config;
pub mod error;
pub mod paths;
pub mod schema;
pub mod types;

pub use config::{Config, LogFormat, TransportConfig};
pub use error::{ConfigError, SchemaError};
pub use schema::{Field, TableSchema};
pub use types::{
    Category, DeviceTag, FieldType, OwnerId, Record, Row, RowId, TableName, Value,
    COMMITTED_FIELD, MAX_BATCH_SIZE, OWNER_FIELD, TIMESTAMP_FIELD,
};
