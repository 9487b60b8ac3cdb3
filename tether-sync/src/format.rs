//! Wire serialization of record batches.
//!
//! A formatted batch is a header line of space-separated `name[tag]` tokens
//! (`s` string, `f` float, `i` integer, arrays as `name[]`) followed by one
//! line per record with values in header order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::DateTime;

use tether_core::{schema, Record, Row, TableName, Value};
use tether_store::Conditions;

use crate::error::FormatError;

/// Server's canonical timestamp profile.
pub const TIMESTAMP_FORMAT: &str = "%y-%m-%dT%H:%M:%S%.3f";

/// Placeholder for an absent or null cell.
const MISSING: &str = "NaN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Float,
    Integer,
    /// Epoch milliseconds rendered with [`TIMESTAMP_FORMAT`]; tagged `s`.
    Timestamp,
    Array,
}

impl ColumnKind {
    fn tag(self) -> &'static str {
        match self {
            ColumnKind::Text | ColumnKind::Timestamp => "s",
            ColumnKind::Float => "f",
            ColumnKind::Integer => "i",
            ColumnKind::Array => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub field: String,
    pub kind: ColumnKind,
}

impl Column {
    pub fn new(field: &str, kind: ColumnKind) -> Self {
        Self {
            field: field.to_string(),
            kind,
        }
    }

    fn token(&self) -> String {
        format!("{}[{}]", self.field, self.kind.tag())
    }
}

/// Serializer for one table's rows.
pub trait RecordFormatter: Send + Sync {
    fn header(&self) -> String;

    /// Narrow the rows a session selects for this table.
    fn restrict(&self, eligible: Conditions) -> Conditions {
        eligible
    }

    fn line(&self, record: &Record) -> String;

    /// Header plus one line per row, each newline-terminated.
    fn format(&self, rows: &[Row]) -> String {
        let mut out = self.header();
        out.push('\n');
        for row in rows {
            out.push_str(&self.line(&row.record));
            out.push('\n');
        }
        out
    }
}

/// Formatter driven by a fixed column list.
#[derive(Debug, Clone)]
pub struct ColumnFormatter {
    columns: Vec<Column>,
    filter: Conditions,
}

impl ColumnFormatter {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            filter: Conditions::new(),
        }
    }

    /// Only upload rows that also satisfy `filter`.
    pub fn with_filter(mut self, filter: Conditions) -> Self {
        self.filter = filter;
        self
    }
}

impl RecordFormatter for ColumnFormatter {
    fn restrict(&self, eligible: Conditions) -> Conditions {
        self.filter.iter().cloned().fold(eligible, Conditions::and)
    }

    fn header(&self) -> String {
        self.columns
            .iter()
            .map(Column::token)
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn line(&self, record: &Record) -> String {
        self.columns
            .iter()
            .map(|col| render(col.kind, record.get(&col.field)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Beacon scans carry a JSON object of room -> signal strength. Rooms are
/// emitted as two parallel arrays sorted by room name.
#[derive(Debug, Clone, Default)]
pub struct RssiFormatter;

impl RecordFormatter for RssiFormatter {
    fn header(&self) -> String {
        "timestamp[s] rooms[] rssi[]".to_string()
    }

    fn line(&self, record: &Record) -> String {
        let ts = render(ColumnKind::Timestamp, record.get("timestamp"));
        let rooms: BTreeMap<String, f64> = record
            .get("rooms")
            .and_then(Value::as_str)
            .and_then(|json| serde_json::from_str::<BTreeMap<String, serde_json::Value>>(json).ok())
            .map(|map| {
                map.into_iter()
                    .filter_map(|(room, v)| v.as_f64().map(|dbm| (room, dbm)))
                    .collect()
            })
            .unwrap_or_default();

        let names: Vec<String> = rooms.keys().map(|r| array_item(r)).collect();
        let levels: Vec<String> = rooms.values().map(|v| format!("{v:?}")).collect();
        format!("{ts} [{}] [{}]", names.join(","), levels.join(","))
    }
}

fn render(kind: ColumnKind, value: Option<&Value>) -> String {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return MISSING.to_string();
    };
    match kind {
        ColumnKind::Timestamp => value
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_else(|| MISSING.to_string()),
        ColumnKind::Float => value
            .as_f64()
            .map(|f| format!("{f:?}"))
            .unwrap_or_else(|| MISSING.to_string()),
        ColumnKind::Integer => match value {
            Value::Boolean(b) => i64::from(*b).to_string(),
            other => other
                .as_i64()
                .map(|n| n.to_string())
                .unwrap_or_else(|| MISSING.to_string()),
        },
        ColumnKind::Text => match value {
            Value::Text(s) => quote(s),
            Value::Blob(bytes) => quote(&String::from_utf8_lossy(bytes)),
            Value::Boolean(b) => b.to_string(),
            other => other
                .as_f64()
                .map(|f| f.to_string())
                .unwrap_or_else(|| MISSING.to_string()),
        },
        ColumnKind::Array => match value {
            Value::Text(s) => format!("[{}]", array_item(s)),
            _ => "[]".to_string(),
        },
    }
}

/// Text containing whitespace or quotes is wrapped in `"` with `"` and `\`
/// escaped, so a line always splits back into the header's column count.
fn quote(s: &str) -> String {
    let needs_quotes = s.is_empty() || s.chars().any(|c| c.is_whitespace() || c == '"');
    if !needs_quotes {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn array_item(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_whitespace() || c == ',' { '_' } else { c })
        .collect()
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Table name -> serializer.
#[derive(Clone, Default)]
pub struct FormatterRegistry {
    formatters: HashMap<TableName, Arc<dyn RecordFormatter>>,
}

impl FormatterRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Formatters for every table in the built-in catalog.
    pub fn builtin() -> Self {
        use ColumnKind::{Float, Integer, Text, Timestamp};

        let mut registry = Self::empty();
        let ts = || Column::new("timestamp", Timestamp);

        registry.register(schema::RSSI, Arc::new(RssiFormatter));
        registry.register(
            schema::SENSORS,
            Arc::new(ColumnFormatter::new(vec![
                ts(),
                Column::new("accel_x", Float),
                Column::new("accel_y", Float),
                Column::new("accel_z", Float),
                Column::new("azimuth", Float),
                Column::new("pitch", Float),
                Column::new("roll", Float),
                Column::new("heart_rate", Integer),
                Column::new("heart_rate_valid", Integer),
                Column::new("step_count", Integer),
            ])),
        );
        registry.register(
            schema::GPS,
            Arc::new(ColumnFormatter::new(vec![
                ts(),
                Column::new("latitude", Float),
                Column::new("longitude", Float),
            ])),
        );
        registry.register(
            schema::GROUND_TRUTH,
            // An interval is uploaded once it has been closed.
            Arc::new(
                ColumnFormatter::new(vec![
                    Column::new("type", Text),
                    Column::new("label", Text),
                    Column::new("start", Timestamp),
                    Column::new("end", Timestamp),
                ])
                .with_filter(Conditions::new().ge("end", 0i64)),
            ),
        );
        registry.register(
            schema::EXTERNAL_SENSOR,
            Arc::new(ColumnFormatter::new(vec![
                ts(),
                Column::new("device_id", Text),
                Column::new("reading_type", Text),
                Column::new("reading", Float),
                Column::new("x", Float),
                Column::new("y", Float),
                Column::new("z", Float),
            ])),
        );
        registry.register(
            schema::LOGS,
            Arc::new(ColumnFormatter::new(vec![ts(), Column::new("message", Text)])),
        );
        registry.register(
            schema::PROFILE,
            Arc::new(ColumnFormatter::new(vec![
                ts(),
                Column::new("key", Text),
                Column::new("value", Text),
            ])),
        );
        registry
    }

    pub fn register(&mut self, table: &str, formatter: Arc<dyn RecordFormatter>) {
        self.formatters.insert(TableName::from(table), formatter);
    }

    pub fn get(&self, table: &TableName) -> Result<Arc<dyn RecordFormatter>, FormatError> {
        self.formatters
            .get(table)
            .cloned()
            .ok_or_else(|| FormatError::UnknownTable(table.clone()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableName> {
        self.formatters.keys()
    }
}

/// Render a whole batch as the bytes handed to the transport.
pub fn encode_batch(formatter: &dyn RecordFormatter, rows: &[Row]) -> Vec<u8> {
    formatter.format(rows).into_bytes()
}
