//! SQLite-backed [`RecordStore`].
//!
//! Each table is a SQL table with one column per declared field plus an
//! autoincrement `_id` key, so row ids are never reused and id order is
//! insertion order. Declared schemas are recorded in `tether_tables`, which
//! lets a reopened store reject a table whose field list has changed.
//!
//! Every call runs on one connection behind a mutex as a single statement
//! or transaction. A failed call leaves the table as it was, and its cost
//! does not depend on how many rows the table holds.

use std::collections::HashMap;
use std::iter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};

use tether_core::{
    FieldType, OwnerId, Record, Row, RowId, TableName, TableSchema, Value, COMMITTED_FIELD,
    OWNER_FIELD,
};

use crate::condition::{CompareOp, Condition};
use crate::error::{io_err, StoreError};
use crate::{Conditions, RecordStore, Rows};

/// Database file created inside the store directory.
pub const DB_FILE: &str = "records.db";

/// Row id column. Schemas may not declare a field with this name.
pub const ID_COLUMN: &str = "_id";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteRecordStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
    schemas: RwLock<HashMap<TableName, Arc<TableSchema>>>,
}

impl SqliteRecordStore {
    /// Open (or create) `<dir>/records.db`. Tables are attached by
    /// [`RecordStore::create_table`].
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let path = dir.join(DB_FILE);
        let conn = Connection::open(&path)?;
        // journal_mode answers with the mode now in effect.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::init(conn, Some(path))
    }

    /// A store that never touches the filesystem.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tether_tables (
                name TEXT PRIMARY KEY,
                schema_json TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
            schemas: RwLock::new(HashMap::new()),
        })
    }

    /// Create every schema in `schemas`, stopping at the first failure.
    pub fn with_tables(self, schemas: Vec<TableSchema>) -> Result<Self, StoreError> {
        for schema in schemas {
            self.create_table(schema)?;
        }
        Ok(self)
    }

    /// Database file, or `None` for an in-memory store.
    pub fn db_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Poisoned("connection"))
    }

    fn cached(&self, table: &TableName) -> Result<Arc<TableSchema>, StoreError> {
        let schemas = self
            .schemas
            .read()
            .map_err(|_| StoreError::Poisoned("schema cache"))?;
        schemas
            .get(table)
            .cloned()
            .ok_or_else(|| StoreError::UnknownTable(table.clone()))
    }
}

impl RecordStore for SqliteRecordStore {
    fn create_table(&self, schema: TableSchema) -> Result<Arc<TableSchema>, StoreError> {
        schema.validate()?;
        if schema.field_type(ID_COLUMN).is_some() {
            return Err(StoreError::ReservedField {
                table: schema.name,
                field: ID_COLUMN.to_string(),
            });
        }

        let mut schemas = self
            .schemas
            .write()
            .map_err(|_| StoreError::Poisoned("schema cache"))?;
        if let Some(existing) = schemas.get(&schema.name) {
            if **existing != schema {
                return Err(StoreError::SchemaMismatch { table: schema.name });
            }
            return Ok(existing.clone());
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let stored: Option<String> = tx
            .query_row(
                "SELECT schema_json FROM tether_tables WHERE name = ?1",
                params![schema.name.0],
                |row| row.get(0),
            )
            .optional()?;
        match stored {
            Some(json) => {
                let stored: TableSchema = serde_json::from_str(&json)?;
                if stored != schema {
                    return Err(StoreError::SchemaMismatch { table: schema.name });
                }
                tracing::debug!(table = %schema.name, "attached table");
            }
            None => {
                tx.execute_batch(&create_sql(&schema))?;
                tx.execute(
                    "INSERT INTO tether_tables (name, schema_json) VALUES (?1, ?2)",
                    params![schema.name.0, serde_json::to_string(&schema)?],
                )?;
                tracing::info!(table = %schema.name, "created table");
            }
        }
        tx.commit()?;

        let handle = Arc::new(schema);
        schemas.insert(handle.name.clone(), handle.clone());
        Ok(handle)
    }

    fn schema(&self, table: &TableName) -> Option<Arc<TableSchema>> {
        self.cached(table).ok()
    }

    fn insert(&self, table: &TableName, record: Record) -> Result<RowId, StoreError> {
        let schema = self.cached(table)?;
        let mut record = normalize_record(&schema, record)?;
        record.set(COMMITTED_FIELD, false);
        require_identity(&schema, &record)?;
        let conn = self.conn()?;
        insert_row(&conn, &schema, &record)
    }

    fn fetch(
        &self,
        table: &TableName,
        limit: usize,
        conditions: &Conditions,
    ) -> Result<Rows, StoreError> {
        let schema = self.cached(table)?;
        let filter = Filter::new(&schema, conditions);
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} LIMIT ?",
            select_list(&schema),
            quote(&schema.name.0),
            filter.sql,
            quote(ID_COLUMN),
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let params = filter.params.into_iter().chain(iter::once(SqlValue::Integer(limit)));

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows: Vec<Row> = stmt
            .query_map(params_from_iter(params), |row| decode_row(&schema, row))?
            .collect::<Result<_, _>>()?;
        Ok(Rows::from(rows))
    }

    fn update(
        &self,
        table: &TableName,
        fields: Record,
        conditions: &Conditions,
    ) -> Result<usize, StoreError> {
        let schema = self.cached(table)?;
        let fields = normalize_record(&schema, fields)?;
        let filter = Filter::new(&schema, conditions);
        let conn = self.conn()?;
        if fields.is_empty() {
            return count_rows(&conn, &schema, filter);
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote(&schema.name.0),
            assignments(&fields),
            filter.sql,
        );
        let params = fields.iter().map(|(_, v)| to_sql(v)).chain(filter.params);
        let result = conn
            .prepare_cached(&sql)?
            .execute(params_from_iter(params))
            .map_err(|e| write_err(&schema, e));
        result
    }

    fn erase(&self, table: &TableName, conditions: &Conditions) -> Result<usize, StoreError> {
        let schema = self.cached(table)?;
        let filter = Filter::new(&schema, conditions);
        let sql = format!("DELETE FROM {} WHERE {}", quote(&schema.name.0), filter.sql);
        let conn = self.conn()?;
        let erased = conn
            .prepare_cached(&sql)?
            .execute(params_from_iter(filter.params))?;
        Ok(erased)
    }

    fn upsert(
        &self,
        table: &TableName,
        key: &Conditions,
        fields: Record,
    ) -> Result<RowId, StoreError> {
        let schema = self.cached(table)?;
        let mut fields = normalize_record(&schema, fields)?;
        // A changed parameter has to reach the server again.
        if !fields.contains(COMMITTED_FIELD) {
            fields.set(COMMITTED_FIELD, false);
        }
        let filter = Filter::new(&schema, key);
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} LIMIT 1",
            select_list(&schema),
            quote(&schema.name.0),
            filter.sql,
            quote(ID_COLUMN),
        );

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let existing = tx
            .query_row(&sql, params_from_iter(filter.params), |row| {
                decode_row(&schema, row)
            })
            .optional()?;

        let id = match existing {
            Some(Row { id, record }) => {
                let mut merged = record;
                for (field, value) in fields.iter() {
                    merged.set(field.clone(), value.clone());
                }
                require_identity(&schema, &merged)?;
                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = ?",
                    quote(&schema.name.0),
                    assignments(&fields),
                    quote(ID_COLUMN),
                );
                let params = fields
                    .iter()
                    .map(|(_, v)| to_sql(v))
                    .chain(iter::once(SqlValue::Integer(id.0 as i64)));
                tx.execute(&sql, params_from_iter(params))
                    .map_err(|e| write_err(&schema, e))?;
                id
            }
            None => {
                require_identity(&schema, &fields)?;
                insert_row(&tx, &schema, &fields)?
            }
        };
        tx.commit()?;
        Ok(id)
    }

    fn count(&self, table: &TableName, conditions: &Conditions) -> Result<usize, StoreError> {
        let schema = self.cached(table)?;
        let filter = Filter::new(&schema, conditions);
        let conn = self.conn()?;
        count_rows(&conn, &schema, filter)
    }

    fn owners(&self, table: &TableName) -> Result<Vec<OwnerId>, StoreError> {
        let schema = self.cached(table)?;
        let owner = quote(OWNER_FIELD);
        let sql = format!(
            "SELECT {owner} FROM {} WHERE {owner} IS NOT NULL GROUP BY {owner} ORDER BY MIN({})",
            quote(&schema.name.0),
            quote(ID_COLUMN),
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let owners: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(owners.into_iter().map(OwnerId::from).collect())
    }
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Check every field against the schema and coerce numeric widths.
fn normalize_record(schema: &TableSchema, record: Record) -> Result<Record, StoreError> {
    record
        .into_iter()
        .map(|(field, value)| {
            let Some(field_type) = schema.field_type(&field) else {
                return Err(StoreError::UnknownField {
                    table: schema.name.clone(),
                    field,
                });
            };
            match field_type.normalize(value) {
                Some(value) => Ok((field, value)),
                None => Err(StoreError::TypeMismatch {
                    table: schema.name.clone(),
                    field,
                    expected: field_type,
                }),
            }
        })
        .collect()
}

/// A stored row needs a non-empty owner and a timestamp for the upload
/// predicates to ever select it.
fn require_identity(schema: &TableSchema, record: &Record) -> Result<(), StoreError> {
    let owner_ok = record
        .owner()
        .map(|o| !o.trim().is_empty())
        .unwrap_or(false);
    if !owner_ok {
        return Err(StoreError::MissingField {
            table: schema.name.clone(),
            field: OWNER_FIELD.to_string(),
        });
    }
    let ts_ok = record
        .get(&schema.timestamp_field)
        .map(|v| !v.is_null())
        .unwrap_or(false);
    if !ts_ok {
        return Err(StoreError::MissingField {
            table: schema.name.clone(),
            field: schema.timestamp_field.clone(),
        });
    }
    Ok(())
}

/// Map a unique-constraint failure onto the field that caused it.
fn write_err(schema: &TableSchema, err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &err {
        if failure.code == ErrorCode::ConstraintViolation {
            // "UNIQUE constraint failed: <table>.<field>"
            if let Some(target) = message.strip_prefix("UNIQUE constraint failed: ") {
                let field = target.rsplit('.').next().unwrap_or(target);
                return StoreError::UniqueViolation {
                    table: schema.name.clone(),
                    field: field.to_string(),
                };
            }
        }
    }
    StoreError::Sqlite(err)
}

// ---------------------------------------------------------------------------
// SQL building
// ---------------------------------------------------------------------------

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn column_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Text => "TEXT",
        FieldType::UniqueText => "TEXT UNIQUE",
        FieldType::Integer | FieldType::Long | FieldType::Boolean => "INTEGER",
        FieldType::Real => "REAL",
        FieldType::Blob => "BLOB",
    }
}

fn create_sql(schema: &TableSchema) -> String {
    let table = quote(&schema.name.0);
    let columns: Vec<String> = iter::once(format!(
        "{} INTEGER PRIMARY KEY AUTOINCREMENT",
        quote(ID_COLUMN)
    ))
    .chain(
        schema
            .fields
            .iter()
            .map(|f| format!("{} {}", quote(&f.name), column_type(f.field_type))),
    )
    .collect();
    format!(
        "CREATE TABLE {table} ({});\nCREATE INDEX {} ON {table} ({}, {});",
        columns.join(", "),
        quote(&format!("{}_pending", schema.name.0)),
        quote(COMMITTED_FIELD),
        quote(OWNER_FIELD),
    )
}

fn select_list(schema: &TableSchema) -> String {
    iter::once(quote(ID_COLUMN))
        .chain(schema.fields.iter().map(|f| quote(&f.name)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn assignments(fields: &Record) -> String {
    fields
        .iter()
        .map(|(field, _)| format!("{} = ?", quote(field)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_row(conn: &Connection, schema: &TableSchema, record: &Record) -> Result<RowId, StoreError> {
    let columns: Vec<String> = record.iter().map(|(field, _)| quote(field)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(&schema.name.0),
        columns.join(", "),
        vec!["?"; columns.len()].join(", "),
    );
    conn.prepare_cached(&sql)?
        .execute(params_from_iter(record.iter().map(|(_, v)| to_sql(v))))
        .map_err(|e| write_err(schema, e))?;
    Ok(RowId(conn.last_insert_rowid() as u64))
}

fn count_rows(conn: &Connection, schema: &TableSchema, filter: Filter) -> Result<usize, StoreError> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {}",
        quote(&schema.name.0),
        filter.sql
    );
    let count: i64 = conn
        .prepare_cached(&sql)?
        .query_row(params_from_iter(filter.params), |row| row.get(0))?;
    Ok(count as usize)
}

/// `WHERE` body plus its bound values.
struct Filter {
    sql: String,
    params: Vec<SqlValue>,
}

impl Filter {
    fn new(schema: &TableSchema, conditions: &Conditions) -> Self {
        let mut params = Vec::new();
        let clauses: Vec<String> = conditions
            .iter()
            .map(|condition| match condition {
                Condition::IdIn(ids) if ids.is_empty() => "0".to_string(),
                Condition::IdIn(ids) => {
                    params.extend(ids.iter().map(|id| SqlValue::Integer(id.0 as i64)));
                    format!(
                        "{} IN ({})",
                        quote(ID_COLUMN),
                        vec!["?"; ids.len()].join(", ")
                    )
                }
                Condition::Compare { field, op, value } => {
                    compare_clause(schema, field, *op, value, &mut params)
                }
            })
            .collect();
        let sql = if clauses.is_empty() {
            "1".to_string()
        } else {
            clauses.join(" AND ")
        };
        Self { sql, params }
    }
}

/// SQL for `field <op> value` with the same outcome as [`Conditions::matches`]:
/// a missing cell reads as `Null`, and a value of another kind than the
/// column never compares, so only `Ne` holds against it.
fn compare_clause(
    schema: &TableSchema,
    field: &str,
    op: CompareOp,
    value: &Value,
    params: &mut Vec<SqlValue>,
) -> String {
    let Some(field_type) = schema.field_type(field) else {
        return constant(op.holds(Value::Null.compare(value)));
    };
    let column = quote(field);
    if value.is_null() {
        return match op {
            CompareOp::Eq | CompareOp::Le | CompareOp::Ge => format!("{column} IS NULL"),
            CompareOp::Ne => format!("{column} IS NOT NULL"),
            CompareOp::Lt | CompareOp::Gt => constant(false),
        };
    }
    if !comparable(field_type, value) {
        return constant(op == CompareOp::Ne);
    }
    params.push(to_sql(value));
    match op {
        CompareOp::Eq => format!("{column} = ?"),
        CompareOp::Ne => format!("({column} IS NULL OR {column} != ?)"),
        CompareOp::Lt => format!("{column} < ?"),
        CompareOp::Le => format!("{column} <= ?"),
        CompareOp::Gt => format!("{column} > ?"),
        CompareOp::Ge => format!("{column} >= ?"),
    }
}

fn constant(holds: bool) -> String {
    if holds { "1" } else { "0" }.to_string()
}

fn comparable(field_type: FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::Text | FieldType::UniqueText => matches!(value, Value::Text(_)),
        FieldType::Integer | FieldType::Long | FieldType::Real => {
            matches!(value, Value::Integer(_) | Value::Long(_) | Value::Real(_))
        }
        FieldType::Blob => matches!(value, Value::Blob(_)),
        FieldType::Boolean => matches!(value, Value::Boolean(_)),
    }
}

// ---------------------------------------------------------------------------
// Value mapping
// ---------------------------------------------------------------------------

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Integer(n) | Value::Long(n) => SqlValue::Integer(*n),
        Value::Real(f) => SqlValue::Real(*f),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
    }
}

fn from_sql(field_type: FieldType, cell: ValueRef<'_>) -> Value {
    match (field_type, cell) {
        (_, ValueRef::Null) => Value::Null,
        (FieldType::Boolean, ValueRef::Integer(n)) => Value::Boolean(n != 0),
        (FieldType::Long, ValueRef::Integer(n)) => Value::Long(n),
        (FieldType::Real, ValueRef::Integer(n)) => Value::Real(n as f64),
        (_, ValueRef::Integer(n)) => Value::Integer(n),
        (_, ValueRef::Real(f)) => Value::Real(f),
        (_, ValueRef::Text(t)) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        (_, ValueRef::Blob(b)) => Value::Blob(b.to_vec()),
    }
}

/// Columns come back in [`select_list`] order. Null cells are left out of
/// the record, matching a field that was never set.
fn decode_row(schema: &TableSchema, row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    let id: i64 = row.get(0)?;
    let mut record = Record::new();
    for (index, field) in schema.fields.iter().enumerate() {
        let value = from_sql(field.field_type, row.get_ref(index + 1)?);
        if !value.is_null() {
            record.set(field.name.clone(), value);
        }
    }
    Ok(Row {
        id: RowId(id as u64),
        record,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
