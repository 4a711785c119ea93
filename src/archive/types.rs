//! Archive and restore report types.
//!
//! Table payloads keep the store's column order. Each value is typed by
//! its column's declared type, so booleans and timestamps survive the trip
//! even though SQLite stores both as integers.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, Value as SqlValue};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::migrate::SchemaVersion;

/// Archive container format understood by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Zip entry holding the [`Manifest`].
pub const MANIFEST_ENTRY: &str = "manifest.json";

/// Zip entry name of a table payload.
#[must_use]
pub fn table_entry(table: &str) -> String {
    format!("tables/{table}.jsonl")
}

/// Value type of a column, derived from its declared SQL type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    Integer,
    Real,
    Timestamp,
    Text,
}

impl ColumnType {
    /// Map a declared type (`BOOLEAN`, `TIMESTAMP`, `INTEGER`, ...) to a
    /// value type. Unknown declarations are text.
    #[must_use]
    pub fn from_declared(decl: &str) -> Self {
        let decl = decl.to_ascii_uppercase();
        if decl.contains("BOOL") {
            Self::Boolean
        } else if decl.contains("TIMESTAMP") || decl.contains("DATE") {
            Self::Timestamp
        } else if decl.contains("INT") {
            Self::Integer
        } else if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") {
            Self::Real
        } else {
            Self::Text
        }
    }
}

/// A column in an archived table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnType,
    pub nullable: bool,
}

/// Key wrapping text stored in a timestamp column.
const TEXT_CELL_KEY: &str = "text";

/// A typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Convert a raw SQLite value read from a column of type `kind`.
    ///
    /// Values whose storage class does not fit the declared type keep
    /// their storage class; text in a timestamp column stays text.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for blobs and out-of-range timestamps.
    pub fn from_sql(raw: SqlValue, kind: ColumnType) -> Result<Self> {
        Ok(match (raw, kind) {
            (SqlValue::Null, _) => Self::Null,
            (SqlValue::Integer(i), ColumnType::Boolean) => Self::Bool(i != 0),
            (SqlValue::Integer(ms), ColumnType::Timestamp) => Self::Timestamp(
                DateTime::from_timestamp_millis(ms)
                    .ok_or_else(|| Error::InvalidArgument(format!("timestamp out of range: {ms}")))?,
            ),
            #[allow(clippy::cast_precision_loss)]
            (SqlValue::Integer(i), ColumnType::Real) => Self::Real(i as f64),
            (SqlValue::Integer(i), _) => Self::Integer(i),
            (SqlValue::Real(r), _) => Self::Real(r),
            (SqlValue::Text(s), _) => Self::Text(s),
            (SqlValue::Blob(_), _) => {
                return Err(Error::InvalidArgument(
                    "blob values cannot be archived".to_string(),
                ));
            }
        })
    }

    /// JSON form used in table payloads.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Real(r) => serde_json::Number::from_f64(*r)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Timestamp(ts) => {
                serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
        }
    }

    /// Payload cell for a column of type `kind`.
    ///
    /// Text in a timestamp column is wrapped as `{"text": ..}` so it is not
    /// read back as a timestamp.
    #[must_use]
    pub fn to_cell(&self, kind: ColumnType) -> serde_json::Value {
        match (self, kind) {
            (Self::Text(s), ColumnType::Timestamp) => serde_json::json!({ TEXT_CELL_KEY: s }),
            _ => self.to_json(),
        }
    }

    /// Read a payload cell for a column of type `kind`.
    ///
    /// Returns `None` if the JSON value cannot represent that column.
    #[must_use]
    pub fn from_json(json: &serde_json::Value, kind: ColumnType) -> Option<Self> {
        use serde_json::Value as Json;

        Some(match (json, kind) {
            (Json::Null, _) => Self::Null,
            (Json::Bool(b), _) => Self::Bool(*b),
            (Json::String(s), ColumnType::Timestamp) => match DateTime::parse_from_rfc3339(s) {
                Ok(ts) => Self::Timestamp(ts.with_timezone(&Utc)),
                Err(_) => Self::Text(s.clone()),
            },
            (Json::String(s), _) => Self::Text(s.clone()),
            (Json::Object(map), ColumnType::Timestamp) if map.len() == 1 => {
                Self::Text(map.get(TEXT_CELL_KEY)?.as_str()?.to_string())
            }
            (Json::Number(n), ColumnType::Real) => Self::Real(n.as_f64()?),
            (Json::Number(n), _) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Real(n.as_f64()?),
            },
            (Json::Array(_) | Json::Object(_), _) => return None,
        })
    }

    /// Integer payload, if this is an integer.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(SqlValue::Null),
            Self::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Self::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Self::Real(r) => ToSqlOutput::Owned(SqlValue::Real(*r)),
            Self::Text(s) => ToSqlOutput::Borrowed(rusqlite::types::ValueRef::Text(s.as_bytes())),
            Self::Timestamp(ts) => ToSqlOutput::Owned(SqlValue::Integer(ts.timestamp_millis())),
        })
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Text(s) => write!(f, "{s:?}"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// Per-table entry in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableManifest {
    pub name: String,
    pub columns: Vec<Column>,
    pub row_count: usize,
    /// SHA-256 of the table's JSONL payload.
    pub sha256: String,
}

/// Archive manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub source_schema_version: SchemaVersion,
    pub generated_at: DateTime<Utc>,
    /// Tables in dependency order.
    pub tables: Vec<TableManifest>,
}

/// Rows of one table, in rowid order.
#[derive(Debug, Clone, PartialEq)]
pub struct TableData {
    pub name: String,
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
}

impl TableData {
    /// Position of a column by name.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// A complete logical backup.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupArchive {
    pub source_schema_version: SchemaVersion,
    pub generated_at: DateTime<Utc>,
    /// Tables in dependency order.
    pub tables: Vec<TableData>,
}

impl BackupArchive {
    /// Look up a table by name.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableData> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Total number of rows across all tables.
    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }
}

/// Result of writing an archive to disk.
#[derive(Debug, Clone, Serialize)]
pub struct BackupSummary {
    pub path: std::path::PathBuf,
    pub schema_version: SchemaVersion,
    pub tables: Vec<TableCount>,
    pub bytes: u64,
    /// SHA-256 of the archive file.
    pub sha256: String,
}

/// Row count of one exported table.
#[derive(Debug, Clone, Serialize)]
pub struct TableCount {
    pub table: String,
    pub rows: usize,
}

/// How a restore treats existing rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Replace every domain table with the archive's contents.
    #[default]
    Full,
    /// Insert or update by natural key; leave other rows alone.
    Upsert,
}

impl std::fmt::Display for RestoreMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Upsert => write!(f, "upsert"),
        }
    }
}

impl std::str::FromStr for RestoreMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(Self::Full),
            "upsert" => Ok(Self::Upsert),
            _ => Err(Error::InvalidArgument(format!("Unknown restore mode: {s}"))),
        }
    }
}

/// Options for a restore job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    pub mode: RestoreMode,
    /// Validate and count without writing.
    pub dry_run: bool,
}

/// A row an upsert could not apply. Not fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowConflict {
    pub table: String,
    /// Identifier of the row in the archive.
    pub row_key: String,
    pub reason: String,
}

/// Per-table restore counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub table: String,
    pub rows_inserted: usize,
    pub rows_updated: usize,
    pub rows_unchanged: usize,
    pub rows_skipped: usize,
    pub rows_deleted: usize,
    pub errors: Vec<RowConflict>,
}

impl TableReport {
    #[must_use]
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    /// Record a skipped row.
    pub fn skip(&mut self, row_key: String, reason: String) {
        self.rows_skipped += 1;
        self.errors.push(RowConflict {
            table: self.table.clone(),
            row_key,
            reason,
        });
    }

    /// Machine-parsable one-line summary.
    #[must_use]
    pub fn summary_line(&self) -> String {
        format!(
            "table={} inserted={} updated={} unchanged={} skipped={} deleted={} errors={}",
            self.table,
            self.rows_inserted,
            self.rows_updated,
            self.rows_unchanged,
            self.rows_skipped,
            self.rows_deleted,
            self.errors.len()
        )
    }
}

/// Outcome of a restore job.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub mode: RestoreMode,
    pub dry_run: bool,
    pub archive_version: SchemaVersion,
    pub store_version: SchemaVersion,
    /// Tables in dependency order.
    pub tables: Vec<TableReport>,
}

impl RestoreReport {
    /// Report for a table by name.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }

    /// Total conflicts across all tables.
    #[must_use]
    pub fn total_errors(&self) -> usize {
        self.tables.iter().map(|t| t.errors.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_from_declared() {
        assert_eq!(ColumnType::from_declared("BOOLEAN"), ColumnType::Boolean);
        assert_eq!(ColumnType::from_declared("TIMESTAMP"), ColumnType::Timestamp);
        assert_eq!(ColumnType::from_declared("datetime"), ColumnType::Timestamp);
        assert_eq!(ColumnType::from_declared("INTEGER"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("REAL"), ColumnType::Real);
        assert_eq!(ColumnType::from_declared("TEXT"), ColumnType::Text);
        assert_eq!(ColumnType::from_declared(""), ColumnType::Text);
    }

    #[test]
    fn test_sql_values_take_column_type() {
        assert_eq!(
            Value::from_sql(SqlValue::Integer(1), ColumnType::Boolean).unwrap(),
            Value::Bool(true)
        );
        let ts = Value::from_sql(SqlValue::Integer(1_700_000_000_123), ColumnType::Timestamp)
            .unwrap();
        assert_eq!(
            ts.to_json(),
            serde_json::json!("2023-11-14T22:13:20.123Z")
        );
        assert!(Value::from_sql(SqlValue::Blob(vec![1]), ColumnType::Text).is_err());
    }

    #[test]
    fn test_text_in_timestamp_column_stays_text() {
        let raw = "2023-11-14T22:13:20.123Z";
        let value =
            Value::from_sql(SqlValue::Text(raw.to_string()), ColumnType::Timestamp).unwrap();
        assert_eq!(value, Value::Text(raw.to_string()));

        let cell = value.to_cell(ColumnType::Timestamp);
        assert_eq!(cell, serde_json::json!({ "text": raw }));
        assert_eq!(Value::from_json(&cell, ColumnType::Timestamp), Some(value));
        assert_eq!(
            Value::from_json(&serde_json::json!({ "other": raw }), ColumnType::Timestamp),
            None
        );
        assert_eq!(
            Value::Text(raw.to_string()).to_cell(ColumnType::Text),
            serde_json::json!(raw)
        );
    }

    #[test]
    fn test_json_cells_keep_types() {
        let ts = Value::from_json(&serde_json::json!("2023-11-14T22:13:20.123Z"), ColumnType::Timestamp)
            .unwrap();
        assert!(matches!(ts, Value::Timestamp(t) if t.timestamp_millis() == 1_700_000_000_123));
        assert_eq!(
            Value::from_json(&serde_json::json!(false), ColumnType::Boolean),
            Some(Value::Bool(false))
        );
        assert_eq!(
            Value::from_json(&serde_json::json!(2), ColumnType::Real),
            Some(Value::Real(2.0))
        );
        assert_eq!(Value::from_json(&serde_json::json!([1]), ColumnType::Text), None);
    }

    #[test]
    fn test_summary_line() {
        let mut report = TableReport::new("matches");
        report.rows_inserted = 3;
        report.skip("id=4".to_string(), "no match".to_string());
        assert_eq!(
            report.summary_line(),
            "table=matches inserted=3 updated=0 unchanged=0 skipped=1 deleted=0 errors=1"
        );
    }

    #[test]
    fn test_restore_mode_parse() {
        assert_eq!("upsert".parse::<RestoreMode>().unwrap(), RestoreMode::Upsert);
        assert!("merge".parse::<RestoreMode>().is_err());
    }
}
