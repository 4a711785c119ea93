//! Reserved metadata schema and the catalog of domain tables.
//!
//! The metadata tables are created on every open; the domain tables are
//! owned by migration steps. [`TABLES`] fixes the dependency order used by
//! export (parents first) and restore (reverse for deletes).

use rusqlite::{Connection, Result};

/// Metadata key holding the current schema version string.
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Reserved tables, created before any migration step runs.
///
/// `metadata` holds key/value pairs (one row for the schema version).
/// `migration_history` records every step applied, in the step's own
/// transaction.
pub const METADATA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT
);

CREATE TABLE IF NOT EXISTS migration_history (
    version TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at INTEGER NOT NULL
);
";

/// A column on a child table pointing at a parent's surrogate key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    /// Column on the child table.
    pub column: &'static str,
    /// Parent table name.
    pub parent: &'static str,
}

/// A reference that older schemas stored denormalized, by name.
///
/// `column` is resolved by looking up `via` against `parent.parent_column`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyReference {
    /// Normalized id column on the child table.
    pub column: &'static str,
    /// Denormalized column on the child table carrying the parent's name.
    pub via: &'static str,
    /// Parent table name.
    pub parent: &'static str,
    /// Parent column matched against `via`.
    pub parent_column: &'static str,
}

/// Static description of a domain table for export and restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    /// Auto-increment primary key; ignored when matching rows by content.
    pub surrogate_key: &'static str,
    /// Columns identifying a row across stores.
    pub natural_key: &'static [&'static str],
    pub references: &'static [Reference],
    pub legacy_references: &'static [LegacyReference],
}

impl TableSpec {
    /// Reference declared on `column`, if any.
    #[must_use]
    pub fn reference(&self, column: &str) -> Option<&Reference> {
        self.references.iter().find(|r| r.column == column)
    }
}

/// Link from `matches.deck_id` back to `decks.name` through `deck_name`.
pub const MATCH_DECK_LINK: LegacyReference = LegacyReference {
    column: "deck_id",
    via: "deck_name",
    parent: "decks",
    parent_column: "name",
};

/// Domain tables in dependency order: parents before children.
pub const TABLES: &[TableSpec] = &[
    TableSpec {
        name: "decks",
        surrogate_key: "id",
        natural_key: &["name"],
        references: &[],
        legacy_references: &[],
    },
    TableSpec {
        name: "matches",
        surrogate_key: "id",
        natural_key: &["deck_id", "played_at"],
        references: &[Reference {
            column: "deck_id",
            parent: "decks",
        }],
        legacy_references: &[MATCH_DECK_LINK],
    },
];

/// Look up a table in [`TABLES`].
#[must_use]
pub fn table_spec(name: &str) -> Option<&'static TableSpec> {
    TABLES.iter().find(|t| t.name == name)
}

/// One row of `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type as written in the DDL (may be empty).
    pub decl_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

/// Set connection pragmas.
///
/// # Errors
///
/// Returns an error if a pragma cannot be set.
pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(())
}

/// Create the reserved metadata tables.
///
/// Idempotent: every statement uses `IF NOT EXISTS`.
///
/// # Errors
///
/// Returns an error if the SQL execution fails.
pub fn apply_metadata_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(METADATA_SQL)
}

/// Check if a table exists.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    conn.prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?
        .exists([table])
}

/// Check if a column exists in a table.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    conn.prepare("SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2")?
        .exists([table, column])
}

/// Columns of a table in schema order.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn.prepare(
        "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    stmt.query_map([table], |row| {
        Ok(ColumnInfo {
            name: row.get(0)?,
            decl_type: row.get(1)?,
            not_null: row.get::<_, i64>(2)? != 0,
            primary_key: row.get::<_, i64>(3)? != 0,
        })
    })?
    .collect()
}

/// Domain tables from [`TABLES`] present in this store, in dependency order.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn existing_tables(conn: &Connection) -> Result<Vec<&'static TableSpec>> {
    let mut present = Vec::new();
    for spec in TABLES {
        if table_exists(conn, spec.name)? {
            present.push(spec);
        }
    }
    Ok(present)
}

/// Quote an identifier for interpolation into SQL.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
