//! SQLite store implementation.
//!
//! Owns the single writer connection. Mutations go through
//! [`SqliteStore::transaction`], which commits when the closure returns
//! `Ok` and rolls back on `Err` or unwind (the rusqlite `Transaction`
//! rolls back when dropped uncommitted).

use crate::error::{Error, Result};
use crate::migrate::SchemaVersion;
use crate::storage::schema::{SCHEMA_VERSION_KEY, apply_metadata_schema, apply_pragmas, quote_ident};
use rusqlite::{Connection, DatabaseName, OptionalExtension, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// SQLite-based store.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open a store at the given path.
    ///
    /// Creates the file and the reserved metadata tables if missing. Domain
    /// tables are left to the migration runner.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or the
    /// metadata schema fails.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, None)
    }

    /// Open a store with an optional busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or the
    /// metadata schema fails.
    pub fn open_with_timeout(path: &Path, timeout_ms: Option<u64>) -> Result<Self> {
        let conn = Connection::open(path)?;

        if let Some(timeout) = timeout_ms {
            conn.busy_timeout(Duration::from_millis(timeout))?;
        } else {
            // Default 5 second timeout
            conn.busy_timeout(Duration::from_secs(5))?;
        }

        apply_pragmas(&conn)?;
        apply_metadata_schema(&conn)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_pragmas(&conn)?;
        apply_metadata_schema(&conn)?;
        Ok(Self { conn, path: None })
    }

    /// Get a reference to the underlying connection (for read operations).
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Database file path, `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` inside an IMMEDIATE transaction.
    ///
    /// Commits if `f` returns `Ok`. Any `Err`, and any panic unwinding
    /// through `f`, leaves the transaction uncommitted so it rolls back.
    ///
    /// # Errors
    ///
    /// Returns the closure's error or a database error from begin/commit.
    pub fn transaction<F, R>(&mut self, op: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R>,
    {
        let mut tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                debug!(op, "Transaction committed");
                Ok(value)
            }
            Err(e) => {
                debug!(op, error = %e, "Transaction rolled back");
                // Dropping `tx` rolls back.
                Err(e)
            }
        }
    }

    /// Run `f` inside an IMMEDIATE transaction that is always rolled back.
    ///
    /// Writes made by `f` are visible to `f` itself, constraints included,
    /// and never reach the database file.
    ///
    /// # Errors
    ///
    /// Returns the closure's error or a database error from begin/rollback.
    pub fn rehearse<F, R>(&mut self, op: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R>,
    {
        let mut tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&mut tx);
        tx.rollback()?;
        debug!(op, "Rehearsal rolled back");
        result
    }

    /// Run `f` against a consistent read snapshot.
    ///
    /// Uses a DEFERRED transaction, which only takes a shared lock, and
    /// always rolls it back.
    ///
    /// # Errors
    ///
    /// Returns the closure's error or a database error.
    pub fn read_snapshot<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)?;
        let result = f(&tx);
        tx.rollback()?;
        result
    }

    /// Current schema version, `None` if never migrated.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored value is malformed.
    pub fn schema_version(&self) -> Result<Option<SchemaVersion>> {
        read_schema_version(&self.conn)
    }

    /// Copy the live database to `dest` with the online backup API.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination cannot be written.
    pub fn backup_to(&self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.conn.backup(DatabaseName::Main, dest, None)?;
        Ok(())
    }

    /// Replace the live database contents with the database at `src`.
    ///
    /// # Errors
    ///
    /// Returns an error if `src` cannot be read or the copy fails.
    pub fn restore_from(&mut self, src: &Path) -> Result<()> {
        self.conn
            .restore(DatabaseName::Main, src, None::<fn(rusqlite::backup::Progress)>)?;
        Ok(())
    }

    /// Checkpoint the WAL and rebuild the file to drop free pages.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint or `VACUUM` fails.
    pub fn compact(&self) -> Result<()> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        self.conn.execute_batch("VACUUM")?;
        debug!("Store compacted");
        Ok(())
    }

    /// Toggle foreign key enforcement. No-op inside a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the pragma cannot be set.
    pub fn set_foreign_keys(&self, enabled: bool) -> Result<()> {
        self.conn
            .pragma_update(None, "foreign_keys", if enabled { "ON" } else { "OFF" })?;
        Ok(())
    }

    /// Number of rows in a table.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn row_count(&self, table: &str) -> Result<usize> {
        count_rows(&self.conn, table)
    }
}

/// Read the schema version from the metadata table.
///
/// # Errors
///
/// Returns an error if the query fails or the value is malformed.
pub fn read_schema_version(conn: &Connection) -> Result<Option<SchemaVersion>> {
    let raw: Option<Option<String>> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    raw.flatten().map(|v| SchemaVersion::parse(&v)).transpose()
}

/// Write the schema version to the metadata table.
///
/// # Errors
///
/// Returns an error if the upsert fails.
pub fn write_schema_version(conn: &Connection, version: &SchemaVersion) -> Result<()> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [SCHEMA_VERSION_KEY, version.as_str()],
    )?;
    Ok(())
}

/// Number of rows in a table.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn count_rows(conn: &Connection, table: &str) -> Result<usize> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
        [],
        |row| row.get(0),
    )?;
    usize::try_from(count).map_err(|_| Error::InvalidArgument(format!("row count {count}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn v(s: &str) -> SchemaVersion {
        SchemaVersion::parse(s).unwrap()
    }

    #[test]
    fn test_schema_version_unset_then_written() {
        let mut store = SqliteStore::open_memory().unwrap();
        assert!(store.schema_version().unwrap().is_none());

        store
            .transaction("set_version", |tx| write_schema_version(tx, &v("003")))
            .unwrap();
        assert_eq!(store.schema_version().unwrap().unwrap().as_str(), "003");

        store
            .transaction("set_version", |tx| write_schema_version(tx, &v("004")))
            .unwrap();
        assert_eq!(store.schema_version().unwrap().unwrap().as_str(), "004");
    }

    #[test]
    fn test_malformed_stored_version_is_reported() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO metadata (key, value) VALUES ('schema_version', 'banana')",
                [],
            )
            .unwrap();
        assert!(matches!(
            store.schema_version(),
            Err(Error::VersionParse { .. })
        ));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let mut store = SqliteStore::open_memory().unwrap();
        store
            .conn()
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .unwrap();

        let result: Result<()> = store.transaction("failing", |tx| {
            tx.execute("INSERT INTO t (id) VALUES (1)", [])?;
            Err(Error::InvalidArgument("boom".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(store.row_count("t").unwrap(), 0);
    }

    #[test]
    fn test_rehearse_sees_its_writes_then_rolls_back() {
        let mut store = SqliteStore::open_memory().unwrap();
        store
            .conn()
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, n INTEGER CHECK (n > 0))")
            .unwrap();

        let (seen, rejected) = store
            .rehearse("rehearsal", |tx| {
                tx.execute("INSERT INTO t (id, n) VALUES (1, 1)", [])?;
                let seen = count_rows(tx, "t")?;
                let rejected = tx.execute("INSERT INTO t (id, n) VALUES (2, 0)", []).is_err();
                Ok((seen, rejected))
            })
            .unwrap();

        assert_eq!(seen, 1);
        assert!(rejected);
        assert_eq!(store.row_count("t").unwrap(), 0);
    }

    #[test]
    fn test_transaction_rolls_back_on_panic() {
        let mut store = SqliteStore::open_memory().unwrap();
        store
            .conn()
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .unwrap();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<()> = store.transaction("panicking", |tx| {
                tx.execute("INSERT INTO t (id) VALUES (1)", [])?;
                panic!("unexpected");
            });
        }));

        assert!(outcome.is_err());
        assert_eq!(store.row_count("t").unwrap(), 0);
    }

    #[test]
    fn test_backup_and_restore_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = SqliteStore::open(&temp_dir.path().join("live.db")).unwrap();
        store
            .conn()
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")
            .unwrap();

        let backup = temp_dir.path().join("backups").join("snapshot.db");
        store.backup_to(&backup).unwrap();
        assert!(backup.exists());

        store.conn().execute("INSERT INTO t VALUES (2)", []).unwrap();
        assert_eq!(store.row_count("t").unwrap(), 2);

        store.restore_from(&backup).unwrap();
        assert_eq!(store.row_count("t").unwrap(), 1);
    }

    #[test]
    fn test_compact_keeps_data() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&temp_dir.path().join("live.db")).unwrap();
        store
            .conn()
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")
            .unwrap();

        store.compact().unwrap();
        assert_eq!(store.row_count("t").unwrap(), 1);
    }
}
