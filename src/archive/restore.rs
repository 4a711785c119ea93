//! Restore engine.
//!
//! Every job first validates the archive against the store (version
//! window, known tables and columns) without writing anything. Then:
//!
//! - `full` replaces all domain tables inside one transaction with foreign
//!   key enforcement off, preserving archived ids, and checks referential
//!   and structural integrity before committing.
//! - `upsert` matches rows by natural key; see [`upsert`].
//!
//! A dry run takes the same path inside a transaction that is always
//! rolled back, so constraints decide its counts exactly as they would.

mod upsert;

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{info, warn};

use crate::archive::types::{
    BackupArchive, RestoreMode, RestoreOptions, RestoreReport, TableData, TableReport,
};
use crate::error::{Error, Result};
use crate::integrity;
use crate::migrate::SchemaVersion;
use crate::migrate::steps::resolve_legacy_reference;
use crate::progress::{CancelToken, NoopSink, ProgressSink, TableTicker};
use crate::storage::SqliteStore;
use crate::storage::schema::{
    LegacyReference, TABLES, TableSpec, existing_tables, quote_ident, table_columns, table_spec,
};

/// Origin reported in `Resolution` errors raised while restoring.
const RESTORE_ORIGIN: &str = "restore";

/// Restores archives into a store.
pub struct RestoreEngine<'a> {
    oldest_restorable: SchemaVersion,
    sink: &'a dyn ProgressSink,
    cancel: CancelToken,
    progress_interval: Duration,
}

/// An archived table checked against the store.
struct TablePlan<'t> {
    spec: &'static TableSpec,
    data: &'t TableData,
    /// Links to fill from a name because the archive predates the id column.
    legacy: Vec<&'static LegacyReference>,
}

/// Validated restore job.
struct RestorePlan<'t> {
    store_version: SchemaVersion,
    /// Domain tables present in the store, in dependency order.
    store_tables: Vec<&'static TableSpec>,
    /// Archived tables, in dependency order.
    tables: Vec<TablePlan<'t>>,
}

impl<'a> RestoreEngine<'a> {
    /// Create an engine refusing archives older than `oldest_restorable`.
    #[must_use]
    pub fn new(oldest_restorable: SchemaVersion) -> Self {
        Self {
            oldest_restorable,
            sink: &NoopSink,
            cancel: CancelToken::new(),
            progress_interval: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub fn progress(mut self, sink: &'a dyn ProgressSink) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Minimum time between `TableProgress` events for one table.
    #[must_use]
    pub const fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Run a restore job.
    ///
    /// All-or-nothing: on any error the store is left as it was.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveVersion` or `InvalidArchive` before any write,
    /// `Resolution` for an unlinkable legacy row in `full` mode,
    /// `IntegrityCheckFailed` if the restored data does not verify,
    /// `Cancelled`, or a database error.
    pub fn restore(
        &self,
        store: &mut SqliteStore,
        archive: &BackupArchive,
        options: RestoreOptions,
    ) -> Result<RestoreReport> {
        let plan = self.validate(store, archive)?;
        info!(
            mode = %options.mode,
            dry_run = options.dry_run,
            archive_version = %archive.source_schema_version,
            store_version = %plan.store_version,
            "Starting restore"
        );

        let tables = match options.mode {
            RestoreMode::Full => self.full(store, &plan, options.dry_run)?,
            RestoreMode::Upsert => self.upsert(store, &plan, options.dry_run)?,
        };

        let report = RestoreReport {
            mode: options.mode,
            dry_run: options.dry_run,
            archive_version: archive.source_schema_version.clone(),
            store_version: plan.store_version,
            tables,
        };
        info!(
            mode = %options.mode,
            dry_run = options.dry_run,
            errors = report.total_errors(),
            "Restore complete"
        );
        Ok(report)
    }

    /// Read and restore an archive file.
    ///
    /// # Errors
    ///
    /// See [`BackupArchive::read_from`] and [`RestoreEngine::restore`].
    pub fn restore_file(
        &self,
        store: &mut SqliteStore,
        path: &Path,
        options: RestoreOptions,
    ) -> Result<RestoreReport> {
        let archive = BackupArchive::read_from(path)?;
        self.restore(store, &archive, options)
    }

    fn validate<'t>(
        &self,
        store: &SqliteStore,
        archive: &'t BackupArchive,
    ) -> Result<RestorePlan<'t>> {
        let store_version = store.schema_version()?.ok_or_else(|| Error::NotInitialized {
            path: store
                .path()
                .map_or_else(|| PathBuf::from(":memory:"), Path::to_path_buf),
        })?;

        let archive_version = &archive.source_schema_version;
        if *archive_version > store_version || *archive_version < self.oldest_restorable {
            return Err(Error::ArchiveVersion {
                archive: archive_version.to_string(),
                store: store_version.to_string(),
                oldest: self.oldest_restorable.to_string(),
            });
        }

        let conn = store.conn();
        let store_tables = existing_tables(conn)?;
        let mut tables = Vec::with_capacity(archive.tables.len());

        for data in &archive.tables {
            let spec = table_spec(&data.name)
                .ok_or_else(|| Error::invalid_archive(format!("unknown table {}", data.name)))?;
            if !store_tables.iter().any(|t| t.name == spec.name) {
                return Err(Error::invalid_archive(format!(
                    "table {} does not exist in the store",
                    spec.name
                )));
            }
            if data.column_index(spec.surrogate_key).is_none() {
                return Err(Error::invalid_archive(format!(
                    "table {} lacks key column {}",
                    spec.name, spec.surrogate_key
                )));
            }

            if let Some((n, row)) = data
                .rows
                .iter()
                .enumerate()
                .find(|(_, row)| row.len() != data.columns.len())
            {
                return Err(Error::invalid_archive(format!(
                    "table {} row {} has {} values for {} columns",
                    spec.name,
                    n + 1,
                    row.len(),
                    data.columns.len()
                )));
            }

            let store_columns = table_columns(conn, spec.name)?;
            for column in &data.columns {
                if !store_columns.iter().any(|c| c.name == column.name) {
                    return Err(Error::invalid_archive(format!(
                        "unknown column {}.{}",
                        spec.name, column.name
                    )));
                }
            }

            let legacy = spec
                .legacy_references
                .iter()
                .filter(|link| {
                    data.column_index(link.column).is_none()
                        && data.column_index(link.via).is_some()
                        && store_columns.iter().any(|c| c.name == link.column)
                })
                .collect();

            tables.push(TablePlan { spec, data, legacy });
        }

        tables.sort_by_key(|t| TABLES.iter().position(|s| s.name == t.spec.name));

        Ok(RestorePlan {
            store_version,
            store_tables,
            tables,
        })
    }

    fn full(
        &self,
        store: &mut SqliteStore,
        plan: &RestorePlan<'_>,
        dry_run: bool,
    ) -> Result<Vec<TableReport>> {
        let mut store = ForeignKeysOff::engage(store)?;

        write_scope(&mut store, "restore_full", dry_run, |tx| {
            let mut reports: Vec<TableReport> = plan
                .store_tables
                .iter()
                .map(|spec| TableReport::new(spec.name))
                .collect();

            for (spec, report) in plan.store_tables.iter().zip(reports.iter_mut()).rev() {
                report.rows_deleted =
                    tx.execute(&format!("DELETE FROM {}", quote_ident(spec.name)), [])?;
            }

            for table in &plan.tables {
                self.cancel
                    .checkpoint(&format!("table {}", table.spec.name))?;
                let inserted = self.insert_all(tx, table.data)?;
                report_mut(&mut reports, table.spec.name).rows_inserted = inserted;

                for link in &table.legacy {
                    resolve_legacy_reference(tx, RESTORE_ORIGIN, table.spec.name, link)?;
                }
            }

            integrity::check(tx)?.into_result()?;
            Ok(reports)
        })
    }

    fn insert_all(&self, conn: &Connection, data: &TableData) -> Result<usize> {
        let columns: Vec<String> = data.columns.iter().map(|c| quote_ident(&c.name)).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let mut stmt = conn.prepare(&format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&data.name),
            columns.join(", "),
            placeholders.join(", ")
        ))?;

        let mut ticker =
            TableTicker::start(self.sink, &data.name, data.rows.len(), self.progress_interval);
        for (n, row) in data.rows.iter().enumerate() {
            stmt.execute(rusqlite::params_from_iter(row.iter()))?;
            ticker.tick(n + 1);
        }
        ticker.finish();
        Ok(data.rows.len())
    }
}

/// Run `f` in a committing transaction, or in one that always rolls back
/// for a dry run.
fn write_scope<F, R>(store: &mut SqliteStore, op: &str, dry_run: bool, f: F) -> Result<R>
where
    F: FnOnce(&mut rusqlite::Transaction<'_>) -> Result<R>,
{
    if dry_run {
        store.rehearse(op, f)
    } else {
        store.transaction(op, f)
    }
}

/// Report for `table`, appended if missing.
fn report_mut<'r>(reports: &'r mut Vec<TableReport>, table: &str) -> &'r mut TableReport {
    let idx = if let Some(idx) = reports.iter().position(|r| r.table == table) {
        idx
    } else {
        reports.push(TableReport::new(table));
        reports.len() - 1
    };
    &mut reports[idx]
}

/// Foreign key enforcement off for as long as the guard lives.
///
/// The pragma is a no-op inside a transaction, so the guard must be
/// engaged before the transaction begins.
struct ForeignKeysOff<'s> {
    store: &'s mut SqliteStore,
}

impl<'s> ForeignKeysOff<'s> {
    fn engage(store: &'s mut SqliteStore) -> Result<Self> {
        store.set_foreign_keys(false)?;
        Ok(Self { store })
    }
}

impl Deref for ForeignKeysOff<'_> {
    type Target = SqliteStore;

    fn deref(&self) -> &SqliteStore {
        self.store
    }
}

impl DerefMut for ForeignKeysOff<'_> {
    fn deref_mut(&mut self) -> &mut SqliteStore {
        self.store
    }
}

impl Drop for ForeignKeysOff<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.set_foreign_keys(true) {
            warn!(error = %e, "Failed to re-enable foreign keys");
        }
    }
}
