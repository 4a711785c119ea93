//! Backup export.
//!
//! Compacts the store (the only step that needs the write lock), then reads
//! every domain table inside one deferred read transaction so the archive
//! is a consistent snapshot.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::archive::hash::file_sha256;
use crate::archive::types::{
    BackupArchive, BackupSummary, Column, ColumnType, TableCount, TableData, Value,
};
use crate::error::{Error, Result};
use crate::progress::{CancelToken, NoopSink, ProgressSink, TableTicker};
use crate::storage::SqliteStore;
use crate::storage::schema::{TableSpec, existing_tables, quote_ident, table_columns};
use crate::storage::sqlite::count_rows;

/// Produces logical backups of a store.
pub struct BackupArchiver<'a> {
    sink: &'a dyn ProgressSink,
    cancel: CancelToken,
    progress_interval: Duration,
}

impl Default for BackupArchiver<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> BackupArchiver<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self {
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

    /// Snapshot every domain table.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` if the store has never been migrated,
    /// `Cancelled` if cancellation is requested between tables, or a
    /// database error.
    pub fn export(&self, store: &mut SqliteStore) -> Result<BackupArchive> {
        let version = store.schema_version()?.ok_or_else(|| Error::NotInitialized {
            path: store
                .path()
                .map_or_else(|| PathBuf::from(":memory:"), Path::to_path_buf),
        })?;

        store.compact()?;

        let tables = store.read_snapshot(|tx| {
            let mut tables = Vec::new();
            for spec in existing_tables(tx)? {
                self.cancel.checkpoint(&format!("table {}", spec.name))?;
                tables.push(self.export_table(tx, spec)?);
            }
            Ok(tables)
        })?;

        info!(
            version = %version,
            tables = tables.len(),
            rows = tables.iter().map(|t| t.rows.len()).sum::<usize>(),
            "Export complete"
        );
        Ok(BackupArchive {
            source_schema_version: version,
            generated_at: chrono::Utc::now(),
            tables,
        })
    }

    /// Export and write the archive to `path`.
    ///
    /// # Errors
    ///
    /// Returns any export error, or an error writing the file.
    pub fn backup(&self, store: &mut SqliteStore, path: &Path) -> Result<BackupSummary> {
        let archive = self.export(store)?;
        archive.write_to(path)?;

        let bytes = std::fs::metadata(path)?.len();
        info!(path = %path.display(), bytes, "Backup written");
        Ok(BackupSummary {
            path: path.to_path_buf(),
            schema_version: archive.source_schema_version.clone(),
            tables: archive
                .tables
                .iter()
                .map(|t| TableCount {
                    table: t.name.clone(),
                    rows: t.rows.len(),
                })
                .collect(),
            bytes,
            sha256: file_sha256(path)?,
        })
    }

    fn export_table(&self, conn: &Connection, spec: &TableSpec) -> Result<TableData> {
        let columns: Vec<Column> = table_columns(conn, spec.name)?
            .into_iter()
            .map(|info| Column {
                kind: ColumnType::from_declared(&info.decl_type),
                nullable: !info.not_null && !info.primary_key,
                name: info.name,
            })
            .collect();

        let total = count_rows(conn, spec.name)?;
        let mut ticker = TableTicker::start(self.sink, spec.name, total, self.progress_interval);

        let select = format!(
            "SELECT {} FROM {} ORDER BY rowid",
            columns
                .iter()
                .map(|c| quote_ident(&c.name))
                .collect::<Vec<_>>()
                .join(", "),
            quote_ident(spec.name)
        );
        let mut stmt = conn.prepare(&select)?;
        let mut rows = stmt.query([])?;

        let mut out = Vec::with_capacity(total);
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for (idx, column) in columns.iter().enumerate() {
                let raw: rusqlite::types::Value = row.get(idx)?;
                values.push(Value::from_sql(raw, column.kind)?);
            }
            out.push(values);
            ticker.tick(out.len());
        }
        ticker.finish();

        debug!(table = spec.name, rows = out.len(), "Exported table");
        Ok(TableData {
            name: spec.name.to_string(),
            columns,
            rows: out,
        })
    }
}
