//! Engine: one store, its configuration and its step catalog.
//!
//! Opening goes through the startup guard (quarantine a corrupt file) and
//! then migrates to the catalog's latest version. Long jobs can run on a
//! worker thread: the `spawn_*` methods move the engine into the worker and
//! hand back a [`JobHandle`] streaming [`ProgressEvent`]s; joining returns
//! the engine together with the job's result.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, info};

use crate::archive::{
    BackupArchiver, BackupSummary, RestoreEngine, RestoreOptions, RestoreReport, TableCount,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::integrity::{self, IntegrityStatus};
use crate::migrate::{MigrationOutcome, MigrationRunner, Resolution, SchemaVersion, StepCatalog};
use crate::progress::{CancelToken, ProgressEvent, ProgressSink};
use crate::storage::SqliteStore;
use crate::storage::schema::existing_tables;

/// What happened while opening the store.
#[derive(Debug, Clone, Serialize)]
pub struct OpenReport {
    /// Where a corrupt store was moved before a fresh one was created.
    pub quarantined: Option<PathBuf>,
    /// Migration to latest run on open; `None` when opened without it.
    pub migration: Option<MigrationOutcome>,
}

/// A step not yet applied to the store.
#[derive(Debug, Clone, Serialize)]
pub struct PendingStep {
    pub version: SchemaVersion,
    pub description: String,
}

/// Store version against the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub db_path: PathBuf,
    pub current: Option<SchemaVersion>,
    pub latest: Option<SchemaVersion>,
    pub pending: Vec<PendingStep>,
    pub tables: Vec<TableCount>,
}

/// Owns a store for the lifetime of the process.
pub struct Engine {
    config: EngineConfig,
    store: SqliteStore,
    catalog: StepCatalog,
}

impl Engine {
    /// Open the store and migrate it to the latest version.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened, the step catalog
    /// cannot be loaded, or migration fails (the store is then back at its
    /// previous version).
    pub fn open(config: EngineConfig, sink: &dyn ProgressSink) -> Result<(Self, OpenReport)> {
        let (mut engine, mut report) = Self::attach(config, sink)?;
        report.migration = Some(engine.migrate(None, sink, CancelToken::new())?);
        Ok((engine, report))
    }

    /// Open the store through the startup guard without migrating.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or the step catalog
    /// cannot be loaded.
    pub fn attach(config: EngineConfig, sink: &dyn ProgressSink) -> Result<(Self, OpenReport)> {
        let catalog = match &config.migrations_dir {
            Some(dir) => StepCatalog::discover(dir)?,
            None => StepCatalog::builtin(),
        };
        let guarded = integrity::open_checked(
            &config.db_path,
            &config.quarantine_dir,
            config.busy_timeout_ms,
            sink,
        )?;
        debug!(path = %config.db_path.display(), steps = catalog.len(), "Store attached");

        Ok((
            Self {
                config,
                store: guarded.store,
                catalog,
            },
            OpenReport {
                quarantined: guarded.quarantined,
                migration: None,
            },
        ))
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SqliteStore {
        &mut self.store
    }

    #[must_use]
    pub const fn catalog(&self) -> &StepCatalog {
        &self.catalog
    }

    /// Migrate to `target`, or to the latest version when `None`.
    ///
    /// # Errors
    ///
    /// See [`MigrationRunner::run`].
    pub fn migrate(
        &mut self,
        target: Option<&SchemaVersion>,
        sink: &dyn ProgressSink,
        cancel: CancelToken,
    ) -> Result<MigrationOutcome> {
        let runner = MigrationRunner::new(&self.catalog, &self.config.backup_dir)
            .keep_backups(self.config.keep_backups)
            .progress(sink)
            .cancel_token(cancel);
        match target {
            Some(target) => runner.run(&mut self.store, target),
            None => runner.run_to_latest(&mut self.store),
        }
    }

    /// Write a backup archive to `path`.
    ///
    /// # Errors
    ///
    /// See [`BackupArchiver::backup`].
    pub fn backup(
        &mut self,
        path: &Path,
        sink: &dyn ProgressSink,
        cancel: CancelToken,
    ) -> Result<BackupSummary> {
        BackupArchiver::new()
            .progress(sink)
            .cancel_token(cancel)
            .progress_interval(self.config.progress_interval())
            .backup(&mut self.store, path)
    }

    /// Restore the archive at `path`.
    ///
    /// # Errors
    ///
    /// See [`RestoreEngine::restore`].
    pub fn restore(
        &mut self,
        path: &Path,
        options: RestoreOptions,
        sink: &dyn ProgressSink,
        cancel: CancelToken,
    ) -> Result<RestoreReport> {
        RestoreEngine::new(self.config.oldest_restorable.clone())
            .progress(sink)
            .cancel_token(cancel)
            .progress_interval(self.config.progress_interval())
            .restore_file(&mut self.store, path, options)
    }

    /// Full structural and referential check.
    ///
    /// # Errors
    ///
    /// Returns a database error if the check itself cannot run.
    pub fn check(&self) -> Result<IntegrityStatus> {
        integrity::check(self.store.conn())
    }

    /// Current version, latest available and the steps in between.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored version or table counts cannot be read.
    pub fn status(&self) -> Result<StoreStatus> {
        let current = self.store.schema_version()?;
        let latest = self.catalog.latest().cloned();

        let pending = match &latest {
            Some(latest) => {
                match crate::migrate::resolve(current.as_ref(), latest, &self.catalog) {
                    Resolution::UpToDate => Vec::new(),
                    Resolution::Pending(steps) => steps
                        .into_iter()
                        .map(|step| PendingStep {
                            version: step.version().clone(),
                            description: step.description().to_string(),
                        })
                        .collect(),
                }
            }
            None => Vec::new(),
        };

        let tables = existing_tables(self.store.conn())?
            .into_iter()
            .map(|spec| {
                Ok(TableCount {
                    table: spec.name.to_string(),
                    rows: self.store.row_count(spec.name)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(StoreStatus {
            db_path: self.config.db_path.clone(),
            current,
            latest,
            pending,
            tables,
        })
    }

    /// Run [`Engine::migrate`] on a worker thread.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn spawn_migration(self, target: Option<SchemaVersion>) -> Result<JobHandle<MigrationOutcome>> {
        self.spawn("migrate", move |engine, sink, cancel| {
            engine.migrate(target.as_ref(), sink, cancel)
        })
    }

    /// Run [`Engine::backup`] on a worker thread.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn spawn_backup(self, path: PathBuf) -> Result<JobHandle<BackupSummary>> {
        self.spawn("backup", move |engine, sink, cancel| {
            engine.backup(&path, sink, cancel)
        })
    }

    /// Run [`Engine::restore`] on a worker thread.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn spawn_restore(
        self,
        path: PathBuf,
        options: RestoreOptions,
    ) -> Result<JobHandle<RestoreReport>> {
        self.spawn("restore", move |engine, sink, cancel| {
            engine.restore(&path, options, sink, cancel)
        })
    }

    fn spawn<T, F>(mut self, job: &str, work: F) -> Result<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Self, &dyn ProgressSink, CancelToken) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();

        let handle = thread::Builder::new()
            .name(format!("duelstore-{job}"))
            .spawn(move || {
                let result = work(&mut self, &tx, worker_cancel);
                (self, result)
            })?;
        info!(job, "Job started on worker thread");

        Ok(JobHandle {
            events: rx,
            cancel,
            handle,
        })
    }
}

/// A job running on a worker thread.
///
/// The worker never blocks on the channel; events queue until drained.
pub struct JobHandle<T> {
    events: Receiver<ProgressEvent>,
    cancel: CancelToken,
    handle: JoinHandle<(Engine, Result<T>)>,
}

impl<T> JobHandle<T> {
    /// Progress events, in emission order. Iteration ends when the job does.
    #[must_use]
    pub const fn events(&self) -> &Receiver<ProgressEvent> {
        &self.events
    }

    /// Ask the job to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the job, getting the engine back alongside its result.
    ///
    /// # Errors
    ///
    /// Returns `WorkerPanicked` if the worker thread panicked; the engine
    /// is lost in that case.
    pub fn join(self) -> Result<(Engine, Result<T>)> {
        self.handle.join().map_err(|_| Error::WorkerPanicked)
    }
}
