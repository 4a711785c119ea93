//! Migration runner.
//!
//! Drives a store from its current version to a target:
//!
//! ```text
//! detect gap -> up to date (no writes)
//!            -> backup -> [apply step -> verify step]* -> commit version
//! apply/verify failure -> roll back step -> restore backup -> quarantine backup
//! ```
//!
//! Each step runs in its own IMMEDIATE transaction together with its
//! `migration_history` row. The schema version is written once, after the
//! last step committed, so a crash mid-chain re-runs the (idempotent) steps
//! on the next start.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::integrity;
use crate::migrate::steps::{MigrationStep, StepCatalog};
use crate::migrate::version::{Resolution, SchemaVersion, resolve};
use crate::progress::{CancelToken, NoopSink, ProgressEvent, ProgressSink, StepStatus};
use crate::storage::SqliteStore;
use crate::storage::sqlite::write_schema_version;

/// File name prefix of pre-migration backups.
pub const BACKUP_PREFIX: &str = "pre-migrate-";

/// Marker appended to a backup after a failed chain was rolled back to it.
pub const FAILED_MARKER: &str = ".failed";

/// What a migration run did.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome {
    pub from: Option<SchemaVersion>,
    /// Version after the run; equals `from` when nothing was applied.
    pub to: Option<SchemaVersion>,
    /// Step ids applied, in order.
    pub applied: Vec<String>,
    /// Pre-migration backup, if one was taken.
    pub backup: Option<PathBuf>,
}

impl MigrationOutcome {
    /// True if the run found nothing to do.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Applies pending steps from a catalog.
pub struct MigrationRunner<'a> {
    catalog: &'a StepCatalog,
    backup_dir: PathBuf,
    keep_backups: usize,
    sink: &'a dyn ProgressSink,
    cancel: CancelToken,
}

impl<'a> MigrationRunner<'a> {
    /// Create a runner writing pre-migration backups into `backup_dir`.
    #[must_use]
    pub fn new(catalog: &'a StepCatalog, backup_dir: &Path) -> Self {
        Self {
            catalog,
            backup_dir: backup_dir.to_path_buf(),
            keep_backups: 0,
            sink: &NoopSink,
            cancel: CancelToken::new(),
        }
    }

    /// Keep at most `n` successful backups (0 keeps all).
    #[must_use]
    pub const fn keep_backups(mut self, n: usize) -> Self {
        self.keep_backups = n;
        self
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

    /// Migrate to the catalog's latest version.
    ///
    /// # Errors
    ///
    /// See [`MigrationRunner::run`].
    pub fn run_to_latest(&self, store: &mut SqliteStore) -> Result<MigrationOutcome> {
        match self.catalog.latest() {
            Some(latest) => {
                let latest = latest.clone();
                self.run(store, &latest)
            }
            None => {
                let current = store.schema_version()?;
                Ok(MigrationOutcome {
                    from: current.clone(),
                    to: current,
                    applied: Vec::new(),
                    backup: None,
                })
            }
        }
    }

    /// Migrate the store to `target`.
    ///
    /// When the store is already at or past `target` nothing is written.
    ///
    /// # Errors
    ///
    /// Returns the failing step's error (`MigrationStep`, `Resolution` or
    /// `IntegrityCheckFailed`) or `Cancelled`, after the store has been
    /// restored to its pre-migration state.
    pub fn run(&self, store: &mut SqliteStore, target: &SchemaVersion) -> Result<MigrationOutcome> {
        let current = store.schema_version()?;

        let steps = match resolve(current.as_ref(), target, self.catalog) {
            Resolution::UpToDate => {
                info!(
                    current = current.as_ref().map(SchemaVersion::as_str),
                    target = %target,
                    "No migration needed"
                );
                self.sink.emit(ProgressEvent::NoMigrationNeeded {
                    current: current.as_ref().map(ToString::to_string),
                    target: target.to_string(),
                });
                return Ok(MigrationOutcome {
                    from: current.clone(),
                    to: current,
                    applied: Vec::new(),
                    backup: None,
                });
            }
            Resolution::Pending(steps) => steps,
        };

        info!(
            from = current.as_ref().map(SchemaVersion::as_str),
            to = %target,
            steps = steps.len(),
            "Starting migration"
        );
        self.sink.emit(ProgressEvent::MigrationStarted {
            from: current.as_ref().map(ToString::to_string),
            to: target.to_string(),
            steps: steps.len(),
        });

        let backup = self.backup_path(current.as_ref(), target);
        store.backup_to(&backup)?;
        debug!(path = %backup.display(), "Pre-migration backup written");
        self.sink.emit(ProgressEvent::BackupCreated {
            path: backup.clone(),
        });

        let mut applied = Vec::with_capacity(steps.len());
        for step in &steps {
            if let Err(e) = self.cancel.checkpoint(&format!("step {}", step.id())) {
                warn!(step = step.id(), "Migration cancelled");
                return Err(roll_back(store, &backup, e));
            }

            if let Err(e) = self.apply_step(store, step) {
                error!(step = step.id(), error = %e, "Migration step failed");
                self.sink.emit(ProgressEvent::Step {
                    step_id: step.id().to_string(),
                    status: StepStatus::Failed,
                });
                let e = roll_back(store, &backup, e);
                quarantine_backup(&backup);
                self.sink.emit(ProgressEvent::Step {
                    step_id: step.id().to_string(),
                    status: StepStatus::RolledBack,
                });
                return Err(e);
            }
            applied.push(step.id().to_string());
        }

        // `steps` is non-empty for `Pending`.
        let reached = steps[steps.len() - 1].version().clone();
        let committed = store.transaction("commit_version", |tx| {
            integrity::check(tx)?.into_result()?;
            write_schema_version(tx, &reached)
        });
        if let Err(e) = committed {
            error!(error = %e, "Final verification failed");
            let e = roll_back(store, &backup, e);
            quarantine_backup(&backup);
            return Err(e);
        }

        info!(version = %reached, "Schema version committed");
        self.sink.emit(ProgressEvent::VersionCommitted {
            version: reached.to_string(),
        });

        if let Err(e) = self.prune_backups() {
            warn!(error = %e, "Failed to prune old backups");
        }

        Ok(MigrationOutcome {
            from: current,
            to: Some(reached),
            applied,
            backup: Some(backup),
        })
    }

    fn apply_step(&self, store: &mut SqliteStore, step: &MigrationStep) -> Result<()> {
        info!(version = step.id(), description = step.description(), "Applying migration");
        self.sink.emit(ProgressEvent::Step {
            step_id: step.id().to_string(),
            status: StepStatus::Started,
        });

        store.transaction(step.id(), |tx| {
            step.apply(tx)?;
            tx.execute(
                "INSERT OR REPLACE INTO migration_history (version, description, applied_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    step.id(),
                    step.description(),
                    chrono::Utc::now().timestamp_millis()
                ],
            )?;
            self.sink.emit(ProgressEvent::Step {
                step_id: step.id().to_string(),
                status: StepStatus::Applied,
            });

            integrity::quick_check(tx)?.into_result()
        })?;

        self.sink.emit(ProgressEvent::Step {
            step_id: step.id().to_string(),
            status: StepStatus::Verified,
        });
        Ok(())
    }

    fn backup_path(&self, from: Option<&SchemaVersion>, to: &SchemaVersion) -> PathBuf {
        let from = from.map_or("unset", SchemaVersion::as_str);
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        self.backup_dir
            .join(format!("{BACKUP_PREFIX}{from}-to-{to}-{stamp}.db"))
    }

    /// Delete the oldest successful backups beyond `keep_backups`.
    fn prune_backups(&self) -> Result<()> {
        if self.keep_backups == 0 {
            return Ok(());
        }

        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(BACKUP_PREFIX) && name.ends_with(".db") {
                backups.push((entry.metadata()?.modified()?, entry.path()));
            }
        }

        if backups.len() <= self.keep_backups {
            return Ok(());
        }

        backups.sort();
        let excess = backups.len() - self.keep_backups;
        for (_, path) in backups.into_iter().take(excess) {
            debug!(path = %path.display(), "Pruning old backup");
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Put the store back to `backup` after `cause`, which stays the reported
/// error even if the restore itself fails.
fn roll_back(store: &mut SqliteStore, backup: &Path, cause: Error) -> Error {
    match store.restore_from(backup) {
        Ok(()) => info!(backup = %backup.display(), "Store restored from pre-migration backup"),
        Err(e) => error!(
            backup = %backup.display(),
            error = %e,
            cause = %cause,
            "Failed to restore pre-migration backup"
        ),
    }
    cause
}

/// Keep the failed run's recovery point, out of the pruning rotation.
fn quarantine_backup(backup: &Path) {
    let mut failed = backup.as_os_str().to_owned();
    failed.push(FAILED_MARKER);
    if let Err(e) = fs::rename(backup, &failed) {
        warn!(path = %backup.display(), error = %e, "Failed to mark backup as failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolutionReason;
    use crate::migrate::steps::StepAction;
    use crate::storage::schema::{column_exists, table_exists};
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn v(s: &str) -> SchemaVersion {
        SchemaVersion::parse(s).unwrap()
    }

    fn total_changes(store: &SqliteStore) -> i64 {
        store
            .conn()
            .query_row("SELECT total_changes()", [], |row| row.get(0))
            .unwrap()
    }

    fn setup() -> (TempDir, SqliteStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&temp_dir.path().join("duelstore.db")).unwrap();
        (temp_dir, store)
    }

    fn backups(dir: &Path) -> Vec<String> {
        if !dir.exists() {
            return Vec::new();
        }
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Store at version 002 with two decks sharing a name.
    fn seed_ambiguous(store: &mut SqliteStore, backup_dir: &Path, catalog: &StepCatalog) {
        MigrationRunner::new(catalog, backup_dir)
            .run(store, &v("002"))
            .unwrap();
        store
            .conn()
            .execute_batch(
                "INSERT INTO decks (name, created_at) VALUES ('Blue-Eyes', 0), ('Blue-Eyes', 1);
                 INSERT INTO matches (deck_name, result, played_at) VALUES ('Blue-Eyes', 'win', 5);",
            )
            .unwrap();
    }

    #[test]
    fn test_fresh_store_migrates_to_latest() {
        let (temp_dir, mut store) = setup();
        let catalog = StepCatalog::builtin();
        let backup_dir = temp_dir.path().join("backups");

        let outcome = MigrationRunner::new(&catalog, &backup_dir)
            .run_to_latest(&mut store)
            .unwrap();

        assert!(outcome.from.is_none());
        assert_eq!(outcome.to.unwrap().as_str(), "004");
        assert_eq!(outcome.applied, ["001", "002", "003", "004"]);
        assert_eq!(store.schema_version().unwrap().unwrap().as_str(), "004");
        assert!(column_exists(store.conn(), "matches", "deck_id").unwrap());
        assert_eq!(store.row_count("migration_history").unwrap(), 4);

        let names = backups(&backup_dir);
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("pre-migrate-unset-to-004-"));
    }

    #[test]
    fn test_current_ahead_of_target_is_noop() {
        let (temp_dir, mut store) = setup();
        let catalog = StepCatalog::builtin();
        let backup_dir = temp_dir.path().join("backups");
        MigrationRunner::new(&catalog, &backup_dir)
            .run_to_latest(&mut store)
            .unwrap();
        fs::remove_dir_all(&backup_dir).unwrap();

        let changes_before = total_changes(&store);
        let (tx, rx) = mpsc::channel();
        let outcome = MigrationRunner::new(&catalog, &backup_dir)
            .progress(&tx)
            .run(&mut store, &v("002"))
            .unwrap();

        assert!(outcome.is_noop());
        assert_eq!(total_changes(&store), changes_before);
        assert_eq!(store.schema_version().unwrap().unwrap().as_str(), "004");
        assert!(backups(&backup_dir).is_empty());
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![ProgressEvent::NoMigrationNeeded {
                current: Some("004".to_string()),
                target: "002".to_string(),
            }]
        );
    }

    #[test]
    fn test_second_run_is_noop() {
        let (temp_dir, mut store) = setup();
        let catalog = StepCatalog::builtin();
        let runner = MigrationRunner::new(&catalog, &temp_dir.path().join("backups"));

        runner.run_to_latest(&mut store).unwrap();
        let changes_before = total_changes(&store);
        let outcome = runner.run_to_latest(&mut store).unwrap();

        assert!(outcome.is_noop());
        assert_eq!(total_changes(&store), changes_before);
    }

    #[test]
    fn test_legacy_names_are_linked() {
        let (temp_dir, mut store) = setup();
        let catalog = StepCatalog::builtin();
        let runner = MigrationRunner::new(&catalog, &temp_dir.path().join("backups"));
        runner.run(&mut store, &v("002")).unwrap();
        store
            .conn()
            .execute_batch(
                "INSERT INTO decks (name, created_at) VALUES ('Blue-Eyes', 0), ('Dark Magician', 0);
                 INSERT INTO matches (deck_name, result, played_at) VALUES
                     ('Dark Magician', 'win', 10), ('Blue-Eyes', 'loss', 20);",
            )
            .unwrap();

        runner.run_to_latest(&mut store).unwrap();

        let linked: Vec<(String, i64)> = store
            .conn()
            .prepare("SELECT deck_name, deck_id FROM matches ORDER BY id")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(
            linked,
            [
                ("Dark Magician".to_string(), 2),
                ("Blue-Eyes".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_ambiguous_reference_aborts_chain_and_restores() {
        let (temp_dir, mut store) = setup();
        let catalog = StepCatalog::builtin();
        let backup_dir = temp_dir.path().join("backups");
        seed_ambiguous(&mut store, &backup_dir, &catalog);

        let (tx, rx) = mpsc::channel();
        let err = MigrationRunner::new(&catalog, &backup_dir)
            .progress(&tx)
            .run_to_latest(&mut store)
            .unwrap_err();

        match err {
            Error::Resolution {
                step,
                table,
                reason,
                ..
            } => {
                assert_eq!(step, "003");
                assert_eq!(table, "matches");
                assert_eq!(reason, ResolutionReason::Ambiguous { candidates: 2 });
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(store.schema_version().unwrap().unwrap().as_str(), "002");
        assert!(!column_exists(store.conn(), "matches", "deck_id").unwrap());
        assert_eq!(store.row_count("decks").unwrap(), 2);
        assert_eq!(store.row_count("matches").unwrap(), 1);
        assert!(
            backups(&backup_dir)
                .iter()
                .any(|n| n.starts_with("pre-migrate-002-to-004-") && n.ends_with(".db.failed"))
        );

        let statuses: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                ProgressEvent::Step { step_id, status } => Some((step_id, status)),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses.last().unwrap(),
            &("003".to_string(), StepStatus::RolledBack)
        );
        assert!(statuses.contains(&("003".to_string(), StepStatus::Failed)));
        assert!(!statuses.contains(&("004".to_string(), StepStatus::Started)));
    }

    #[test]
    fn test_failing_sql_step_rolls_back_whole_chain() {
        let (temp_dir, mut store) = setup();
        let mut steps: Vec<MigrationStep> = StepCatalog::builtin().iter().cloned().collect();
        steps.push(MigrationStep::new(
            v("005"),
            "broken",
            vec![StepAction::sql("CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY); INSERT INTO nowhere VALUES (1);")],
        ));
        let catalog = StepCatalog::new(steps).unwrap();

        let err = MigrationRunner::new(&catalog, &temp_dir.path().join("backups"))
            .run_to_latest(&mut store)
            .unwrap_err();

        assert!(matches!(err, Error::MigrationStep { ref step, .. } if step == "005"));
        assert!(store.schema_version().unwrap().is_none());
        assert!(!table_exists(store.conn(), "decks").unwrap());
        assert!(!table_exists(store.conn(), "notes").unwrap());
    }

    /// Rewrite that corrupts every backup beside the store, then fails.
    fn clobber_backups_then_fail(tx: &rusqlite::Transaction<'_>, _: &MigrationStep) -> Result<()> {
        let db = Path::new(tx.path().unwrap());
        for entry in fs::read_dir(db.parent().unwrap().join("backups")).unwrap() {
            fs::write(entry.unwrap().path(), vec![0x42u8; 4096]).unwrap();
        }
        Err(Error::InvalidArgument("rewrite failed".to_string()))
    }

    #[test]
    fn test_step_error_survives_failed_rollback() {
        let (temp_dir, mut store) = setup();
        let catalog = StepCatalog::new(vec![MigrationStep::new(
            v("001"),
            "clobber",
            vec![StepAction::Rewrite(clobber_backups_then_fail)],
        )])
        .unwrap();

        let err = MigrationRunner::new(&catalog, &temp_dir.path().join("backups"))
            .run_to_latest(&mut store)
            .unwrap_err();

        assert!(
            matches!(err, Error::InvalidArgument(ref msg) if msg == "rewrite failed"),
            "{err}"
        );
    }

    #[test]
    fn test_cancelled_chain_restores_backup() {
        let (temp_dir, mut store) = setup();
        let catalog = StepCatalog::builtin();
        let token = CancelToken::new();
        token.cancel();

        let err = MigrationRunner::new(&catalog, &temp_dir.path().join("backups"))
            .cancel_token(token)
            .run_to_latest(&mut store)
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled { ref phase } if phase == "step 001"));
        assert!(store.schema_version().unwrap().is_none());
        assert!(!table_exists(store.conn(), "decks").unwrap());
    }

    #[test]
    fn test_old_backups_are_pruned() {
        let (temp_dir, mut store) = setup();
        let catalog = StepCatalog::builtin();
        let backup_dir = temp_dir.path().join("backups");
        fs::create_dir_all(&backup_dir).unwrap();
        for name in ["pre-migrate-old-1.db", "pre-migrate-old-2.db", "unrelated.txt"] {
            fs::write(backup_dir.join(name), b"x").unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(20));

        MigrationRunner::new(&catalog, &backup_dir)
            .keep_backups(1)
            .run_to_latest(&mut store)
            .unwrap();

        let names = backups(&backup_dir);
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"unrelated.txt".to_string()));
        assert!(names.iter().any(|n| n.starts_with("pre-migrate-unset-to-004-")));
    }
}
