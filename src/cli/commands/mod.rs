//! Command implementations.

pub mod backup;
pub mod check;
pub mod migrate;
pub mod restore;
pub mod status;
pub mod version;

use std::path::Path;

use colored::Colorize;
use tracing::debug;

use crate::config::{EngineConfig, resolve_db_path};
use crate::engine::{Engine, JobHandle};
use crate::error::{Error, Result};
use crate::progress::{ProgressEvent, ProgressSink, StepStatus};

/// Renders progress on stderr for a human at a terminal.
///
/// Silent when `enabled` is false so JSON and quiet runs keep stderr clean.
pub(crate) struct StderrSink {
    enabled: bool,
}

impl StderrSink {
    pub(crate) const fn new(quiet: bool, json: bool) -> Self {
        Self {
            enabled: !quiet && !json,
        }
    }
}

impl ProgressSink for StderrSink {
    fn emit(&self, event: ProgressEvent) {
        debug!(?event, "Progress");
        if self.enabled {
            render_event(&event);
        }
    }
}

fn render_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::MigrationStarted { from, to, steps } => eprintln!(
            "{} {} -> {to} ({steps} step{})",
            "Migrating".cyan().bold(),
            from.as_deref().unwrap_or("unset"),
            if *steps == 1 { "" } else { "s" }
        ),
        ProgressEvent::BackupCreated { path } => {
            eprintln!("  {}", format!("backup {}", path.display()).dimmed());
        }
        ProgressEvent::Step { step_id, status } => match status {
            StepStatus::Verified => eprintln!("  {} {step_id}", "✓".green()),
            StepStatus::Failed => eprintln!("  {} {step_id} failed", "✗".red()),
            StepStatus::RolledBack => {
                eprintln!("  {} rolled back to pre-migration backup", "↺".yellow());
            }
            StepStatus::Started | StepStatus::Applied => {}
        },
        ProgressEvent::VersionCommitted { version } => {
            eprintln!("{} {version}", "Schema version".green().bold());
        }
        ProgressEvent::Quarantined { path } => eprintln!(
            "{} corrupt store moved to {}",
            "Warning:".yellow().bold(),
            path.display()
        ),
        ProgressEvent::TableFinished { table } => eprintln!("  {} {table}", "✓".green()),
        ProgressEvent::NoMigrationNeeded { .. }
        | ProgressEvent::TableStarted { .. }
        | ProgressEvent::TableProgress { .. } => {}
    }
}

/// Resolve the database path and load its configuration.
pub(crate) fn engine_config(db: Option<&Path>) -> Result<EngineConfig> {
    let db_path = resolve_db_path(db).ok_or_else(|| {
        Error::Config("Cannot determine a home directory; pass --db".to_string())
    })?;
    EngineConfig::load(&db_path)
}

/// Like [`engine_config`], but the store must already exist.
pub(crate) fn existing_engine_config(db: Option<&Path>) -> Result<EngineConfig> {
    let config = engine_config(db)?;
    if !config.db_path.exists() {
        return Err(Error::NotInitialized {
            path: config.db_path,
        });
    }
    Ok(config)
}

/// Drain a job's progress into `sink`, then wait for it.
pub(crate) fn finish_job<T>(job: JobHandle<T>, sink: &StderrSink) -> Result<(Engine, T)> {
    for event in job.events() {
        sink.emit(event);
    }
    let (engine, result) = job.join()?;
    Ok((engine, result?))
}
