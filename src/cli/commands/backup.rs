//! Backup command implementation.

use std::path::Path;

use colored::Colorize;

use super::{StderrSink, existing_engine_config, finish_job};
use crate::engine::Engine;
use crate::error::Result;

/// Execute the backup command.
///
/// The store is brought to the latest version first, so archives are
/// always taken at a version this build knows.
///
/// # Errors
///
/// Returns `NotInitialized` if the store does not exist, or an error from
/// opening, migrating or exporting it.
pub fn execute(db: Option<&Path>, output: &Path, quiet: bool, json: bool) -> Result<()> {
    let config = existing_engine_config(db)?;
    let sink = StderrSink::new(quiet, json);

    let (engine, _) = Engine::open(config, &sink)?;
    let (_, summary) = finish_job(engine.spawn_backup(output.to_path_buf())?, &sink)?;

    if json {
        println!("{}", serde_json::to_string(&summary)?);
    } else if !quiet {
        println!(
            "{} {} (schema {}, {} bytes)",
            "Backup written:".green().bold(),
            summary.path.display(),
            summary.schema_version,
            summary.bytes
        );
        for table in &summary.tables {
            println!("table={} rows={}", table.table, table.rows);
        }
        println!("sha256={}", summary.sha256);
    }
    Ok(())
}
