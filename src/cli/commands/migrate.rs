//! Migrate command implementation.

use std::path::Path;

use colored::Colorize;

use super::{StderrSink, engine_config, finish_job};
use crate::engine::Engine;
use crate::error::Result;
use crate::migrate::SchemaVersion;

/// Execute the migrate command.
///
/// Creates the store if it does not exist yet.
///
/// # Errors
///
/// Returns `VersionParse` for a malformed `--target`, or the migration
/// error after the store has been put back to its previous version.
pub fn execute(db: Option<&Path>, target: Option<&str>, quiet: bool, json: bool) -> Result<()> {
    let target = target.map(SchemaVersion::parse).transpose()?;
    let config = engine_config(db)?;
    let sink = StderrSink::new(quiet, json);

    let (engine, opened) = Engine::attach(config, &sink)?;
    let (_, outcome) = finish_job(engine.spawn_migration(target)?, &sink)?;

    if json {
        let output = serde_json::json!({
            "quarantined": opened.quarantined,
            "migration": outcome,
        });
        println!("{output}");
    } else if !quiet {
        let version = outcome
            .to
            .as_ref()
            .map_or_else(|| "unset".to_string(), ToString::to_string);
        if outcome.is_noop() {
            println!("{} already at {version}", "✓".green());
        } else {
            println!(
                "{} migrated to {version} ({})",
                "✓".green(),
                outcome.applied.join(", ")
            );
        }
    }
    Ok(())
}
