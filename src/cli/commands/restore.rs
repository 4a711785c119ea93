//! Restore command implementation.

use std::path::Path;

use colored::Colorize;

use super::{StderrSink, engine_config, finish_job};
use crate::archive::RestoreOptions;
use crate::cli::RestoreArgs;
use crate::engine::Engine;
use crate::error::Result;

/// Execute the restore command.
///
/// Prints one `table=<name> inserted=N ...` line per table. Row conflicts
/// in upsert mode are listed but do not fail the command.
///
/// # Errors
///
/// Returns the restore error; the store is unchanged in that case.
pub fn execute(db: Option<&Path>, args: &RestoreArgs, quiet: bool, json: bool) -> Result<()> {
    let config = engine_config(db)?;
    let sink = StderrSink::new(quiet, json);
    let options = RestoreOptions {
        mode: args.mode,
        dry_run: args.dry_run,
    };

    let (engine, _) = Engine::open(config, &sink)?;
    let (_, report) = finish_job(engine.spawn_restore(args.archive.clone(), options)?, &sink)?;

    if json {
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }

    if !quiet {
        let heading = format!(
            "Restore ({}{}) of archive {} into store {}",
            report.mode,
            if report.dry_run { ", dry run" } else { "" },
            report.archive_version,
            report.store_version
        );
        println!("{}", heading.cyan().bold());
    }
    for table in &report.tables {
        println!("{}", table.summary_line());
    }
    if !quiet {
        for conflict in report.tables.iter().flat_map(|t| &t.errors) {
            println!(
                "  {} {} {}: {}",
                "conflict".yellow(),
                conflict.table,
                conflict.row_key,
                conflict.reason
            );
        }
        if report.dry_run {
            println!("{}", "Dry run: nothing was written.".dimmed());
        }
    }
    Ok(())
}
