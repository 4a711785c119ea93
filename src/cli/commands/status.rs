//! Status command implementation.

use std::path::Path;

use colored::Colorize;

use super::{StderrSink, existing_engine_config};
use crate::engine::Engine;
use crate::error::Result;

/// Execute status command.
///
/// Attaches without migrating so pending steps are visible.
///
/// # Errors
///
/// Returns `NotInitialized` if the store does not exist, or an error
/// opening or reading it.
pub fn execute(db: Option<&Path>, json: bool) -> Result<()> {
    let config = existing_engine_config(db)?;
    let (engine, _) = Engine::attach(config, &StderrSink::new(false, json))?;
    let status = engine.status()?;

    if json {
        println!("{}", serde_json::to_string(&status)?);
        return Ok(());
    }

    println!("duelstore status");
    println!("================");
    println!();
    println!("Database: {}", status.db_path.display());
    let current = status
        .current
        .as_ref()
        .map_or_else(|| "unset".to_string(), ToString::to_string);
    let latest = status
        .latest
        .as_ref()
        .map_or_else(|| "none".to_string(), ToString::to_string);
    println!("Schema:   {current} (latest {latest})");

    if status.pending.is_empty() {
        println!("Pending:  {}", "none".green());
    } else {
        println!("Pending:  {}", status.pending.len().to_string().yellow());
        for step in &status.pending {
            println!("  {} {}", step.version, step.description);
        }
        println!();
        println!("Apply with: duelstore migrate");
    }

    if !status.tables.is_empty() {
        println!();
        println!("Tables:");
        for table in &status.tables {
            println!("  {:<10} {} rows", table.table, table.rows);
        }
    }
    Ok(())
}
