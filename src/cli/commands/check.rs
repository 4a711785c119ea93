//! Check command implementation.

use std::path::Path;

use colored::Colorize;
use serde::Serialize;

use super::existing_engine_config;
use crate::error::{Error, Result};
use crate::integrity::{self, IntegrityStatus};
use crate::storage::SqliteStore;

#[derive(Serialize)]
struct CheckOutput<'a> {
    ok: bool,
    problems: &'a [String],
}

/// Execute the check command.
///
/// Opens the store directly, bypassing the startup guard, so a corrupt
/// file is reported rather than quarantined.
///
/// # Errors
///
/// Returns `IntegrityCheckFailed` if the store does not verify, or
/// `NotInitialized` if it does not exist.
pub fn execute(db: Option<&Path>, json: bool) -> Result<()> {
    let config = existing_engine_config(db)?;

    let status = match SqliteStore::open_with_timeout(&config.db_path, Some(config.busy_timeout_ms))
    {
        Ok(store) => integrity::check(store.conn())?,
        Err(Error::Database(e)) if integrity::is_corruption(&e) => IntegrityStatus::Corrupt {
            problems: vec![e.to_string()],
        },
        Err(e) => return Err(e),
    };

    let problems: &[String] = match &status {
        IntegrityStatus::Ok => &[],
        IntegrityStatus::Corrupt { problems } => problems,
    };
    if json {
        let output = CheckOutput {
            ok: status.is_ok(),
            problems,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else if status.is_ok() {
        println!("{} {}", "✓".green(), config.db_path.display());
    } else {
        println!("{} {}", "✗".red(), config.db_path.display());
        for problem in problems {
            println!("  {problem}");
        }
    }

    status.into_result()
}
