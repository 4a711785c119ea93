//! Version command implementation.

use crate::archive::types::FORMAT_VERSION;
use crate::error::Result;
use crate::migrate::StepCatalog;
use serde::Serialize;

#[derive(Serialize)]
struct VersionOutput<'a> {
    version: &'a str,
    build: &'a str,
    schema_version: Option<String>,
    archive_format: u32,
}

/// Execute the version command.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn execute(json: bool) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let build = if cfg!(debug_assertions) {
        "dev"
    } else {
        "release"
    };
    let schema_version = StepCatalog::builtin().latest().map(ToString::to_string);

    if json {
        let output = VersionOutput {
            version,
            build,
            schema_version,
            archive_format: FORMAT_VERSION,
        };
        let payload = serde_json::to_string(&output)?;
        println!("{payload}");
        return Ok(());
    }

    println!("duelstore version {version} ({build})");
    if let Some(schema) = schema_version {
        println!("schema {schema}, archive format {FORMAT_VERSION}");
    }
    Ok(())
}
