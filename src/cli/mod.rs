//! CLI definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::archive::RestoreMode;
use crate::error::Error;

pub mod commands;

/// duelstore - schema migration and backup/restore for the deck and match store
#[derive(Parser, Debug)]
#[command(name = "duelstore", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database path (default: ~/.duelstore/data/duelstore.db)
    #[arg(long, global = true, env = "DUELSTORE_DB")]
    pub db: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print version information
    Version,

    /// Show the schema version and pending migration steps
    Status,

    /// Run a full integrity check without modifying the store
    Check,

    /// Migrate the store (to the latest version by default)
    Migrate {
        /// Stop at this version (e.g. 003 or v0.4.0)
        #[arg(long)]
        target: Option<String>,
    },

    /// Write a backup archive
    Backup {
        /// Archive file to create
        output: PathBuf,
    },

    /// Restore a backup archive
    Restore(RestoreArgs),
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Archive file to restore
    pub archive: PathBuf,

    /// full: replace every table; upsert: merge by natural key
    #[arg(long, default_value_t = RestoreMode::Full)]
    pub mode: RestoreMode,

    /// Report what would change without writing
    #[arg(long)]
    pub dry_run: bool,
}

/// A suggestion to print under a human-readable error.
#[must_use]
pub fn error_hint(error: &Error) -> Option<String> {
    match error {
        Error::NotInitialized { .. } => {
            Some("Run `duelstore migrate` to create and initialize the store".to_string())
        }
        Error::ArchiveVersion { store, .. } => Some(format!(
            "Migrate the store first if the archive is newer than {store}; \
             older archives need `oldest_restorable` lowered in config.json"
        )),
        Error::MigrationStep { .. } | Error::Resolution { .. } => Some(
            "The store was restored to its pre-migration state; \
             the failed run's backup is kept with a .failed suffix"
                .to_string(),
        ),
        Error::IntegrityCheckFailed { .. } => {
            Some("Restore from a backup archive with `duelstore restore`".to_string())
        }
        Error::Config(_) => {
            Some("Check config.json next to the database, or pass --db".to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_restore_args_parse() {
        let cli = Cli::parse_from([
            "duelstore", "restore", "backup.zip", "--mode", "upsert", "--dry-run",
        ]);
        let Commands::Restore(args) = cli.command else {
            panic!("expected restore");
        };
        assert_eq!(args.mode, RestoreMode::Upsert);
        assert!(args.dry_run);
    }

    #[test]
    fn test_restore_mode_defaults_to_full() {
        let cli = Cli::parse_from(["duelstore", "restore", "backup.zip"]);
        let Commands::Restore(args) = cli.command else {
            panic!("expected restore");
        };
        assert_eq!(args.mode, RestoreMode::Full);
        assert!(!args.dry_run);
    }

    #[test]
    fn test_unknown_restore_mode_is_rejected() {
        assert!(Cli::try_parse_from(["duelstore", "restore", "b.zip", "--mode", "merge"]).is_err());
    }
}
