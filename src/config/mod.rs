//! Configuration management.
//!
//! This module resolves the database location and builds the
//! [`EngineConfig`] every job is driven by.
//!
//! # Layout
//!
//! ```text
//! ~/.duelstore/
//!   data/duelstore.db        the store
//!   data/config.json         optional overrides
//!   data/backups/            pre-migration backups
//!   data/quarantine/         corrupt stores moved aside at startup
//! ```
//!
//! Backup and quarantine directories sit next to whichever database is in
//! use, so a `--db` override keeps everything together.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::migrate::SchemaVersion;

/// Name of the optional override file next to the database.
pub const CONFIG_FILE: &str = "config.json";

/// Oldest archive version restorable by default.
pub const DEFAULT_OLDEST_RESTORABLE: &str = "001";

/// Get the global duelstore directory location (`~/.duelstore/`).
#[must_use]
pub fn global_duelstore_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".duelstore"))
}

/// Check if test mode is enabled.
///
/// Test mode is enabled by setting `DUELSTORE_TEST_DB=1` (or any non-empty
/// value other than `0`/`false`). It redirects the default database to an
/// isolated location.
#[must_use]
pub fn is_test_mode() -> bool {
    std::env::var("DUELSTORE_TEST_DB").is_ok_and(|v| is_truthy(&v))
}

fn is_truthy(value: &str) -> bool {
    !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
}

/// Get the test database path (`~/.duelstore/test/duelstore.db`).
#[must_use]
pub fn test_db_path() -> Option<PathBuf> {
    global_duelstore_dir().map(|dir| dir.join("test").join("duelstore.db"))
}

/// Resolve the database path.
///
/// Priority:
/// 1. `explicit_path` (the `--db` flag, or `DUELSTORE_DB` through clap)
/// 2. `DUELSTORE_TEST_DB` set: the test database
/// 3. Global location: `~/.duelstore/data/duelstore.db`
///
/// Returns `None` only if no home directory can be determined.
#[must_use]
pub fn resolve_db_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }

    if is_test_mode() {
        return test_db_path();
    }

    global_duelstore_dir().map(|dir| dir.join("data").join("duelstore.db"))
}

/// Settings for one store.
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    /// Where pre-migration backups go.
    pub backup_dir: PathBuf,
    /// Where corrupt stores are moved at startup.
    pub quarantine_dir: PathBuf,
    /// Archives older than this are refused by restore.
    pub oldest_restorable: SchemaVersion,
    /// Minimum interval between per-table progress events.
    pub progress_interval_ms: u64,
    /// How long to wait on a locked database.
    pub busy_timeout_ms: u64,
    /// Pre-migration backups to keep (0 keeps all).
    pub keep_backups: usize,
    /// Load migration steps from this directory instead of the built-in set.
    pub migrations_dir: Option<PathBuf>,
}

/// Overrides read from [`CONFIG_FILE`]. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    backup_dir: Option<PathBuf>,
    quarantine_dir: Option<PathBuf>,
    oldest_restorable: Option<SchemaVersion>,
    progress_interval_ms: Option<u64>,
    busy_timeout_ms: Option<u64>,
    keep_backups: Option<usize>,
    migrations_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Defaults for a store at `db_path`.
    ///
    /// # Errors
    ///
    /// Never fails for the built-in defaults; the `Result` carries the
    /// version parse of [`DEFAULT_OLDEST_RESTORABLE`].
    pub fn for_db(db_path: &Path) -> Result<Self> {
        let data_dir = data_dir(db_path);
        Ok(Self {
            db_path: db_path.to_path_buf(),
            backup_dir: data_dir.join("backups"),
            quarantine_dir: data_dir.join("quarantine"),
            oldest_restorable: SchemaVersion::parse(DEFAULT_OLDEST_RESTORABLE)?,
            progress_interval_ms: 1000,
            busy_timeout_ms: 5000,
            keep_backups: 10,
            migrations_dir: None,
        })
    }

    /// Defaults for `db_path`, overridden by `config.json` beside it.
    ///
    /// Relative paths in the file are taken relative to the file.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file exists but cannot be read or parsed.
    pub fn load(db_path: &Path) -> Result<Self> {
        let mut config = Self::for_db(db_path)?;
        let file = data_dir(db_path).join(CONFIG_FILE);
        if !file.exists() {
            return Ok(config);
        }

        let content = std::fs::read_to_string(&file)
            .map_err(|e| Error::Config(format!("Cannot read {}: {e}", file.display())))?;
        let overrides: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid {}: {e}", file.display())))?;
        debug!(path = %file.display(), "Loaded config overrides");

        let base = data_dir(db_path);
        if let Some(dir) = overrides.backup_dir {
            config.backup_dir = base.join(dir);
        }
        if let Some(dir) = overrides.quarantine_dir {
            config.quarantine_dir = base.join(dir);
        }
        if let Some(dir) = overrides.migrations_dir {
            config.migrations_dir = Some(base.join(dir));
        }
        if let Some(version) = overrides.oldest_restorable {
            config.oldest_restorable = version;
        }
        if let Some(ms) = overrides.progress_interval_ms {
            config.progress_interval_ms = ms;
        }
        if let Some(ms) = overrides.busy_timeout_ms {
            config.busy_timeout_ms = ms;
        }
        if let Some(n) = overrides.keep_backups {
            config.keep_backups = n;
        }
        Ok(config)
    }

    #[must_use]
    pub const fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Directory holding the database file.
fn data_dir(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_db_path_with_explicit() {
        let explicit = PathBuf::from("/custom/path/db.sqlite");
        let result = resolve_db_path(Some(&explicit));
        assert_eq!(result, Some(explicit));
    }

    #[test]
    fn test_resolve_db_path_defaults_to_global() {
        let path = resolve_db_path(None).unwrap();
        assert!(path.ends_with("duelstore.db"));
        assert!(path.starts_with(global_duelstore_dir().unwrap()));
    }

    #[test]
    fn test_test_db_path_is_separate() {
        let global = global_duelstore_dir().unwrap();
        let test = test_db_path().unwrap();

        assert!(test.ends_with("test/duelstore.db"));
        assert_ne!(global.join("data").join("duelstore.db"), test);
    }

    #[test]
    fn test_is_truthy() {
        for falsy in ["", "0", "false", "FALSE"] {
            assert!(!is_truthy(falsy), "{falsy:?}");
        }
        for truthy in ["1", "true", "yes"] {
            assert!(is_truthy(truthy), "{truthy:?}");
        }
    }

    #[test]
    fn test_defaults_sit_beside_database() {
        let config = EngineConfig::for_db(Path::new("/data/store.db")).unwrap();
        assert_eq!(config.backup_dir, Path::new("/data/backups"));
        assert_eq!(config.quarantine_dir, Path::new("/data/quarantine"));
        assert_eq!(config.oldest_restorable.as_str(), "001");
        assert_eq!(config.progress_interval(), Duration::from_secs(1));

        let bare = EngineConfig::for_db(Path::new("store.db")).unwrap();
        assert_eq!(bare.backup_dir, Path::new("./backups"));
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join(CONFIG_FILE),
            r#"{"keep_backups": 3, "oldest_restorable": "003", "backup_dir": "snapshots"}"#,
        )
        .unwrap();

        let config = EngineConfig::load(&temp_dir.path().join("duelstore.db")).unwrap();
        assert_eq!(config.keep_backups, 3);
        assert_eq!(config.oldest_restorable.as_str(), "003");
        assert_eq!(config.backup_dir, temp_dir.path().join("snapshots"));
        assert_eq!(config.busy_timeout_ms, 5000);
    }

    #[test]
    fn test_config_file_rejects_unknown_keys() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(CONFIG_FILE), r#"{"keep_backup": 3}"#).unwrap();

        let err = EngineConfig::load(&temp_dir.path().join("duelstore.db")).unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("keep_backup")));
    }
}
