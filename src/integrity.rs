//! Structural and referential integrity checks.
//!
//! Wraps `PRAGMA integrity_check` (or `quick_check`) and
//! `PRAGMA foreign_key_check`. At startup a store that fails the structural
//! check, or that SQLite refuses to read at all, is moved aside into the
//! quarantine directory and a fresh file takes its place. Dangling
//! references alone are logged and the store is kept. Nothing is ever
//! deleted.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, ErrorCode};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::storage::SqliteStore;

/// Result of an integrity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityStatus {
    Ok,
    Corrupt { problems: Vec<String> },
}

impl IntegrityStatus {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Convert into `Err(IntegrityCheckFailed)` when corrupt.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityCheckFailed` with the collected problems.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Ok => Ok(()),
            Self::Corrupt { problems } => Err(Error::IntegrityCheckFailed { problems }),
        }
    }

    fn from_problems(problems: Vec<String>) -> Self {
        if problems.is_empty() {
            Self::Ok
        } else {
            Self::Corrupt { problems }
        }
    }
}

/// Full structural check plus foreign keys.
///
/// Unreadable or corrupt files are reported as `Corrupt`, not as errors.
///
/// # Errors
///
/// Returns a database error for failures unrelated to corruption
/// (e.g. the database is locked).
pub fn check(conn: &Connection) -> Result<IntegrityStatus> {
    run(conn, "integrity_check")
}

/// Cheaper structural check plus foreign keys, used after each step.
///
/// # Errors
///
/// Returns a database error for failures unrelated to corruption.
pub fn quick_check(conn: &Connection) -> Result<IntegrityStatus> {
    run(conn, "quick_check")
}

/// Structural check only, ignoring foreign keys.
///
/// # Errors
///
/// Returns a database error for failures unrelated to corruption.
pub fn structural_check(conn: &Connection) -> Result<IntegrityStatus> {
    classify(structural_problems(conn, "integrity_check"))
}

fn run(conn: &Connection, pragma: &str) -> Result<IntegrityStatus> {
    classify(structural_problems(conn, pragma).and_then(|mut problems| {
        problems.extend(foreign_key_problems(conn)?);
        Ok(problems)
    }))
}

fn classify(collected: rusqlite::Result<Vec<String>>) -> Result<IntegrityStatus> {
    match collected {
        Ok(problems) => Ok(IntegrityStatus::from_problems(problems)),
        Err(e) if is_corruption(&e) => Ok(IntegrityStatus::Corrupt {
            problems: vec![e.to_string()],
        }),
        Err(e) => Err(e.into()),
    }
}

fn structural_problems(conn: &Connection, pragma: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA {pragma}"))?;
    let rows: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(rows.into_iter().filter(|r| r != "ok").collect())
}

fn foreign_key_problems(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    stmt.query_map([], |row| {
        let table: String = row.get(0)?;
        let rowid: Option<i64> = row.get(1)?;
        let parent: String = row.get(2)?;
        Ok(match rowid {
            Some(id) => format!("{table} row {id} references a missing {parent} row"),
            None => format!("{table} references a missing {parent} row"),
        })
    })?
    .collect()
}

/// True for errors meaning the file is not a readable database.
#[must_use]
pub fn is_corruption(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
    )
}

/// A store opened through the startup guard.
#[derive(Debug)]
pub struct GuardedOpen {
    pub store: SqliteStore,
    /// Where the corrupt file was moved, if it was.
    pub quarantined: Option<PathBuf>,
}

/// Open the store at `path`, quarantining it first if it is corrupt.
///
/// Only structural corruption leads to quarantine. Referential problems
/// are logged and surface again in the full checks run by migrations and
/// restores.
///
/// # Errors
///
/// Returns an error if the file cannot be opened for reasons other than
/// corruption, or if moving it aside fails.
pub fn open_checked(
    path: &Path,
    quarantine_dir: &Path,
    busy_timeout_ms: u64,
    sink: &dyn ProgressSink,
) -> Result<GuardedOpen> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let problems = match SqliteStore::open_with_timeout(path, Some(busy_timeout_ms)) {
        Ok(store) => match structural_check(store.conn())? {
            IntegrityStatus::Ok => {
                let dangling = foreign_key_problems(store.conn())?;
                if !dangling.is_empty() {
                    warn!(
                        path = %path.display(),
                        problems = ?dangling,
                        "Store has dangling references; keeping it in place"
                    );
                }
                return Ok(GuardedOpen {
                    store,
                    quarantined: None,
                });
            }
            IntegrityStatus::Corrupt { problems } => problems,
        },
        Err(Error::Database(e)) if is_corruption(&e) => vec![e.to_string()],
        Err(e) => return Err(e),
    };

    warn!(path = %path.display(), problems = ?problems, "Store failed integrity check");
    let moved = quarantine(path, quarantine_dir)?;
    sink.emit(ProgressEvent::Quarantined {
        path: moved.clone(),
    });

    let store = SqliteStore::open_with_timeout(path, Some(busy_timeout_ms))?;
    Ok(GuardedOpen {
        store,
        quarantined: Some(moved),
    })
}

/// Move a database file and its WAL/SHM siblings into `dir`.
///
/// The file lands at `<dir>/<file>.corrupt-<timestamp>`.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be created or the move fails.
pub fn quarantine(path: &Path, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidArgument(format!("not a file path: {}", path.display())))?;
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let dest = dir.join(format!("{file_name}.corrupt-{stamp}"));

    move_file(path, &dest)?;
    for suffix in ["-wal", "-shm"] {
        let sibling = sidecar(path, suffix);
        if sibling.exists() {
            move_file(&sibling, &sidecar(&dest, suffix))?;
        }
    }

    info!(from = %path.display(), to = %dest.display(), "Quarantined store");
    Ok(dest)
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Rename, falling back to copy + remove across filesystems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}
