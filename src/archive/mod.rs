//! Logical backups.
//!
//! A backup is a portable archive of every domain table, typed by column
//! and tagged with the schema version it was taken at. Archives restore
//! into any store whose version lies in the restorable window.
//!
//! - [`types`] - Archive values, manifest and report types
//! - [`file`] - Zip container and JSONL encoding
//! - [`hash`] - SHA-256 content hashes
//! - [`export`] - Snapshot a store into an archive
//! - [`restore`] - Full and upsert restore

pub mod export;
pub mod file;
pub mod hash;
pub mod restore;
pub mod types;

pub use export::BackupArchiver;
pub use file::atomic_write;
pub use hash::{file_sha256, sha256_hex};
pub use restore::RestoreEngine;
pub use types::{
    BackupArchive, BackupSummary, Column, ColumnType, RestoreMode, RestoreOptions, RestoreReport,
    RowConflict, TableCount, TableData, TableReport, Value,
};
