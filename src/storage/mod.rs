//! SQLite storage layer for duelstore.
//!
//! This module provides the persistence layer using SQLite with:
//! - WAL mode and a single writer connection
//! - Scoped transactions that roll back on error or unwind
//! - The reserved `metadata` table holding the schema version
//! - A static catalog of domain tables in dependency order
//!
//! # Submodules
//!
//! - [`schema`] - Metadata schema and table catalog
//! - [`sqlite`] - Store implementation

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteStore;
