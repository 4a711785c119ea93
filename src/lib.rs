//! duelstore - schema migration and backup/restore engine
//!
//! This crate provides the core functionality for the `duelstore` CLI tool:
//! keeping an embedded SQLite store of decks and matches at the current
//! schema version, and moving its contents in and out as portable archives.
//!
//! # Architecture
//!
//! - [`migrate`] - Version resolution and the migration runner
//! - [`integrity`] - Integrity checks and the startup quarantine guard
//! - [`archive`] - Backup export and restore
//! - [`engine`] - Owns a store and runs jobs on worker threads
//! - [`storage`] - SQLite database layer
//! - [`progress`] - Progress events and cancellation
//! - [`config`] - Configuration management
//! - [`cli`] - Command-line interface using clap
//! - [`error`] - Error types and handling

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod integrity;
pub mod migrate;
pub mod progress;
pub mod storage;

pub use engine::{Engine, JobHandle};
pub use error::{Error, Result};
