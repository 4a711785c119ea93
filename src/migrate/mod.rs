//! Forward-only schema migrations.
//!
//! - [`version`] - Version parsing and step selection
//! - [`steps`] - Migration steps and the built-in catalog
//! - [`runner`] - Applies steps with backup and rollback

pub mod runner;
pub mod steps;
pub mod version;

pub use runner::{MigrationOutcome, MigrationRunner};
pub use steps::{MigrationStep, StepAction, StepCatalog};
pub use version::{Resolution, SchemaVersion, resolve};
