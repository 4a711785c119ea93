//! Error types for duelstore.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (2=database, 3=migration, 4=validation, etc.)
//! - Retryability flags for callers deciding whether to try again
//! - Structured JSON output for piped / non-TTY consumers
//!
//! Every fatal variant carries the context a caller needs for logging
//! (step id, table, row identifier). Rendering user-facing text is left to
//! whoever consumes the error.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for duelstore operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
///
/// Each code maps to a SCREAMING_SNAKE string and a category-based
/// exit code. Wrappers match on the string; shell scripts on the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Database (exit 2)
    NotInitialized,
    DatabaseError,
    IntegrityCheckFailed,

    // Migration (exit 3)
    MigrationStepError,
    ResolutionError,

    // Validation (exit 4)
    VersionParseError,
    InvalidArgument,

    // Archive (exit 5)
    ArchiveVersionError,
    InvalidArchive,
    ArchiveError,

    // Cancelled (exit 6)
    Cancelled,

    // Config (exit 7)
    ConfigError,

    // I/O (exit 8)
    IoError,
    JsonError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::IntegrityCheckFailed => "INTEGRITY_CHECK_FAILED",
            Self::MigrationStepError => "MIGRATION_STEP_ERROR",
            Self::ResolutionError => "RESOLUTION_ERROR",
            Self::VersionParseError => "VERSION_PARSE_ERROR",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::ArchiveVersionError => "ARCHIVE_VERSION_ERROR",
            Self::InvalidArchive => "INVALID_ARCHIVE",
            Self::ArchiveError => "ARCHIVE_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code (1-8).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::NotInitialized | Self::DatabaseError | Self::IntegrityCheckFailed => 2,
            Self::MigrationStepError | Self::ResolutionError => 3,
            Self::VersionParseError | Self::InvalidArgument => 4,
            Self::ArchiveVersionError | Self::InvalidArchive | Self::ArchiveError => 5,
            Self::Cancelled => 6,
            Self::ConfigError => 7,
            Self::IoError | Self::JsonError => 8,
        }
    }

    /// Whether a caller may retry the same operation after fixing input.
    ///
    /// True for malformed input and cancellation. False for anything that
    /// needs the store or archive itself to change first.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VersionParseError | Self::InvalidArgument | Self::Cancelled | Self::DatabaseError
        )
    }
}

// ── Resolution reason ─────────────────────────────────────────

/// Why a denormalized reference could not be resolved to an identifier.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionReason {
    /// No parent row carries the referenced name.
    Missing,
    /// More than one parent row carries the referenced name.
    Ambiguous { candidates: usize },
}

impl std::fmt::Display for ResolutionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "no match"),
            Self::Ambiguous { candidates } => write!(f, "{candidates} candidates"),
        }
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in migration, integrity, backup and restore.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed version string: {input:?}")]
    VersionParse { input: String },

    #[error("Migration step {step} failed: {source}")]
    MigrationStep {
        step: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Step {step} cannot resolve {table} row {row_id} reference {reference:?}: {reason}")]
    Resolution {
        step: String,
        table: String,
        row_id: i64,
        reference: String,
        reason: ResolutionReason,
    },

    #[error("Integrity check failed: {}", problems.join("; "))]
    IntegrityCheckFailed { problems: Vec<String> },

    #[error(
        "Archive schema version {archive} is outside the restorable window [{oldest}, {store}]"
    )]
    ArchiveVersion {
        archive: String,
        store: String,
        oldest: String,
    },

    #[error("Invalid archive: {reason}")]
    InvalidArchive { reason: String },

    #[error("Operation cancelled before {phase}")]
    Cancelled { phase: String },

    #[error("Store not initialized at {path}")]
    NotInitialized { path: PathBuf },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive container error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker thread terminated unexpectedly")]
    WorkerPanicked,
}

impl Error {
    /// Shorthand for an `InvalidArchive` error.
    pub(crate) fn invalid_archive(reason: impl Into<String>) -> Self {
        Self::InvalidArchive {
            reason: reason.into(),
        }
    }

    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::VersionParse { .. } => ErrorCode::VersionParseError,
            Self::MigrationStep { .. } => ErrorCode::MigrationStepError,
            Self::Resolution { .. } => ErrorCode::ResolutionError,
            Self::IntegrityCheckFailed { .. } => ErrorCode::IntegrityCheckFailed,
            Self::ArchiveVersion { .. } => ErrorCode::ArchiveVersionError,
            Self::InvalidArchive { .. } => ErrorCode::InvalidArchive,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::NotInitialized { .. } => ErrorCode::NotInitialized,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::Zip(_) => ErrorCode::ArchiveError,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::WorkerPanicked => ErrorCode::InternalError,
        }
    }

    /// Category-based exit code, delegating to the `ErrorCode`.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// Structured context fields for this error, if any.
    fn context(&self) -> Option<serde_json::Value> {
        match self {
            Self::VersionParse { input } => Some(serde_json::json!({ "input": input })),
            Self::MigrationStep { step, .. } => Some(serde_json::json!({ "step": step })),
            Self::Resolution {
                step,
                table,
                row_id,
                reference,
                reason,
            } => Some(serde_json::json!({
                "step": step,
                "table": table,
                "row_id": row_id,
                "reference": reference,
                "reason": reason,
            })),
            Self::IntegrityCheckFailed { problems } => {
                Some(serde_json::json!({ "problems": problems }))
            }
            Self::ArchiveVersion {
                archive,
                store,
                oldest,
            } => Some(serde_json::json!({
                "archive_version": archive,
                "store_version": store,
                "oldest_restorable": oldest,
            })),
            Self::Cancelled { phase } => Some(serde_json::json!({ "phase": phase })),
            Self::NotInitialized { path } => {
                Some(serde_json::json!({ "path": path.display().to_string() }))
            }
            _ => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    ///
    /// Includes error code, message, retryability, exit code, and the
    /// structured context fields of the variant.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(context) = self.context() {
            obj["error"]["context"] = context;
        }

        obj
    }
}
