//! Migration steps and the step catalog.
//!
//! Built-in steps are sourced from `/migrations/` at the repo root and
//! embedded into the binary using `include_str!`, so the binary has no
//! runtime file dependencies. [`StepCatalog::discover`] loads the same
//! `NNN_description.sql` layout from a directory instead.
//!
//! Every action must be safe to run twice: DDL uses `IF NOT EXISTS`,
//! columns are only added when absent, and rewrites only touch rows they
//! have not rewritten yet. SQLite has no `ADD COLUMN IF NOT EXISTS`, so
//! column additions are a dedicated action rather than SQL text.

use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::path::Path;

use rusqlite::{Connection, Transaction};
use tracing::debug;

use crate::error::{Error, ResolutionReason, Result};
use crate::migrate::version::SchemaVersion;
use crate::storage::schema::{LegacyReference, MATCH_DECK_LINK, column_exists, quote_ident};

/// Data rewrite run inside the step's transaction.
pub type RewriteFn = fn(&Transaction<'_>, &MigrationStep) -> Result<()>;

/// One unit of work inside a step.
#[derive(Clone)]
pub enum StepAction {
    /// A batch of existence-guarded SQL statements.
    Sql(Cow<'static, str>),
    /// `ALTER TABLE .. ADD COLUMN`, skipped when the column exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
    /// A Rust data rewrite.
    Rewrite(RewriteFn),
}

impl StepAction {
    /// SQL action from a string.
    pub fn sql(sql: impl Into<Cow<'static, str>>) -> Self {
        Self::Sql(sql.into())
    }
}

impl fmt::Debug for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql(sql) => f.debug_tuple("Sql").field(&sql.len()).finish(),
            Self::AddColumn { table, column, .. } => f
                .debug_struct("AddColumn")
                .field("table", table)
                .field("column", column)
                .finish(),
            Self::Rewrite(_) => f.write_str("Rewrite"),
        }
    }
}

/// A single forward-only migration step, identified by its version tag.
#[derive(Debug, Clone)]
pub struct MigrationStep {
    version: SchemaVersion,
    description: String,
    actions: Vec<StepAction>,
}

impl MigrationStep {
    /// Create a step.
    #[must_use]
    pub fn new(version: SchemaVersion, description: &str, actions: Vec<StepAction>) -> Self {
        Self {
            version,
            description: description.to_string(),
            actions,
        }
    }

    /// Version tag (the step's identity and order key).
    #[must_use]
    pub fn version(&self) -> &SchemaVersion {
        &self.version
    }

    /// Step id used in progress events and errors.
    #[must_use]
    pub fn id(&self) -> &str {
        self.version.as_str()
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Run every action of the step inside `tx`.
    ///
    /// # Errors
    ///
    /// Returns `MigrationStep` for SQL failures and whatever a rewrite
    /// returns (typically `Resolution`).
    pub fn apply(&self, tx: &Transaction<'_>) -> Result<()> {
        for action in &self.actions {
            match action {
                StepAction::Sql(sql) => {
                    tx.execute_batch(sql).map_err(|source| self.failed(source))?;
                }
                StepAction::AddColumn {
                    table,
                    column,
                    definition,
                } => {
                    add_column_if_absent(tx, table, column, definition)
                        .map_err(|source| self.failed(source))?;
                }
                StepAction::Rewrite(rewrite) => rewrite(tx, self)?,
            }
        }
        Ok(())
    }

    fn failed(&self, source: rusqlite::Error) -> Error {
        Error::MigrationStep {
            step: self.id().to_string(),
            source,
        }
    }
}

/// Add a column unless the table already has it.
fn add_column_if_absent(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> rusqlite::Result<()> {
    if column_exists(conn, table, column)? {
        debug!(table, column, "Column already present");
        return Ok(());
    }
    conn.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN {} {definition}",
        quote_ident(table),
        quote_ident(column),
    ))
}

/// Fill `link.column` from `link.via` for every row where it is still NULL.
///
/// Each name must match exactly one parent row. The first row that matches
/// none or several aborts with `Resolution`; callers roll back. Returns the
/// number of rows rewritten.
///
/// # Errors
///
/// Returns `Resolution` for a missing or ambiguous name, or a database error.
pub(crate) fn resolve_legacy_reference(
    conn: &Connection,
    origin: &str,
    table: &str,
    link: &LegacyReference,
) -> Result<usize> {
    let select = format!(
        "SELECT rowid, {via} FROM {table} WHERE {column} IS NULL ORDER BY rowid",
        via = quote_ident(link.via),
        table = quote_ident(table),
        column = quote_ident(link.column),
    );
    let pending: Vec<(i64, String)> = conn
        .prepare(&select)?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    if pending.is_empty() {
        return Ok(0);
    }

    let lookup = format!(
        "SELECT COUNT(*), MIN(rowid) FROM {parent} WHERE {parent_column} = ?1",
        parent = quote_ident(link.parent),
        parent_column = quote_ident(link.parent_column),
    );
    let update = format!(
        "UPDATE {table} SET {column} = ?1 WHERE rowid = ?2",
        table = quote_ident(table),
        column = quote_ident(link.column),
    );
    let mut lookup_stmt = conn.prepare(&lookup)?;
    let mut update_stmt = conn.prepare(&update)?;

    for (row_id, name) in &pending {
        let (candidates, parent_id): (i64, Option<i64>) =
            lookup_stmt.query_row([name], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let reason = match (candidates, parent_id) {
            (1, Some(id)) => {
                update_stmt.execute(rusqlite::params![id, row_id])?;
                continue;
            }
            (0, _) | (_, None) => ResolutionReason::Missing,
            (n, _) => ResolutionReason::Ambiguous {
                candidates: usize::try_from(n).unwrap_or(usize::MAX),
            },
        };

        return Err(Error::Resolution {
            step: origin.to_string(),
            table: table.to_string(),
            row_id: *row_id,
            reference: name.clone(),
            reason,
        });
    }

    debug!(table, rows = pending.len(), "Resolved legacy references");
    Ok(pending.len())
}

/// Rewrite for step 003: link every match to its deck by name.
fn link_matches_to_decks(tx: &Transaction<'_>, step: &MigrationStep) -> Result<()> {
    resolve_legacy_reference(tx, step.id(), "matches", &MATCH_DECK_LINK)?;
    Ok(())
}

/// Ordered, duplicate-free set of migration steps.
#[derive(Debug, Clone)]
pub struct StepCatalog {
    steps: Vec<MigrationStep>,
}

impl StepCatalog {
    /// Build a catalog, sorting steps by version.
    ///
    /// # Errors
    ///
    /// Returns `Config` if two steps share a version.
    pub fn new(mut steps: Vec<MigrationStep>) -> Result<Self> {
        steps.sort_by(|a, b| a.version.cmp(&b.version));
        if let Some(pair) = steps.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(Error::Config(format!(
                "Duplicate migration version: {} and {}",
                pair[0].version, pair[1].version
            )));
        }
        Ok(Self { steps })
    }

    /// Steps compiled into the binary.
    #[must_use]
    pub fn builtin() -> Self {
        let step = |tag: &'static str, description: &str, actions: Vec<StepAction>| {
            let major = tag.bytes().fold(0, |n, b| n * 10 + u64::from(b - b'0'));
            MigrationStep {
                version: SchemaVersion::builtin(major, tag),
                description: description.to_string(),
                actions,
            }
        };

        Self {
            steps: vec![
                step(
                    "001",
                    "create decks",
                    vec![StepAction::sql(include_str!(
                        "../../migrations/001_create_decks.sql"
                    ))],
                ),
                step(
                    "002",
                    "create matches",
                    vec![StepAction::sql(include_str!(
                        "../../migrations/002_create_matches.sql"
                    ))],
                ),
                step(
                    "003",
                    "link matches to decks",
                    vec![
                        StepAction::AddColumn {
                            table: "matches",
                            column: "deck_id",
                            definition: "INTEGER REFERENCES decks(id)",
                        },
                        StepAction::sql(include_str!(
                            "../../migrations/003_link_matches_to_decks.sql"
                        )),
                        StepAction::Rewrite(link_matches_to_decks),
                    ],
                ),
                step(
                    "004",
                    "unique deck names",
                    vec![StepAction::sql(include_str!(
                        "../../migrations/004_unique_deck_names.sql"
                    ))],
                ),
            ],
        }
    }

    /// Load `*.sql` steps from a directory.
    ///
    /// File stems must look like `<version>_<description>` where the
    /// version is a sequence number (`003`) or a tag (`v0.4.0`).
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be read, `VersionParse`
    /// for a malformed order key, or `Config` for duplicate versions.
    pub fn discover(dir: &Path) -> Result<Self> {
        let mut steps = Vec::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let (tag, description) = stem.split_once('_').unwrap_or((stem, ""));
            let version = SchemaVersion::parse(tag)?;
            let sql = fs::read_to_string(&path)?;

            debug!(version = %version, file = %path.display(), "Discovered migration");
            steps.push(MigrationStep::new(
                version,
                &description.replace('_', " "),
                vec![StepAction::sql(sql)],
            ));
        }

        Self::new(steps)
    }

    /// Iterate steps in ascending version order.
    pub fn iter(&self) -> impl Iterator<Item = &MigrationStep> {
        self.steps.iter()
    }

    /// Highest version in the catalog.
    #[must_use]
    pub fn latest(&self) -> Option<&SchemaVersion> {
        self.steps.last().map(|s| &s.version)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
