//! Upsert restore.
//!
//! Tables are processed parents first. Each archived row is matched to a
//! local row by the table's natural key, after its foreign keys have been
//! remapped from archive ids to the local ids assigned earlier in the job:
//!
//! - match with identical values: unchanged
//! - match with different values: update non-key columns
//! - no match: insert with a fresh id
//!
//! Local rows absent from the archive are never touched. Every write runs
//! in its own savepoint; a constraint violation rolls back just that row
//! and is reported as a [`RowConflict`](crate::archive::RowConflict).

use std::collections::HashMap;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction};
use tracing::debug;

use super::{RestoreEngine, RestorePlan, TablePlan, write_scope};
use crate::archive::types::{ColumnType, TableReport, Value};
use crate::error::{Error, ResolutionReason, Result};
use crate::integrity;
use crate::progress::TableTicker;
use crate::storage::SqliteStore;
use crate::storage::schema::{LegacyReference, TableSpec, quote_ident};

/// Archive id to local id, per table.
type IdMaps = HashMap<&'static str, HashMap<i64, i64>>;

/// What happened to one archived row.
#[derive(Debug, Clone, Copy)]
enum Action {
    Unchanged(i64),
    Update(i64),
    Insert,
}

impl RestoreEngine<'_> {
    pub(super) fn upsert(
        &self,
        store: &mut SqliteStore,
        plan: &RestorePlan<'_>,
        dry_run: bool,
    ) -> Result<Vec<TableReport>> {
        write_scope(store, "restore_upsert", dry_run, |tx| {
            let mut id_maps = IdMaps::new();
            let mut reports = Vec::with_capacity(plan.tables.len());
            for table in &plan.tables {
                self.cancel
                    .checkpoint(&format!("table {}", table.spec.name))?;
                reports.push(self.upsert_table(tx, table, &mut id_maps)?);
            }
            integrity::check(tx)?.into_result()?;
            Ok(reports)
        })
    }

    fn upsert_table(
        &self,
        tx: &mut Transaction<'_>,
        table: &TablePlan<'_>,
        id_maps: &mut IdMaps,
    ) -> Result<TableReport> {
        let spec = table.spec;
        let data = table.data;
        let surrogate_idx = data
            .column_index(spec.surrogate_key)
            .ok_or_else(|| Error::invalid_archive(format!("{} lacks its key column", spec.name)))?;

        let mut columns: Vec<(&str, ColumnType)> = data
            .columns
            .iter()
            .filter(|c| c.name != spec.surrogate_key)
            .map(|c| (c.name.as_str(), c.kind))
            .collect();
        columns.extend(table.legacy.iter().map(|l| (l.column, ColumnType::Integer)));
        let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();

        let key_positions = spec
            .natural_key
            .iter()
            .map(|key| names.iter().position(|n| n == key))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                Error::invalid_archive(format!(
                    "{} cannot be matched: natural key ({}) not in archive",
                    spec.name,
                    spec.natural_key.join(", ")
                ))
            })?;

        let mut report = TableReport::new(spec.name);
        let mut id_map = HashMap::with_capacity(data.rows.len());
        let mut ticker = TableTicker::start(self.sink, spec.name, data.rows.len(), self.progress_interval);

        for (n, row) in data.rows.iter().enumerate() {
            let archive_id = row.get(surrogate_idx).and_then(Value::as_i64);
            let row_key = archive_id.map_or_else(
                || format!("row {}", n + 1),
                |id| format!("{}={id}", spec.surrogate_key),
            );

            let values = match build_row(tx, table, row, surrogate_idx, id_maps)? {
                Ok(values) => values,
                Err(reason) => {
                    report.skip(row_key, reason);
                    ticker.tick(n + 1);
                    continue;
                }
            };

            let key: Vec<(&str, &Value)> = key_positions
                .iter()
                .map(|&i| (names[i], &values[i]))
                .collect();
            let action = match select_by_key(tx, spec, &key, &columns)? {
                Some((id, current)) if current == values => Action::Unchanged(id),
                Some((id, _)) => Action::Update(id),
                None => Action::Insert,
            };

            let written = match action {
                Action::Unchanged(id) => Ok(id),
                Action::Update(id) => update_row(tx, spec, id, &names, &values).map(|()| id),
                Action::Insert => insert_row(tx, spec, &names, &values),
            };

            match written {
                Ok(local_id) => {
                    match action {
                        Action::Unchanged(_) => report.rows_unchanged += 1,
                        Action::Update(_) => report.rows_updated += 1,
                        Action::Insert => report.rows_inserted += 1,
                    }
                    if let Some(archive_id) = archive_id {
                        id_map.insert(archive_id, local_id);
                    }
                }
                Err(Error::Database(e)) if is_constraint(&e) => {
                    debug!(table = spec.name, row = %row_key, error = %e, "Row conflict");
                    report.skip(row_key, e.to_string());
                }
                Err(e) => return Err(e),
            }
            ticker.tick(n + 1);
        }
        ticker.finish();

        id_maps.insert(spec.name, id_map);
        Ok(report)
    }
}

/// Values for the write columns of one row, or the reason it cannot be
/// written.
fn build_row(
    conn: &Connection,
    table: &TablePlan<'_>,
    row: &[Value],
    surrogate_idx: usize,
    id_maps: &IdMaps,
) -> Result<std::result::Result<Vec<Value>, String>> {
    let mut values = Vec::with_capacity(row.len() + table.legacy.len());

    for (idx, (column, value)) in table.data.columns.iter().zip(row).enumerate() {
        if idx == surrogate_idx {
            continue;
        }
        let Some(reference) = table.spec.reference(&column.name) else {
            values.push(value.clone());
            continue;
        };
        if *value == Value::Null {
            values.push(Value::Null);
            continue;
        }

        let Some(archive_parent) = value.as_i64() else {
            return Ok(Err(format!("{} {value} is not an id", column.name)));
        };
        match id_maps
            .get(reference.parent)
            .and_then(|m| m.get(&archive_parent))
        {
            Some(local) => values.push(Value::Integer(*local)),
            None => {
                return Ok(Err(format!(
                    "{} {archive_parent} refers to a {} row that was not restored",
                    column.name, reference.parent
                )));
            }
        }
    }

    for link in &table.legacy {
        let Some(via) = table.data.column_index(link.via).and_then(|i| row.get(i)) else {
            return Ok(Err(format!("missing {}", link.via)));
        };
        let reason = match count_parents(conn, link, via)? {
            (1, Some(id)) => {
                values.push(Value::Integer(id));
                continue;
            }
            (0, _) | (_, None) => ResolutionReason::Missing,
            (candidates, _) => ResolutionReason::Ambiguous { candidates },
        };
        return Ok(Err(format!("{} {via}: {reason}", link.via)));
    }

    Ok(Ok(values))
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

/// Lowest-id local row whose natural key equals `key`, with the current
/// values of `columns`.
fn select_by_key(
    conn: &Connection,
    spec: &TableSpec,
    key: &[(&str, &Value)],
    columns: &[(&str, ColumnType)],
) -> Result<Option<(i64, Vec<Value>)>> {
    let selected: Vec<String> = columns.iter().map(|(name, _)| quote_ident(name)).collect();
    let filter: Vec<String> = key
        .iter()
        .enumerate()
        .map(|(i, (name, _))| format!("{} IS ?{}", quote_ident(name), i + 1))
        .collect();
    let sql = format!(
        "SELECT {id}, {cols} FROM {table} WHERE {filter} ORDER BY {id} LIMIT 1",
        id = quote_ident(spec.surrogate_key),
        cols = selected.join(", "),
        table = quote_ident(spec.name),
        filter = filter.join(" AND "),
    );

    let found = conn
        .query_row(
            &sql,
            rusqlite::params_from_iter(key.iter().map(|(_, v)| *v)),
            |row| {
                let id: i64 = row.get(0)?;
                let raw = (1..=columns.len())
                    .map(|i| row.get::<_, SqlValue>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok((id, raw))
            },
        )
        .optional()?;

    found
        .map(|(id, raw)| {
            let values = raw
                .into_iter()
                .zip(columns)
                .map(|(raw, (_, kind))| Value::from_sql(raw, *kind))
                .collect::<Result<Vec<_>>>()?;
            Ok((id, values))
        })
        .transpose()
}

/// Number of parent rows carrying `value`, and the lowest id among them.
fn count_parents(
    conn: &Connection,
    link: &LegacyReference,
    value: &Value,
) -> Result<(usize, Option<i64>)> {
    let (count, id): (i64, Option<i64>) = conn.query_row(
        &format!(
            "SELECT COUNT(*), MIN(rowid) FROM {} WHERE {} = ?1",
            quote_ident(link.parent),
            quote_ident(link.parent_column)
        ),
        [value],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((usize::try_from(count).unwrap_or(0), id))
}

fn insert_row(
    tx: &mut Transaction<'_>,
    spec: &TableSpec,
    columns: &[&str],
    values: &[Value],
) -> Result<i64> {
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(spec.name),
        columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let sp = tx.savepoint()?;
    sp.execute(&sql, rusqlite::params_from_iter(values))?;
    let id = sp.last_insert_rowid();
    sp.commit()?;
    Ok(id)
}

fn update_row(
    tx: &mut Transaction<'_>,
    spec: &TableSpec,
    id: i64,
    columns: &[&str],
    values: &[Value],
) -> Result<()> {
    let assignments: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
        .collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?{}",
        quote_ident(spec.name),
        assignments.join(", "),
        quote_ident(spec.surrogate_key),
        columns.len() + 1
    );

    let mut params: Vec<&dyn rusqlite::ToSql> =
        values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
    params.push(&id);

    let sp = tx.savepoint()?;
    sp.execute(&sql, params.as_slice())?;
    sp.commit()?;
    Ok(())
}
