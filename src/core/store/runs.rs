use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use super::{needs_transition, now_millis, parse_id};
use crate::core::error::RunError;
use crate::core::model::{DEFAULT_TASK_STATUS, Run, RunFilters, RunStatus, SortOrder};

const RUN_COLUMNS: &str = "id, status, task_status, reason, timestamp";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get::<_, i64>(0)?.to_string(),
        status: row.get(1)?,
        task_status: row.get(2)?,
        reason: row.get(3)?,
        timestamp: row.get(4)?,
    })
}

pub(super) fn insert_run(db: &Connection) -> Result<Run, RunError> {
    let timestamp = now_millis();
    db.execute(
        "INSERT INTO runs (status, task_status, timestamp) VALUES (?1, ?2, ?3)",
        params![RunStatus::Scheduled, DEFAULT_TASK_STATUS, timestamp],
    )?;
    Ok(Run {
        id: db.last_insert_rowid().to_string(),
        status: RunStatus::Scheduled,
        task_status: DEFAULT_TASK_STATUS.to_string(),
        reason: None,
        timestamp,
    })
}

pub(super) fn find_run(db: &Connection, id: i64) -> Result<Option<Run>, RunError> {
    let run = db
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
            params![id],
            run_from_row,
        )
        .optional()?;
    Ok(run)
}

/// Resolves a textual run id to its row id and record. Absent and malformed ids are `NotFound`.
pub(super) fn locate_run(db: &Connection, run_id: &str) -> Result<(i64, Run), RunError> {
    let id = parse_id(run_id).ok_or_else(|| RunError::run_not_found(run_id))?;
    let run = find_run(db, id)?.ok_or_else(|| RunError::run_not_found(run_id))?;
    Ok((id, run))
}

pub(super) fn require_run(db: &Connection, run_id: &str) -> Result<Run, RunError> {
    locate_run(db, run_id).map(|(_, run)| run)
}

fn filter_clause(filters: &RunFilters) -> (String, Vec<SqlValue>) {
    let mut conditions = Vec::new();
    let mut values = Vec::new();
    if let Some(status) = &filters.status {
        conditions.push("status = ?");
        values.push(SqlValue::Text(status.clone()));
    }
    if let Some(task_status) = &filters.task_status {
        conditions.push("task_status = ?");
        values.push(SqlValue::Text(task_status.clone()));
    }

    if conditions.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), values)
    }
}

pub(super) fn list_runs(
    db: &Connection,
    limit: u32,
    offset: u64,
    order: SortOrder,
    filters: &RunFilters,
) -> Result<Vec<Run>, RunError> {
    let (where_clause, mut values) = filter_clause(filters);
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM runs{where_clause} ORDER BY timestamp {dir}, id {dir} LIMIT ? OFFSET ?",
        dir = order.as_sql()
    );
    values.push(SqlValue::Integer(i64::from(limit)));
    values.push(SqlValue::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));

    let mut stmt = db.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), run_from_row)?;

    let mut runs = Vec::new();
    for run in rows {
        runs.push(run?);
    }
    Ok(runs)
}

pub(super) fn count_runs(db: &Connection, filters: &RunFilters) -> Result<u64, RunError> {
    let (where_clause, values) = filter_clause(filters);
    let count: i64 = db.query_row(
        &format!("SELECT COUNT(*) FROM runs{where_clause}"),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

pub(super) fn set_status(
    db: &Connection,
    run_id: &str,
    status: RunStatus,
) -> Result<Run, RunError> {
    let (id, mut run) = locate_run(db, run_id)?;
    if !needs_transition(&run, status)? {
        return Ok(run);
    }

    db.execute(
        "UPDATE runs SET status = ?1 WHERE id = ?2",
        params![status, id],
    )?;
    run.status = status;
    Ok(run)
}

pub(super) fn set_task_status(
    db: &Connection,
    run_id: &str,
    task_status: &str,
    reason: Option<&str>,
) -> Result<Run, RunError> {
    let (id, mut run) = locate_run(db, run_id)?;
    db.execute(
        "UPDATE runs SET task_status = ?1, reason = ?2 WHERE id = ?3",
        params![task_status, reason, id],
    )?;
    run.task_status = task_status.to_string();
    run.reason = reason.map(str::to_string);
    Ok(run)
}
