//! Feeds decoded entries into the trace database.
//!
//! One transaction per entry: every dimension row is resolved or
//! inserted, the fact row and its variables/frames go in, then the
//! transaction commits. Any SQL error rolls the whole entry back and
//! surfaces the driver code and message; the caller logs and moves on
//! to the next entry.

use std::fmt;

use rusqlite::{params, Connection, Transaction};
use spoor_types::TraceEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    Storage {
        driver_code: Option<i32>,
        message: String,
    },
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage {
                driver_code: Some(code),
                message,
            } => write!(f, "storage error ({code}): {message}"),
            Self::Storage {
                driver_code: None,
                message,
            } => write!(f, "storage error: {message}"),
        }
    }
}

impl std::error::Error for FeedError {}

impl From<rusqlite::Error> for FeedError {
    fn from(error: rusqlite::Error) -> Self {
        let driver_code = match &error {
            rusqlite::Error::SqliteFailure(inner, _) => Some(inner.extended_code),
            _ => None,
        };
        Self::Storage {
            driver_code,
            message: error.to_string(),
        }
    }
}

/// Store one entry; returns the new `trace_entry` row id.
pub fn feed_entry(conn: &mut Connection, entry: &TraceEntry) -> Result<i64, FeedError> {
    let tx = conn.transaction()?;

    let path_id = resolve_or_insert(
        &tx,
        "SELECT id FROM path_name WHERE name = ?1",
        "INSERT INTO path_name (name) VALUES (?1)",
        params![entry.path],
    )?;
    let function_id = resolve_or_insert(
        &tx,
        "SELECT id FROM function_name WHERE name = ?1",
        "INSERT INTO function_name (name) VALUES (?1)",
        params![entry.function],
    )?;
    let process_id = resolve_or_insert(
        &tx,
        "SELECT id FROM process WHERE name = ?1 AND pid = ?2",
        "INSERT INTO process (name, pid) VALUES (?1, ?2)",
        params![entry.process_name, entry.pid],
    )?;
    let traced_thread_id = resolve_or_insert(
        &tx,
        "SELECT id FROM traced_thread WHERE process_id = ?1 AND tid = ?2",
        "INSERT INTO traced_thread (process_id, tid) VALUES (?1, ?2)",
        params![process_id, entry.tid],
    )?;
    let trace_point_id = resolve_or_insert(
        &tx,
        "SELECT id FROM trace_point
         WHERE verbosity = ?1 AND type = ?2 AND path_id = ?3 AND line = ?4 AND function_id = ?5",
        "INSERT INTO trace_point (verbosity, type, path_id, line, function_id)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.verbosity,
            entry.kind.code(),
            path_id,
            entry.line,
            function_id
        ],
    )?;

    tx.prepare_cached(
        "INSERT INTO trace_entry (traced_thread_id, timestamp, trace_point_id, message)
         VALUES (?1, ?2, ?3, ?4)",
    )?
    .execute(params![
        traced_thread_id,
        entry.timestamp_secs,
        trace_point_id,
        entry.message
    ])?;
    let trace_entry_id = tx.last_insert_rowid();

    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO variable (trace_entry_id, name, value, type_code)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for variable in entry.variables.iter() {
            stmt.execute(params![
                trace_entry_id,
                variable.name,
                variable.value,
                variable.value_type.code()
            ])?;
        }
    }

    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO stackframe
             (trace_entry_id, depth, module, function, function_offset, source_file, line_number)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        // depth is contiguous from 0, innermost first
        for (depth, frame) in entry.backtrace.frames().iter().enumerate() {
            stmt.execute(params![
                trace_entry_id,
                depth as i64,
                frame.module,
                frame.function,
                frame.function_offset,
                frame.source_file,
                frame.line_number
            ])?;
        }
    }

    tx.commit()?;
    Ok(trace_entry_id)
}

fn resolve_or_insert(
    tx: &Transaction<'_>,
    select_sql: &str,
    insert_sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<i64, FeedError> {
    let mut select = tx.prepare_cached(select_sql)?;
    if let Some(id) = select
        .query_map(params, |row| row.get::<_, i64>(0))?
        .next()
        .transpose()?
    {
        return Ok(id);
    }
    tx.prepare_cached(insert_sql)?.execute(params)?;
    Ok(tx.last_insert_rowid())
}
