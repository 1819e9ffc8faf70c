//! Trace database schema.
//!
//! Dimension tables are unique by content: the same path, function,
//! process, thread, or trace point always resolves to the same row.
//! Fact tables (`trace_entry`, `variable`, `stackframe`) reference them
//! by id. The schema version rides in SQLite's `user_version` pragma; a
//! database from a newer daemon is refused rather than guessed at.

use rusqlite::Connection;

use crate::db::Db;

const DB_SCHEMA_VERSION: i64 = 1;

pub fn init_schema(db: &Db) -> Result<(), String> {
    let conn = db.open()?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
        .map_err(|error| format!("init sqlite pragmas: {error}"))?;

    let user_version: i64 = conn
        .query_row("SELECT user_version FROM pragma_user_version", [], |row| {
            row.get(0)
        })
        .map_err(|error| format!("read sqlite user_version: {error}"))?;

    if user_version > DB_SCHEMA_VERSION {
        return Err(format!(
            "trace database schema version {user_version} is newer than supported {DB_SCHEMA_VERSION}"
        ));
    }
    if user_version < DB_SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", DB_SCHEMA_VERSION)
            .map_err(|error| format!("set sqlite user_version: {error}"))?;
    }

    conn.execute_batch(managed_schema_sql())
        .map_err(|error| format!("ensure schema: {error}"))?;
    Ok(())
}

fn managed_schema_sql() -> &'static str {
    "
    CREATE TABLE IF NOT EXISTS path_name (
        id   INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS function_name (
        id   INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS process (
        id   INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT    NOT NULL,
        pid  INTEGER NOT NULL,
        UNIQUE (name, pid)
    );

    CREATE TABLE IF NOT EXISTS traced_thread (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        process_id INTEGER NOT NULL REFERENCES process(id),
        tid        INTEGER NOT NULL,
        UNIQUE (process_id, tid)
    );

    CREATE TABLE IF NOT EXISTS trace_point (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        verbosity   INTEGER NOT NULL,
        type        INTEGER NOT NULL,
        path_id     INTEGER NOT NULL REFERENCES path_name(id),
        line        INTEGER NOT NULL,
        function_id INTEGER NOT NULL REFERENCES function_name(id),
        UNIQUE (verbosity, type, path_id, line, function_id)
    );

    CREATE TABLE IF NOT EXISTS trace_entry (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        traced_thread_id INTEGER NOT NULL REFERENCES traced_thread(id),
        timestamp        INTEGER NOT NULL,
        trace_point_id   INTEGER NOT NULL REFERENCES trace_point(id),
        message          TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_trace_entry_point ON trace_entry(trace_point_id);
    CREATE INDEX IF NOT EXISTS idx_trace_entry_thread ON trace_entry(traced_thread_id);

    CREATE TABLE IF NOT EXISTS variable (
        trace_entry_id INTEGER NOT NULL REFERENCES trace_entry(id),
        name           TEXT    NOT NULL,
        value          TEXT    NOT NULL,
        type_code      INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_variable_entry ON variable(trace_entry_id);

    CREATE TABLE IF NOT EXISTS stackframe (
        trace_entry_id  INTEGER NOT NULL REFERENCES trace_entry(id),
        depth           INTEGER NOT NULL,
        module          TEXT    NOT NULL,
        function        TEXT    NOT NULL,
        function_offset INTEGER NOT NULL,
        source_file     TEXT    NOT NULL,
        line_number     INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_stackframe_entry ON stackframe(trace_entry_id);
    "
}
