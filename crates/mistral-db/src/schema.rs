use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler and locking tables. Safe to call on every
/// startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_scheduled_jobs_table(conn)?;
    create_delayed_calls_table(conn)?;
    create_named_locks_table(conn)?;
    Ok(())
}

fn create_scheduled_jobs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            id                        TEXT NOT NULL PRIMARY KEY,
            run_after                 REAL NOT NULL,
            target_factory_func_name  TEXT,
            func_name                 TEXT NOT NULL,
            func_args                 TEXT NOT NULL,   -- JSON object
            func_arg_serializers      TEXT,            -- JSON object or NULL
            auth_ctx                  TEXT NOT NULL,   -- JSON, 'null' when absent
            execute_at                TEXT NOT NULL,
            captured_at               TEXT,            -- NULL means unclaimed
            key                       TEXT,            -- dedup hint, not unique
            created_at                TEXT NOT NULL,
            updated_at                TEXT NOT NULL
        ) STRICT;

        -- Polling: WHERE execute_at <= ? AND (captured_at IS NULL OR ...) ORDER BY execute_at
        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_execute_at
            ON scheduled_jobs (execute_at);
        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_captured_at
            ON scheduled_jobs (captured_at);
        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_key
            ON scheduled_jobs (key);
        ",
    )?;
    Ok(())
}

fn create_delayed_calls_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS delayed_calls (
            id                   TEXT NOT NULL PRIMARY KEY,
            factory_method_path  TEXT,
            target_method_name   TEXT NOT NULL,
            method_arguments     TEXT NOT NULL,   -- JSON object
            serializers          TEXT,            -- JSON object or NULL
            auth_context         TEXT NOT NULL,
            execution_time       TEXT NOT NULL,
            processing           INTEGER NOT NULL DEFAULT 0,
            key                  TEXT,
            created_at           TEXT NOT NULL,
            updated_at           TEXT NOT NULL    -- refreshed on capture
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_delayed_calls_execution_time
            ON delayed_calls (execution_time);
        ",
    )?;
    Ok(())
}

/// A row's existence is the lock; UNIQUE(name) makes a second insert wait
/// for (or collide with) the first holder.
fn create_named_locks_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS named_locks (
            id          TEXT NOT NULL PRIMARY KEY,
            name        TEXT NOT NULL UNIQUE,
            created_at  TEXT NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
