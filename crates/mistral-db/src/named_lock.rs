//! Cluster-wide mutex backed by a row in `named_locks`.
//!
//! Holding the lock means having inserted the row inside a still-open
//! transaction. `name` is UNIQUE and SQLite admits one writer at a time, so a
//! second acquirer blocks in the busy handler until the holder's transaction
//! ends; if the holder committed without deleting its row the second insert
//! fails with a constraint error instead of entering the section.
//!
//! Rows left behind by crashed holders are not swept here.

use mistral_core::time;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Model, NamedLock};
use crate::session::Session;

/// Insert a lock row and return its id. Runs immediately on the session's
/// connection.
#[instrument(skip(session), fields(session = session.id()))]
pub fn create_named_lock(session: &Session, name: &str) -> Result<String> {
    let id = Uuid::now_v7().to_string();
    session.conn()?.execute(
        "INSERT INTO named_locks (id, name, created_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![id, name, time::to_db(time::utc_now())],
    )?;
    debug!(lock_id = %id, "named lock created");
    Ok(id)
}

pub fn delete_named_lock(session: &Session, id: &str) -> Result<usize> {
    let deleted = session
        .conn()?
        .execute("DELETE FROM named_locks WHERE id = ?1", [id])?;
    debug!(lock_id = %id, deleted, "named lock deleted");
    Ok(deleted)
}

/// Run `f` while holding the named lock `name`.
///
/// Requires an open transaction. The row is deleted only when `f` succeeds;
/// on error it stays for the enclosing transaction's rollback to remove.
pub fn named_lock<T, E, F>(session: &mut Session, name: &str, f: F) -> std::result::Result<T, E>
where
    F: FnOnce(&mut Session) -> std::result::Result<T, E>,
    E: From<crate::error::DbError>,
{
    session.require_tx()?;
    let id = create_named_lock(session, name)?;
    let value = f(session)?;
    delete_named_lock(session, &id)?;
    Ok(value)
}

/// List current lock rows, optionally only those called `name`.
pub fn get_named_locks(session: &Session, name: Option<&str>) -> Result<Vec<NamedLock>> {
    let conn = session.conn()?;
    let columns = NamedLock::COLUMNS.join(", ");
    let locks = match name {
        Some(name) => {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {columns} FROM named_locks WHERE name = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt
                .query_map([name], NamedLock::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {columns} FROM named_locks ORDER BY created_at"
            ))?;
            let rows = stmt
                .query_map([], NamedLock::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
    };
    Ok(locks)
}
