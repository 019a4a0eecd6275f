//! Store operations for the legacy `delayed_calls` table.

use chrono::{DateTime, Utc};
use mistral_core::time;
use rusqlite::params;
use rusqlite::types::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::count_with_filter;
use crate::models::{DelayedCall, JobFilter, NewDelayedCall};
use crate::mutator::{self, text};
use crate::session::Session;

#[instrument(skip(session, new), fields(target = %new.target_method_name, session = session.id()))]
pub fn create_delayed_call(session: &Session, new: &NewDelayedCall) -> Result<DelayedCall> {
    let now = time::utc_now();
    let call = DelayedCall {
        id: Uuid::now_v7().to_string(),
        factory_method_path: new.factory_method_path.clone(),
        target_method_name: new.target_method_name.clone(),
        method_arguments: new.method_arguments.clone(),
        serializers: new.serializers.clone(),
        auth_context: new.auth_context.clone(),
        execution_time: time::add(now, time::duration_from_secs(new.run_after)),
        processing: false,
        key: new.key.clone(),
        created_at: now,
        updated_at: now,
    };

    let serializers = call
        .serializers
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    session.conn()?.execute(
        "INSERT INTO delayed_calls
         (id, factory_method_path, target_method_name, method_arguments,
          serializers, auth_context, execution_time, processing, key,
          created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?9)",
        params![
            call.id,
            call.factory_method_path,
            call.target_method_name,
            serde_json::to_string(&call.method_arguments)?,
            serializers,
            call.auth_context,
            time::to_db(call.execution_time),
            call.key,
            time::to_db(now),
        ],
    )?;
    debug!(call_id = %call.id, "delayed call persisted");
    Ok(call)
}

pub fn get_delayed_call(session: &Session, id: &str) -> Result<Option<DelayedCall>> {
    mutator::load(session, id)
}

/// Ids of unprocessed calls due at or before `due_before`, oldest first.
pub fn get_delayed_calls_to_start(
    session: &Session,
    due_before: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<String>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = session.conn()?.prepare_cached(
        "SELECT id FROM delayed_calls
         WHERE processing = 0 AND execution_time <= ?1
         ORDER BY execution_time
         LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![time::to_db(due_before), limit], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

/// Flip `processing` from false to true and stamp `updated_at`. Returns the
/// captured row, or `None` if someone else captured (or deleted) it first.
#[instrument(skip(session), fields(session = session.id()))]
pub fn capture_delayed_call(
    session: &Session,
    id: &str,
    now: DateTime<Utc>,
) -> Result<Option<DelayedCall>> {
    let (captured, _) = mutator::update_on_match::<DelayedCall>(
        session,
        id,
        &[("processing", Value::Integer(0))],
        &[
            ("processing", Value::Integer(1)),
            ("updated_at", text(time::to_db(now))),
        ],
    )?;
    Ok(captured)
}

pub fn delete_delayed_call(session: &Session, id: &str) -> Result<usize> {
    let deleted = session
        .conn()?
        .execute("DELETE FROM delayed_calls WHERE id = ?1", [id])?;
    Ok(deleted)
}

pub fn count_delayed_calls(session: &Session, filter: &JobFilter) -> Result<usize> {
    count_with_filter(session, "delayed_calls", "processing", filter)
}

/// Release calls captured at or before `captured_before` so a poller can pick
/// them up again. Returns how many were reset.
pub fn reset_stuck_delayed_calls(
    session: &Session,
    captured_before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let reset = session.conn()?.execute(
        "UPDATE delayed_calls SET processing = 0, updated_at = ?1
         WHERE processing = 1 AND updated_at <= ?2",
        params![time::to_db(now), time::to_db(captured_before)],
    )?;
    Ok(reset)
}
