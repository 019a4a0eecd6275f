//! Store operations for `scheduled_jobs`.

use chrono::{DateTime, Utc};
use mistral_core::time;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{JobFilter, Model, NewScheduledJob, ScheduledJob};
use crate::mutator::{self, opt_text, text};
use crate::session::Session;

/// Insert a job. `execute_at` is `created_at + run_after`.
#[instrument(skip(session, new), fields(func_name = %new.func_name, session = session.id()))]
pub fn create_scheduled_job(session: &Session, new: &NewScheduledJob) -> Result<ScheduledJob> {
    let now = time::utc_now();
    let execute_at = time::add(now, time::duration_from_secs(new.run_after));
    let job = ScheduledJob {
        id: Uuid::now_v7().to_string(),
        run_after: new.run_after,
        target_factory_func_name: new.target_factory_func_name.clone(),
        func_name: new.func_name.clone(),
        func_args: new.func_args.clone(),
        func_arg_serializers: new.func_arg_serializers.clone(),
        auth_ctx: new.auth_ctx.clone(),
        execute_at,
        captured_at: None,
        key: new.key.clone(),
        created_at: now,
        updated_at: now,
    };

    let serializers = job
        .func_arg_serializers
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    session.conn()?.execute(
        "INSERT INTO scheduled_jobs
         (id, run_after, target_factory_func_name, func_name, func_args,
          func_arg_serializers, auth_ctx, execute_at, captured_at, key,
          created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?10, ?10)",
        params![
            job.id,
            job.run_after,
            job.target_factory_func_name,
            job.func_name,
            serde_json::to_string(&job.func_args)?,
            serializers,
            job.auth_ctx,
            time::to_db(job.execute_at),
            job.key,
            time::to_db(now),
        ],
    )?;
    debug!(job_id = %job.id, execute_at = %job.execute_at, "scheduled job persisted");
    Ok(job)
}

pub fn get_scheduled_job(session: &Session, id: &str) -> Result<Option<ScheduledJob>> {
    mutator::load(session, id)
}

/// Jobs due at or before `due_before` that are unclaimed or whose capture
/// happened at or before `captured_before`, oldest `execute_at` first.
pub fn get_scheduled_jobs_to_start(
    session: &Session,
    due_before: DateTime<Utc>,
    captured_before: DateTime<Utc>,
    limit: Option<usize>,
) -> Result<Vec<ScheduledJob>> {
    let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
    let mut stmt = session.conn()?.prepare_cached(&format!(
        "SELECT {} FROM scheduled_jobs
         WHERE execute_at <= ?1
           AND (captured_at IS NULL OR captured_at <= ?2)
         ORDER BY execute_at
         LIMIT ?3",
        ScheduledJob::COLUMNS.join(", ")
    ))?;
    let rows = stmt.query_map(
        params![time::to_db(due_before), time::to_db(captured_before), limit],
        |row| Ok((row.get::<_, String>("id")?, ScheduledJob::from_row(row))),
    )?;

    // a row that does not decode is skipped so it cannot hold up the batch
    let mut jobs = Vec::new();
    for row in rows {
        match row? {
            (_, Ok(job)) => jobs.push(job),
            (id, Err(e)) => warn!(job_id = %id, "skipping undecodable scheduled job: {e}"),
        }
    }
    Ok(jobs)
}

/// Claim `job` for this process.
///
/// Compare-and-swap on `captured_at`: succeeds only if the row still carries
/// the `captured_at` the caller read. Returns the updated row, or `None` when
/// another process got there first.
#[instrument(skip(session, job), fields(job_id = %job.id, session = session.id()))]
pub fn capture_scheduled_job(
    session: &Session,
    job: &ScheduledJob,
    now: DateTime<Utc>,
) -> Result<Option<ScheduledJob>> {
    let stamp = time::to_db(now);
    let (captured, _) = mutator::update_on_match::<ScheduledJob>(
        session,
        &job.id,
        &[("captured_at", opt_text(job.captured_at.map(time::to_db)))],
        &[("captured_at", text(stamp.clone())), ("updated_at", text(stamp))],
    )?;
    Ok(captured)
}

pub fn delete_scheduled_job(session: &Session, id: &str) -> Result<usize> {
    let deleted = session
        .conn()?
        .execute("DELETE FROM scheduled_jobs WHERE id = ?1", [id])?;
    Ok(deleted)
}

pub(crate) fn filter_clause(filter: &JobFilter, processing_column: &str, params: &mut Vec<Value>) -> String {
    let mut conditions = Vec::new();
    if let Some(key) = &filter.key {
        params.push(text(key.clone()));
        conditions.push(format!("key = ?{}", params.len()));
    }
    match filter.processing {
        Some(true) => conditions.push(processing_column.to_string()),
        Some(false) => conditions.push(format!("NOT {processing_column}")),
        None => {}
    }
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

pub(crate) fn count_with_filter(
    session: &Session,
    table: &str,
    processing_column: &str,
    filter: &JobFilter,
) -> Result<usize> {
    let mut params = Vec::new();
    let clause = filter_clause(filter, processing_column, &mut params);
    let count: i64 = session.conn()?.query_row(
        &format!("SELECT COUNT(*) FROM {table}{clause}"),
        params_from_iter(params),
        |row| row.get(0),
    )?;
    Ok(usize::try_from(count).unwrap_or_default())
}

/// `processing` maps to `captured_at IS [NOT] NULL`.
pub fn count_scheduled_jobs(session: &Session, filter: &JobFilter) -> Result<usize> {
    count_with_filter(session, "scheduled_jobs", "(captured_at IS NOT NULL)", filter)
}

/// Matching jobs ordered by `execute_at`.
pub fn get_scheduled_jobs(session: &Session, filter: &JobFilter) -> Result<Vec<ScheduledJob>> {
    let mut params = Vec::new();
    let clause = filter_clause(filter, "(captured_at IS NOT NULL)", &mut params);
    let mut stmt = session.conn()?.prepare(&format!(
        "SELECT {} FROM scheduled_jobs{clause} ORDER BY execute_at",
        ScheduledJob::COLUMNS.join(", ")
    ))?;
    let jobs = stmt
        .query_map(params_from_iter(params), ScheduledJob::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(jobs)
}
