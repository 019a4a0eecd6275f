// Legacy delayed calls: per-call transactions, savepoint isolation of failed
// targets, stuck-call recovery.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mistral_core::config::{DatabaseConfig, LegacySchedulerConfig};
use mistral_core::AuthContext;
use mistral_db::{create_named_lock, get_named_locks, Args, Database, JobFilter};
use mistral_scheduler::{Job, LegacyScheduler, Registry, SchedulerError};
use serde_json::json;

type Calls = Arc<Mutex<Vec<(Args, Option<AuthContext>)>>>;

fn open(dir: &tempfile::TempDir) -> Database {
    Database::open(DatabaseConfig::at(dir.path().join("calls.db").to_string_lossy())).unwrap()
}

fn config() -> LegacySchedulerConfig {
    LegacySchedulerConfig {
        enabled: true,
        fixed_delay_secs: 0.05,
        random_delay_secs: 0.0,
        batch_size: 100,
        stuck_call_timeout_secs: Some(0.0),
        recovery_interval_secs: 3600.0,
    }
}

/// `record` writes a named-lock row through the scheduler's session before
/// returning; `fail_after_write` does the same and then fails.
fn registry(calls: &Calls) -> Arc<Registry> {
    let registry = Registry::new();
    let sink = Arc::clone(calls);
    registry.register_function("record", move |ctx, args| {
        let session = ctx
            .session
            .as_deref_mut()
            .ok_or_else(|| anyhow::anyhow!("legacy targets run inside a transaction"))?;
        create_named_lock(session, "written-by-record")?;
        sink.lock().unwrap().push((args, ctx.auth.clone()));
        Ok(())
    });
    registry.register_function("fail_after_write", |ctx, _| {
        if let Some(session) = ctx.session.as_deref_mut() {
            create_named_lock(session, "written-by-failure")?;
        }
        anyhow::bail!("target failed after writing")
    });
    Arc::new(registry)
}

fn lock_names(db: &Database) -> Vec<String> {
    db.transaction(true, |s| get_named_locks(s, None))
        .unwrap()
        .into_iter()
        .map(|l| l.name)
        .collect()
}

#[test]
fn due_call_runs_with_saved_auth_and_is_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    let calls: Calls = Arc::default();
    let scheduler = LegacyScheduler::new(db.clone(), registry(&calls), config());

    let auth = AuthContext::admin();
    let call = Job::new("record").unwrap().arg("id", "321").key("hb");
    scheduler.schedule_call(&call, Some(&auth), None).unwrap();
    assert!(scheduler
        .has_scheduled_calls(&JobFilter::key("hb").processing(false))
        .unwrap());

    assert_eq!(scheduler.process_due_calls().unwrap(), 1);

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0["id"], json!("321"));
    assert_eq!(calls[0].1.as_ref(), Some(&auth));
    assert!(!scheduler.has_scheduled_calls(&JobFilter::default()).unwrap());
    assert_eq!(lock_names(&db), vec!["written-by-record".to_string()]);
}

#[test]
fn call_scheduled_in_rolled_back_transaction_never_exists() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    let calls: Calls = Arc::default();
    let scheduler = LegacyScheduler::new(db.clone(), registry(&calls), config());

    let mut session = db.session().unwrap();
    session.start_tx().unwrap();
    let call = Job::new("record").unwrap();
    scheduler.schedule_call(&call, None, Some(&mut session)).unwrap();
    assert!(session.is_tx_active(), "caller keeps its transaction");
    session.rollback_tx().unwrap();
    session.end_tx().unwrap();

    assert!(!scheduler.has_scheduled_calls(&JobFilter::default()).unwrap());
}

#[test]
fn failed_call_stays_processing_until_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    let calls: Calls = Arc::default();
    let scheduler = LegacyScheduler::new(db.clone(), registry(&calls), config());

    let call = Job::new("fail_after_write").unwrap().key("flaky");
    scheduler.schedule_call(&call, None, None).unwrap();
    assert_eq!(scheduler.process_due_calls().unwrap(), 1);

    // the target's partial write was undone, the capture was kept
    assert!(lock_names(&db).is_empty());
    assert!(scheduler
        .has_scheduled_calls(&JobFilter::key("flaky").processing(true))
        .unwrap());
    assert_eq!(scheduler.process_due_calls().unwrap(), 0, "captured calls are not re-run");

    assert_eq!(scheduler.recover_stuck_calls().unwrap(), 1);
    assert!(scheduler
        .has_scheduled_calls(&JobFilter::key("flaky").processing(false))
        .unwrap());
}

#[test]
fn unknown_target_is_left_for_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let calls: Calls = Arc::default();
    let scheduler = LegacyScheduler::new(open(&dir), registry(&calls), config());

    scheduler
        .schedule_call(&Job::new("not_registered").unwrap(), None, None)
        .unwrap();
    scheduler.process_due_calls().unwrap();
    assert!(scheduler
        .has_scheduled_calls(&JobFilter::default().processing(true))
        .unwrap());
}

#[test]
fn future_calls_wait_for_their_time() {
    let dir = tempfile::tempdir().unwrap();
    let calls: Calls = Arc::default();
    let scheduler = LegacyScheduler::new(open(&dir), registry(&calls), config());

    scheduler
        .schedule_call(&Job::new("record").unwrap().run_after(60.0), None, None)
        .unwrap();
    assert_eq!(scheduler.process_due_calls().unwrap(), 0);
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn start_requires_stuck_call_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let calls: Calls = Arc::default();
    let scheduler = LegacyScheduler::new(
        open(&dir),
        registry(&calls),
        LegacySchedulerConfig {
            stuck_call_timeout_secs: None,
            ..config()
        },
    );
    assert!(matches!(scheduler.start(), Err(SchedulerError::Config(_))));
    assert!(matches!(
        scheduler.recover_stuck_calls(),
        Err(SchedulerError::Config(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn background_loop_processes_calls() {
    let dir = tempfile::tempdir().unwrap();
    let calls: Calls = Arc::default();
    let scheduler = LegacyScheduler::new(open(&dir), registry(&calls), config());
    scheduler.start().unwrap();
    assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyRunning)));

    scheduler
        .schedule_call(&Job::new("record").unwrap().arg("id", "321"), None, None)
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while calls.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "call never ran");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    scheduler.stop(true).await;
    assert!(!scheduler.has_scheduled_calls(&JobFilter::default()).unwrap());
}

#[test]
fn schedule_call_rejects_bad_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let calls: Calls = Arc::default();
    let scheduler = LegacyScheduler::new(open(&dir), registry(&calls), config());
    let bad = Job::new("record").unwrap().run_after(f64::NAN);
    assert!(matches!(
        scheduler.schedule_call(&bad, None, None),
        Err(SchedulerError::InvalidJob(_))
    ));
}
