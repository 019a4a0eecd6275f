// Post-transaction queue: operations run after a successful commit only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mistral_core::config::DatabaseConfig;
use mistral_core::AuthContext;
use mistral_db::{create_named_lock, get_named_locks, Database, DbError};
use mistral_scheduler::{PostTxQueue, SchedulerError};

fn open(dir: &tempfile::TempDir) -> Database {
    Database::open(DatabaseConfig::at(dir.path().join("post_tx.db").to_string_lossy())).unwrap()
}

fn lock_names(db: &Database) -> Vec<String> {
    db.transaction(true, |s| get_named_locks(s, None))
        .unwrap()
        .into_iter()
        .map(|l| l.name)
        .collect()
}

#[test]
fn operations_run_after_commit_with_callers_auth() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    let queue = PostTxQueue::new(db.clone());
    let auth = AuthContext::new("user-7", "project-7");
    let seen_auth = Arc::new(Mutex::new(None));
    let worker_name = Arc::new(Mutex::new(None));

    let value = queue
        .run(Some(&auth), |ops| {
            let seen_auth = Arc::clone(&seen_auth);
            ops.register_operation(
                move |ctx| {
                    let session = ctx
                        .session
                        .as_deref_mut()
                        .ok_or_else(|| anyhow::anyhow!("in_tx operation without session"))?;
                    create_named_lock(session, "from-post-tx")?;
                    *seen_auth.lock().unwrap() = ctx.auth.cloned();
                    Ok(())
                },
                true,
            );
            let worker_name = Arc::clone(&worker_name);
            ops.register_operation(
                move |ctx| {
                    assert!(ctx.session.is_none());
                    *worker_name.lock().unwrap() =
                        std::thread::current().name().map(String::from);
                    Ok(())
                },
                false,
            );
            db.transaction(false, |s| {
                create_named_lock(s, "callers-own-write")?;
                Ok::<_, DbError>(42)
            })
        })
        .unwrap();
    assert_eq!(value, 42);

    queue.wait().unwrap();
    let mut names = lock_names(&db);
    names.sort();
    assert_eq!(names, vec!["callers-own-write", "from-post-tx"]);
    assert_eq!(seen_auth.lock().unwrap().as_ref(), Some(&auth));
    assert!(worker_name
        .lock()
        .unwrap()
        .as_deref()
        .is_some_and(|name| name.starts_with("post-tx-")));
}

#[test]
fn failed_function_discards_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let queue = PostTxQueue::new(open(&dir));
    let ran = Arc::new(AtomicUsize::new(0));

    let out: Result<(), DbError> = queue.run(None, |ops| {
        let ran = Arc::clone(&ran);
        ops.register_operation(
            move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            false,
        );
        Err(DbError::InvalidArgument("caller rolled back".to_string()))
    });
    assert!(out.is_err());

    queue.wait().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn in_tx_failure_aborts_the_rest_of_the_drain() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    let queue = PostTxQueue::new(db.clone());
    let ran = Arc::new(AtomicUsize::new(0));

    queue
        .run(None, |ops| {
            ops.register_operation(
                |ctx| {
                    if let Some(session) = ctx.session.as_deref_mut() {
                        create_named_lock(session, "rolled-back")?;
                    }
                    anyhow::bail!("in-tx operation failed")
                },
                true,
            );
            let ran = Arc::clone(&ran);
            ops.register_operation(
                move |_| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                false,
            );
            Ok::<_, SchedulerError>(())
        })
        .unwrap();

    assert!(matches!(queue.wait(), Err(SchedulerError::Operation(_))));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert!(lock_names(&db).is_empty());
}

#[test]
fn out_of_tx_failure_is_only_logged() {
    let dir = tempfile::tempdir().unwrap();
    let queue = PostTxQueue::new(open(&dir));
    let ran = Arc::new(AtomicUsize::new(0));

    queue
        .run(None, |ops| {
            ops.register_operation(|_| anyhow::bail!("best effort"), false);
            let ran = Arc::clone(&ran);
            ops.register_operation(
                move |_| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                false,
            );
            Ok::<_, SchedulerError>(())
        })
        .unwrap();

    queue.wait().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn operations_can_queue_follow_ups() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir);
    let queue = PostTxQueue::new(db.clone());

    queue
        .run(None, |ops| {
            ops.register_operation(
                |ctx| {
                    ctx.queue.register_operation(
                        |ctx| {
                            let session = ctx
                                .session
                                .as_deref_mut()
                                .ok_or_else(|| anyhow::anyhow!("no session"))?;
                            create_named_lock(session, "follow-up")?;
                            Ok(())
                        },
                        true,
                    );
                    Ok(())
                },
                false,
            );
            Ok::<_, SchedulerError>(())
        })
        .unwrap();

    queue.wait().unwrap();
    assert_eq!(lock_names(&db), vec!["follow-up".to_string()]);
}
