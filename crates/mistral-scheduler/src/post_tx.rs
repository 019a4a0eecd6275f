//! Side effects that must only happen once the caller's transaction commits.
//!
//! ```ignore
//! post_tx.run(auth, |queue| {
//!     db.transaction(false, |s| {
//!         /* ... caller's writes ... */
//!         queue.register_operation(|ctx| schedule_follow_up(ctx), true);
//!         Ok::<_, DbError>(())
//!     })
//! })?;
//! ```
//!
//! The queue is drained on a fresh worker thread only if the wrapped function
//! returned `Ok`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use mistral_core::AuthContext;
use mistral_db::{Database, Session};
use tracing::{debug, error, warn};

use crate::error::{Result, SchedulerError};

/// What a queued operation receives when it runs.
pub struct OperationContext<'a> {
    /// Clone of the auth context of whoever registered the operation.
    pub auth: Option<&'a AuthContext>,
    pub db: &'a Database,
    /// Session with the operation's own open transaction, for `in_tx`
    /// operations only.
    pub session: Option<&'a mut Session>,
    /// Queue for follow-on operations, drained after this drain succeeds.
    pub queue: &'a mut OperationQueue,
}

type Operation = Box<dyn FnOnce(&mut OperationContext<'_>) -> anyhow::Result<()> + Send>;

/// Operations registered during one `PostTxQueue::run`.
#[derive(Default)]
pub struct OperationQueue {
    operations: Vec<(Operation, bool)>,
}

impl OperationQueue {
    /// Queue `op`. With `in_tx` it runs inside its own fresh transaction and a
    /// failure aborts the rest of the drain; without, failures are only logged.
    pub fn register_operation<F>(&mut self, op: F, in_tx: bool)
    where
        F: FnOnce(&mut OperationContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.operations.push((Box::new(op), in_tx));
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

struct Shared {
    db: Database,
    workers: Mutex<Vec<JoinHandle<Result<()>>>>,
    next_worker: AtomicU64,
}

/// Owner of post-transaction workers. Cheap to clone.
#[derive(Clone)]
pub struct PostTxQueue {
    shared: Arc<Shared>,
}

impl PostTxQueue {
    pub fn new(db: Database) -> Self {
        Self {
            shared: Arc::new(Shared {
                db,
                workers: Mutex::new(Vec::new()),
                next_worker: AtomicU64::new(1),
            }),
        }
    }

    /// Run `f` with a fresh queue. On `Ok` a non-empty queue is handed to a
    /// new worker thread along with a clone of `auth`; on `Err` it is dropped.
    pub fn run<T, E, F>(&self, auth: Option<&AuthContext>, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut OperationQueue) -> std::result::Result<T, E>,
    {
        let mut queue = OperationQueue::default();
        let value = f(&mut queue)?;
        if !queue.is_empty() {
            self.spawn_drain(auth.cloned(), queue);
        }
        Ok(value)
    }

    fn spawn_drain(&self, auth: Option<AuthContext>, queue: OperationQueue) {
        let n = self.shared.next_worker.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        let count = queue.len();
        let spawned = std::thread::Builder::new()
            .name(format!("post-tx-{n}"))
            .spawn(move || this.drain(auth, queue));
        match spawned {
            Ok(handle) => {
                debug!(worker = n, operations = count, "post-transaction worker spawned");
                self.shared
                    .workers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(handle);
            }
            Err(e) => error!(operations = count, "could not spawn post-transaction worker: {e}"),
        }
    }

    /// Runs on the worker thread, wrapped by `run` so operations can queue
    /// follow-ups.
    fn drain(&self, auth: Option<AuthContext>, queue: OperationQueue) -> Result<()> {
        let db = &self.shared.db;
        self.run(auth.as_ref(), |next| {
            for (op, in_tx) in queue.operations {
                if in_tx {
                    let ran = db.transaction(false, |s| {
                        let mut ctx = OperationContext {
                            auth: auth.as_ref(),
                            db,
                            session: Some(s),
                            queue: &mut *next,
                        };
                        op(&mut ctx).map_err(SchedulerError::Operation)
                    });
                    if let Err(e) = ran {
                        error!("post-transaction operation failed, dropping the rest: {e}");
                        return Err(e);
                    }
                } else {
                    let mut ctx = OperationContext {
                        auth: auth.as_ref(),
                        db,
                        session: None,
                        queue: &mut *next,
                    };
                    if let Err(e) = op(&mut ctx) {
                        warn!("post-transaction operation failed: {e:#}");
                    }
                }
            }
            Ok(())
        })
    }

    /// Join every worker, including ones spawned by drains still running.
    /// Returns the first drain error.
    pub fn wait(&self) -> Result<()> {
        let mut first_error = None;
        loop {
            let workers = std::mem::take(
                &mut *self
                    .shared
                    .workers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            if workers.is_empty() {
                break;
            }
            for worker in workers {
                let outcome = worker.join().unwrap_or_else(|_| {
                    Err(SchedulerError::Operation(anyhow::anyhow!(
                        "post-transaction worker panicked"
                    )))
                });
                if let Err(e) = outcome {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
