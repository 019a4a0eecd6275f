//! Default (dual-path) job scheduler.
//!
//! Every job is persisted before anything else happens. The process that
//! scheduled it arms a local timer (fast path); every running scheduler polls
//! the table for due jobs (slow path). Whoever wins the compare-and-swap on
//! `captured_at` runs the job and deletes the row.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use mistral_core::config::SchedulerConfig;
use mistral_core::context::{deserialize_context, serialize_context};
use mistral_core::{time, AuthContext};
use mistral_db::{jobs, with_retry, Database, JobFilter, NewScheduledJob, ScheduledJob, Session};
use rand::Rng;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, SchedulerError};
use crate::job::Job;
use crate::registry::{InvocationContext, Registry};

/// A job this process armed a timer for.
struct ArmedJob {
    job: ScheduledJob,
    timer: Option<AbortHandle>,
}

struct Inner {
    db: Database,
    registry: Arc<Registry>,
    config: SchedulerConfig,
    runtime: Handle,
    armed: DashMap<String, ArmedJob>,
}

/// Dual-path scheduler. Construct one per process and share it.
pub struct DefaultScheduler {
    inner: Arc<Inner>,
    poller: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl DefaultScheduler {
    /// Must be called from within a Tokio runtime; timers are spawned on it.
    pub fn new(db: Database, registry: Arc<Registry>, config: SchedulerConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| SchedulerError::Config(format!("no tokio runtime: {e}")))?;
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                registry,
                config,
                runtime,
                armed: DashMap::new(),
            }),
            poller: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn is_running(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start the background poll loop.
    pub fn start(&self) -> Result<()> {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = self.inner.runtime.spawn(inner.run(shutdown_rx));
        *poller = Some((shutdown_tx, handle));
        Ok(())
    }

    /// Stop polling and forget armed timers.
    ///
    /// `graceful` waits for an in-flight poll cycle to finish; otherwise the
    /// loop is abandoned. Jobs whose timers are dropped here stay in the
    /// table and will be picked up by a poller.
    pub async fn stop(&self, graceful: bool) {
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((shutdown_tx, handle)) = poller {
            let _ = shutdown_tx.send(true);
            if graceful {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        error!("scheduler poll task failed: {e}");
                    }
                }
            } else {
                handle.abort();
            }
        }

        for entry in self.inner.armed.iter() {
            if let Some(timer) = &entry.timer {
                timer.abort();
            }
        }
        self.inner.armed.clear();
        info!(graceful, "default scheduler stopped");
    }

    /// Persist `job` in its own transaction, then arm the local timer.
    pub async fn schedule(&self, job: Job, auth: Option<&AuthContext>) -> Result<ScheduledJob> {
        let inner = Arc::clone(&self.inner);
        let auth = auth.cloned();
        let persisted = tokio::task::spawn_blocking(move || {
            let policy = inner.db.retry_policy().clone();
            with_retry(&policy, "schedule_job", || {
                inner.db.transaction(false, |s| inner.persist(s, &job, auth.as_ref()))
            })
        })
        .await
        .map_err(|e| SchedulerError::Operation(anyhow::anyhow!("schedule task failed: {e}")))??;

        self.inner.arm(persisted.clone());
        Ok(persisted)
    }

    /// Blocking variant for synchronous callers (post-transaction operations,
    /// legacy targets).
    ///
    /// With `Some(session)` and an open transaction, the insert joins it and
    /// no local timer is armed: the row only exists once the caller commits,
    /// so the pollers pick it up. Otherwise the insert commits here and the
    /// timer is armed as in [`DefaultScheduler::schedule`].
    pub fn schedule_blocking(
        &self,
        job: &Job,
        auth: Option<&AuthContext>,
        session: Option<&mut Session>,
    ) -> Result<ScheduledJob> {
        let joined = session.as_deref().is_some_and(Session::is_tx_active);
        let persisted = self
            .inner
            .db
            .join_or_begin(session, |s| self.inner.persist(s, job, auth))?;
        if joined {
            debug!(job_id = %persisted.id, "job joined caller transaction, left to the pollers");
        } else {
            self.inner.arm(persisted.clone());
        }
        Ok(persisted)
    }

    /// Whether any job matches `filter`, looking at this process's armed jobs
    /// before asking the database.
    pub async fn has_scheduled_jobs(&self, filter: JobFilter) -> Result<bool> {
        if self.inner.has_armed(&filter) {
            return Ok(true);
        }
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let count = inner
                .db
                .transaction(true, |s| jobs::count_scheduled_jobs(s, &filter))?;
            Ok::<_, SchedulerError>(count > 0)
        })
        .await
        .map_err(|e| SchedulerError::Operation(anyhow::anyhow!("count task failed: {e}")))?
    }

    /// Run one poll cycle now. Returns the number of jobs this process ran.
    pub async fn poll_once(&self) -> Result<usize> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.process_due_jobs())
            .await
            .map_err(|e| SchedulerError::Operation(anyhow::anyhow!("poll task failed: {e}")))?
    }

    /// Number of jobs with a live local timer.
    pub fn armed_jobs(&self) -> usize {
        self.inner.armed.len()
    }
}

impl Inner {
    fn persist(&self, session: &Session, job: &Job, auth: Option<&AuthContext>) -> Result<ScheduledJob> {
        job.validate()?;
        let func_args = self
            .registry
            .serialize_args(&job.func_args, job.func_arg_serializers.as_ref())?;
        let new = NewScheduledJob {
            run_after: job.run_after,
            target_factory_func_name: job.target_factory_func_name.clone(),
            func_name: job.func_name.clone(),
            func_args,
            func_arg_serializers: job.func_arg_serializers.clone(),
            auth_ctx: serialize_context(auth)?,
            key: job.key.clone(),
        };
        Ok(jobs::create_scheduled_job(session, &new)?)
    }

    fn has_armed(&self, filter: &JobFilter) -> bool {
        self.armed.iter().any(|entry| {
            let job = &entry.job;
            if filter.key.is_some() && job.key != filter.key {
                return false;
            }
            match filter.processing {
                Some(processing) => job.captured_at.is_some() == processing,
                None => true,
            }
        })
    }

    /// Fast path: remember the row and fire it after `run_after`.
    fn arm(self: &Arc<Self>, job: ScheduledJob) {
        let id = job.id.clone();
        let delay = time::duration_from_secs(job.run_after);
        self.armed.insert(id.clone(), ArmedJob { job, timer: None });

        let inner = Arc::clone(self);
        let timer_id = id.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some((_, armed)) = inner.armed.remove(&timer_id) else {
                // already taken by a poll cycle or dropped by stop()
                return;
            };
            let runner = Arc::clone(&inner);
            if let Err(e) = tokio::task::spawn_blocking(move || runner.process(armed.job)).await {
                error!(job_id = %timer_id, "job timer task failed: {e}");
            }
        });

        if let Some(mut entry) = self.armed.get_mut(&id) {
            entry.timer = Some(task.abort_handle());
        }
        debug!(job_id = %id, delay_ms = delay.as_millis() as u64, "job timer armed");
    }

    fn next_delay(&self) -> Duration {
        let fixed = self.config.fixed_delay();
        let jitter = self.config.random_delay().as_secs_f64();
        if jitter > 0.0 {
            fixed + Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..jitter))
        } else {
            fixed
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("default scheduler started");
        loop {
            let delay = self.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let inner = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || inner.process_due_jobs()).await {
                Ok(Ok(0)) => {}
                Ok(Ok(processed)) => debug!(processed, "poll cycle finished"),
                Ok(Err(e)) => error!("scheduler poll cycle failed: {e}"),
                Err(e) => error!("scheduler poll cycle panicked: {e}"),
            }

            if *shutdown.borrow() {
                break;
            }
        }
        info!("default scheduler poll loop exited");
    }

    /// Slow path: run every job that is due and not freshly captured.
    fn process_due_jobs(&self) -> Result<usize> {
        let now = time::utc_now();
        let due_before = time::sub(now, self.config.pickup_job_after());
        let captured_before = time::sub(now, self.config.captured_job_timeout());
        let policy = self.db.retry_policy().clone();

        let due = with_retry(&policy, "get_scheduled_jobs_to_start", || {
            self.db.transaction(true, |s| {
                jobs::get_scheduled_jobs_to_start(s, due_before, captured_before, self.config.batch_size)
            })
        })?;

        let mut processed = 0;
        for job in due {
            // the row read from the table supersedes any local snapshot
            if let Some((_, armed)) = self.armed.remove(&job.id) {
                if let Some(timer) = armed.timer {
                    timer.abort();
                }
            }
            if self.process(job) {
                processed += 1;
            }
        }
        Ok(processed)
    }

    /// Capture, invoke, delete. Returns whether this process ran the job.
    #[instrument(skip(self, job), fields(job_id = %job.id, func_name = %job.func_name))]
    fn process(&self, job: ScheduledJob) -> bool {
        let policy = self.db.retry_policy().clone();
        let captured = with_retry(&policy, "capture_scheduled_job", || {
            self.db
                .transaction(false, |s| jobs::capture_scheduled_job(s, &job, time::utc_now()))
        });
        let job = match captured {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!("job captured by another scheduler");
                return false;
            }
            Err(e) => {
                warn!("job capture failed, leaving it to the pollers: {e}");
                return false;
            }
        };

        if let Err(e) = self.invoke(&job) {
            error!(
                target_factory = ?job.target_factory_func_name,
                args = %serde_json::Value::Object(job.func_args.clone()),
                "job invocation failed: {e}"
            );
        }

        let deleted = with_retry(&policy, "delete_scheduled_job", || {
            self.db
                .transaction(false, |s| jobs::delete_scheduled_job(s, &job.id))
        });
        if let Err(e) = deleted {
            error!("job ran but its row could not be deleted: {e}");
        }
        true
    }

    fn invoke(&self, job: &ScheduledJob) -> Result<()> {
        let target = self
            .registry
            .resolve(job.target_factory_func_name.as_deref(), &job.func_name)?;
        let args = self
            .registry
            .deserialize_args(&job.func_args, job.func_arg_serializers.as_ref())?;
        let mut ctx = InvocationContext {
            auth: deserialize_context(&job.auth_ctx)?,
            db: &self.db,
            session: None,
        };
        target.invoke(&mut ctx, args).map_err(SchedulerError::Operation)?;
        debug!("job invoked");
        Ok(())
    }
}
