//! Legacy delayed-call scheduler.
//!
//! Poll, capture, invoke, delete, all inside one transaction per call. Targets
//! run inside the scheduler's transaction and must not open their own. A call
//! whose target fails stays captured (`processing = 1`) until the stuck-call
//! sweep releases it.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use mistral_core::config::LegacySchedulerConfig;
use mistral_core::context::{deserialize_context, serialize_context};
use mistral_core::{time, AuthContext};
use mistral_db::{delayed_calls, with_retry, Database, DelayedCall, JobFilter, NewDelayedCall, Session};
use rand::Rng;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, SchedulerError};
use crate::job::Job;
use crate::registry::{InvocationContext, Registry};

/// Calls due within this window are picked up early.
const DUE_WINDOW: Duration = Duration::from_secs(1);

struct Inner {
    db: Database,
    registry: Arc<Registry>,
    config: LegacySchedulerConfig,
}

pub struct LegacyScheduler {
    inner: Arc<Inner>,
    poller: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl LegacyScheduler {
    pub fn new(db: Database, registry: Arc<Registry>, config: LegacySchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                registry,
                config,
            }),
            poller: Mutex::new(None),
        }
    }

    /// Start polling and the stuck-call sweep.
    ///
    /// Refuses to run without `stuck_call_timeout`: a failed call is never
    /// retried otherwise.
    pub fn start(&self) -> Result<()> {
        let stuck_call_timeout = self.inner.config.stuck_call_timeout().ok_or_else(|| {
            SchedulerError::Config(
                "legacy_scheduler.stuck_call_timeout_secs must be set to run the legacy scheduler"
                    .to_string(),
            )
        })?;
        let runtime = Handle::try_current()
            .map_err(|e| SchedulerError::Config(format!("no tokio runtime: {e}")))?;

        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = runtime.spawn(Arc::clone(&self.inner).run(shutdown_rx));
        *poller = Some((shutdown_tx, handle));
        info!(
            stuck_call_timeout_secs = stuck_call_timeout.as_secs_f64(),
            "legacy scheduler started"
        );
        Ok(())
    }

    pub async fn stop(&self, graceful: bool) {
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some((shutdown_tx, handle)) = poller else {
            return;
        };
        let _ = shutdown_tx.send(true);
        if graceful {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("legacy scheduler task failed: {e}");
                }
            }
        } else {
            handle.abort();
        }
        info!(graceful, "legacy scheduler stopped");
    }

    /// Persist a delayed call. With `Some(session)` the insert joins the
    /// caller's open transaction; otherwise it gets its own.
    pub fn schedule_call(
        &self,
        call: &Job,
        auth: Option<&AuthContext>,
        session: Option<&mut Session>,
    ) -> Result<DelayedCall> {
        call.validate()?;
        let method_arguments = self
            .inner
            .registry
            .serialize_args(&call.func_args, call.func_arg_serializers.as_ref())?;
        let new = NewDelayedCall {
            factory_method_path: call.target_factory_func_name.clone(),
            target_method_name: call.func_name.clone(),
            method_arguments,
            serializers: call.func_arg_serializers.clone(),
            auth_context: serialize_context(auth)?,
            run_after: call.run_after,
            key: call.key.clone(),
        };
        let created = self
            .inner
            .db
            .join_or_begin(session, |s| delayed_calls::create_delayed_call(s, &new))?;
        Ok(created)
    }

    pub fn has_scheduled_calls(&self, filter: &JobFilter) -> Result<bool> {
        let count = self
            .inner
            .db
            .transaction(true, |s| delayed_calls::count_delayed_calls(s, filter))?;
        Ok(count > 0)
    }

    /// Release calls captured longer ago than `stuck_call_timeout`.
    pub fn recover_stuck_calls(&self) -> Result<usize> {
        self.inner.recover_stuck_calls()
    }

    /// Run one poll cycle on the calling thread. Returns how many calls ran.
    pub fn process_due_calls(&self) -> Result<usize> {
        self.inner.process_due_calls()
    }
}

impl Inner {
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
        let mut recovery =
            tokio::time::interval(self.config.recovery_interval().max(Duration::from_millis(1)));
        // polling keeps its own deadline so frequent recovery ticks cannot starve it
        let poll = tokio::time::sleep(self.next_delay());
        tokio::pin!(poll);
        loop {
            tokio::select! {
                _ = &mut poll => {
                    let inner = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || inner.process_due_calls()).await {
                        Ok(Ok(0)) => {}
                        Ok(Ok(processed)) => debug!(processed, "legacy poll cycle finished"),
                        Ok(Err(e)) => error!("legacy poll cycle failed: {e}"),
                        Err(e) => error!("legacy poll cycle panicked: {e}"),
                    }
                    poll.as_mut().reset(tokio::time::Instant::now() + self.next_delay());
                }
                _ = recovery.tick() => {
                    let inner = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || inner.recover_stuck_calls()).await {
                        Ok(Ok(0)) => {}
                        Ok(Ok(reset)) => warn!(reset, "stuck delayed calls released"),
                        Ok(Err(e)) => error!("stuck call recovery failed: {e}"),
                        Err(e) => error!("stuck call recovery panicked: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("legacy scheduler loop exited");
    }

    fn recover_stuck_calls(&self) -> Result<usize> {
        let timeout = self.config.stuck_call_timeout().ok_or_else(|| {
            SchedulerError::Config("stuck call timeout is not configured".to_string())
        })?;
        let now = time::utc_now();
        let cutoff = time::sub(now, timeout);
        let policy = self.db.retry_policy().clone();
        let reset = with_retry(&policy, "recover_stuck_calls", || {
            self.db
                .transaction(false, |s| delayed_calls::reset_stuck_delayed_calls(s, cutoff, now))
        })?;
        Ok(reset)
    }

    fn process_due_calls(&self) -> Result<usize> {
        let due_before = time::add(time::utc_now(), DUE_WINDOW);
        let policy = self.db.retry_policy().clone();
        let ids = with_retry(&policy, "get_delayed_calls_to_start", || {
            self.db.transaction(true, |s| {
                delayed_calls::get_delayed_calls_to_start(s, due_before, self.config.batch_size)
            })
        })?;

        let mut processed = 0;
        for id in ids {
            let outcome = with_retry(&policy, "process_delayed_call", || {
                self.db.transaction(false, |s| self.process_call(s, &id))
            });
            match outcome {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => error!(call_id = %id, "delayed call processing failed: {e}"),
            }
        }
        Ok(processed)
    }

    /// One call, inside the caller's transaction. Returns whether this
    /// process captured it.
    #[instrument(skip(self, session), fields(session = session.id()))]
    fn process_call(&self, session: &mut Session, id: &str) -> Result<bool> {
        let Some(call) = delayed_calls::capture_delayed_call(session, id, time::utc_now())? else {
            debug!("delayed call captured by another scheduler");
            return Ok(false);
        };

        let invoked: Result<()> = session.savepoint("delayed_call", |s| self.invoke(&call, s));
        match invoked {
            Ok(()) => {
                delayed_calls::delete_delayed_call(session, &call.id)?;
            }
            Err(e) => {
                error!(
                    target_method = %call.target_method_name,
                    factory = ?call.factory_method_path,
                    args = %serde_json::Value::Object(call.method_arguments.clone()),
                    "delayed call failed, left for recovery: {e}"
                );
            }
        }
        Ok(true)
    }

    fn invoke(&self, call: &DelayedCall, session: &mut Session) -> Result<()> {
        let target = self
            .registry
            .resolve(call.factory_method_path.as_deref(), &call.target_method_name)?;
        let args = self
            .registry
            .deserialize_args(&call.method_arguments, call.serializers.as_ref())?;
        let mut ctx = InvocationContext {
            auth: deserialize_context(&call.auth_context)?,
            db: &self.db,
            session: Some(session),
        };
        target.invoke(&mut ctx, args).map_err(SchedulerError::Operation)
    }
}
