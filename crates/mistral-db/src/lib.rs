//! `mistral-db`: persistence primitives for deferred work.
//!
//! Sessions and transactions, transient-error retry, the compare-and-swap row
//! mutator, in-process row locks, named locks, and the job and delayed-call
//! stores, all over SQLite.

pub mod compat_lock;
pub mod delayed_calls;
pub mod error;
pub mod jobs;
pub mod models;
pub mod mutator;
pub mod named_lock;
pub mod retry;
pub mod schema;
pub mod session;

pub use error::{DbError, Result};
pub use models::{
    Args, DelayedCall, JobFilter, Model, NamedLock, NewDelayedCall, NewScheduledJob, ScheduledJob,
    Serializers,
};
pub use mutator::{acquire_lock, update_on_match};
pub use named_lock::{create_named_lock, delete_named_lock, get_named_locks, named_lock};
pub use retry::{with_retry, RetryPolicy, Transient};
pub use session::{Database, Session};
