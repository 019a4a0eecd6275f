use std::fmt::Display;
use std::time::Duration;

use mistral_core::config::RetryConfig;
use tracing::warn;

use crate::error::DbError;

/// Errors that know whether a retry could help.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for DbError {
    fn is_transient(&self) -> bool {
        DbError::is_transient(self)
    }
}

/// Bounded attempts with capped linear backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: Duration::from_millis(config.delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Sleep before attempt `attempt + 1`, given `attempt` failures so far.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.delay.saturating_mul(attempt).min(self.max_delay)
    }
}

/// Run `f` until it succeeds, fails with a non-transient error, or the policy
/// runs out of attempts. The last error is returned on exhaustion.
///
/// `f` should be the smallest unit of work that is safe to repeat, typically a
/// whole `Database::transaction` call. Anything the work depends on (auth
/// context included) must be captured by the closure, since an attempt may
/// run long after the first one failed.
pub fn with_retry<T, E, F>(policy: &RetryPolicy, label: &str, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: Transient + Display,
{
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let wait = policy.backoff(attempt);
                warn!(
                    operation = label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    "transient database error, retrying: {e}"
                );
                std::thread::sleep(wait);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
