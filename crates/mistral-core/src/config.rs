use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_POOL_SIZE: usize = 16;
pub const DEFAULT_POOL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_FIXED_DELAY_SECS: f64 = 1.0;
pub const DEFAULT_CAPTURED_JOB_TIMEOUT_SECS: f64 = 30.0;
pub const DEFAULT_PICKUP_JOB_AFTER_SECS: f64 = 60.0;
pub const DEFAULT_STUCK_CALL_TIMEOUT_SECS: f64 = 600.0;

/// Top-level config (mistral.toml + MISTRAL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MistralConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub legacy_scheduler: LegacySchedulerConfig,
}

/// How a writable transaction acquires the SQLite write lock.
///
/// This is the typed isolation knob handed to the connection pool. Read-only
/// transactions always begin deferred regardless of this setting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BeginMode {
    Deferred,
    #[default]
    Immediate,
    Exclusive,
}

impl BeginMode {
    pub fn begin_sql(self) -> &'static str {
        match self {
            BeginMode::Deferred => "BEGIN DEFERRED",
            BeginMode::Immediate => "BEGIN IMMEDIATE",
            BeginMode::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
    Truncate,
}

impl JournalMode {
    pub fn as_pragma(self) -> &'static str {
        match self {
            JournalMode::Wal => "WAL",
            JournalMode::Delete => "DELETE",
            JournalMode::Truncate => "TRUNCATE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on a locked database before failing with BUSY.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default)]
    pub begin_mode: BeginMode,
    #[serde(default)]
    pub journal_mode: JournalMode,
    /// Maximum pooled connections, and so the maximum number of live sessions.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// How long `Database::session` waits for a free connection.
    #[serde(default = "default_pool_timeout_ms")]
    pub pool_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            begin_mode: BeginMode::default(),
            journal_mode: JournalMode::default(),
            pool_size: DEFAULT_POOL_SIZE,
            pool_timeout_ms: DEFAULT_POOL_TIMEOUT_MS,
            retry: RetryConfig::default(),
        }
    }
}

impl DatabaseConfig {
    /// Config pointing at `path` with every other setting at its default.
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }
}

/// Bounded retry with capped linear backoff for transient database errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_retry_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// Default (dual-path) scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_fixed_delay_secs")]
    pub fixed_delay_secs: f64,
    /// Upper bound of the uniform jitter added to every poll delay.
    #[serde(default)]
    pub random_delay_secs: f64,
    /// Max jobs captured per poll. `None` means unbounded.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// A capture older than this is considered abandoned and may be recaptured.
    #[serde(default = "default_captured_job_timeout_secs")]
    pub captured_job_timeout_secs: f64,
    /// Pollers ignore jobs due less than this long ago, leaving them to the
    /// local timer of the process that scheduled them.
    #[serde(default = "default_pickup_job_after_secs")]
    pub pickup_job_after_secs: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fixed_delay_secs: DEFAULT_FIXED_DELAY_SECS,
            random_delay_secs: 0.0,
            batch_size: None,
            captured_job_timeout_secs: DEFAULT_CAPTURED_JOB_TIMEOUT_SECS,
            pickup_job_after_secs: DEFAULT_PICKUP_JOB_AFTER_SECS,
        }
    }
}

impl SchedulerConfig {
    pub fn fixed_delay(&self) -> Duration {
        secs(self.fixed_delay_secs)
    }

    pub fn random_delay(&self) -> Duration {
        secs(self.random_delay_secs)
    }

    pub fn captured_job_timeout(&self) -> Duration {
        secs(self.captured_job_timeout_secs)
    }

    pub fn pickup_job_after(&self) -> Duration {
        secs(self.pickup_job_after_secs)
    }
}

/// Legacy delayed-call scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacySchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fixed_delay_secs")]
    pub fixed_delay_secs: f64,
    #[serde(default)]
    pub random_delay_secs: f64,
    #[serde(default = "default_legacy_batch_size")]
    pub batch_size: usize,
    /// Calls left with `processing = true` longer than this are reset by the
    /// recovery sweep. The legacy scheduler refuses to start without it.
    #[serde(default = "default_stuck_call_timeout_secs")]
    pub stuck_call_timeout_secs: Option<f64>,
    #[serde(default = "default_recovery_interval_secs")]
    pub recovery_interval_secs: f64,
}

impl Default for LegacySchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fixed_delay_secs: DEFAULT_FIXED_DELAY_SECS,
            random_delay_secs: 0.0,
            batch_size: default_legacy_batch_size(),
            stuck_call_timeout_secs: default_stuck_call_timeout_secs(),
            recovery_interval_secs: default_recovery_interval_secs(),
        }
    }
}

impl LegacySchedulerConfig {
    pub fn fixed_delay(&self) -> Duration {
        secs(self.fixed_delay_secs)
    }

    pub fn random_delay(&self) -> Duration {
        secs(self.random_delay_secs)
    }

    pub fn stuck_call_timeout(&self) -> Option<Duration> {
        self.stuck_call_timeout_secs.map(secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        secs(self.recovery_interval_secs)
    }
}

fn secs(value: f64) -> Duration {
    crate::time::duration_from_secs(value)
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mistral/mistral.db", home)
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}
fn default_pool_timeout_ms() -> u64 {
    DEFAULT_POOL_TIMEOUT_MS
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    100
}
fn default_retry_max_delay_ms() -> u64 {
    1_000
}
fn default_fixed_delay_secs() -> f64 {
    DEFAULT_FIXED_DELAY_SECS
}
fn default_captured_job_timeout_secs() -> f64 {
    DEFAULT_CAPTURED_JOB_TIMEOUT_SECS
}
fn default_pickup_job_after_secs() -> f64 {
    DEFAULT_PICKUP_JOB_AFTER_SECS
}
fn default_legacy_batch_size() -> usize {
    1000
}
fn default_stuck_call_timeout_secs() -> Option<f64> {
    Some(DEFAULT_STUCK_CALL_TIMEOUT_SECS)
}
fn default_recovery_interval_secs() -> f64 {
    60.0
}

impl MistralConfig {
    /// Load config from a TOML file with MISTRAL_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `MISTRAL_CONFIG` env var
    ///   3. ~/.mistral/mistral.toml
    ///
    /// A missing file is not an error; defaults and env overrides still apply.
    /// Nested keys use `__` in env names, e.g. `MISTRAL_SCHEDULER__BATCH_SIZE=50`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("MISTRAL_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: MistralConfig = Figment::from(Serialized::defaults(MistralConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("MISTRAL_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the schedulers misbehave silently.
    pub fn validate(&self) -> crate::error::Result<()> {
        let checks = [
            ("scheduler.fixed_delay_secs", self.scheduler.fixed_delay_secs),
            ("scheduler.random_delay_secs", self.scheduler.random_delay_secs),
            (
                "scheduler.captured_job_timeout_secs",
                self.scheduler.captured_job_timeout_secs,
            ),
            (
                "scheduler.pickup_job_after_secs",
                self.scheduler.pickup_job_after_secs,
            ),
            (
                "legacy_scheduler.fixed_delay_secs",
                self.legacy_scheduler.fixed_delay_secs,
            ),
            (
                "legacy_scheduler.random_delay_secs",
                self.legacy_scheduler.random_delay_secs,
            ),
        ];
        for (name, value) in checks {
            if !value.is_finite() || value < 0.0 {
                return Err(crate::error::CoreError::Config(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if self.database.retry.max_attempts == 0 {
            return Err(crate::error::CoreError::Config(
                "database.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mistral/mistral.toml", home)
}
