use mistral_db::{DbError, Transient};
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Db(#[from] DbError),

    /// The job description cannot be scheduled (e.g. empty function name).
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Nothing is registered under the given factory/function name.
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Unknown serializer: {0}")]
    UnknownSerializer(String),

    /// An argument listed in the serializer map is absent from the arguments.
    #[error("Missing argument: {0}")]
    MissingArgument(String),

    /// A registered serializer rejected a value.
    #[error("Cannot convert argument {arg}: {reason}")]
    ArgumentConversion { arg: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] mistral_core::CoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// A target or post-transaction operation failed.
    #[error("Operation failed: {0:#}")]
    Operation(anyhow::Error),
}

impl Transient for SchedulerError {
    fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::Db(e) if e.is_transient())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
