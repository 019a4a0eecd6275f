use mistral_core::time;
use mistral_db::{Args, Serializers};
use serde_json::Value;

use crate::error::{Result, SchedulerError};

/// "Call this function later with these arguments."
///
/// Used by both schedulers: the default scheduler persists it as a
/// `scheduled_jobs` row, the legacy one as a `delayed_calls` row (the factory
/// becomes `factory_method_path`, the function `target_method_name`).
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Seconds from scheduling until the job is due.
    pub run_after: f64,
    pub target_factory_func_name: Option<String>,
    pub func_name: String,
    pub func_args: Args,
    pub func_arg_serializers: Option<Serializers>,
    /// Dedup hint for existence checks; not unique.
    pub key: Option<String>,
}

impl Job {
    pub fn new(func_name: impl Into<String>) -> Result<Self> {
        let func_name = func_name.into();
        if func_name.trim().is_empty() {
            return Err(SchedulerError::InvalidJob(
                "func_name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            run_after: 0.0,
            target_factory_func_name: None,
            func_name,
            func_args: Args::new(),
            func_arg_serializers: None,
            key: None,
        })
    }

    pub fn run_after(mut self, secs: f64) -> Self {
        self.run_after = secs;
        self
    }

    /// Resolve `func_name` as a method of the target built by this factory.
    pub fn factory(mut self, name: impl Into<String>) -> Self {
        self.target_factory_func_name = Some(name.into());
        self
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.func_args.insert(name.into(), value.into());
        self
    }

    pub fn args(mut self, args: Args) -> Self {
        self.func_args.extend(args);
        self
    }

    /// Store argument `arg` through the serializer registered as `serializer`.
    pub fn serializer(mut self, arg: impl Into<String>, serializer: impl Into<String>) -> Self {
        self.func_arg_serializers
            .get_or_insert_with(Serializers::new)
            .insert(arg.into(), serializer.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Checks done before anything is persisted.
    pub fn validate(&self) -> Result<()> {
        if self.func_name.trim().is_empty() {
            return Err(SchedulerError::InvalidJob(
                "func_name must not be empty".to_string(),
            ));
        }
        if !self.run_after.is_finite() || self.run_after < 0.0 {
            return Err(SchedulerError::InvalidJob(format!(
                "run_after must be a non-negative number, got {}",
                self.run_after
            )));
        }
        if self.run_after > time::max_delay_secs(time::utc_now()) {
            return Err(SchedulerError::InvalidJob(format!(
                "run_after of {} seconds is past the last storable date",
                self.run_after
            )));
        }
        if matches!(&self.target_factory_func_name, Some(f) if f.trim().is_empty()) {
            return Err(SchedulerError::InvalidJob(
                "target_factory_func_name must not be empty when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_func_name_is_rejected() {
        assert!(matches!(Job::new(""), Err(SchedulerError::InvalidJob(_))));
        assert!(matches!(Job::new("   "), Err(SchedulerError::InvalidJob(_))));
    }

    #[test]
    fn builder_sets_optional_parts() {
        let job = Job::new("run_task")
            .unwrap()
            .run_after(5.0)
            .factory("task_handler")
            .arg("id", "321")
            .arg("attempt", 2)
            .serializer("payload", "json_text")
            .key("task-321");

        assert_eq!(job.run_after, 5.0);
        assert_eq!(job.target_factory_func_name.as_deref(), Some("task_handler"));
        assert_eq!(job.func_args["id"], json!("321"));
        assert_eq!(job.func_args["attempt"], json!(2));
        assert_eq!(
            job.func_arg_serializers.as_ref().unwrap()["payload"],
            "json_text"
        );
        assert_eq!(job.key.as_deref(), Some("task-321"));
        job.validate().unwrap();
    }

    #[test]
    fn negative_run_after_fails_validation() {
        let job = Job::new("f").unwrap().run_after(-1.0);
        assert!(matches!(job.validate(), Err(SchedulerError::InvalidJob(_))));
    }

    #[test]
    fn run_after_past_the_storable_range_fails_validation() {
        let job = Job::new("f").unwrap().run_after(1.0e12);
        assert!(matches!(job.validate(), Err(SchedulerError::InvalidJob(_))));
        Job::new("f").unwrap().run_after(86_400.0 * 365.0 * 100.0).validate().unwrap();
    }
}
