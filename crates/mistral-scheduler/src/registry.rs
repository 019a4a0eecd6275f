//! Late binding of job targets and argument serializers.
//!
//! Persisted jobs name their target by string. Every process that may run a
//! job registers the same names at startup; resolution happens when the job
//! fires, possibly in a different process than the one that scheduled it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use mistral_core::AuthContext;
use mistral_db::{Args, Database, Serializers, Session};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SchedulerError};

/// Key of the built-in serializer that stores a value as its JSON text.
pub const JSON_TEXT: &str = "json_text";

/// What a target sees while it runs.
pub struct InvocationContext<'a> {
    /// Auth context restored from the persisted row.
    pub auth: Option<AuthContext>,
    pub db: &'a Database,
    /// The scheduler's session with its open transaction. Only set for legacy
    /// delayed calls; such targets must not manage transactions themselves.
    pub session: Option<&'a mut Session>,
}

impl std::fmt::Debug for InvocationContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("auth", &self.auth)
            .field("in_tx", &self.session.is_some())
            .finish()
    }
}

/// A free-function target.
pub type TargetFn = dyn Fn(&mut InvocationContext<'_>, Args) -> anyhow::Result<()> + Send + Sync;

/// An object whose methods are job targets. Built fresh per invocation by a
/// registered factory.
pub trait JobTarget: Send + Sync {
    /// Run method `method`. Unknown methods must return an error.
    fn call(&self, method: &str, ctx: &mut InvocationContext<'_>, args: Args)
        -> anyhow::Result<()>;
}

pub type FactoryFn = dyn Fn() -> Arc<dyn JobTarget> + Send + Sync;

/// Converts one argument between its in-memory and persisted JSON forms.
pub trait ArgSerializer: Send + Sync {
    fn serialize(&self, value: &Value) -> anyhow::Result<Value>;
    fn deserialize(&self, value: &Value) -> anyhow::Result<Value>;
}

/// Stores any JSON value as its compact text.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonTextSerializer;

impl ArgSerializer for JsonTextSerializer {
    fn serialize(&self, value: &Value) -> anyhow::Result<Value> {
        Ok(Value::String(serde_json::to_string(value)?))
    }

    fn deserialize(&self, value: &Value) -> anyhow::Result<Value> {
        match value {
            Value::String(raw) => Ok(serde_json::from_str(raw)?),
            other => anyhow::bail!("expected JSON text, found {other}"),
        }
    }
}

/// A resolved, ready-to-call target.
#[derive(Clone)]
pub enum Target {
    Function(Arc<TargetFn>),
    Method {
        object: Arc<dyn JobTarget>,
        method: String,
    },
}

impl Target {
    pub fn invoke(&self, ctx: &mut InvocationContext<'_>, args: Args) -> anyhow::Result<()> {
        match self {
            Target::Function(f) => f(ctx, args),
            Target::Method { object, method } => object.call(method, ctx, args),
        }
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Function(_) => f.write_str("Target::Function"),
            Target::Method { method, .. } => write!(f, "Target::Method({method})"),
        }
    }
}

/// Name -> callable/serializer table, shared by every scheduler in a process.
pub struct Registry {
    functions: RwLock<HashMap<String, Arc<TargetFn>>>,
    factories: RwLock<HashMap<String, Arc<FactoryFn>>>,
    serializers: RwLock<HashMap<String, Arc<dyn ArgSerializer>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Empty registry with the built-in `json_text` serializer.
    pub fn new() -> Self {
        let registry = Self {
            functions: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
            serializers: RwLock::new(HashMap::new()),
        };
        registry.register_serializer(JSON_TEXT, JsonTextSerializer);
        registry
    }

    /// Register (or replace) a free-function target.
    pub fn register_function<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut InvocationContext<'_>, Args) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(%name, "job function registered");
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(f));
    }

    pub fn register_factory<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn JobTarget> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(%name, "job target factory registered");
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(factory));
    }

    pub fn register_serializer<S>(&self, name: impl Into<String>, serializer: S)
    where
        S: ArgSerializer + 'static,
    {
        self.serializers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::new(serializer));
    }

    /// Look up the callable for `(factory, func)`.
    ///
    /// With a factory, the factory is invoked to build the target object and
    /// `func` names its method; unknown methods surface when called.
    pub fn resolve(&self, factory: Option<&str>, func: &str) -> Result<Target> {
        match factory {
            Some(factory_name) => {
                let factory = self
                    .factories
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(factory_name)
                    .cloned()
                    .ok_or_else(|| SchedulerError::UnknownTarget(factory_name.to_string()))?;
                Ok(Target::Method {
                    object: factory(),
                    method: func.to_string(),
                })
            }
            None => self
                .functions
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(func)
                .cloned()
                .map(Target::Function)
                .ok_or_else(|| SchedulerError::UnknownTarget(func.to_string())),
        }
    }

    fn serializer(&self, key: &str) -> Result<Arc<dyn ArgSerializer>> {
        self.serializers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownSerializer(key.to_string()))
    }

    /// Persisted form of `args`: every argument listed in `serializers` goes
    /// through its serializer, the rest pass through unchanged.
    pub fn serialize_args(&self, args: &Args, serializers: Option<&Serializers>) -> Result<Args> {
        self.convert_args(args, serializers, |s, v| s.serialize(v))
    }

    /// Inverse of [`Registry::serialize_args`].
    pub fn deserialize_args(&self, args: &Args, serializers: Option<&Serializers>) -> Result<Args> {
        self.convert_args(args, serializers, |s, v| s.deserialize(v))
    }

    fn convert_args<C>(&self, args: &Args, serializers: Option<&Serializers>, convert: C) -> Result<Args>
    where
        C: Fn(&dyn ArgSerializer, &Value) -> anyhow::Result<Value>,
    {
        let mut converted = args.clone();
        for (arg, key) in serializers.into_iter().flatten() {
            let value = args
                .get(arg)
                .ok_or_else(|| SchedulerError::MissingArgument(arg.clone()))?;
            let serializer = self.serializer(key)?;
            let value = convert(serializer.as_ref(), value).map_err(|e| {
                SchedulerError::ArgumentConversion {
                    arg: arg.clone(),
                    reason: format!("{e:#}"),
                }
            })?;
            converted.insert(arg.clone(), value);
        }
        Ok(converted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl JobTarget for Echo {
        fn call(&self, method: &str, _ctx: &mut InvocationContext<'_>, _args: Args) -> anyhow::Result<()> {
            match method {
                "ping" => Ok(()),
                other => anyhow::bail!("Echo has no method {other}"),
            }
        }
    }

    fn args(value: Value) -> Args {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn unknown_names_fail_to_resolve() {
        let registry = Registry::new();
        assert!(matches!(
            registry.resolve(None, "nope"),
            Err(SchedulerError::UnknownTarget(_))
        ));
        assert!(matches!(
            registry.resolve(Some("nope"), "ping"),
            Err(SchedulerError::UnknownTarget(_))
        ));
    }

    #[test]
    fn factory_target_dispatches_by_method() {
        let registry = Registry::new();
        registry.register_factory("echo", || Arc::new(Echo) as Arc<dyn JobTarget>);

        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(mistral_core::config::DatabaseConfig::at(
            dir.path().join("registry.db").to_string_lossy(),
        ))
        .unwrap();
        let mut ctx = InvocationContext {
            auth: None,
            db: &db,
            session: None,
        };

        let ping = registry.resolve(Some("echo"), "ping").unwrap();
        ping.invoke(&mut ctx, Args::new()).unwrap();
        let missing = registry.resolve(Some("echo"), "pong").unwrap();
        assert!(missing.invoke(&mut ctx, Args::new()).is_err());
    }

    #[test]
    fn json_text_round_trips_listed_arguments_only() {
        let registry = Registry::new();
        let mut serializers = Serializers::new();
        serializers.insert("payload".to_string(), JSON_TEXT.to_string());
        let original = args(json!({"payload": {"a": [1, 2]}, "id": "321"}));

        let stored = registry.serialize_args(&original, Some(&serializers)).unwrap();
        assert_eq!(stored["payload"], json!(r#"{"a":[1,2]}"#));
        assert_eq!(stored["id"], json!("321"));

        let restored = registry.deserialize_args(&stored, Some(&serializers)).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn listed_argument_must_exist() {
        let registry = Registry::new();
        let mut serializers = Serializers::new();
        serializers.insert("missing".to_string(), JSON_TEXT.to_string());
        assert!(matches!(
            registry.serialize_args(&Args::new(), Some(&serializers)),
            Err(SchedulerError::MissingArgument(arg)) if arg == "missing"
        ));
    }

    #[test]
    fn unregistered_serializer_is_reported() {
        let registry = Registry::new();
        let mut serializers = Serializers::new();
        serializers.insert("id".to_string(), "pickle".to_string());
        assert!(matches!(
            registry.serialize_args(&args(json!({"id": 1})), Some(&serializers)),
            Err(SchedulerError::UnknownSerializer(key)) if key == "pickle"
        ));
    }
}
