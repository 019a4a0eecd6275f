use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mistral_core::time;
use rusqlite::types::Type;
use rusqlite::Row;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A table row the generic store helpers can load and update.
///
/// `COLUMNS` doubles as the allow-list for column names accepted by
/// [`crate::mutator::update_on_match`], so it must name every column.
pub trait Model: Sized {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// Argument map of a job or delayed call.
pub type Args = Map<String, Value>;

/// Argument name -> serializer key.
pub type Serializers = BTreeMap<String, String>;

/// Persisted "call this later" record used by the default scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub run_after: f64,
    pub target_factory_func_name: Option<String>,
    pub func_name: String,
    pub func_args: Args,
    pub func_arg_serializers: Option<Serializers>,
    /// Serialized auth context, `"null"` when the job was scheduled without one.
    pub auth_ctx: String,
    pub execute_at: DateTime<Utc>,
    /// `None` while unclaimed.
    pub captured_at: Option<DateTime<Utc>>,
    pub key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model for ScheduledJob {
    const TABLE: &'static str = "scheduled_jobs";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "run_after",
        "target_factory_func_name",
        "func_name",
        "func_args",
        "func_arg_serializers",
        "auth_ctx",
        "execute_at",
        "captured_at",
        "key",
        "created_at",
        "updated_at",
    ];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            run_after: row.get("run_after")?,
            target_factory_func_name: row.get("target_factory_func_name")?,
            func_name: row.get("func_name")?,
            func_args: json_column(row, "func_args")?,
            func_arg_serializers: optional_json_column(row, "func_arg_serializers")?,
            auth_ctx: row.get("auth_ctx")?,
            execute_at: timestamp_column(row, "execute_at")?,
            captured_at: optional_timestamp_column(row, "captured_at")?,
            key: row.get("key")?,
            created_at: timestamp_column(row, "created_at")?,
            updated_at: timestamp_column(row, "updated_at")?,
        })
    }
}

/// Insert payload for [`ScheduledJob`]. The store fills in id, timestamps and
/// `execute_at = created_at + run_after`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewScheduledJob {
    pub run_after: f64,
    pub target_factory_func_name: Option<String>,
    pub func_name: String,
    pub func_args: Args,
    pub func_arg_serializers: Option<Serializers>,
    pub auth_ctx: String,
    pub key: Option<String>,
}

/// Legacy delayed-call row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedCall {
    pub id: String,
    pub factory_method_path: Option<String>,
    pub target_method_name: String,
    pub method_arguments: Args,
    pub serializers: Option<Serializers>,
    pub auth_context: String,
    pub execution_time: DateTime<Utc>,
    pub processing: bool,
    pub key: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Refreshed on capture; the stuck-call sweep measures from here.
    pub updated_at: DateTime<Utc>,
}

impl Model for DelayedCall {
    const TABLE: &'static str = "delayed_calls";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "factory_method_path",
        "target_method_name",
        "method_arguments",
        "serializers",
        "auth_context",
        "execution_time",
        "processing",
        "key",
        "created_at",
        "updated_at",
    ];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            factory_method_path: row.get("factory_method_path")?,
            target_method_name: row.get("target_method_name")?,
            method_arguments: json_column(row, "method_arguments")?,
            serializers: optional_json_column(row, "serializers")?,
            auth_context: row.get("auth_context")?,
            execution_time: timestamp_column(row, "execution_time")?,
            processing: row.get("processing")?,
            key: row.get("key")?,
            created_at: timestamp_column(row, "created_at")?,
            updated_at: timestamp_column(row, "updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewDelayedCall {
    pub factory_method_path: Option<String>,
    pub target_method_name: String,
    pub method_arguments: Args,
    pub serializers: Option<Serializers>,
    pub auth_context: String,
    pub run_after: f64,
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedLock {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Model for NamedLock {
    const TABLE: &'static str = "named_locks";
    const COLUMNS: &'static [&'static str] = &["id", "name", "created_at"];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            created_at: timestamp_column(row, "created_at")?,
        })
    }
}

/// Filter shared by the job and delayed-call existence checks.
///
/// `processing = Some(true)` selects captured rows, `Some(false)` unclaimed
/// ones, `None` both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub key: Option<String>,
    pub processing: Option<bool>,
}

impl JobFilter {
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            processing: None,
        }
    }

    pub fn processing(mut self, processing: bool) -> Self {
        self.processing = Some(processing);
        self
    }
}

fn conversion_error(
    row: &Row<'_>,
    column: &str,
    err: Box<dyn std::error::Error + Send + Sync>,
) -> rusqlite::Error {
    let index = row.as_ref().column_index(column).unwrap_or_default();
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, err)
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(row, column, Box::new(e)))
}

fn optional_json_column<T: DeserializeOwned>(
    row: &Row<'_>,
    column: &str,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| conversion_error(row, column, Box::new(e)))
}

fn timestamp_column(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    time::from_db(&raw).map_err(|e| conversion_error(row, column, Box::new(e)))
}

fn optional_timestamp_column(
    row: &Row<'_>,
    column: &str,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|raw| time::from_db(&raw))
        .transpose()
        .map_err(|e| conversion_error(row, column, Box::new(e)))
}
