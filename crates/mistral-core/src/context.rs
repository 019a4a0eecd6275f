//! Security/tenant context carried by deferred work.
//!
//! A scheduler persists the context of whoever registered a job and restores
//! it when the job runs, possibly in another process hours later. Nothing here
//! is thread-local: the context is always passed explicitly.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_name: Option<String>,
    /// Fields set by the authentication integration that this crate does not
    /// interpret; kept so a restored context is identical to the saved one.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AuthContext {
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            project_id: Some(project_id.into()),
            ..Self::default()
        }
    }

    pub fn admin() -> Self {
        Self {
            is_admin: true,
            roles: vec!["admin".to_string()],
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

/// Serialize an optional context for storage. `None` is stored as JSON `null`.
pub fn serialize_context(ctx: Option<&AuthContext>) -> crate::error::Result<String> {
    Ok(serde_json::to_string(&ctx)?)
}

/// Inverse of [`serialize_context`]. An empty object is treated as "no context"
/// so rows written by older writers that stored `{}` restore to `None`.
pub fn deserialize_context(raw: &str) -> crate::error::Result<Option<AuthContext>> {
    let value: Value = serde_json::from_str(raw)?;
    match value {
        Value::Null => Ok(None),
        Value::Object(ref map) if map.is_empty() => Ok(None),
        other => Ok(Some(serde_json::from_value(other)?)),
    }
}
