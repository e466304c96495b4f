//! Session records and the value types the store's queries take and return.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::error::StoreErr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Inactive,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Inactive => "inactive",
            SessionStatus::Archived => "archived",
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "active" => Ok(SessionStatus::Active),
            "inactive" => Ok(SessionStatus::Inactive),
            "archived" => Ok(SessionStatus::Archived),
            other => Err(StoreErr::InvalidSession {
                field: "status".to_string(),
                reason: format!("unknown status '{other}'"),
            }),
        }
    }
}

/// One working copy registered inside a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: String,
    #[serde(default)]
    pub branch: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// 128-bit opaque id in 32-char hex form, assigned by the store.
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Microsecond precision; monotonically non-decreasing per session.
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub linear_task: Option<String>,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    pub metadata: Value,
    pub worktrees: BTreeMap<String, WorktreeInfo>,
    pub projects: BTreeSet<String>,
}

/// Caller-provided fields for [`crate::SessionStore::create`]; everything
/// else is assigned by the store.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub name: String,
    pub linear_task: Option<String>,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    pub metadata: Option<Value>,
    pub projects: BTreeSet<String>,
}

impl NewSession {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Partial update; `None` fields are left untouched. `expected_version`
/// engages optimistic locking against the previously observed `updated_at`.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub linear_task: Option<String>,
    pub description: Option<String>,
    pub tags: Option<BTreeSet<String>>,
    pub metadata: Option<Value>,
    pub expected_version: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilters {
    pub status: Option<SessionStatus>,
    pub tag: Option<String>,
    pub linear_task: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionSort {
    #[default]
    UpdatedDesc,
    CreatedDesc,
    NameAsc,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub recent_activity_7d: i64,
    pub db_size_mb: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MaintenanceOptions {
    pub vacuum: bool,
    pub analyze: bool,
    pub integrity_check: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub vacuumed: bool,
    pub analyzed: bool,
    /// `None` when the check was not requested.
    pub integrity_ok: Option<bool>,
}

/// Session names travel through shell commands and directory names, so the
/// accepted alphabet is deliberately narrow.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreErr::InvalidSession {
            field: "name".to_string(),
            reason: format!("'{name}' must match [A-Za-z0-9_-]+"),
        })
    }
}
