//! Sync Data Models
//!
//! Data categories:
//! - ActionSpec / QueuedAction: offline mutations waiting for replay
//! - CompletedAction / FailedAction: append-only audit of drained actions
//! - QueueStats / DrainReport: queue observability
//! - SyncStatus / SyncResult / OfflineInfo: orchestrator reporting
//!
//! Persisted records serialize as camelCase JSON; timestamps are epoch
//! milliseconds so the store's secondary indices sort them numerically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Queued Actions
// ============================================================================

/// HTTP method of the endpoint an action replays against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// Caller description of a mutation to capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    /// Domain action name, e.g. "addBook"
    pub action_type: String,

    /// Opaque request body
    #[serde(default)]
    pub payload: Value,

    /// Endpoint path relative to the gateway base, e.g. "/books/9780261103573"
    pub endpoint: String,

    pub method: HttpMethod,

    /// Retry budget; the configured default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl ActionSpec {
    pub fn new(
        action_type: impl Into<String>,
        method: HttpMethod,
        endpoint: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            payload,
            endpoint: endpoint.into(),
            method,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A pending mutation stored in the `queue` collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
    pub id: String,
    pub action_type: String,
    #[serde(default)]
    pub payload: Value,
    pub endpoint: String,
    pub method: HttpMethod,

    /// Enqueue time; defines FIFO order
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    pub retry_count: u32,
    pub max_retries: u32,

    /// Most recent execution failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedAction {
    /// Build a fresh action from a spec
    pub fn from_spec(spec: ActionSpec, default_max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action_type: spec.action_type,
            payload: spec.payload,
            endpoint: spec.endpoint,
            method: spec.method,
            timestamp: now,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            last_error: None,
        }
    }

    /// True once the retry budget is spent
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Audit record of a successfully replayed action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedAction {
    #[serde(flatten)]
    pub action: QueuedAction,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub completed_at: DateTime<Utc>,
}

/// Failure classification (informational; retries ignore it)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// Audit record of an action dropped after exhausting its retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedAction {
    #[serde(flatten)]
    pub action: QueuedAction,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub failed_at: DateTime<Utc>,

    pub error: String,
    pub error_kind: ErrorKind,
}

/// Queue statistics, computed from store counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Every action ever enqueued and not yet compacted
    pub total_queued: u64,
    pub pending: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Outcome of one drain cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub processed: u32,
    pub succeeded: u32,
    /// Failed but left queued for the next cycle
    pub retried: u32,
    /// Failed and removed after exhausting retries
    pub failed_permanently: u32,
    /// Storage errors that aborted individual actions
    pub errors: Vec<String>,
}

// ============================================================================
// Sync Status & Results
// ============================================================================

/// Orchestrator lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Running => "running",
            SyncState::Completed => "completed",
            SyncState::Failed => "failed",
        }
    }
}

/// Live progress of the orchestrator, one instance per [`super::SyncManager`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub is_running: bool,
    pub step_index: u32,
    pub total_steps: u32,
    pub current_operation: String,
    pub errors: Vec<String>,
    pub conflicts: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

/// Result of a finished sync run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// All steps ran; per-record errors may still be present
    pub success: bool,
    pub state: SyncState,
    pub errors: Vec<String>,
    pub conflicts: Vec<String>,

    /// `None` when another drain was already in flight
    pub drain: Option<DrainReport>,

    pub collections_merged: u32,
    pub settings_merged: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

// ============================================================================
// Offline Info
// ============================================================================

/// How trustworthy the cached data is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
    /// Never synced
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineInfo {
    pub is_offline: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub pending_actions: u64,
    /// Seconds since the last completed sync
    pub data_age_secs: Option<i64>,
    pub estimated_freshness: Freshness,
}
