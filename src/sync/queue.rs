//! Offline Queue Module - Durable FIFO of mutations captured while offline
//!
//! Mutations are persisted as [`QueuedAction`] records and replayed against
//! the remote gateway when a drain runs.
//!
//! Features:
//! - Store-backed persistent queue (survives restarts)
//! - FIFO by enqueue timestamp, ties in insertion order
//! - Bounded retries (default: 5 attempts), one attempt per drain cycle
//! - Single-flight drain; concurrent calls are no-ops
//! - Completed/failed audit records with retention cleanup
//! - Queue statistics computed from store counts

use super::gateway::{GatewayError, RemoteGateway};
use super::models::{
    ActionSpec, CompletedAction, DrainReport, FailedAction, QueueStats, QueuedAction,
};
use crate::db::{Collection, DbError, Index, PersistentStore, StoreExt};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// Queue Manager
// ============================================================================

/// Manages offline queue operations
pub struct QueueManager {
    store: Arc<dyn PersistentStore>,
    gateway: Arc<dyn RemoteGateway>,
    default_max_retries: u32,
    online: AtomicBool,
    draining: AtomicBool,
}

/// Clears the drain flag on every exit path
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl QueueManager {
    /// Create new queue manager (starts online)
    pub fn new(
        store: Arc<dyn PersistentStore>,
        gateway: Arc<dyn RemoteGateway>,
        default_max_retries: u32,
    ) -> Self {
        Self {
            store,
            gateway,
            default_max_retries: default_max_retries.max(1),
            online: AtomicBool::new(true),
            draining: AtomicBool::new(false),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Record connectivity; returns the previous value
    pub fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::AcqRel)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Persist a new action and return its id
    pub fn enqueue(&self, spec: ActionSpec) -> Result<String, QueueError> {
        validate(&spec)?;

        let action = QueuedAction::from_spec(spec, self.default_max_retries, Utc::now());
        self.store
            .add_record(Collection::Queue, &action.id, &encode(&action)?)?;

        log::info!(
            "Queued {} {} {} as {}",
            action.action_type,
            action.method.as_str(),
            action.endpoint,
            action.id
        );
        Ok(action.id)
    }

    /// Enqueue, or overwrite the payload of a pending action with the same
    /// type, method and endpoint. The pending action keeps its id, queue
    /// position and retry count.
    pub fn enqueue_or_replace(&self, spec: ActionSpec) -> Result<String, QueueError> {
        validate(&spec)?;

        let same_type = self.store.get_all_by_index(
            Collection::Queue,
            Index::ActionType,
            Some(&Value::String(spec.action_type.clone())),
        )?;
        let existing = decode_all::<QueuedAction>(same_type)?
            .into_iter()
            .find(|a| a.method == spec.method && a.endpoint == spec.endpoint);

        let Some(mut action) = existing else {
            return self.enqueue(spec);
        };

        if action.payload != spec.payload {
            action.payload = spec.payload;
            self.store
                .put_record(Collection::Queue, &action.id, &encode(&action)?)?;
            log::debug!("Replaced payload of pending action {}", action.id);
        }
        Ok(action.id)
    }

    /// Replay every pending action once, oldest first.
    ///
    /// Returns `None` without touching the queue when offline or when another
    /// drain is in flight.
    pub async fn drain_queue(&self) -> Result<Option<DrainReport>, QueueError> {
        if !self.is_online() {
            log::debug!("Offline, skipping queue drain");
            return Ok(None);
        }

        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Queue drain already in progress");
            return Ok(None);
        }
        let _guard = DrainGuard(&self.draining);

        let records = self
            .store
            .get_all_by_index(Collection::Queue, Index::Timestamp, None)?;

        log::info!("Draining {} queued actions", records.len());
        let mut report = DrainReport::default();

        for record in records {
            let action: QueuedAction = match serde_json::from_value(record) {
                Ok(action) => action,
                Err(e) => {
                    report.errors.push(format!("Unreadable queue record: {}", e));
                    continue;
                }
            };

            report.processed += 1;

            match self.gateway.execute(&action).await {
                Ok(_) => match self.mark_completed(&action) {
                    Ok(()) => report.succeeded += 1,
                    Err(e) => report.errors.push(format!("Action {}: {}", action.id, e)),
                },
                Err(err) => {
                    let id = action.id.clone();
                    match self.mark_failed(action, &err) {
                        Ok(true) => report.failed_permanently += 1,
                        Ok(false) => report.retried += 1,
                        Err(e) => report.errors.push(format!("Action {}: {}", id, e)),
                    }
                }
            }
        }

        log::info!(
            "Queue drain finished: {} succeeded, {} retried, {} failed permanently",
            report.succeeded,
            report.retried,
            report.failed_permanently
        );

        Ok(Some(report))
    }

    /// Manual trigger; a no-op while a drain is already running
    pub async fn force_sync(&self) -> Result<Option<DrainReport>, QueueError> {
        self.drain_queue().await
    }

    /// Completed record first, then remove from the queue
    fn mark_completed(&self, action: &QueuedAction) -> Result<(), QueueError> {
        let completed = CompletedAction {
            action: action.clone(),
            completed_at: Utc::now(),
        };
        self.store
            .put_record(Collection::Completed, &action.id, &encode(&completed)?)?;
        self.store.delete_record(Collection::Queue, &action.id)?;

        log::debug!("Action {} completed", action.id);
        Ok(())
    }

    /// Count a failed attempt. Returns true once the action has been dropped.
    fn mark_failed(&self, mut action: QueuedAction, err: &GatewayError) -> Result<bool, QueueError> {
        action.retry_count = action.retry_count.saturating_add(1).min(action.max_retries);
        action.last_error = Some(err.to_string());

        if !action.is_exhausted() {
            log::info!(
                "Action {} failed: {} (attempt {}/{})",
                action.id,
                err,
                action.retry_count,
                action.max_retries
            );
            self.store
                .put_record(Collection::Queue, &action.id, &encode(&action)?)?;
            return Ok(false);
        }

        log::warn!(
            "Action {} ({} {}) exceeded max retries, dropping: {}",
            action.id,
            action.method.as_str(),
            action.endpoint,
            err
        );

        let id = action.id.clone();
        let failed = FailedAction {
            action,
            failed_at: Utc::now(),
            error: err.to_string(),
            error_kind: err.kind(),
        };
        self.store.put_record(Collection::Failed, &id, &encode(&failed)?)?;
        self.store.delete_record(Collection::Queue, &id)?;

        Ok(true)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Get queue statistics
    pub fn get_queue_stats(&self) -> Result<QueueStats, QueueError> {
        let pending = self.store.count(Collection::Queue)?;
        let completed = self.store.count(Collection::Completed)?;
        let failed = self.store.count(Collection::Failed)?;

        Ok(QueueStats {
            total_queued: pending + completed + failed,
            pending,
            completed,
            failed,
        })
    }

    /// Get a pending action by id
    pub fn get_item(&self, id: &str) -> Result<Option<QueuedAction>, QueueError> {
        Ok(self.store.get_typed(Collection::Queue, id)?)
    }

    /// Pending actions in replay order
    pub fn pending_items(&self) -> Result<Vec<QueuedAction>, QueueError> {
        decode_all(self.store.get_all_by_index(Collection::Queue, Index::Timestamp, None)?)
    }

    /// Permanently failed actions, oldest failure first
    pub fn failed_items(&self) -> Result<Vec<FailedAction>, QueueError> {
        decode_all(self.store.get_all_by_index(Collection::Failed, Index::FailedAt, None)?)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Requeue permanently failed actions with a fresh retry budget
    pub fn retry_failed_items(&self) -> Result<usize, QueueError> {
        let failed = self.failed_items()?;
        let mut requeued = 0;

        for item in failed {
            let mut action = item.action;
            action.retry_count = 0;
            action.last_error = None;

            self.store
                .put_record(Collection::Queue, &action.id, &encode(&action)?)?;
            self.store.delete_record(Collection::Failed, &action.id)?;
            requeued += 1;
        }

        log::info!("Requeued {} failed actions", requeued);
        Ok(requeued)
    }

    /// Delete all permanently failed records (manual action)
    pub fn clear_failed(&self) -> Result<usize, QueueError> {
        let deleted =
            self.store
                .delete_by_index_before(Collection::Failed, Index::FailedAt, &json!(i64::MAX))?;

        log::info!("Cleared {} permanently failed actions", deleted);
        Ok(deleted)
    }

    /// Delete completed records older than N days
    pub fn clear_completed(&self, older_than_days: i64) -> Result<usize, QueueError> {
        let cutoff = retention_cutoff(Utc::now(), older_than_days)?;
        let deleted = self.store.delete_by_index_before(
            Collection::Completed,
            Index::CompletedAt,
            &json!(cutoff.timestamp_millis()),
        )?;

        log::info!("Cleared {} completed actions", deleted);
        Ok(deleted)
    }

    /// Delete completed and failed audit records older than `cutoff`
    pub fn compact_audit(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueError> {
        let bound = json!(cutoff.timestamp_millis());
        let completed =
            self.store
                .delete_by_index_before(Collection::Completed, Index::CompletedAt, &bound)?;
        let failed = self
            .store
            .delete_by_index_before(Collection::Failed, Index::FailedAt, &bound)?;

        Ok(completed + failed)
    }
}

/// `now - days`, rejecting negative or unrepresentable spans
pub fn retention_cutoff(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>, QueueError> {
    if days < 0 {
        return Err(QueueError::InvalidRetention(days));
    }
    Duration::try_days(days)
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or(QueueError::InvalidRetention(days))
}

fn validate(spec: &ActionSpec) -> Result<(), QueueError> {
    if spec.action_type.trim().is_empty() {
        return Err(QueueError::InvalidAction("action type is empty".to_string()));
    }
    if spec.endpoint.trim().is_empty() {
        return Err(QueueError::InvalidAction("endpoint is empty".to_string()));
    }
    if spec.max_retries == Some(0) {
        return Err(QueueError::InvalidAction("maxRetries must be at least 1".to_string()));
    }
    Ok(())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, QueueError> {
    serde_json::to_value(value).map_err(|e| QueueError::Serialization(e.to_string()))
}

fn decode_all<T: serde::de::DeserializeOwned>(records: Vec<Value>) -> Result<Vec<T>, QueueError> {
    records
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(|e| QueueError::Serialization(e.to_string())))
        .collect()
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Invalid retention period: {0} days")]
    InvalidRetention(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

// ============================================================================
// Tests
// ============================================================================
