//! Sync Manager - Orchestrates synchronization runs
//!
//! Coordinates between the persistent store, the offline queue, the conflict
//! resolver and the remote gateway. A run walks five steps:
//! 1. Drain the offline action queue
//! 2. Merge each tracked collection (seeding the cache on first sync)
//! 3. Merge the settings singleton (local wins by default)
//! 4. Cache maintenance (expired entries, old audit records)
//! 5. Persist the `lastSyncTimestamp` marker
//!
//! Step errors are collected and never abort later steps. Only one run
//! executes at a time; forced calls that arrive during a run share a single
//! follow-up run. Progress is published to listeners and a watch channel.

use super::conflict::{ConflictData, ConflictResolver, ConflictStrategy, FieldPolicyTable};
use super::gateway::{GatewayError, RemoteGateway};
use super::models::{
    ActionSpec, Freshness, HttpMethod, OfflineInfo, QueueStats, SyncResult, SyncState, SyncStatus,
};
use super::queue::{retention_cutoff, QueueError, QueueManager};
use crate::config::SyncConfig;
use crate::db::{Collection, DbError, PersistentStore, StoreExt};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::watch;

pub const TOTAL_STEPS: u32 = 5;

/// Settings key of the last successful sync (epoch millis)
pub const LAST_SYNC_KEY: &str = "lastSyncTimestamp";

/// Key/value entry holding the local settings singleton
pub const SETTINGS_KEY: &str = "settings";

const SNAPSHOT_PREFIX: &str = "snapshot:";

// ============================================================================
// Options
// ============================================================================

/// A tracked entity collection
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSpec {
    /// Remote collection name, also used for the cache key and push endpoint
    pub name: String,

    /// Field holding the stable record key, e.g. "isbn"
    pub key_field: String,

    pub field_policy: FieldPolicyTable,

    /// Enqueue a PUT for every merged record that differs from remote
    pub push_local_changes: bool,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_field: key_field.into(),
            field_policy: FieldPolicyTable::default(),
            push_local_changes: false,
        }
    }

    pub fn with_policy(mut self, policy: FieldPolicyTable) -> Self {
        self.field_policy = policy;
        self
    }

    pub fn push_local_changes(mut self, push: bool) -> Self {
        self.push_local_changes = push;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub collections: Vec<CollectionSpec>,
    pub sync_settings: bool,
    pub settings_strategy: ConflictStrategy,
    pub timestamp_field: String,
    pub completed_retention_days: i64,
    pub fresh_threshold_minutes: i64,
    pub stale_threshold_hours: i64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            collections: Vec::new(),
            sync_settings: true,
            settings_strategy: ConflictStrategy::LocalWins,
            timestamp_field: super::conflict::DEFAULT_TIMESTAMP_FIELD.to_string(),
            completed_retention_days: 7,
            fresh_threshold_minutes: 60,
            stale_threshold_hours: 24,
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            completed_retention_days: config.completed_retention_days,
            fresh_threshold_minutes: config.fresh_threshold_minutes,
            stale_threshold_hours: config.stale_threshold_hours,
            ..Self::default()
        }
    }

    pub fn track(mut self, collection: CollectionSpec) -> Self {
        self.collections.push(collection);
        self
    }
}

// ============================================================================
// Sync Manager
// ============================================================================

pub type ListenerId = u64;

type StatusListener = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

/// Sync manager - main orchestrator
pub struct SyncManager {
    store: Arc<dyn PersistentStore>,
    gateway: Arc<dyn RemoteGateway>,
    queue: Arc<QueueManager>,
    resolver: ConflictResolver,
    options: SyncOptions,
    run_lock: tokio::sync::Mutex<()>,
    /// Result of the forced run waiting on `run_lock`, if any
    pending_forced: Mutex<Option<watch::Receiver<Option<SyncResult>>>>,
    status: watch::Sender<SyncStatus>,
    listeners: Mutex<Vec<(ListenerId, StatusListener)>>,
    next_listener_id: AtomicU64,
}

/// Per-collection merge outcome
#[derive(Debug, Default)]
struct MergeOutcome {
    conflicts: Vec<String>,
    errors: Vec<String>,
}

impl SyncManager {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        gateway: Arc<dyn RemoteGateway>,
        queue: Arc<QueueManager>,
        options: SyncOptions,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus {
            total_steps: TOTAL_STEPS,
            ..SyncStatus::default()
        });

        Self {
            store,
            gateway,
            queue,
            resolver: ConflictResolver::new(options.timestamp_field.clone()),
            options,
            run_lock: tokio::sync::Mutex::new(()),
            pending_forced: Mutex::new(None),
            status,
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    // ========================================================================
    // Caller API
    // ========================================================================

    pub fn enqueue(&self, spec: ActionSpec) -> Result<String, SyncManagerError> {
        Ok(self.queue.enqueue(spec)?)
    }

    pub fn get_queue_stats(&self) -> Result<QueueStats, SyncManagerError> {
        Ok(self.queue.get_queue_stats()?)
    }

    /// Snapshot of the current progress
    pub fn get_sync_status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Channel-based alternative to listeners
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.status.borrow().is_running
    }

    /// Register a callback invoked after every progress update
    pub fn add_status_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns whether the listener was registered
    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Time of the last completed sync
    pub fn last_sync_timestamp(&self) -> Result<Option<DateTime<Utc>>, SyncManagerError> {
        let millis: Option<i64> = self.store.get_setting(LAST_SYNC_KEY)?;
        Ok(millis.and_then(DateTime::from_timestamp_millis))
    }

    /// Connectivity and cache freshness summary
    pub fn get_offline_info(&self) -> Result<OfflineInfo, SyncManagerError> {
        let last_sync = self.last_sync_timestamp()?;
        let pending_actions = self.store.count(Collection::Queue)?;
        let now = Utc::now();

        let fresh = Duration::try_minutes(self.options.fresh_threshold_minutes);
        let stale = Duration::try_hours(self.options.stale_threshold_hours);

        // A threshold too large to represent never expires
        let within = |age: Duration, limit: Option<Duration>| limit.map_or(true, |l| age <= l);

        let age = last_sync.map(|ts| now - ts);
        let estimated_freshness = match age {
            None => Freshness::Unknown,
            Some(age) if within(age, fresh) => Freshness::Fresh,
            Some(age) if within(age, stale) => Freshness::Stale,
            Some(_) => Freshness::Expired,
        };

        Ok(OfflineInfo {
            is_offline: !self.queue.is_online(),
            last_sync,
            pending_actions,
            data_age_secs: age.map(|a| a.num_seconds().max(0)),
            estimated_freshness,
        })
    }

    /// Cached snapshot of a tracked collection
    pub fn local_snapshot(&self, collection: &str) -> Result<Option<Vec<Value>>, SyncManagerError> {
        match self.store.get_value(&snapshot_key(collection))? {
            Some(Value::Array(items)) => Ok(Some(items)),
            Some(_) => Err(SyncManagerError::InvalidSnapshot(collection.to_string())),
            None => Ok(None),
        }
    }

    /// Replace the cached snapshot of a collection (local edits)
    pub fn save_local_snapshot(&self, collection: &str, records: Vec<Value>) -> Result<(), SyncManagerError> {
        self.store
            .set_value(&snapshot_key(collection), &Value::Array(records), None)?;
        Ok(())
    }

    pub fn local_settings(&self) -> Result<Option<Value>, SyncManagerError> {
        Ok(self.store.get_value(SETTINGS_KEY)?)
    }

    pub fn save_local_settings(&self, settings: &Value) -> Result<(), SyncManagerError> {
        self.store.set_value(SETTINGS_KEY, settings, None)?;
        Ok(())
    }

    // ========================================================================
    // Sync Run
    // ========================================================================

    /// Run a full sync.
    ///
    /// A non-forced call while a run is active fails with
    /// [`SyncManagerError::AlreadyRunning`]. A forced call waits for the
    /// active run to finish and then runs; further forced calls arriving
    /// before that follow-up run starts receive its result instead of
    /// queueing runs of their own.
    pub async fn start_sync(&self, force: bool) -> Result<SyncResult, SyncManagerError> {
        loop {
            if let Ok(_run) = self.run_lock.try_lock() {
                return Ok(self.run().await);
            }
            if !force {
                return Err(SyncManagerError::AlreadyRunning);
            }

            let (leader, mut rx) = {
                let mut pending = self
                    .pending_forced
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match pending.as_ref() {
                    Some(rx) => (None, rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        *pending = Some(rx.clone());
                        (Some(tx), rx)
                    }
                }
            };

            let Some(tx) = leader else {
                let shared = rx.wait_for(Option::is_some).await.map(|r| r.clone());
                match shared {
                    Ok(Some(result)) => return Ok(result),
                    // The waiting caller was dropped before running
                    _ => {
                        self.clear_pending_forced(&rx);
                        continue;
                    }
                }
            };

            let _run = self.run_lock.lock().await;
            // Forced calls from here on need a run of their own
            self.clear_pending_forced(&rx);

            log::debug!("Starting forced sync");
            let result = self.run().await;
            tx.send_replace(Some(result.clone()));
            return Ok(result);
        }
    }

    fn clear_pending_forced(&self, rx: &watch::Receiver<Option<SyncResult>>) {
        let mut pending = self
            .pending_forced
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if pending.as_ref().is_some_and(|current| current.same_channel(rx)) {
            *pending = None;
        }
    }

    async fn run(&self) -> SyncResult {
        let started_at = Utc::now();
        let clock = Instant::now();

        log::info!("Starting sync");

        let mut result = SyncResult {
            success: false,
            state: SyncState::Running,
            errors: Vec::new(),
            conflicts: Vec::new(),
            drain: None,
            collections_merged: 0,
            settings_merged: false,
            started_at,
            finished_at: started_at,
        };

        self.update_status(|status| {
            *status = SyncStatus {
                state: SyncState::Running,
                is_running: true,
                step_index: 0,
                total_steps: TOTAL_STEPS,
                current_operation: "Starting sync".to_string(),
                errors: Vec::new(),
                conflicts: Vec::new(),
                started_at: Some(started_at),
                estimated_completion: None,
                last_completed_at: status.last_completed_at,
            };
        });

        // Step 1: offline queue
        self.begin_step(1, "Draining offline queue");
        match self.queue.drain_queue().await {
            Ok(report) => {
                if let Some(report) = &report {
                    result
                        .errors
                        .extend(report.errors.iter().map(|e| format!("Queue: {}", e)));
                }
                result.drain = report;
            }
            Err(e) => result.errors.push(format!("Queue: {}", e)),
        }
        self.end_step(1, &result, clock);

        // Step 2: tracked collections
        self.begin_step(2, "Merging collections");
        let last_sync = self.last_sync_timestamp().unwrap_or_else(|e| {
            result.errors.push(format!("Marker: {}", e));
            None
        });
        for spec in &self.options.collections {
            self.set_operation(&format!("Merging {}", spec.name));
            match self.merge_collection(spec, started_at, last_sync).await {
                Ok(outcome) => {
                    result.conflicts.extend(outcome.conflicts);
                    result.errors.extend(outcome.errors);
                    result.collections_merged += 1;
                }
                Err(e) => result.errors.push(format!("{}: {}", spec.name, e)),
            }
        }
        self.end_step(2, &result, clock);

        // Step 3: settings singleton
        self.begin_step(3, "Merging settings");
        if self.options.sync_settings {
            match self.merge_settings(started_at, last_sync).await {
                Ok(conflicts) => {
                    result.conflicts.extend(conflicts);
                    result.settings_merged = true;
                }
                Err(e) => result.errors.push(format!("Settings: {}", e)),
            }
        }
        self.end_step(3, &result, clock);

        // Step 4: cache maintenance
        self.begin_step(4, "Cache maintenance");
        if let Err(e) = self.run_maintenance(started_at) {
            result.errors.push(format!("Maintenance: {}", e));
        }
        self.end_step(4, &result, clock);

        // Step 5: finalize
        self.begin_step(5, "Finalizing");
        let finished_at = Utc::now();
        match self
            .store
            .set_setting(LAST_SYNC_KEY, &started_at.timestamp_millis())
        {
            Ok(()) => {
                result.success = true;
                result.state = SyncState::Completed;
            }
            Err(e) => {
                log::error!("Failed to persist sync marker: {}", e);
                result.errors.push(format!("Finalize: {}", e));
                result.state = SyncState::Failed;
            }
        }
        result.finished_at = finished_at;

        let completed = result.state == SyncState::Completed;
        self.update_status(|status| {
            status.state = result.state;
            status.is_running = false;
            status.step_index = TOTAL_STEPS;
            status.current_operation = if completed {
                "Sync completed".to_string()
            } else {
                "Sync failed".to_string()
            };
            status.errors = result.errors.clone();
            status.conflicts = result.conflicts.clone();
            status.estimated_completion = Some(finished_at);
            if completed {
                status.last_completed_at = Some(finished_at);
            }
        });

        if result.has_errors() {
            log::warn!(
                "Sync finished ({}) with {} errors, {} conflicts",
                result.state.as_str(),
                result.errors.len(),
                result.conflicts.len()
            );
        } else {
            log::info!(
                "Sync finished ({}), {} conflicts",
                result.state.as_str(),
                result.conflicts.len()
            );
        }

        result
    }

    /// Merge one collection and write it back to the cache
    async fn merge_collection(
        &self,
        spec: &CollectionSpec,
        now: DateTime<Utc>,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<MergeOutcome, SyncManagerError> {
        let remote = self.gateway.get_entities(&spec.name).await?;

        let Some(local) = self.local_snapshot(&spec.name)? else {
            log::info!("Seeding {} cache with {} remote records", spec.name, remote.len());
            self.save_local_snapshot(&spec.name, remote)?;
            return Ok(MergeOutcome::default());
        };

        let mut outcome = MergeOutcome::default();
        let mut local_by_key = BTreeMap::new();
        let mut remote_by_key = BTreeMap::new();
        let mut unkeyed = Vec::new();

        for record in local {
            match record_key(&record, &spec.key_field) {
                Some(key) => {
                    local_by_key.insert(key, record);
                }
                None => unkeyed.push(record),
            }
        }
        if !unkeyed.is_empty() {
            outcome.errors.push(format!(
                "{}: {} local records without '{}' kept unmerged",
                spec.name,
                unkeyed.len(),
                spec.key_field
            ));
        }

        for record in remote {
            match record_key(&record, &spec.key_field) {
                Some(key) => {
                    remote_by_key.insert(key, record);
                }
                None => outcome.errors.push(format!(
                    "{}: remote record without '{}' skipped",
                    spec.name, spec.key_field
                )),
            }
        }

        let mut keys: Vec<&String> = local_by_key.keys().chain(remote_by_key.keys()).collect();
        keys.sort();
        keys.dedup();

        let mut merged = Vec::with_capacity(keys.len() + unkeyed.len());

        for key in keys {
            match (local_by_key.get(key), remote_by_key.get(key)) {
                (Some(local), Some(remote)) => {
                    let data = ConflictData::new(local.clone(), remote.clone(), now)
                        .with_last_sync(last_sync);
                    let resolution =
                        self.resolver
                            .resolve(&data, ConflictStrategy::Merge, Some(&spec.field_policy));

                    outcome.conflicts.extend(
                        resolution
                            .conflicts
                            .iter()
                            .map(|c| format!("{}/{}: {}", spec.name, key, c)),
                    );

                    if spec.push_local_changes && resolution.resolved != *remote {
                        if let Err(e) = self.push_record(&spec.name, key, &resolution.resolved) {
                            outcome.errors.push(format!("{}/{}: {}", spec.name, key, e));
                        }
                    }

                    merged.push(resolution.resolved);
                }
                (Some(local), None) => merged.push(local.clone()),
                (None, Some(remote)) => merged.push(remote.clone()),
                (None, None) => {}
            }
        }
        merged.extend(unkeyed);

        log::debug!(
            "Merged {} ({} records, {} conflicts)",
            spec.name,
            merged.len(),
            outcome.conflicts.len()
        );

        self.save_local_snapshot(&spec.name, merged)?;
        Ok(outcome)
    }

    /// Queue a PUT of the merged record, reusing an undelivered one
    fn push_record(&self, collection: &str, key: &str, record: &Value) -> Result<String, SyncManagerError> {
        let spec = ActionSpec::new(
            "syncUpdate",
            HttpMethod::Put,
            format!("/{}/{}", collection, key),
            record.clone(),
        );
        Ok(self.queue.enqueue_or_replace(spec)?)
    }

    /// Merge the settings singleton; returns the conflicts found
    async fn merge_settings(
        &self,
        now: DateTime<Utc>,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, SyncManagerError> {
        let remote = self.gateway.get_config().await?;
        let local = self.local_settings()?;

        match (local, remote) {
            (None, Value::Null) => Ok(Vec::new()),
            (None, remote) => {
                self.save_local_settings(&remote)?;
                Ok(Vec::new())
            }
            (Some(local), Value::Null) => {
                self.gateway.update_config(&local).await?;
                Ok(Vec::new())
            }
            (Some(local), remote) => {
                let data = ConflictData::new(local, remote, now).with_last_sync(last_sync);
                let resolution = self
                    .resolver
                    .resolve(&data, self.options.settings_strategy, None);

                self.save_local_settings(&resolution.resolved)?;
                if resolution.resolved != data.remote {
                    self.gateway.update_config(&resolution.resolved).await?;
                }

                Ok(resolution
                    .conflicts
                    .into_iter()
                    .map(|c| format!("settings: {}", c))
                    .collect())
            }
        }
    }

    fn run_maintenance(&self, now: DateTime<Utc>) -> Result<(), SyncManagerError> {
        let purged = self.store.purge_expired(now)?;
        let cutoff = retention_cutoff(now, self.options.completed_retention_days)?;
        let compacted = self.queue.compact_audit(cutoff)?;

        if purged + compacted > 0 {
            log::info!(
                "Maintenance removed {} expired entries and {} audit records",
                purged,
                compacted
            );
        }
        Ok(())
    }

    // ========================================================================
    // Status
    // ========================================================================

    fn begin_step(&self, step: u32, label: &str) {
        self.update_status(|status| {
            status.step_index = step;
            status.current_operation = label.to_string();
        });
    }

    fn set_operation(&self, label: &str) {
        self.update_status(|status| status.current_operation = label.to_string());
    }

    fn end_step(&self, step: u32, result: &SyncResult, clock: Instant) {
        let eta = estimate_completion(Utc::now(), clock.elapsed(), step, TOTAL_STEPS);
        self.update_status(|status| {
            status.errors = result.errors.clone();
            status.conflicts = result.conflicts.clone();
            status.estimated_completion = Some(eta);
        });
    }

    fn update_status<F: FnOnce(&mut SyncStatus)>(&self, update: F) {
        self.status.send_modify(update);
        let snapshot = self.status.borrow().clone();
        self.notify_listeners(&snapshot);
    }

    fn notify_listeners(&self, status: &SyncStatus) {
        let listeners: Vec<(ListenerId, StatusListener)> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(status))).is_err() {
                log::error!("Status listener {} panicked", id);
            }
        }
    }
}

/// Linear extrapolation: `now + elapsed / completed * remaining`
pub fn estimate_completion(
    now: DateTime<Utc>,
    elapsed: std::time::Duration,
    steps_completed: u32,
    total_steps: u32,
) -> DateTime<Utc> {
    if steps_completed == 0 {
        return now;
    }
    let remaining = total_steps.saturating_sub(steps_completed);
    let projected = elapsed / steps_completed * remaining;

    now + Duration::from_std(projected).unwrap_or_else(|_| Duration::zero())
}

fn snapshot_key(collection: &str) -> String {
    format!("{}{}", SNAPSHOT_PREFIX, collection)
}

fn record_key(record: &Value, key_field: &str) -> Option<String> {
    match record.get(key_field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncManagerError {
    #[error("Sync already in progress")]
    AlreadyRunning,

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Cached snapshot of '{0}' is not a list")]
    InvalidSnapshot(String),
}
