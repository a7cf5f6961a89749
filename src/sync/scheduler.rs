//! Sync Scheduler
//!
//! Two triggers for background work:
//! - Connectivity: an offline→online transition schedules one queue drain.
//!   Transitions that arrive while that drain is pending are coalesced.
//! - Periodic: an optional interval loop running non-forced syncs.
//!
//! Uses Tokio tasks for non-blocking background execution; `set_online` and
//! `start` must be called from within a Tokio runtime.

use super::manager::{SyncManager, SyncManagerError};
use crate::db::{DbError, PersistentStore, StoreExt};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Settings key of the persisted [`SchedulerConfig`]
pub const SCHEDULER_CONFIG_KEY: &str = "scheduler_config";

const MIN_INTERVAL_MINUTES: u64 = 1;
const MAX_INTERVAL_MINUTES: u64 = 1440;

/// Scheduler configuration stored in settings table
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub last_run: Option<DateTime<Utc>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            last_run: None,
        }
    }
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

/// Background triggers for a [`SyncManager`]
#[derive(Clone)]
pub struct SyncScheduler {
    manager: Arc<SyncManager>,
    store: Arc<dyn PersistentStore>,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
    reconnect_pending: Arc<AtomicBool>,
}

impl SyncScheduler {
    pub fn new(manager: Arc<SyncManager>, store: Arc<dyn PersistentStore>) -> Self {
        Self {
            manager,
            store,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
            reconnect_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    // ========================================================================
    // Connectivity
    // ========================================================================

    /// Record a connectivity change.
    ///
    /// Returns the handle of the drain task when this call scheduled one.
    pub fn set_online(&self, online: bool) -> Option<JoinHandle<()>> {
        let was_online = self.manager.queue().set_online(online);

        if !online || was_online {
            if was_online != online {
                log::info!("Connectivity lost, queueing mutations locally");
            }
            return None;
        }

        if self
            .reconnect_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Reconnect drain already pending");
            return None;
        }

        log::info!("Connectivity restored, draining offline queue");

        let queue = self.manager.queue().clone();
        let pending = self.reconnect_pending.clone();

        Some(tokio::spawn(async move {
            match queue.drain_queue().await {
                Ok(Some(report)) => log::info!(
                    "Reconnect drain: {} succeeded, {} retried, {} failed",
                    report.succeeded,
                    report.retried,
                    report.failed_permanently
                ),
                Ok(None) => log::debug!("Reconnect drain skipped"),
                Err(e) => log::error!("Reconnect drain failed: {}", e),
            }
            pending.store(false, Ordering::Release);
        }))
    }

    // ========================================================================
    // Periodic Sync
    // ========================================================================

    /// Load configuration from database settings table
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let config: SchedulerConfig = self
            .store
            .get_setting(SCHEDULER_CONFIG_KEY)?
            .unwrap_or_default();

        *self.config.write().await = config;
        Ok(())
    }

    /// Save configuration to database settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.store.set_setting(SCHEDULER_CONFIG_KEY, &config)?;
        Ok(())
    }

    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Start the periodic loop with the configured interval
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let interval_minutes = self.config.read().await.interval_minutes;
        validate_interval(interval_minutes)?;

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }

        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            scheduler.scheduler_loop(interval_minutes).await;
        });

        *self
            .task_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        log::info!("Background scheduler started (interval: {} minutes)", interval_minutes);
        Ok(())
    }

    /// Stop the periodic loop
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(SchedulerError::NotRunning);
        }

        if let Some(handle) = self
            .task_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Update configuration, persist it and restart the loop if needed
    pub async fn update_config(&self, enabled: bool, interval_minutes: u64) -> Result<(), SchedulerError> {
        validate_interval(interval_minutes)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
        }
        self.save_config().await?;

        if self.is_running() {
            // Ignore error if not running (race with stop)
            let _ = self.stop().await;
        }
        if enabled {
            self.start().await?;
        }

        log::info!(
            "Scheduler config updated: enabled={}, interval={} minutes",
            enabled,
            interval_minutes
        );
        Ok(())
    }

    async fn scheduler_loop(&self, interval_minutes: u64) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(60 * interval_minutes));

        loop {
            interval.tick().await;

            if !self.running.load(Ordering::Acquire) {
                break;
            }

            log::info!("Background sync triggered by scheduler");

            match self.manager.start_sync(false).await {
                Ok(result) => {
                    if result.has_errors() {
                        log::warn!(
                            "Background sync had {} errors: {:?}",
                            result.errors.len(),
                            result.errors
                        );
                    }

                    let config = {
                        let mut config = self.config.write().await;
                        config.last_run = Some(result.finished_at);
                        config.clone()
                    };
                    if let Err(e) = self.store.set_setting(SCHEDULER_CONFIG_KEY, &config) {
                        log::error!("Failed to save last_run timestamp: {}", e);
                    }
                }
                Err(SyncManagerError::AlreadyRunning) => {
                    log::debug!("Sync already running, skipping scheduled run");
                }
                Err(e) => log::error!("Background sync failed: {}", e),
            }
        }

        log::info!("Scheduler loop exited");
    }
}

fn validate_interval(interval_minutes: u64) -> Result<(), SchedulerError> {
    if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be {}-{} minutes, got {}",
            MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES, interval_minutes
        )));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sync::manager::SyncOptions;
    use crate::sync::models::{ActionSpec, HttpMethod};
    use crate::sync::queue::QueueManager;
    use crate::sync::testing::MockGateway;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (SyncScheduler, Arc<SyncManager>, Arc<MockGateway>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let gateway = Arc::new(MockGateway::new());
        let queue = Arc::new(QueueManager::new(db.clone(), gateway.clone(), 5));
        let manager = Arc::new(SyncManager::new(
            db.clone(),
            gateway.clone(),
            queue,
            SyncOptions::default(),
        ));
        (SyncScheduler::new(manager.clone(), db), manager, gateway)
    }

    #[tokio::test]
    async fn test_config_default() {
        let (scheduler, _, _) = setup();

        let config = scheduler.get_config().await;
        assert!(!config.enabled);
        assert_eq!(config.interval_minutes, 30);
        assert!(config.last_run.is_none());
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_save_load_config() {
        let (scheduler, _, _) = setup();
        let last_run = Utc::now();

        {
            let mut config = scheduler.config.write().await;
            config.enabled = true;
            config.interval_minutes = 60;
            config.last_run = Some(last_run);
        }
        scheduler.save_config().await.unwrap();

        *scheduler.config.write().await = SchedulerConfig::default();
        scheduler.load_config().await.unwrap();

        let loaded = scheduler.get_config().await;
        assert!(loaded.enabled);
        assert_eq!(loaded.interval_minutes, 60);
        assert_eq!(loaded.last_run, Some(last_run));
    }

    #[tokio::test]
    async fn test_invalid_interval() {
        let (scheduler, _, _) = setup();

        let result = scheduler.update_config(true, 0).await;
        assert!(matches!(result, Err(SchedulerError::InvalidInterval(_))));

        let result = scheduler.update_config(true, 2000).await;
        assert!(matches!(result, Err(SchedulerError::InvalidInterval(_))));
    }

    #[tokio::test]
    async fn test_stop_not_running() {
        let (scheduler, _, _) = setup();
        assert!(matches!(scheduler.stop().await, Err(SchedulerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_periodic_sync_runs_and_records_last_run() {
        let (scheduler, manager, _) = setup();

        scheduler.update_config(true, 1).await.unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(scheduler.start().await, Err(SchedulerError::AlreadyRunning)));

        // First interval tick fires immediately
        for _ in 0..100 {
            if scheduler.get_config().await.last_run.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(scheduler.get_config().await.last_run.is_some());
        assert!(manager.last_sync_timestamp().unwrap().is_some());

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_reconnect_schedules_single_drain() {
        let (scheduler, manager, gateway) = setup();
        gateway.set_delay(Duration::from_millis(50));

        assert!(scheduler.set_online(false).is_none());
        manager
            .enqueue(ActionSpec::new("addBook", HttpMethod::Post, "/books", json!({"isbn": "1"})))
            .unwrap();

        let handle = scheduler.set_online(true).expect("drain should be scheduled");

        // Flapping while the drain is pending coalesces
        assert!(scheduler.set_online(false).is_none());
        assert!(scheduler.set_online(true).is_none());
        assert!(scheduler.set_online(true).is_none());

        handle.await.unwrap();

        assert_eq!(gateway.executed().len(), 1);
        assert_eq!(manager.get_queue_stats().unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_online_when_already_online_is_noop() {
        let (scheduler, _, gateway) = setup();

        assert!(scheduler.set_online(true).is_none());
        assert!(gateway.executed().is_empty());
    }
}
