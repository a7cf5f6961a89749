//! # Shelf Sync
//!
//! Offline-first synchronization core for a personal library client:
//! a durable action queue, a deterministic conflict resolver and a sync
//! orchestrator that reconciles the local cache with the backend.

pub mod config;
pub mod db;
pub mod sync;

pub use config::{ConfigError, SyncConfig};
pub use db::{Collection, Database, DbError, Index, PersistentStore, StoreExt};
pub use sync::{
    ActionSpec, CollectionSpec, ConflictResolver, ConflictStrategy, FieldPolicy, FieldPolicyTable,
    HttpGateway, HttpMethod, QueueManager, RemoteGateway, SyncManager, SyncOptions, SyncResult,
    SyncScheduler, SyncStatus,
};

use std::sync::Arc;

/// Load `.env` and install the logger (default filter `info`)
pub fn init_logging() {
    dotenvy::dotenv().ok();

    // Ignore the error when a logger is already installed
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] sync::GatewayError),
}

/// Fully wired sync stack backed by SQLite and the HTTP gateway
pub struct ShelfSync {
    pub db: Arc<Database>,
    pub gateway: Arc<HttpGateway>,
    pub manager: Arc<SyncManager>,
    pub scheduler: SyncScheduler,
}

impl ShelfSync {
    /// Open the stack from environment configuration
    pub fn from_env(options: SyncOptions) -> Result<Self, InitError> {
        let config = SyncConfig::from_env()?;
        Self::open(&config, options)
    }

    pub fn open(config: &SyncConfig, options: SyncOptions) -> Result<Self, InitError> {
        let db = Arc::new(Database::new(config.db_path.clone())?);
        let gateway = Arc::new(HttpGateway::from_config(config)?);
        let queue = Arc::new(QueueManager::new(
            db.clone(),
            gateway.clone(),
            config.default_max_retries,
        ));

        let options = SyncOptions {
            completed_retention_days: config.completed_retention_days,
            fresh_threshold_minutes: config.fresh_threshold_minutes,
            stale_threshold_hours: config.stale_threshold_hours,
            ..options
        };
        let manager = Arc::new(SyncManager::new(db.clone(), gateway.clone(), queue, options));
        let scheduler = SyncScheduler::new(manager.clone(), db.clone());

        log::info!(
            "Shelf sync ready (db: {}, api: {})",
            config.db_path.display(),
            gateway.base_url()
        );

        Ok(Self {
            db,
            gateway,
            manager,
            scheduler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_open_wires_config_into_stack() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            db_path: dir.path().join("shelf.db"),
            api_base_url: "http://localhost:9".to_string(),
            default_max_retries: 2,
            completed_retention_days: 14,
            ..SyncConfig::default()
        };

        let stack = ShelfSync::open(&config, SyncOptions::default()).unwrap();

        assert_eq!(stack.gateway.base_url(), "http://localhost:9");
        assert_eq!(stack.manager.options().completed_retention_days, 14);

        let id = stack
            .manager
            .enqueue(ActionSpec::new("addBook", HttpMethod::Post, "/books", json!({})))
            .unwrap();
        let action = stack.manager.queue().get_item(&id).unwrap().unwrap();
        assert_eq!(action.max_retries, 2);
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
    }
}
