//! Sync Module - Offline-first synchronization core
//!
//! Provides:
//! - Offline queue: durable FIFO of mutations with bounded retries
//! - Conflict resolution: pure, deterministic merge of local/remote snapshots
//! - Sync manager: five-step reconciliation run with progress reporting
//! - Scheduler: reconnect-triggered drains and periodic syncs
//!
//! Architecture:
//! - Storage through [`crate::db::PersistentStore`], backend through [`RemoteGateway`]
//! - Both are injected, so every component runs against test doubles
//! - Single-flight: at most one drain and one sync run at a time

pub mod conflict;
pub mod gateway;
pub mod manager;
pub mod models;
pub mod queue;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;


// Re-export commonly used types
pub use conflict::{
    ConflictData, ConflictError, ConflictResolution, ConflictResolver, ConflictStrategy,
    FieldPolicy, FieldPolicyTable,
};
pub use gateway::{GatewayError, HttpGateway, RemoteGateway};
pub use manager::{CollectionSpec, ListenerId, SyncManager, SyncManagerError, SyncOptions};
pub use models::{
    ActionSpec, CompletedAction, DrainReport, ErrorKind, FailedAction, Freshness, HttpMethod,
    OfflineInfo, QueueStats, QueuedAction, SyncResult, SyncState, SyncStatus,
};
pub use queue::{QueueError, QueueManager};
pub use scheduler::{SchedulerConfig, SchedulerError, SyncScheduler};
