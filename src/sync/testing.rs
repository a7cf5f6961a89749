//! Test doubles shared by the sync test modules

use super::gateway::{GatewayError, RemoteGateway};
use super::models::QueuedAction;
use crate::db::{Collection, Database, DbError, DbResult, Index, PersistentStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// How scripted executions fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Transient,
    Permanent,
}

impl Failure {
    fn to_error(self) -> GatewayError {
        match self {
            Failure::Transient => GatewayError::ServerError {
                status: 503,
                message: "service unavailable".to_string(),
            },
            Failure::Permanent => GatewayError::Rejected {
                status: 422,
                message: "invalid payload".to_string(),
            },
        }
    }
}

/// In-memory backend with scripted failures and optional latency
#[derive(Default)]
pub struct MockGateway {
    pub failure: Mutex<Option<Failure>>,
    pub failing_endpoints: Mutex<HashSet<String>>,
    pub failing_collections: Mutex<HashSet<String>>,
    pub entities: Mutex<HashMap<String, Vec<Value>>>,
    pub config: Mutex<Value>,
    pub config_updates: Mutex<Vec<Value>>,
    pub executed: Mutex<Vec<String>>,
    pub entity_calls: AtomicUsize,
    pub delay_ms: AtomicU64,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_all(&self, failure: Failure) {
        *self.failure.lock().unwrap() = Some(failure);
    }

    pub fn succeed_all(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn fail_endpoint(&self, endpoint: &str) {
        self.failing_endpoints.lock().unwrap().insert(endpoint.to_string());
    }

    pub fn fail_collection(&self, collection: &str) {
        self.failing_collections.lock().unwrap().insert(collection.to_string());
    }

    pub fn set_entities(&self, collection: &str, items: Vec<Value>) {
        self.entities.lock().unwrap().insert(collection.to_string(), items);
    }

    pub fn set_config(&self, config: Value) {
        *self.config.lock().unwrap() = config;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn entity_calls(&self) -> usize {
        self.entity_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl RemoteGateway for MockGateway {
    async fn execute(&self, action: &QueuedAction) -> Result<Value, GatewayError> {
        self.pause().await;
        self.executed.lock().unwrap().push(action.id.clone());

        if self.failing_endpoints.lock().unwrap().contains(&action.endpoint) {
            return Err(Failure::Permanent.to_error());
        }
        match *self.failure.lock().unwrap() {
            Some(failure) => Err(failure.to_error()),
            None => Ok(Value::Null),
        }
    }

    async fn get_entities(&self, collection: &str) -> Result<Vec<Value>, GatewayError> {
        self.pause().await;
        self.entity_calls.fetch_add(1, Ordering::SeqCst);

        if self.failing_collections.lock().unwrap().contains(collection) {
            return Err(GatewayError::Unavailable(format!("{} offline", collection)));
        }
        Ok(self
            .entities
            .lock()
            .unwrap()
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_config(&self) -> Result<Value, GatewayError> {
        Ok(self.config.lock().unwrap().clone())
    }

    async fn update_config(&self, settings: &Value) -> Result<(), GatewayError> {
        self.config_updates.lock().unwrap().push(settings.clone());
        *self.config.lock().unwrap() = settings.clone();
        Ok(())
    }
}

/// Store wrapper that fails writes on demand
pub struct FlakyStore {
    pub inner: Database,
    pub fail_all: AtomicBool,
    pub fail_keys: Mutex<HashSet<String>>,
    pub fail_kv: Mutex<HashSet<String>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: Database::in_memory().expect("Failed to create in-memory database"),
            fail_all: AtomicBool::new(false),
            fail_keys: Mutex::new(HashSet::new()),
            fail_kv: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_key(&self, key: &str) {
        self.fail_keys.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_value(&self, key: &str) {
        self.fail_kv.lock().unwrap().insert(key.to_string());
    }

    fn check(&self, key: &str) -> DbResult<()> {
        if self.fail_all.load(Ordering::SeqCst) || self.fail_keys.lock().unwrap().contains(key) {
            return Err(DbError::Unavailable(format!("write to {} refused", key)));
        }
        Ok(())
    }
}

impl PersistentStore for FlakyStore {
    fn add_record(&self, collection: Collection, key: &str, value: &Value) -> DbResult<()> {
        self.check(key)?;
        self.inner.add_record(collection, key, value)
    }

    fn get_record(&self, collection: Collection, key: &str) -> DbResult<Option<Value>> {
        self.inner.get_record(collection, key)
    }

    fn get_all_by_index(
        &self,
        collection: Collection,
        index: Index,
        match_value: Option<&Value>,
    ) -> DbResult<Vec<Value>> {
        self.inner.get_all_by_index(collection, index, match_value)
    }

    fn put_record(&self, collection: Collection, key: &str, value: &Value) -> DbResult<()> {
        self.check(key)?;
        self.inner.put_record(collection, key, value)
    }

    fn delete_record(&self, collection: Collection, key: &str) -> DbResult<bool> {
        self.check(key)?;
        self.inner.delete_record(collection, key)
    }

    fn count(&self, collection: Collection) -> DbResult<u64> {
        self.inner.count(collection)
    }

    fn delete_by_index_before(
        &self,
        collection: Collection,
        index: Index,
        bound: &Value,
    ) -> DbResult<usize> {
        self.inner.delete_by_index_before(collection, index, bound)
    }

    fn get_value(&self, key: &str) -> DbResult<Option<Value>> {
        self.inner.get_value(key)
    }

    fn set_value(&self, key: &str, value: &Value, ttl: Option<ChronoDuration>) -> DbResult<()> {
        if self.fail_kv.lock().unwrap().contains(key) {
            return Err(DbError::Unavailable(format!("write to {} refused", key)));
        }
        self.inner.set_value(key, value, ttl)
    }

    fn delete_value(&self, key: &str) -> DbResult<bool> {
        self.inner.delete_value(key)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> DbResult<usize> {
        self.inner.purge_expired(now)
    }
}
