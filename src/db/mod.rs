//! Database module for Shelf Sync
//!
//! Provides the persistent store used by the queue, the snapshot cache and
//! the sync orchestrator:
//! - Keyed collections (`queue`, `completed`, `failed`) with secondary indices
//! - A general key/value table for cached snapshots, settings and markers
//! - Atomic per-record operations (one SQL statement each)
//!
//! The store is consumed through the [`PersistentStore`] trait so that the
//! queue and the orchestrator can run against test doubles.

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Duplicate key '{key}' in collection '{collection}'")]
    DuplicateKey { collection: String, key: String },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type DbResult<T> = Result<T, DbError>;

// ============================================================================
// Collections & Indices
// ============================================================================

/// Keyed collections held in the `records` table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Pending queued actions, keyed by action id
    Queue,
    /// Successfully executed actions (audit only)
    Completed,
    /// Actions dropped after exhausting their retries
    Failed,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Secondary indices over record fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Index {
    Timestamp,
    ActionType,
    RetryCount,
    CompletedAt,
    FailedAt,
}

impl Index {
    /// JSON path of the indexed field, matching the expression indexes in schema.sql
    pub fn json_path(&self) -> &'static str {
        match self {
            Self::Timestamp => "$.timestamp",
            Self::ActionType => "$.actionType",
            Self::RetryCount => "$.retryCount",
            Self::CompletedAt => "$.completedAt",
            Self::FailedAt => "$.failedAt",
        }
    }
}

// ============================================================================
// Store Interface
// ============================================================================

/// Durable keyed storage with secondary indices.
///
/// Every method touches at most one record (or one key) in a single
/// statement; partial writes are never observable.
pub trait PersistentStore: Send + Sync {
    /// Insert a new record. Fails with [`DbError::DuplicateKey`] if the key exists.
    fn add_record(&self, collection: Collection, key: &str, value: &Value) -> DbResult<()>;

    fn get_record(&self, collection: Collection, key: &str) -> DbResult<Option<Value>>;

    /// Records ordered by the index value ascending, ties in insertion order.
    /// `None` returns the whole collection.
    fn get_all_by_index(
        &self,
        collection: Collection,
        index: Index,
        match_value: Option<&Value>,
    ) -> DbResult<Vec<Value>>;

    /// Insert or replace. An existing record keeps its insertion position.
    fn put_record(&self, collection: Collection, key: &str, value: &Value) -> DbResult<()>;

    /// Returns whether a record was removed
    fn delete_record(&self, collection: Collection, key: &str) -> DbResult<bool>;

    fn count(&self, collection: Collection) -> DbResult<u64>;

    /// Delete records whose index value is strictly below `bound`
    fn delete_by_index_before(
        &self,
        collection: Collection,
        index: Index,
        bound: &Value,
    ) -> DbResult<usize>;

    /// Get a key/value entry. Expired entries read as absent.
    fn get_value(&self, key: &str) -> DbResult<Option<Value>>;

    fn set_value(&self, key: &str, value: &Value, ttl: Option<Duration>) -> DbResult<()>;

    fn delete_value(&self, key: &str) -> DbResult<bool>;

    /// Remove key/value entries that expired at or before `now`
    fn purge_expired(&self, now: DateTime<Utc>) -> DbResult<usize>;
}

/// Typed helpers over any [`PersistentStore`]
pub trait StoreExt: PersistentStore {
    /// Get a setting value
    fn get_setting<T: DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        match self.get_value(key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| DbError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Set a setting value (never expires)
    fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let json = serde_json::to_value(value).map_err(|e| DbError::Serialization(e.to_string()))?;
        self.set_value(key, &json, None)
    }

    /// Get and decode a record
    fn get_typed<T: DeserializeOwned>(&self, collection: Collection, key: &str) -> DbResult<Option<T>> {
        match self.get_record(collection, key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| DbError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }
}

impl<S: PersistentStore + ?Sized> StoreExt for S {}

// ============================================================================
// SQLite Database
// ============================================================================

/// Database manager for thread-safe SQLite access
/// Uses r2d2 connection pooling
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) a database file
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| DbError::Unavailable(format!("{}: {}", parent.display(), e)))?;
            }
        }

        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.execute_batch(
                r#"
                PRAGMA busy_timeout = 5000;
                PRAGMA synchronous = NORMAL;
                PRAGMA temp_store = MEMORY;
                "#,
            )
        });

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::initialize_schema(&conn)?;
        drop(conn);

        log::info!("Opened database at {}", db_path.display());

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every pooled SQLite memory connection is its own database, so the pool
    /// is pinned to a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;
        Self::initialize_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn initialize_schema(conn: &Connection) -> DbResult<()> {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        Ok(())
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }
}

impl PersistentStore for Database {
    fn add_record(&self, collection: Collection, key: &str, value: &Value) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = encode(value)?;

        let result = conn.execute(
            "INSERT INTO records (collection, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![collection.as_str(), key, json, Utc::now().to_rfc3339()],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(DbError::DuplicateKey {
                    collection: collection.as_str().to_string(),
                    key: key.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get_record(&self, collection: Collection, key: &str) -> DbResult<Option<Value>> {
        let conn = self.get_conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT value FROM records WHERE collection = ?1 AND key = ?2",
                params![collection.as_str(), key],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|s| decode(&s)).transpose()
    }

    fn get_all_by_index(
        &self,
        collection: Collection,
        index: Index,
        match_value: Option<&Value>,
    ) -> DbResult<Vec<Value>> {
        let conn = self.get_conn()?;
        let path = index.json_path();

        let rows: Vec<String> = match match_value {
            Some(Value::Null) => {
                let sql = format!(
                    "SELECT value FROM records WHERE collection = ?1 \
                     AND json_extract(value, '{path}') IS NULL ORDER BY seq"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![collection.as_str()], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<String>>>()?
            }
            Some(matching) => {
                let sql = format!(
                    "SELECT value FROM records WHERE collection = ?1 \
                     AND json_extract(value, '{path}') = ?2 ORDER BY seq"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    params![collection.as_str(), to_sql_value(matching)],
                    |row| row.get(0),
                )?;
                rows.collect::<rusqlite::Result<Vec<String>>>()?
            }
            None => {
                let sql = format!(
                    "SELECT value FROM records WHERE collection = ?1 \
                     ORDER BY json_extract(value, '{path}'), seq"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![collection.as_str()], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<String>>>()?
            }
        };

        rows.iter().map(|s| decode(s)).collect()
    }

    fn put_record(&self, collection: Collection, key: &str, value: &Value) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = encode(value)?;

        conn.execute(
            r#"
            INSERT INTO records (collection, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(collection, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![collection.as_str(), key, json, Utc::now().to_rfc3339()],
        )?;

        Ok(())
    }

    fn delete_record(&self, collection: Collection, key: &str) -> DbResult<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND key = ?2",
            params![collection.as_str(), key],
        )?;
        Ok(deleted > 0)
    }

    fn count(&self, collection: Collection) -> DbResult<u64> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            params![collection.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn delete_by_index_before(
        &self,
        collection: Collection,
        index: Index,
        bound: &Value,
    ) -> DbResult<usize> {
        let conn = self.get_conn()?;
        let sql = format!(
            "DELETE FROM records WHERE collection = ?1 AND json_extract(value, '{}') < ?2",
            index.json_path()
        );
        let deleted = conn.execute(&sql, params![collection.as_str(), to_sql_value(bound)])?;
        Ok(deleted)
    }

    fn get_value(&self, key: &str) -> DbResult<Option<Value>> {
        let conn = self.get_conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1 \
                 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, Utc::now().timestamp_millis()],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|s| decode(&s)).transpose()
    }

    fn set_value(&self, key: &str, value: &Value, ttl: Option<Duration>) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = encode(value)?;
        let now = Utc::now();
        // A TTL past the representable range never expires
        let expires_at = ttl
            .and_then(|ttl| now.checked_add_signed(ttl))
            .map(|at| at.timestamp_millis());

        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![key, json, now.to_rfc3339(), expires_at],
        )?;

        Ok(())
    }

    fn delete_value(&self, key: &str) -> DbResult<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> DbResult<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM kv_store WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now.timestamp_millis()],
        )?;

        if deleted > 0 {
            log::info!("Purged {} expired cache entries", deleted);
        }
        Ok(deleted)
    }
}

// =========================================================================
// HELPERS
// =========================================================================

fn encode(value: &Value) -> DbResult<String> {
    serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode(json: &str) -> DbResult<Value> {
    serde_json::from_str(json).map_err(|e| DbError::Serialization(e.to_string()))
}

/// Convert a JSON value to what `json_extract` yields for it
fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
