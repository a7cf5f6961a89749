//! Conflict Resolution - pure merge logic between local and remote snapshots
//!
//! Strategies:
//! - `newest-wins`: whole entity from the side with the greater timestamp (ties: remote)
//! - `local-wins` / `remote-wins`: plain selection
//! - `merge`: per-field policy table, timestamp becomes max(local, remote)
//! - `manual`: keeps local and always reports conflicts for a later decision
//!
//! Every strategy reports a deep, order-sensitive diff of the shared fields,
//! except the timestamp field, which never counts as a conflict.
//! Nothing here touches storage or the clock, so identical input always
//! yields an identical [`ConflictResolution`].

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_TIMESTAMP_FIELD: &str = "updatedAt";

// ============================================================================
// Types
// ============================================================================

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Greater last-updated timestamp wins, ties go to remote
    NewestWins,

    /// Use local version (discard server changes)
    LocalWins,

    /// Use server version (discard local changes)
    RemoteWins,

    /// Field-by-field merge driven by a [`FieldPolicyTable`]
    Merge,

    /// Keep local until the user decides
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewestWins => "newest-wins",
            Self::LocalWins => "local-wins",
            Self::RemoteWins => "remote-wins",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }
}

/// How a single field is merged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldPolicy {
    LocalWins,
    RemoteWins,
    #[default]
    NewestWins,
    /// Remote entries then local ones, de-duplicated by value
    UnionArray,
}

/// Per-field policies for the `merge` strategy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldPolicyTable {
    pub fields: BTreeMap<String, FieldPolicy>,

    /// Applies to fields without an entry
    #[serde(default)]
    pub default: FieldPolicy,
}

impl FieldPolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, policy: FieldPolicy) -> Self {
        self.fields.insert(name.into(), policy);
        self
    }

    pub fn with_default(mut self, policy: FieldPolicy) -> Self {
        self.default = policy;
        self
    }

    pub fn policy_for(&self, field: &str) -> FieldPolicy {
        self.fields.get(field).copied().unwrap_or(self.default)
    }
}

/// Input to a resolution; never mutated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictData<T> {
    pub local: T,
    pub remote: T,
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl<T> ConflictData<T> {
    pub fn new(local: T, remote: T, now: DateTime<Utc>) -> Self {
        Self {
            local,
            remote,
            last_sync_timestamp: None,
            now,
        }
    }

    pub fn with_last_sync(mut self, last_sync: Option<DateTime<Utc>>) -> Self {
        self.last_sync_timestamp = last_sync;
        self
    }
}

/// Output of a resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution<T> {
    pub resolved: T,
    pub strategy_used: ConflictStrategy,
    /// Human-readable diff entries, `path: local=<json> remote=<json>`
    pub conflicts: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConflictError {
    #[error("Serialization error: {0}")]
    Serialization(String),
}

// ============================================================================
// Resolver
// ============================================================================

/// Stateless resolver; only knows which field carries the timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictResolver {
    timestamp_field: String,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TIMESTAMP_FIELD)
    }
}

impl ConflictResolver {
    pub fn new(timestamp_field: impl Into<String>) -> Self {
        Self {
            timestamp_field: timestamp_field.into(),
        }
    }

    pub fn timestamp_field(&self) -> &str {
        &self.timestamp_field
    }

    /// Resolve a conflict between two JSON snapshots
    pub fn resolve(
        &self,
        data: &ConflictData<Value>,
        strategy: ConflictStrategy,
        policy: Option<&FieldPolicyTable>,
    ) -> ConflictResolution<Value> {
        let local = &data.local;
        let remote = &data.remote;
        let mut conflicts = self.diff(local, remote);

        let resolved = match strategy {
            ConflictStrategy::NewestWins => self.newest(local, remote).clone(),
            ConflictStrategy::LocalWins => local.clone(),
            ConflictStrategy::RemoteWins => remote.clone(),
            ConflictStrategy::Merge => {
                let default_policy = FieldPolicyTable::default();
                self.merge(local, remote, policy.unwrap_or(&default_policy))
            }
            ConflictStrategy::Manual => {
                if conflicts.is_empty() {
                    conflicts.push("$: flagged for manual resolution, local and remote are identical".to_string());
                }
                local.clone()
            }
        };

        ConflictResolution {
            resolved,
            strategy_used: strategy,
            conflicts,
        }
    }

    /// Resolve typed entities by way of their JSON form
    pub fn resolve_entity<T>(
        &self,
        data: &ConflictData<T>,
        strategy: ConflictStrategy,
        policy: Option<&FieldPolicyTable>,
    ) -> Result<ConflictResolution<T>, ConflictError>
    where
        T: Serialize + DeserializeOwned,
    {
        let json = ConflictData {
            local: to_json(&data.local)?,
            remote: to_json(&data.remote)?,
            last_sync_timestamp: data.last_sync_timestamp,
            now: data.now,
        };

        let resolution = self.resolve(&json, strategy, policy);
        let resolved = serde_json::from_value(resolution.resolved)
            .map_err(|e| ConflictError::Serialization(e.to_string()))?;

        Ok(ConflictResolution {
            resolved,
            strategy_used: resolution.strategy_used,
            conflicts: resolution.conflicts,
        })
    }

    /// Last-updated timestamp in epoch millis; missing or unparseable is 0
    pub fn timestamp_of(&self, entity: &Value) -> i64 {
        match entity.get(&self.timestamp_field) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.timestamp_millis())
                .or_else(|_| s.trim().parse::<i64>())
                .unwrap_or(0),
            _ => 0,
        }
    }

    fn newest<'a>(&self, local: &'a Value, remote: &'a Value) -> &'a Value {
        if self.timestamp_of(local) > self.timestamp_of(remote) {
            local
        } else {
            remote
        }
    }

    fn merge(&self, local: &Value, remote: &Value, policy: &FieldPolicyTable) -> Value {
        let (Value::Object(local_map), Value::Object(remote_map)) = (local, remote) else {
            // Nothing to merge field by field
            return self.newest(local, remote).clone();
        };

        let local_newer = self.timestamp_of(local) > self.timestamp_of(remote);
        let keys: BTreeSet<&String> = local_map.keys().chain(remote_map.keys()).collect();
        let mut merged = Map::new();

        for key in keys {
            if *key == self.timestamp_field {
                continue;
            }

            let value = match (local_map.get(key.as_str()), remote_map.get(key.as_str())) {
                (Some(l), None) => l.clone(),
                (None, Some(r)) => r.clone(),
                (Some(l), Some(r)) => match policy.policy_for(key) {
                    FieldPolicy::LocalWins => l.clone(),
                    FieldPolicy::RemoteWins => r.clone(),
                    FieldPolicy::NewestWins => pick(local_newer, l, r),
                    FieldPolicy::UnionArray => match (l, r) {
                        (Value::Array(l_items), Value::Array(r_items)) => {
                            Value::Array(union_array(r_items, l_items))
                        }
                        _ => pick(local_newer, l, r),
                    },
                },
                (None, None) => continue,
            };

            merged.insert(key.clone(), value);
        }

        // Timestamp is always max(local, remote) regardless of field outcomes
        let ts_field = self.timestamp_field.as_str();
        let newest_ts = match (local_map.get(ts_field), remote_map.get(ts_field)) {
            (Some(l), Some(r)) => Some(pick(local_newer, l, r)),
            (Some(l), None) => Some(l.clone()),
            (None, Some(r)) => Some(r.clone()),
            (None, None) => None,
        };
        if let Some(ts) = newest_ts {
            merged.insert(self.timestamp_field.clone(), ts);
        }

        Value::Object(merged)
    }

    /// Deep diff over the fields both sides share, minus the timestamp field.
    /// Arrays compare by position.
    pub fn diff(&self, local: &Value, remote: &Value) -> Vec<String> {
        let mut out = Vec::new();

        match (local, remote) {
            (Value::Object(l), Value::Object(r)) => {
                for key in sorted_shared_keys(l, r) {
                    if key == self.timestamp_field {
                        continue;
                    }
                    diff_values(key, &l[key], &r[key], &mut out);
                }
            }
            _ => diff_values("$", local, remote, &mut out),
        }

        out
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn pick(local_newer: bool, local: &Value, remote: &Value) -> Value {
    if local_newer {
        local.clone()
    } else {
        remote.clone()
    }
}

/// Remote entries first, then local ones not already present
fn union_array(remote: &[Value], local: &[Value]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(remote.len() + local.len());
    for item in remote.iter().chain(local.iter()) {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

fn sorted_shared_keys<'a>(l: &'a Map<String, Value>, r: &Map<String, Value>) -> Vec<&'a str> {
    let mut keys: Vec<&str> = l
        .keys()
        .filter(|k| r.contains_key(k.as_str()))
        .map(String::as_str)
        .collect();
    keys.sort_unstable();
    keys
}

fn diff_values(path: &str, local: &Value, remote: &Value, out: &mut Vec<String>) {
    if local == remote {
        return;
    }

    match (local, remote) {
        (Value::Object(l), Value::Object(r)) => {
            for key in sorted_shared_keys(l, r) {
                diff_values(&format!("{}.{}", path, key), &l[key], &r[key], out);
            }
        }
        (Value::Array(l), Value::Array(r)) if l.len() == r.len() => {
            for (i, (lv, rv)) in l.iter().zip(r.iter()).enumerate() {
                diff_values(&format!("{}[{}]", path, i), lv, rv, out);
            }
        }
        _ => out.push(format!("{}: local={} remote={}", path, local, remote)),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, ConflictError> {
    serde_json::to_value(value).map_err(|e| ConflictError::Serialization(e.to_string()))
}

// ============================================================================
// Tests
// ============================================================================
