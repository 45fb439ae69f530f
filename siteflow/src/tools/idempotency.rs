//! Idempotency store for tool results.
//!
//! Successful results are cached under the invocation's idempotency key
//! together with its parameter hash. A repeated invocation with the same
//! key and hash is replayed instead of applied again.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::definitions::ToolResult;

/// A cached tool result with metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResult {
    /// The cached result.
    pub result: ToolResult,
    /// Hash of the parameters that produced it.
    pub params_hash: String,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// When the entry expires, if ever.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CachedResult {
    /// Creates a new entry.
    #[must_use]
    pub fn new(result: ToolResult, params_hash: impl Into<String>) -> Self {
        Self {
            result,
            params_hash: params_hash.into(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Sets a time to live.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(self.created_at + ttl);
        self
    }

    /// Returns true if the entry has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }
}

/// Outcome of an idempotency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyCheck {
    /// No entry for the key.
    Miss,
    /// An entry with matching parameters.
    Hit(ToolResult),
    /// An entry for the key with different parameters.
    ParamsChanged,
}

/// Storage backend for cached tool results.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Gets a live entry by key.
    async fn get(&self, key: &str) -> Option<CachedResult>;

    /// Stores an entry, replacing any previous one.
    async fn set(&self, key: &str, entry: CachedResult);

    /// Removes an entry.
    async fn delete(&self, key: &str);

    /// Removes every entry.
    async fn clear(&self);
}

/// In-memory idempotency store.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    entries: DashMap<String, CachedResult>,
}

impl InMemoryIdempotencyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Option<CachedResult> {
        let entry = self.entries.get(key).map(|e| e.value().clone())?;
        if entry.is_expired() {
            self.entries.remove(key);
            return None;
        }
        Some(entry)
    }

    async fn set(&self, key: &str, entry: CachedResult) {
        self.entries.insert(key.to_string(), entry);
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn clear(&self) {
        self.entries.clear();
    }
}

/// Looks up `key` and compares the stored parameter hash.
pub async fn check_idempotency(
    store: &dyn IdempotencyStore,
    key: &str,
    params_hash: &str,
) -> IdempotencyCheck {
    match store.get(key).await {
        None => IdempotencyCheck::Miss,
        Some(entry) if entry.params_hash == params_hash => IdempotencyCheck::Hit(entry.result),
        Some(_) => IdempotencyCheck::ParamsChanged,
    }
}

/// Generates an idempotency key from components.
#[must_use]
pub fn generate_idempotency_key(components: &[&str]) -> String {
    let combined = components.join(":");
    let digest = Sha256::digest(combined.as_bytes());
    format!("idem:{}", hex::encode(&digest[..16]))
}

/// Hashes parameters into a stable hex digest.
///
/// Object keys are serialized in sorted order, so the hash does not depend
/// on the order arguments were inserted.
#[must_use]
pub fn hash_parameters(params: &serde_json::Value) -> String {
    let json = serde_json::to_string(params).unwrap_or_default();
    hex::encode(Sha256::digest(json.as_bytes()))
}
