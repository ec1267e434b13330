//! Key-value store contract and in-memory implementation
//!
//! The relay treats durable storage as an opaque asynchronous KV store with
//! TTL support. Implement `KvStore` to plug in a backend.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::StorageError;

/// Abstract asynchronous key-value store.
///
/// Assumed eventually consistent across replicas; at least read-your-writes
/// per key within one process.
#[async_trait]
pub trait KvStore: Send + Sync + Clone + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a value, optionally expiring the whole key after `ttl`
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List keys under a prefix, lexicographically ordered
    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StorageError>;

    /// Backend name (for logging)
    fn name(&self) -> &'static str;
}

/// In-memory KV store with lazy TTL expiry.
///
/// Suitable for tests and single-process deployments. Not suitable for
/// multi-instance deployments.
#[derive(Clone, Default)]
pub struct MemoryKv {
    entries: Arc<DashMap<String, MemoryEntry>>,
}

#[derive(Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.entries.get(key) {
            Some(entry) if entry.expired() => {
                drop(entry);
                self.entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().expired())
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
