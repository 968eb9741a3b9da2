//! Bounded In-Process Backend
//!
//! Hot tier kept in a hash map guarded by a single mutex together with the
//! eviction bookkeeping, so the capacity check, the evictions and the insert
//! happen as one step.
//!
//! # Admission
//!
//! Before an insert the projected item count and byte size are compared with
//! the bounds. While either is exceeded the policy's candidate is evicted.
//! Admission fails with a capacity error when the policy has no candidate or
//! the candidate is the key being written.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use super::policy::{EvictionPolicy, EvictionPolicyKind};
use super::{rank_by_access, BackendStats, SearchQuery, StorageBackend};
use crate::error::{Error, Result};
use crate::item::Item;

/// Memory tier configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryConfig {
    /// Maximum resident items, `None` = unbounded
    pub max_items: Option<u64>,
    /// Maximum resident bytes, `None` = unbounded
    pub max_bytes: Option<u64>,
    /// Eviction strategy
    pub policy: EvictionPolicyKind,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_items: Some(10_000),
            max_bytes: Some(64 * 1024 * 1024),
            policy: EvictionPolicyKind::Lru,
        }
    }
}

impl MemoryConfig {
    pub fn unbounded() -> Self {
        Self {
            max_items: None,
            max_bytes: None,
            policy: EvictionPolicyKind::Lru,
        }
    }

    pub fn with_max_items(max_items: u64, policy: EvictionPolicyKind) -> Self {
        Self {
            max_items: Some(max_items),
            max_bytes: None,
            policy,
        }
    }
}

struct Inner {
    items: HashMap<String, Item>,
    policy: Box<dyn EvictionPolicy>,
    size_bytes: u64,
}

impl Inner {
    fn remove(&mut self, key: &str) -> Option<Item> {
        let removed = self.items.remove(key)?;
        self.size_bytes = self.size_bytes.saturating_sub(removed.size_bytes());
        self.policy.remove(key);
        Some(removed)
    }
}

/// Bounded in-process tier
pub struct MemoryBackend {
    name: String,
    config: MemoryConfig,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>, config: MemoryConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                items: HashMap::new(),
                policy: config.policy.build(),
                size_bytes: 0,
            }),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Number of resident items
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resident bytes
    pub fn size_bytes(&self) -> u64 {
        self.inner.lock().size_bytes
    }

    /// Whether a key is resident (expired or not), without side effects
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().items.contains_key(key)
    }

    fn capacity_error(&self, key: &str, reason: impl Into<String>) -> Error {
        Error::Capacity {
            tier: self.name.clone(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    fn over_bounds(&self, items: u64, bytes: u64) -> bool {
        self.config.max_items.map_or(false, |max| items > max)
            || self.config.max_bytes.map_or(false, |max| bytes > max)
    }

    /// Admit one item, evicting as needed
    fn admit(&self, item: Item) -> Result<()> {
        self.admit_when(item, |_| true).map(|_| ())
    }

    /// Admit one item if `allow` accepts the resident entry for its key;
    /// `false` if it was refused
    fn admit_when(&self, item: Item, allow: impl FnOnce(Option<&Item>) -> bool) -> Result<bool> {
        let key = item.key().to_string();
        let size = item.size_bytes();

        if let Some(max) = self.config.max_bytes {
            if size > max {
                return Err(self.capacity_error(
                    &key,
                    format!("item is {} bytes, tier holds at most {}", size, max),
                ));
            }
        }

        let now = Utc::now();
        let mut inner = self.inner.lock();
        let resident = inner.items.get(&key).filter(|old| !old.is_expired_at(now));
        if !allow(resident) {
            return Ok(false);
        }
        let old_size = inner.items.get(&key).map(|old| old.size_bytes());
        let added_items = if old_size.is_some() { 0 } else { 1 };

        loop {
            let projected_items = inner.items.len() as u64 + added_items;
            let projected_bytes = inner.size_bytes - old_size.unwrap_or(0) + size;
            if !self.over_bounds(projected_items, projected_bytes) {
                break;
            }

            match inner.policy.get_eviction_candidate() {
                None => return Err(self.capacity_error(&key, "no eviction candidate")),
                Some(candidate) if candidate == key => {
                    return Err(self.capacity_error(&key, "eviction candidate is the incoming key"));
                }
                Some(candidate) => {
                    inner.remove(&candidate);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(tier = %self.name, key = %candidate, policy = inner.policy.name(), "evicted");
                }
            }
        }

        inner.size_bytes = inner.size_bytes - old_size.unwrap_or(0) + size;
        inner.items.insert(key.clone(), item);
        inner.policy.on_insert(&key);
        drop(inner);

        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn lookup(&self, key: &str, touch: bool) -> Option<Item> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let current = match inner.items.get(key) {
            Some(item) => item.clone(),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if current.is_expired_at(now) {
            inner.remove(key);
            self.expired.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        if !touch {
            return Some(current);
        }

        let touched = current.touched_at(now);
        inner.items.insert(key.to_string(), touched.clone());
        inner.policy.on_access(key);
        Some(touched)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Item>> {
        Ok(self.lookup(key, true))
    }

    async fn peek(&self, key: &str) -> Result<Option<Item>> {
        Ok(self.lookup(key, false))
    }

    async fn set(&self, item: Item) -> Result<()> {
        self.admit(item)
    }

    async fn set_if_absent(&self, item: Item) -> Result<bool> {
        self.admit_when(item, |resident| resident.is_none())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.inner.lock().remove(key).is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    async fn delete_version(&self, item: &Item) -> Result<bool> {
        let mut inner = self.inner.lock();
        let matches = inner
            .items
            .get(item.key())
            .map_or(false, |current| current.same_version(item));
        if !matches {
            return Ok(false);
        }
        inner.remove(item.key());
        drop(inner);
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = Utc::now();
        Ok(self
            .inner
            .lock()
            .items
            .get(key)
            .map_or(false, |item| !item.is_expired_at(now)))
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Item>> {
        let now = Utc::now();
        let mut matches: Vec<Item> = {
            let inner = self.inner.lock();
            inner
                .items
                .values()
                .filter(|item| !item.is_expired_at(now) && query.matches(item))
                .cloned()
                .collect()
        };
        rank_by_access(&mut matches, query.limit);
        Ok(matches)
    }

    async fn sample(&self, limit: usize) -> Result<Vec<Item>> {
        let now = Utc::now();
        let inner = self.inner.lock();
        Ok(inner
            .items
            .values()
            .filter(|item| !item.is_expired_at(now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<BackendStats> {
        let (total_items, total_size_bytes) = {
            let inner = self.inner.lock();
            (inner.items.len() as u64, inner.size_bytes)
        };
        Ok(BackendStats {
            total_items,
            total_size_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            max_items: self.config.max_items,
            max_bytes: self.config.max_bytes,
        })
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .items
            .values()
            .filter(|item| item.is_expired_at(now))
            .map(|item| item.key().to_string())
            .collect();

        for key in &expired {
            inner.remove(key);
        }
        drop(inner);

        self.expired.fetch_add(expired.len() as u64, Ordering::Relaxed);
        Ok(expired.len())
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.policy = self.config.policy.build();
        inner.size_bytes = 0;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
