//! Storage Backends
//!
//! Every tier is an implementation of [`StorageBackend`]. The engine ships
//! three:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────┬──────────────────────┐
//! │ MemoryBackend        │ SqliteBackend        │ SemanticBackend      │
//! │ bounded, in-process  │ durable, relational  │ vector similarity    │
//! │ LRU / LFU / FIFO     │ LZ4 above threshold  │ hashed term vectors  │
//! └──────────────────────┴──────────────────────┴──────────────────────┘
//! ```
//!
//! Anything else (a shared network store, for instance) plugs in by
//! implementing the trait and registering it in the hierarchy.

use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::item::{Item, Metadata};

pub mod compression;
mod memory;
mod policy;
mod semantic;
mod sqlite;

pub use compression::{CompressionAlgorithm, CompressionConfig, CompressionManager, Compressor};
pub use memory::{MemoryBackend, MemoryConfig};
pub use policy::{EvictionPolicy, EvictionPolicyKind, FifoPolicy, LfuPolicy, LruPolicy};
pub use semantic::{SemanticBackend, SemanticConfig};
pub use sqlite::{SqliteBackend, SqliteConfig};

/// Capability contract every tier implements
///
/// `get` returns the re-versioned item (one more access recorded); `peek`
/// reads without touching access bookkeeping.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend name for logs and errors
    fn name(&self) -> &str;

    /// Prepare the backend (create tables, open files)
    async fn initialize(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Item>>;

    /// Read without recording an access
    async fn peek(&self, key: &str) -> Result<Option<Item>> {
        self.get(key).await
    }

    /// Store an item, replacing any previous version
    async fn set(&self, item: Item) -> Result<()>;

    /// Store an item only if the key is not already resident; `true` if
    /// it was written
    ///
    /// The default checks then writes; backends that can make the two steps
    /// atomic override it.
    async fn set_if_absent(&self, item: Item) -> Result<bool> {
        if self.peek(item.key()).await?.is_some() {
            return Ok(false);
        }
        self.set(item).await?;
        Ok(true)
    }

    /// Remove a key; `true` if it was present
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove `item`'s key only while it still holds that version (see
    /// [`Item::same_version`]); `true` if it was removed
    async fn delete_version(&self, item: &Item) -> Result<bool> {
        match self.peek(item.key()).await? {
            Some(current) if current.same_version(item) => self.delete(item.key()).await,
            _ => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Fetch several keys; missing keys are absent from the map
    async fn get_batch(&self, keys: &[String]) -> Result<HashMap<String, Item>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(item) = self.get(key).await? {
                found.insert(key.clone(), item);
            }
        }
        Ok(found)
    }

    /// Store several items, one outcome per input in input order
    async fn set_batch(&self, items: Vec<Item>) -> Result<Vec<Result<()>>> {
        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            outcomes.push(self.set(item).await);
        }
        Ok(outcomes)
    }

    /// Matching items ordered by descending access count
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Item>>;

    /// Whether [`semantic_search`](Self::semantic_search) is supported
    fn supports_semantic(&self) -> bool {
        false
    }

    /// Items ranked by similarity to free text
    async fn semantic_search(&self, _query: &str, _limit: usize) -> Result<Vec<Item>> {
        Err(Error::Validation(format!(
            "backend {} does not support semantic search",
            self.name()
        )))
    }

    /// Up to `limit` resident, unexpired items
    async fn sample(&self, limit: usize) -> Result<Vec<Item>> {
        self.search(&SearchQuery::all(limit)).await
    }

    async fn stats(&self) -> Result<BackendStats>;

    /// Remove expired items; returns how many were removed
    async fn cleanup_expired(&self) -> Result<usize>;

    async fn close(&self) -> Result<()>;
}

// =============================================================================
// Search
// =============================================================================

/// Glob pattern over keys: `*` matches any run, `?` exactly one character
#[derive(Debug, Clone)]
pub struct KeyPattern {
    source: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for c in pattern.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr)
            .map_err(|e| Error::Validation(format!("invalid pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }
}

/// Key pattern + metadata equality filter + result bound
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub pattern: Option<KeyPattern>,
    pub metadata_filter: Option<Metadata>,
    pub limit: usize,
}

impl SearchQuery {
    /// Everything, up to `limit`
    pub fn all(limit: usize) -> Self {
        Self {
            pattern: None,
            metadata_filter: None,
            limit,
        }
    }

    pub fn with_pattern(mut self, pattern: KeyPattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn with_metadata_filter(mut self, filter: Metadata) -> Self {
        self.metadata_filter = Some(filter);
        self
    }

    /// Pattern and every filter entry must match
    pub fn matches(&self, item: &Item) -> bool {
        if let Some(pattern) = &self.pattern {
            if !pattern.matches(item.key()) {
                return false;
            }
        }
        if let Some(filter) = &self.metadata_filter {
            return filter
                .iter()
                .all(|(k, v)| item.metadata().get(k) == Some(v));
        }
        true
    }
}

/// Sort by descending access count (key ascending on ties) and truncate
pub(crate) fn rank_by_access(items: &mut Vec<Item>, limit: usize) {
    items.sort_by(|a, b| {
        b.access_count()
            .cmp(&a.access_count())
            .then_with(|| a.key().cmp(b.key()))
    });
    items.truncate(limit);
}

// =============================================================================
// Stats
// =============================================================================

/// Backend counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendStats {
    pub total_items: u64,
    pub total_size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expired: u64,
    pub max_items: Option<u64>,
    pub max_bytes: Option<u64>,
}

impl BackendStats {
    /// Hit ratio (0.0 - 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Byte utilization (0.0 - 1.0) for byte-bounded tiers
    pub fn utilization(&self) -> Option<f64> {
        self.max_bytes
            .filter(|max| *max > 0)
            .map(|max| self.total_size_bytes as f64 / max as f64)
    }
}

// =============================================================================
// Tests
// =============================================================================
