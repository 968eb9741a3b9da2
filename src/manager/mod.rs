//! Tier Manager
//!
//! Public facade over the tier hierarchy. Reads walk the tiers from fastest
//! to slowest and return the first hit; writes land in one tier chosen by
//! hint or payload size and invalidate every other copy.
//!
//! ```text
//!   get ──► T0 ──miss──► T1 ──miss──► T2 ──miss──► None
//!            │            │            │
//!           hit          hit          hit ──► optimizer ──► promotion task
//!                                                  └──────► prefetch queue
//! ```
//!
//! Promotion, prefetch and the periodic loops run as background tasks outside
//! the admission semaphore and never block a caller.

mod batch;
mod tasks;

pub use batch::{Operation, OperationResult, ResultStatus};

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{EngineConfig, TierConfig, TierKind};
use crate::error::{Error, Result};
use crate::item::{validate_key, Item, Metadata};
use crate::metrics::{MetricsCollector, MetricsSnapshot, MigrationReason, OperationKind};
use crate::optimizer::{Optimizer, OptimizerStats, TierScorer};
use crate::storage::{
    rank_by_access, BackendStats, CompressionConfig, KeyPattern, MemoryBackend, MemoryConfig,
    SearchQuery, SemanticBackend, SemanticConfig, SqliteBackend, SqliteConfig, StorageBackend,
};
use crate::tier::{LatencyClass, Tier, TierDescriptor, TierHierarchy, TierId};

const DEFAULT_SEARCH_LIMIT: usize = 100;

// =============================================================================
// Requests
// =============================================================================

/// Optional parameters of a write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    /// Lifetime in seconds from creation; falls back to the engine default
    pub ttl: Option<u64>,
    /// Write to this tier instead of the size-based choice
    pub tier: Option<TierId>,
    pub metadata: Option<Metadata>,
}

impl SetOptions {
    pub fn ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    pub fn tier(mut self, tier: TierId) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Search across tiers
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    /// Glob over keys (`*`, `?`)
    pub pattern: Option<String>,
    /// Every entry must equal the item's metadata value
    pub metadata_filter: Option<Metadata>,
    /// Free-text query, routed to semantic tiers only
    pub semantic_query: Option<String>,
    pub limit: usize,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            pattern: None,
            metadata_filter: None,
            semantic_query: None,
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

impl SearchRequest {
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            ..Self::default()
        }
    }

    pub fn semantic(query: impl Into<String>) -> Self {
        Self {
            semantic_query: Some(query.into()),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata_filter
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn to_query(&self) -> Result<SearchQuery> {
        let mut query = SearchQuery::all(self.limit);
        if let Some(pattern) = &self.pattern {
            query = query.with_pattern(KeyPattern::new(pattern)?);
        }
        if let Some(filter) = &self.metadata_filter {
            query = query.with_metadata_filter(filter.clone());
        }
        Ok(query)
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Outcome of one optimization pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptimizeReport {
    pub examined: usize,
    pub promoted: usize,
    pub demoted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub id: TierId,
    pub name: String,
    pub latency: LatencyClass,
    #[serde(flatten)]
    pub backend: BackendStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub tiers: Vec<TierStats>,
    pub optimizer: OptimizerStats,
    pub migrations_in_flight: usize,
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`Manager`] from arbitrary backends
///
/// ```ignore
/// let manager = ManagerBuilder::new()
///     .tier(TierDescriptor::new("hot", LatencyClass::Memory), hot)
///     .tier(TierDescriptor::new("shared", LatencyClass::Network), shared)
///     .build()
///     .await?;
/// ```
pub struct ManagerBuilder {
    config: EngineConfig,
    tiers: Vec<(TierDescriptor, Arc<dyn StorageBackend>)>,
    scorer: Option<Arc<dyn TierScorer>>,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            tiers: Vec::new(),
            scorer: None,
        }
    }

    /// Engine settings; its tier list is ignored by the builder
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tier(mut self, descriptor: TierDescriptor, backend: Arc<dyn StorageBackend>) -> Self {
        self.tiers.push((descriptor, backend));
        self
    }

    pub fn scorer(mut self, scorer: Arc<dyn TierScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub async fn build(self) -> Result<Manager> {
        self.config.validate_settings()?;
        let hierarchy = TierHierarchy::new(self.tiers)?;

        let initialized = join_all(hierarchy.tiers().iter().map(|t| t.backend().initialize())).await;
        for (tier, result) in hierarchy.tiers().iter().zip(initialized) {
            result.map_err(|e| {
                Error::Config(format!("tier {} failed to initialize: {}", tier.name(), e))
            })?;
        }

        let mut optimizer = Optimizer::new(self.config.optimizer.clone());
        if let Some(scorer) = self.scorer {
            optimizer = optimizer.with_scorer(scorer);
        }
        optimizer.initialize(&hierarchy);

        let metrics = MetricsCollector::new(self.config.metrics.clone())?;
        let (prefetch_tx, prefetch_rx) = mpsc::channel(self.config.engine.prefetch_queue_size);

        let inner = Arc::new(ManagerInner {
            admission: Semaphore::new(self.config.engine.max_concurrency),
            hierarchy,
            optimizer,
            metrics,
            config: self.config,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            prefetch_tx,
            in_flight: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let manager = Manager { inner };
        manager.start_background(prefetch_rx);

        info!(
            tiers = ?manager.inner.hierarchy.tiers().iter().map(|t| t.name()).collect::<Vec<_>>(),
            max_concurrency = manager.inner.config.engine.max_concurrency,
            "Tier manager started"
        );
        Ok(manager)
    }
}

/// Backend and descriptor for one configured tier
pub fn build_tier(config: &TierConfig) -> Result<(TierDescriptor, Arc<dyn StorageBackend>)> {
    let mut descriptor = TierDescriptor::new(&config.name, config.latency_class());

    let backend: Arc<dyn StorageBackend> = match config.kind {
        TierKind::Memory => {
            if config.max_items.is_some() || config.max_bytes.is_some() {
                descriptor =
                    descriptor.with_bounds(config.max_items, config.max_bytes, config.eviction_policy);
            }
            Arc::new(MemoryBackend::new(
                &config.name,
                MemoryConfig {
                    max_items: config.max_items,
                    max_bytes: config.max_bytes,
                    policy: config.eviction_policy,
                },
            ))
        }
        TierKind::Sqlite => {
            let path = config.path.as_deref().unwrap_or_default();
            let mut sqlite = if path.starts_with("sqlite:") {
                SqliteConfig {
                    url: path.to_string(),
                    ..SqliteConfig::in_memory()
                }
            } else {
                SqliteConfig::file(path)
            };
            if let Some(max) = config.max_connections {
                sqlite.max_connections = max;
            }
            if let Some(threshold) = config.compression_threshold_bytes {
                sqlite.compression = CompressionConfig {
                    threshold_bytes: threshold,
                    ..CompressionConfig::default()
                };
            }
            if !sqlite.url.contains(":memory:") {
                descriptor = descriptor.persistent();
            }
            Arc::new(SqliteBackend::new(&config.name, sqlite)?)
        }
        TierKind::Semantic => {
            let defaults = SemanticConfig::default();
            Arc::new(SemanticBackend::new(
                &config.name,
                SemanticConfig {
                    min_similarity: config.min_similarity.unwrap_or(defaults.min_similarity),
                    ..defaults
                },
            ))
        }
    };

    Ok((descriptor, backend))
}

// =============================================================================
// Manager
// =============================================================================

pub(crate) struct ManagerInner {
    hierarchy: TierHierarchy,
    optimizer: Optimizer,
    metrics: MetricsCollector,
    config: EngineConfig,
    admission: Semaphore,
    shutdown: CancellationToken,
    closed: AtomicBool,
    prefetch_tx: mpsc::Sender<String>,
    in_flight: DashMap<String, ()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to the engine; clones share state
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").finish_non_exhaustive()
    }
}

impl Manager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    /// Build every enabled tier from configuration
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let mut builder = ManagerBuilder::new().config(config.clone());
        for tier in config.enabled_tiers() {
            let (descriptor, backend) = build_tier(tier)?;
            builder = builder.tier(descriptor, backend);
        }
        builder.build().await
    }

    pub fn hierarchy(&self) -> &TierHierarchy {
        &self.inner.hierarchy
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.inner.optimizer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Wait for a foreground slot
    async fn admit(&self) -> Result<SemaphorePermit<'_>> {
        self.ensure_open()?;
        self.inner
            .admission
            .acquire()
            .await
            .map_err(|_| Error::Closed)
    }

    // =========================================================================
    // Backend calls
    // =========================================================================

    /// Run one backend call under the operation timeout, retrying once after
    /// the backoff when the failure is retryable
    async fn call<T, F, Fut>(&self, tier: &Tier, operation: &'static str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn StorageBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.attempt(tier, operation, &f).await {
            Err(e) if e.is_retryable() => {
                debug!(tier = %tier.name(), operation, error = %e, "Retrying backend call");
                tokio::time::sleep(self.inner.config.engine.retry_backoff()).await;
                self.attempt(tier, operation, &f).await
            }
            other => other,
        }
    }

    async fn attempt<T, F, Fut>(&self, tier: &Tier, operation: &'static str, f: &F) -> Result<T>
    where
        F: Fn(Arc<dyn StorageBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = self.inner.config.engine.operation_timeout();
        match tokio::time::timeout(deadline, f(Arc::clone(tier.backend()))).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: format!("{}.{}", tier.name(), operation),
                duration: deadline,
            }),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Value stored under `key`
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.get_item(key).await?.map(Item::into_value))
    }

    /// Value stored under `key`, or `default` on a miss
    pub async fn get_or(&self, key: &str, default: Value) -> Result<Value> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    /// Full item, with its tier and access bookkeeping
    pub async fn get_item(&self, key: &str) -> Result<Option<Item>> {
        let _permit = self.admit().await?;
        self.lookup(key).await
    }

    async fn lookup(&self, key: &str) -> Result<Option<Item>> {
        let start = Instant::now();
        let result = self.find(key).await;
        match &result {
            Ok(found) => self
                .inner
                .metrics
                .record_get(found.as_ref().map(Item::tier), start.elapsed()),
            Err(e) => self
                .inner
                .metrics
                .record_error(OperationKind::Get, e, start.elapsed()),
        }
        result
    }

    async fn find(&self, key: &str) -> Result<Option<Item>> {
        validate_key(key)?;

        let mut failure = None;
        for tier in self.inner.hierarchy.tiers() {
            match self.call(tier, "get", |b| async move { b.get(key).await }).await {
                Ok(Some(item)) => {
                    let item = item.placed_in(tier.id());
                    self.on_hit(&item);
                    return Ok(Some(item));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, tier = %tier.name(), error = %e, "Tier read failed");
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Access bookkeeping after a read hit
    fn on_hit(&self, item: &Item) {
        let optimizer = &self.inner.optimizer;
        optimizer.record_access(item.key(), item.size_bytes());

        if let Some(target) = optimizer.should_promote(item) {
            self.spawn_migration(item.key(), item.tier(), target, MigrationReason::Promotion);
        }

        for candidate in optimizer.get_prefetch_candidates(item.key()) {
            if let Err(e) = self.inner.prefetch_tx.try_send(candidate.key) {
                debug!(key = %item.key(), error = %e, "Prefetch queue full, dropping candidate");
                break;
            }
        }
    }

    /// Whether any tier holds an unexpired copy
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let _permit = self.admit().await?;
        validate_key(key)?;
        let start = Instant::now();

        let mut failure = None;
        for tier in self.inner.hierarchy.tiers() {
            match self.call(tier, "exists", |b| async move { b.exists(key).await }).await {
                Ok(true) => {
                    self.inner
                        .metrics
                        .record_operation(OperationKind::Exists, start.elapsed());
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => {
                self.inner
                    .metrics
                    .record_error(OperationKind::Exists, &e, start.elapsed());
                Err(e)
            }
            None => {
                self.inner
                    .metrics
                    .record_operation(OperationKind::Exists, start.elapsed());
                Ok(false)
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.set_with(key, value, SetOptions::default()).await
    }

    /// Store `value`, returning once one tier holds it
    pub async fn set_with(&self, key: &str, value: Value, options: SetOptions) -> Result<()> {
        let _permit = self.admit().await?;
        self.store(key, value, options).await.map(|_| ())
    }

    async fn store(&self, key: &str, value: Value, options: SetOptions) -> Result<TierId> {
        let start = Instant::now();
        let result = match self.prepare(key, value, &options) {
            Ok(item) => self.write(item, options.tier).await,
            Err(e) => Err(e),
        };
        match &result {
            Ok(_) => self
                .inner
                .metrics
                .record_operation(OperationKind::Set, start.elapsed()),
            Err(e) => self
                .inner
                .metrics
                .record_error(OperationKind::Set, e, start.elapsed()),
        }
        result
    }

    fn prepare(&self, key: &str, value: Value, options: &SetOptions) -> Result<Item> {
        let ttl = options.ttl.or(self.inner.config.engine.default_ttl_secs);
        if ttl == Some(0) {
            return Err(Error::Validation("ttl must be positive".into()));
        }
        if let Some(hint) = options.tier {
            self.inner.hierarchy.tier(hint)?;
        }

        let mut item = Item::new(key, value)?.with_ttl(ttl);
        if let Some(metadata) = &options.metadata {
            item = item.with_metadata(metadata.clone());
        }
        Ok(item)
    }

    /// Tiers to try for an unhinted write, preferred first
    ///
    /// The fastest tier of a multi-tier hierarchy is left to promotion and
    /// prefetch. Among the rest, small payloads go to the fastest, large ones
    /// to the slowest and the remainder to the middle, falling back towards
    /// slower tiers.
    pub fn placement_order(&self, size_bytes: u64) -> Vec<TierId> {
        let tiers = self.inner.hierarchy.tiers();
        let eligible = if tiers.len() > 1 { &tiers[1..] } else { tiers };
        let pool: Vec<&Tier> = eligible
            .iter()
            .filter(|t| t.descriptor().can_hold(size_bytes))
            .collect();
        if pool.is_empty() {
            return vec![self.inner.hierarchy.slowest().id()];
        }

        let placement = &self.inner.config.placement;
        let primary = if size_bytes <= placement.small_item_bytes {
            0
        } else if size_bytes > placement.large_item_bytes {
            pool.len() - 1
        } else {
            pool.len() / 2
        };
        pool[primary..].iter().map(|t| t.id()).collect()
    }

    /// Write `item` into a hinted tier or along the placement order
    async fn write(&self, item: Item, hint: Option<TierId>) -> Result<TierId> {
        match hint {
            Some(tier) => self.write_ordered(item, vec![tier], true).await,
            None => {
                let order = self.placement_order(item.size_bytes());
                self.write_ordered(item, order, false).await
            }
        }
    }

    /// Try each tier of `order` in turn; only an unpinned write moves on
    /// after a capacity refusal
    async fn write_ordered(&self, item: Item, order: Vec<TierId>, pinned: bool) -> Result<TierId> {
        let mut refused = None;
        for tier_id in order {
            let tier = self.inner.hierarchy.tier(tier_id)?;
            let placed = item.placed_in(tier_id);
            let written = self
                .call(tier, "set", |b| {
                    let placed = placed.clone();
                    async move { b.set(placed).await }
                })
                .await;

            match written {
                Ok(()) => {
                    self.invalidate_except(item.key(), tier_id).await;
                    self.write_through(&placed).await;
                    return Ok(tier_id);
                }
                Err(e @ Error::Capacity { .. }) if !pinned => {
                    debug!(key = %item.key(), tier = %tier.name(), error = %e, "Tier refused write, trying slower tier");
                    refused = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(refused.unwrap_or_else(|| {
            Error::Internal(format!("no tier accepted key {}", item.key()))
        }))
    }

    /// Drop stale copies of `key` from every tier but `keep`
    async fn invalidate_except(&self, key: &str, keep: TierId) {
        let deletes = self
            .inner
            .hierarchy
            .tiers()
            .iter()
            .filter(|t| t.id() != keep)
            .map(|tier| async move {
                let result = self.call(tier, "delete", |b| async move { b.delete(key).await }).await;
                (tier, result)
            });

        for (tier, result) in join_all(deletes).await {
            if let Err(e) = result {
                warn!(key = %key, tier = %tier.name(), error = %e, "Failed to invalidate stale copy");
            }
        }
    }

    /// Copy a freshly written item into the fastest tier when it is likely to
    /// be read soon
    async fn write_through(&self, item: &Item) {
        let hierarchy = &self.inner.hierarchy;
        let fastest = hierarchy.fastest();
        if hierarchy.is_fastest(item.tier()) || !fastest.descriptor().can_hold(item.size_bytes()) {
            return;
        }

        let probability = self.inner.optimizer.access_probability(item.key());
        if probability < self.inner.config.optimizer.write_through_threshold {
            return;
        }

        let start = Instant::now();
        let copy = item.placed_in(fastest.id());
        let result = self
            .call(fastest, "set", |b| {
                let copy = copy.clone();
                async move { b.set(copy).await }
            })
            .await;

        match result {
            Ok(()) => {
                debug!(key = %item.key(), probability, "Write-through into fastest tier");
                self.inner.metrics.record_migration(
                    item.tier(),
                    fastest.id(),
                    MigrationReason::WriteThrough,
                    start.elapsed(),
                );
            }
            Err(e) => warn!(key = %item.key(), error = %e, "Write-through failed"),
        }
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Remove `key` from every tier; `true` if any tier held it
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let _permit = self.admit().await?;
        self.remove(key).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let start = Instant::now();
        let result = self.remove_everywhere(key).await;
        match &result {
            Ok(_) => self
                .inner
                .metrics
                .record_operation(OperationKind::Delete, start.elapsed()),
            Err(e) => self
                .inner
                .metrics
                .record_error(OperationKind::Delete, e, start.elapsed()),
        }
        result
    }

    async fn remove_everywhere(&self, key: &str) -> Result<bool> {
        validate_key(key)?;

        let deletes = self.inner.hierarchy.tiers().iter().map(|tier| async move {
            self.call(tier, "delete", |b| async move { b.delete(key).await })
                .await
        });
        let results = join_all(deletes).await;
        self.inner.optimizer.forget(key);

        let mut removed = false;
        let mut failure = None;
        for result in results {
            match result {
                Ok(hit) => removed |= hit,
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Merge matches from every tier, one entry per key
    ///
    /// Key/metadata searches are ranked by access count; semantic searches
    /// keep similarity order.
    pub async fn search(&self, request: SearchRequest) -> Result<Vec<Item>> {
        let _permit = self.admit().await?;
        let start = Instant::now();
        let result = self.search_tiers(&request).await;
        match &result {
            Ok(_) => self
                .inner
                .metrics
                .record_operation(OperationKind::Search, start.elapsed()),
            Err(e) => self
                .inner
                .metrics
                .record_error(OperationKind::Search, e, start.elapsed()),
        }
        result
    }

    async fn search_tiers(&self, request: &SearchRequest) -> Result<Vec<Item>> {
        let query = request.to_query()?;
        if request.limit == 0 {
            return Ok(Vec::new());
        }

        let hierarchy = &self.inner.hierarchy;
        let results: Vec<(&Tier, Result<Vec<Item>>)> = match &request.semantic_query {
            Some(text) => {
                let text = text.as_str();
                let limit = request.limit;
                join_all(hierarchy.semantic_tiers().map(|tier| async move {
                    let result = self
                        .call(tier, "semantic_search", |b| async move {
                            b.semantic_search(text, limit).await
                        })
                        .await;
                    (tier, result)
                }))
                .await
            }
            None => {
                let query = &query;
                join_all(hierarchy.tiers().iter().map(|tier| async move {
                    let result = self
                        .call(tier, "search", |b| async move { b.search(query).await })
                        .await;
                    (tier, result)
                }))
                .await
            }
        };

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for (tier, result) in results {
            match result {
                Ok(items) => {
                    for item in items {
                        if query.matches(&item) && seen.insert(item.key().to_string()) {
                            merged.push(item.placed_in(tier.id()));
                        }
                    }
                }
                Err(e) => warn!(tier = %tier.name(), error = %e, "Tier search failed"),
            }
        }

        if request.semantic_query.is_some() {
            merged.truncate(request.limit);
        } else {
            rank_by_access(&mut merged, request.limit);
        }
        Ok(merged)
    }

    // =========================================================================
    // Migration
    // =========================================================================

    /// Move `key` in the background unless a move is already running
    fn spawn_migration(&self, key: &str, from: TierId, to: TierId, reason: MigrationReason) {
        if self.inner.in_flight.insert(key.to_string(), ()).is_some() {
            return;
        }
        let manager = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = manager.migrate(&key, from, to, reason).await {
                warn!(key = %key, from = %from, to = %to, reason = %reason, error = %e, "Migration failed");
            }
            manager.inner.in_flight.remove(&key);
        });
    }

    /// Copy into `to`, then retire the copy in `from`, then record the move
    ///
    /// The move only completes while `from` still holds the version that was
    /// read. A write that lands in either tier meanwhile wins: the copy is
    /// withdrawn and nothing is recorded. A failure after the copy leaves the
    /// item in both tiers.
    async fn migrate(
        &self,
        key: &str,
        from: TierId,
        to: TierId,
        reason: MigrationReason,
    ) -> Result<bool> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(false);
        }
        let start = Instant::now();
        let source = self.inner.hierarchy.tier(from)?;
        let destination = self.inner.hierarchy.tier(to)?;

        let peeked = self
            .call(source, "peek", |b| async move { b.peek(key).await })
            .await?;
        let Some(item) = peeked else {
            return Ok(false);
        };

        let moved = item.placed_in(to);
        let inserted = self
            .call(destination, "set_if_absent", |b| {
                let moved = moved.clone();
                async move { b.set_if_absent(moved).await }
            })
            .await?;
        if !inserted {
            let resident = self
                .call(destination, "peek", |b| async move { b.peek(key).await })
                .await?;
            if !resident.map_or(false, |current| current.same_version(&item)) {
                debug!(key = %key, to = %destination.name(), "Destination holds another version, migration skipped");
                return Ok(false);
            }
        }

        let read = &item;
        let retired = self
            .call(source, "delete_version", |b| async move { b.delete_version(read).await })
            .await?;
        if !retired {
            if inserted {
                let copy = &moved;
                self.call(destination, "delete_version", |b| async move {
                    b.delete_version(copy).await
                })
                .await?;
            }
            debug!(key = %key, from = %source.name(), "Source changed during migration, copy withdrawn");
            return Ok(false);
        }

        self.inner
            .metrics
            .record_migration(from, to, reason, start.elapsed());
        debug!(key = %key, from = %source.name(), to = %destination.name(), reason = %reason, "Migrated item");
        Ok(true)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Sample the bounded middle tiers and move items whose recommended tier
    /// differs
    ///
    /// The fastest tier is kept in shape by its eviction policy and the
    /// slowest has nowhere to demote to.
    #[instrument(skip(self))]
    pub async fn optimize(&self) -> Result<OptimizeReport> {
        self.ensure_open()?;
        let sample_size = self.inner.config.optimizer.sample_size;
        let mut report = OptimizeReport::default();
        let mut moved = HashSet::new();

        for tier in self.inner.hierarchy.tiers() {
            let hierarchy = &self.inner.hierarchy;
            if !tier.is_bounded() || hierarchy.is_fastest(tier.id()) || hierarchy.is_slowest(tier.id()) {
                continue;
            }

            let sampled = self
                .call(tier, "sample", |b| async move { b.sample(sample_size).await })
                .await;
            let items = match sampled {
                Ok(items) => items,
                Err(e) => {
                    warn!(tier = %tier.name(), error = %e, "Failed to sample tier");
                    report.failed += 1;
                    continue;
                }
            };

            for item in items {
                report.examined += 1;
                let item = item.placed_in(tier.id());
                let target = self.inner.optimizer.recommended_tier(&item);
                if target == tier.id() || moved.contains(item.key()) {
                    continue;
                }
                if self.inner.in_flight.insert(item.key().to_string(), ()).is_some() {
                    continue;
                }

                let reason = if target < tier.id() {
                    MigrationReason::Promotion
                } else {
                    MigrationReason::Demotion
                };
                match self.migrate(item.key(), tier.id(), target, reason).await {
                    Ok(true) => {
                        moved.insert(item.key().to_string());
                        if reason == MigrationReason::Promotion {
                            report.promoted += 1;
                        } else {
                            report.demoted += 1;
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(key = %item.key(), error = %e, "Migration failed");
                        report.failed += 1;
                    }
                }
                self.inner.in_flight.remove(item.key());
            }
        }

        if report.promoted + report.demoted + report.failed > 0 {
            info!(
                examined = report.examined,
                promoted = report.promoted,
                demoted = report.demoted,
                failed = report.failed,
                "Optimization pass complete"
            );
        }
        Ok(report)
    }

    /// Sweep expired items from every tier and prune stale access history
    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<usize> {
        self.ensure_open()?;

        let sweeps = self.inner.hierarchy.tiers().iter().map(|tier| async move {
            let result = self
                .call(tier, "cleanup_expired", |b| async move { b.cleanup_expired().await })
                .await;
            (tier, result)
        });

        let mut removed = 0;
        for (tier, result) in join_all(sweeps).await {
            match result {
                Ok(count) => removed += count,
                Err(e) => warn!(tier = %tier.name(), error = %e, "Expiry sweep failed"),
            }
        }
        let pruned = self.inner.optimizer.prune_idle(chrono::Utc::now());

        if removed > 0 || pruned > 0 {
            info!(removed, pruned, "Cleanup complete");
        }
        Ok(removed)
    }

    /// Stop background work and close every backend
    ///
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Closing tier manager");
        self.inner.shutdown.cancel();
        self.inner.admission.close();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let closes = self
            .inner
            .hierarchy
            .tiers()
            .iter()
            .map(|tier| async move { (tier, tier.backend().close().await) });
        let mut failure = None;
        for (tier, result) in join_all(closes).await {
            if let Err(e) = result {
                warn!(tier = %tier.name(), error = %e, "Failed to close backend");
                failure.get_or_insert(e);
            }
        }

        info!("Tier manager closed");
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Observability
    // =========================================================================

    pub async fn stats(&self) -> Result<ManagerStats> {
        self.ensure_open()?;
        let mut tiers = Vec::with_capacity(self.inner.hierarchy.len());
        for tier in self.inner.hierarchy.tiers() {
            let backend = self.call(tier, "stats", |b| async move { b.stats().await }).await?;
            tiers.push(TierStats {
                id: tier.id(),
                name: tier.name().to_string(),
                latency: tier.descriptor().latency,
                backend,
            });
        }
        Ok(ManagerStats {
            tiers,
            optimizer: self.inner.optimizer.stats(),
            migrations_in_flight: self.inner.in_flight.len(),
        })
    }

    /// Pull-style metrics snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn export_prometheus(&self) -> Result<String> {
        self.inner.metrics.export_prometheus()
    }
}

// =============================================================================
// Tests
// =============================================================================
