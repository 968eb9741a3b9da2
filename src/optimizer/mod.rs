//! Placement optimizer
//!
//! Tracks per-key access history and co-access transitions, and decides when
//! an item should move between tiers:
//!
//! - promotion through a ladder of recency/frequency rules, one rung per tier
//! - demotion after tier-specific idle periods
//! - prefetch candidates from observed key-to-key transitions
//!
//! An optional [`TierScorer`] can override the ladder for keys with enough
//! history.

mod pattern;
mod prefetch;
mod scorer;

pub use pattern::AccessPattern;
pub use prefetch::PrefetchCandidate;
pub use scorer::{PromotionRule, RuleLadderScorer, ScoringContext, TierScorer};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::OptimizerConfig;
use crate::item::Item;
use crate::tier::{TierHierarchy, TierId};
use prefetch::CoAccessTracker;

/// Optimizer bookkeeping sizes
#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizerStats {
    pub tracked_keys: usize,
    pub co_access_keys: usize,
    pub tier_count: usize,
    pub scorer: String,
}

pub struct Optimizer {
    config: OptimizerConfig,
    ladder: RuleLadderScorer,
    scorer: Option<Arc<dyn TierScorer>>,
    patterns: DashMap<String, AccessPattern>,
    co_access: Mutex<CoAccessTracker>,
    hierarchy: RwLock<Option<TierHierarchy>>,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        let co_access = CoAccessTracker::new(
            Duration::from_secs(config.co_access_window_secs),
            config.co_access_depth,
        );
        Self {
            ladder: RuleLadderScorer::from_config(&config),
            scorer: None,
            patterns: DashMap::new(),
            co_access: Mutex::new(co_access),
            hierarchy: RwLock::new(None),
            config,
        }
    }

    /// Consult `scorer` for keys with at least `min_scorer_samples` accesses
    pub fn with_scorer(mut self, scorer: Arc<dyn TierScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Bind the optimizer to the tier layout it reasons about
    pub fn initialize(&self, hierarchy: &TierHierarchy) {
        info!(
            tiers = hierarchy.len(),
            scorer = self.scorer_name(),
            "Optimizer initialized"
        );
        *self.hierarchy.write() = Some(hierarchy.clone());
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    fn tier_count(&self) -> usize {
        self.hierarchy.read().as_ref().map_or(0, |h| h.len())
    }

    fn scorer_name(&self) -> &str {
        self.scorer
            .as_deref()
            .map_or_else(|| self.ladder.name(), |s| s.name())
    }

    // =========================================================================
    // Access tracking
    // =========================================================================

    pub fn record_access(&self, key: &str, size_bytes: u64) {
        self.record_access_at(key, size_bytes, Utc::now());
    }

    pub fn record_access_at(&self, key: &str, size_bytes: u64, at: DateTime<Utc>) {
        self.patterns
            .entry(key.to_string())
            .or_insert_with(|| AccessPattern::new(self.config.history_size, at))
            .record(at, size_bytes);
        self.co_access.lock().record(key, at);
    }

    pub fn pattern(&self, key: &str) -> Option<AccessPattern> {
        self.patterns.get(key).map(|p| p.value().clone())
    }

    /// Drop all history for a deleted key
    pub fn forget(&self, key: &str) {
        self.patterns.remove(key);
        self.co_access.lock().forget(key);
    }

    /// Drop history of keys idle longer than the retention period
    pub fn prune_idle(&self, now: DateTime<Utc>) -> usize {
        let retention = Duration::from_secs(self.config.pattern_retention_secs);
        let stale: Vec<String> = self
            .patterns
            .iter()
            .filter(|entry| entry.idle(now).map_or(true, |idle| idle > retention))
            .map(|entry| entry.key().clone())
            .collect();

        for key in &stale {
            self.forget(key);
        }
        if !stale.is_empty() {
            debug!(pruned = stale.len(), "Pruned idle access patterns");
        }
        stale.len()
    }

    // =========================================================================
    // Placement decisions
    // =========================================================================

    fn with_context<T>(
        &self,
        item: &Item,
        now: DateTime<Utc>,
        f: impl FnOnce(&ScoringContext<'_>) -> T,
    ) -> T {
        let tier_count = self.tier_count();
        let pattern = self.patterns.get(item.key());
        let ctx = ScoringContext {
            item,
            pattern: pattern.as_deref(),
            tier_count,
            now,
        };
        f(&ctx)
    }

    /// Recommendation from the pluggable scorer, once it has enough samples
    fn scored(&self, ctx: &ScoringContext<'_>) -> Option<TierId> {
        let scorer = self.scorer.as_ref()?;
        if ctx.total_accesses() < self.config.min_scorer_samples || ctx.tier_count == 0 {
            return None;
        }
        scorer
            .recommend(ctx)
            .map(|tier| TierId::new(tier.index().min(ctx.tier_count - 1)))
    }

    pub fn should_promote(&self, item: &Item) -> Option<TierId> {
        self.should_promote_at(item, Utc::now())
    }

    /// Faster tier the item should move to, if any
    pub fn should_promote_at(&self, item: &Item, now: DateTime<Utc>) -> Option<TierId> {
        self.with_context(item, now, |ctx| {
            if self.scorer.is_some() && ctx.total_accesses() >= self.config.min_scorer_samples {
                let current = ctx.current_tier();
                return self.scored(ctx).filter(|tier| *tier < current);
            }
            self.ladder.promote(ctx)
        })
    }

    pub fn should_demote(&self, item: &Item) -> Option<TierId> {
        self.should_demote_at(item, Utc::now())
    }

    /// Slower tier the item should move to, if any
    pub fn should_demote_at(&self, item: &Item, now: DateTime<Utc>) -> Option<TierId> {
        self.with_context(item, now, |ctx| {
            if self.scorer.is_some() && ctx.total_accesses() >= self.config.min_scorer_samples {
                let current = ctx.current_tier();
                return self.scored(ctx).filter(|tier| *tier > current);
            }
            self.ladder.demote(ctx)
        })
    }

    pub fn recommended_tier(&self, item: &Item) -> TierId {
        self.recommended_tier_at(item, Utc::now())
    }

    pub fn recommended_tier_at(&self, item: &Item, now: DateTime<Utc>) -> TierId {
        self.with_context(item, now, |ctx| {
            self.scored(ctx)
                .or_else(|| self.ladder.recommend(ctx))
                .unwrap_or_else(|| ctx.current_tier())
        })
    }

    // =========================================================================
    // Prediction
    // =========================================================================

    /// Keys likely to be accessed right after `key`
    pub fn get_prefetch_candidates(&self, key: &str) -> Vec<PrefetchCandidate> {
        self.co_access.lock().candidates(
            key,
            self.config.prefetch_threshold,
            self.config.prefetch_max_candidates,
        )
    }

    pub fn access_probability(&self, key: &str) -> f64 {
        self.access_probability_at(key, Utc::now())
    }

    /// Likelihood in `[0, 1]` that `key` is accessed soon
    ///
    /// The larger of its own recent access rate, saturating at
    /// `prediction_saturation` accesses per prediction window, and the
    /// strongest co-access prediction from recently accessed keys.
    pub fn access_probability_at(&self, key: &str, now: DateTime<Utc>) -> f64 {
        let window = Duration::from_secs(self.config.prediction_window_secs);
        let saturation = self.config.prediction_saturation.max(1) as f64;

        let frequency = self
            .patterns
            .get(key)
            .map(|p| (p.accesses_within(window, now) as f64 / saturation).min(1.0))
            .unwrap_or(0.0);
        let co_access = self.co_access.lock().incoming_probability(key, now);

        frequency.max(co_access)
    }

    pub fn stats(&self) -> OptimizerStats {
        OptimizerStats {
            tracked_keys: self.patterns.len(),
            co_access_keys: self.co_access.lock().tracked_keys(),
            tier_count: self.tier_count(),
            scorer: self.scorer_name().to_string(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBackend, MemoryConfig, StorageBackend};
    use crate::tier::{LatencyClass, TierDescriptor};
    use serde_json::json;

    fn hierarchy(n: usize) -> TierHierarchy {
        let latencies = [
            LatencyClass::Memory,
            LatencyClass::Local,
            LatencyClass::Network,
            LatencyClass::Remote,
        ];
        let tiers = (0..n)
            .map(|i| {
                let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new(
                    format!("t{i}"),
                    MemoryConfig::unbounded(),
                ));
                (TierDescriptor::new(format!("t{i}"), latencies[i]), backend)
            })
            .collect();
        TierHierarchy::new(tiers).unwrap()
    }

    fn optimizer(tiers: usize) -> Optimizer {
        let optimizer = Optimizer::new(OptimizerConfig::default());
        optimizer.initialize(&hierarchy(tiers));
        optimizer
    }

    fn item_in(key: &str, tier: usize) -> Item {
        Item::new(key, json!("v")).unwrap().placed_in(TierId::new(tier))
    }

    struct AlwaysFastest;

    impl TierScorer for AlwaysFastest {
        fn name(&self) -> &str {
            "always-fastest"
        }

        fn recommend(&self, _ctx: &ScoringContext<'_>) -> Option<TierId> {
            Some(TierId::new(0))
        }
    }

    #[test]
    fn test_burst_on_slowest_tier_promotes() {
        let optimizer = optimizer(3);
        let item = item_in("burst", 2);
        let start = Utc::now();
        for i in 0..50 {
            let at = start + chrono::Duration::milliseconds(i * 20);
            optimizer.record_access_at("burst", 10, at);
        }

        let now = start + chrono::Duration::seconds(1);
        assert_eq!(optimizer.should_promote_at(&item, now), Some(TierId::new(1)));
        assert_eq!(optimizer.recommended_tier_at(&item, now), TierId::new(1));
    }

    #[test]
    fn test_unaccessed_item_is_not_promoted() {
        let optimizer = optimizer(3);
        let item = item_in("cold", 2);
        assert_eq!(optimizer.should_promote(&item), None);
        assert_eq!(optimizer.recommended_tier(&item), TierId::new(2));
    }

    #[test]
    fn test_idle_item_demotes_to_next_slower_tier() {
        let optimizer = optimizer(3);
        let created = Utc::now() - chrono::Duration::hours(2);
        let item = item_in("idle", 0).created(created);

        assert_eq!(optimizer.should_demote(&item), Some(TierId::new(1)));
        assert_eq!(optimizer.should_promote(&item), None);
    }

    #[test]
    fn test_recent_access_prevents_demotion() {
        let optimizer = optimizer(3);
        let created = Utc::now() - chrono::Duration::hours(2);
        let item = item_in("busy", 0).created(created);
        optimizer.record_access("busy", 1);

        assert_eq!(optimizer.should_demote(&item), None);
    }

    #[test]
    fn test_slowest_tier_never_demotes() {
        let optimizer = optimizer(3);
        let item = item_in("old", 2).created(Utc::now() - chrono::Duration::days(365));
        assert_eq!(optimizer.should_demote(&item), None);
    }

    #[test]
    fn test_uninitialized_optimizer_makes_no_moves() {
        let optimizer = Optimizer::new(OptimizerConfig::default());
        let item = item_in("k", 1).created(Utc::now() - chrono::Duration::days(365));
        assert_eq!(optimizer.should_demote(&item), None);
        assert_eq!(optimizer.should_promote(&item), None);
    }

    #[test]
    fn test_custom_scorer_needs_enough_samples() {
        let optimizer = Optimizer::new(OptimizerConfig {
            min_scorer_samples: 5,
            ..OptimizerConfig::default()
        })
        .with_scorer(Arc::new(AlwaysFastest));
        optimizer.initialize(&hierarchy(3));
        let item = item_in("k", 2);

        optimizer.record_access("k", 1);
        assert_eq!(optimizer.should_promote(&item), None);

        for _ in 0..4 {
            optimizer.record_access("k", 1);
        }
        assert_eq!(optimizer.should_promote(&item), Some(TierId::new(0)));
        assert_eq!(optimizer.should_demote(&item), None);
        assert_eq!(optimizer.stats().scorer, "always-fastest");
    }

    #[test]
    fn test_prefetch_candidates_follow_co_access() {
        let optimizer = optimizer(2);
        let start = Utc::now();
        for round in 0..4 {
            let at = start + chrono::Duration::seconds(round * 600);
            optimizer.record_access_at("user:1", 1, at);
            optimizer.record_access_at("profile:1", 1, at + chrono::Duration::seconds(1));
        }

        let candidates = optimizer.get_prefetch_candidates("user:1");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].key, "profile:1");
        assert!(optimizer.get_prefetch_candidates("unknown").is_empty());
    }

    #[test]
    fn test_access_probability_saturates() {
        let optimizer = optimizer(2);
        let now = Utc::now();
        assert_eq!(optimizer.access_probability_at("k", now), 0.0);

        for _ in 0..5 {
            optimizer.record_access_at("k", 1, now);
        }
        assert!((optimizer.access_probability_at("k", now) - 0.5).abs() < 1e-9);

        for _ in 0..20 {
            optimizer.record_access_at("k", 1, now);
        }
        assert_eq!(optimizer.access_probability_at("k", now), 1.0);
    }

    #[test]
    fn test_forget_and_prune() {
        let optimizer = optimizer(2);
        let now = Utc::now();
        optimizer.record_access_at("old", 1, now - chrono::Duration::days(2));
        optimizer.record_access_at("new", 1, now);
        optimizer.record_access_at("gone", 1, now);

        optimizer.forget("gone");
        assert!(optimizer.pattern("gone").is_none());

        assert_eq!(optimizer.prune_idle(now), 1);
        assert!(optimizer.pattern("old").is_none());
        assert!(optimizer.pattern("new").is_some());
        assert_eq!(optimizer.stats().tracked_keys, 1);
    }
}
