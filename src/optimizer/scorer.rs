//! Tier scoring strategies
//!
//! A [`TierScorer`] maps an item and its access history to the tier it
//! should live in. [`RuleLadderScorer`] is the deterministic default; any
//! other implementation (a learned model, for instance) can be swapped in
//! through the manager builder.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::pattern::AccessPattern;
use crate::config::{OptimizerConfig, PromotionRuleConfig};
use crate::item::Item;
use crate::tier::TierId;

/// Everything a scorer may look at
#[derive(Debug, Clone, Copy)]
pub struct ScoringContext<'a> {
    pub item: &'a Item,
    pub pattern: Option<&'a AccessPattern>,
    pub tier_count: usize,
    pub now: DateTime<Utc>,
}

impl<'a> ScoringContext<'a> {
    pub fn current_tier(&self) -> TierId {
        self.item.tier()
    }

    /// Accesses known for the key, from the pattern or the stored count
    pub fn total_accesses(&self) -> u64 {
        self.pattern
            .map(|p| p.total_accesses())
            .unwrap_or(0)
            .max(self.item.access_count())
    }

    /// Time since the most recent access seen by either source
    pub fn idle(&self) -> Duration {
        let stored = self.item.accessed_at();
        let last = self
            .pattern
            .and_then(|p| p.last_access())
            .map_or(stored, |observed| observed.max(stored));
        (self.now - last).to_std().unwrap_or_default()
    }

    /// Accesses within `window`
    ///
    /// Without a pattern the stored count is used when the last access falls
    /// inside the window.
    pub fn accesses_within(&self, window: Duration) -> u64 {
        match self.pattern {
            Some(pattern) => pattern.accesses_within(window, self.now),
            None if self.idle() <= window => self.item.access_count(),
            None => 0,
        }
    }
}

/// Placement strategy
pub trait TierScorer: Send + Sync {
    fn name(&self) -> &str;

    /// Tier the item should live in, `None` for no opinion
    fn recommend(&self, ctx: &ScoringContext<'_>) -> Option<TierId>;
}

// =============================================================================
// Rule ladder
// =============================================================================

/// One promotion rung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotionRule {
    pub max_idle: Duration,
    pub window: Duration,
    pub min_accesses: u64,
}

impl From<&PromotionRuleConfig> for PromotionRule {
    fn from(config: &PromotionRuleConfig) -> Self {
        Self {
            max_idle: Duration::from_secs(config.max_idle_secs),
            window: Duration::from_secs(config.window_secs),
            min_accesses: config.min_accesses,
        }
    }
}

/// Default deterministic scorer
///
/// Promotion rungs are indexed by distance from the slowest tier, so rungs
/// closer to the fastest tier demand more recent and more frequent access.
/// Demotion thresholds are indexed by tier from the fastest downwards and
/// grow as tiers get slower. Missing rungs repeat the last one.
#[derive(Debug, Clone)]
pub struct RuleLadderScorer {
    promotion: Vec<PromotionRule>,
    demotion: Vec<Duration>,
}

impl RuleLadderScorer {
    pub fn new(promotion: Vec<PromotionRule>, demotion: Vec<Duration>) -> Self {
        Self {
            promotion,
            demotion,
        }
    }

    pub fn from_config(config: &OptimizerConfig) -> Self {
        Self::new(
            config.promotion_rules.iter().map(PromotionRule::from).collect(),
            config
                .demotion_idle_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        )
    }

    /// Rung used to leave `tier`
    pub fn promotion_rule(&self, tier: TierId, tier_count: usize) -> Option<PromotionRule> {
        let level = tier_count.checked_sub(1)?.checked_sub(tier.index())?;
        self.promotion
            .get(level)
            .or_else(|| self.promotion.last())
            .copied()
    }

    /// Idle time after which `tier` hands the item down
    pub fn demotion_threshold(&self, tier: TierId) -> Option<Duration> {
        self.demotion
            .get(tier.index())
            .or_else(|| self.demotion.last())
            .copied()
    }

    /// One tier faster, when the rung for the current tier is satisfied
    pub fn promote(&self, ctx: &ScoringContext<'_>) -> Option<TierId> {
        let current = ctx.current_tier();
        if current.index() == 0 || current.index() >= ctx.tier_count {
            return None;
        }
        let rule = self.promotion_rule(current, ctx.tier_count)?;

        let recent = ctx.idle() < rule.max_idle;
        let frequent = ctx.accesses_within(rule.window) > rule.min_accesses;
        (recent && frequent).then(|| TierId::new(current.index() - 1))
    }

    /// One tier slower, when the item has been idle past the threshold
    pub fn demote(&self, ctx: &ScoringContext<'_>) -> Option<TierId> {
        let current = ctx.current_tier();
        if current.index() + 1 >= ctx.tier_count {
            return None;
        }
        let threshold = self.demotion_threshold(current)?;
        (ctx.idle() > threshold).then(|| TierId::new(current.index() + 1))
    }
}

impl TierScorer for RuleLadderScorer {
    fn name(&self) -> &str {
        "rule-ladder"
    }

    fn recommend(&self, ctx: &ScoringContext<'_>) -> Option<TierId> {
        self.promote(ctx)
            .or_else(|| self.demote(ctx))
            .or(Some(ctx.current_tier()))
    }
}

// =============================================================================
// Tests
// =============================================================================
