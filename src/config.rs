//! Engine Configuration
//!
//! YAML-backed settings with defaults for every section. [`EngineConfig::validate`]
//! runs before any backend is touched.
//!
//! ```yaml
//! engine:
//!   max_concurrency: 64
//! tiers:
//!   - name: hot
//!     kind: memory
//!     max_items: 10000
//!     eviction_policy: lru
//!   - name: durable
//!     kind: sqlite
//!     latency: local
//!     path: "sqlite:///var/lib/tiermem/items.db"
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::EvictionPolicyKind;
use crate::tier::LatencyClass;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub engine: RuntimeConfig,
    pub tiers: Vec<TierConfig>,
    pub placement: PlacementConfig,
    pub optimizer: OptimizerConfig,
    pub metrics: MetricsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine: RuntimeConfig::default(),
            tiers: vec![
                TierConfig::memory("hot", 10_000, 64 * 1024 * 1024),
                TierConfig::memory("warm", 100_000, 512 * 1024 * 1024),
                TierConfig::sqlite("durable", "sqlite::memory:"),
            ],
            placement: PlacementConfig::default(),
            optimizer: OptimizerConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Tiers with `enabled: true`
    pub fn enabled_tiers(&self) -> impl Iterator<Item = &TierConfig> {
        self.tiers.iter().filter(|t| t.enabled)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.validate_settings()?;

        if self.enabled_tiers().next().is_none() {
            return Err(Error::Config("at least one tier must be enabled".into()));
        }
        let mut names = HashSet::new();
        for tier in &self.tiers {
            if !names.insert(tier.name.as_str()) {
                return Err(Error::Config(format!("duplicate tier name: {}", tier.name)));
            }
            tier.validate()?;
        }
        Ok(())
    }

    /// Validate everything except the tier list, for hierarchies assembled
    /// from externally built backends
    pub fn validate_settings(&self) -> Result<()> {
        self.engine.validate()?;
        self.placement.validate()?;
        self.optimizer.validate()?;
        self.metrics.validate()?;
        Ok(())
    }
}

fn check_probability(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        return Err(Error::Config(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

fn check_positive(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(Error::Config(format!("{} must be positive", name)));
    }
    Ok(())
}

// =============================================================================
// Runtime
// =============================================================================

/// Admission gate, deadlines and retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Concurrent foreground operations
    pub max_concurrency: usize,
    /// Deadline for one backend call
    pub operation_timeout_ms: u64,
    /// Pause before the single retry of a retryable failure
    pub retry_backoff_ms: u64,
    /// TTL applied when a write does not carry one
    pub default_ttl_secs: Option<u64>,
    /// Bound of the prefetch queue
    pub prefetch_queue_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 64,
            operation_timeout_ms: 5_000,
            retry_backoff_ms: 50,
            default_ttl_secs: None,
            prefetch_queue_size: 256,
        }
    }
}

impl RuntimeConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    fn validate(&self) -> Result<()> {
        check_positive("engine.max_concurrency", self.max_concurrency as u64)?;
        check_positive("engine.operation_timeout_ms", self.operation_timeout_ms)?;
        check_positive("engine.prefetch_queue_size", self.prefetch_queue_size as u64)?;
        if let Some(ttl) = self.default_ttl_secs {
            check_positive("engine.default_ttl_secs", ttl)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tiers
// =============================================================================

/// Which bundled backend implements a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Memory,
    Sqlite,
    Semantic,
}

impl TierKind {
    fn default_latency(self) -> LatencyClass {
        match self {
            TierKind::Memory => LatencyClass::Memory,
            TierKind::Sqlite => LatencyClass::Local,
            TierKind::Semantic => LatencyClass::Remote,
        }
    }
}

/// One tier of the hierarchy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierConfig {
    pub name: String,
    pub kind: TierKind,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Defaults to the kind's natural latency class
    #[serde(default)]
    pub latency: Option<LatencyClass>,
    #[serde(default)]
    pub max_items: Option<u64>,
    #[serde(default)]
    pub max_bytes: Option<u64>,
    #[serde(default)]
    pub eviction_policy: EvictionPolicyKind,
    /// SQLite connection URL or file path
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub compression_threshold_bytes: Option<u64>,
    #[serde(default)]
    pub min_similarity: Option<f32>,
}

fn enabled_by_default() -> bool {
    true
}

impl TierConfig {
    fn base(name: &str, kind: TierKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            enabled: true,
            latency: None,
            max_items: None,
            max_bytes: None,
            eviction_policy: EvictionPolicyKind::Lru,
            path: None,
            max_connections: None,
            compression_threshold_bytes: None,
            min_similarity: None,
        }
    }

    /// Bounded in-process tier
    pub fn memory(name: &str, max_items: u64, max_bytes: u64) -> Self {
        Self {
            max_items: Some(max_items),
            max_bytes: Some(max_bytes),
            ..Self::base(name, TierKind::Memory)
        }
    }

    /// Durable SQLite tier
    pub fn sqlite(name: &str, path: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            ..Self::base(name, TierKind::Sqlite)
        }
    }

    /// Semantic tier
    pub fn semantic(name: &str) -> Self {
        Self::base(name, TierKind::Semantic)
    }

    pub fn latency_class(&self) -> LatencyClass {
        self.latency.unwrap_or_else(|| self.kind.default_latency())
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("tier name must not be empty".into()));
        }
        let field = |f: &str| format!("tiers.{}.{}", self.name, f);
        if let Some(max) = self.max_items {
            check_positive(&field("max_items"), max)?;
        }
        if let Some(max) = self.max_bytes {
            check_positive(&field("max_bytes"), max)?;
        }
        if let Some(max) = self.max_connections {
            check_positive(&field("max_connections"), max as u64)?;
        }
        if let Some(similarity) = self.min_similarity {
            check_probability(&field("min_similarity"), similarity as f64)?;
        }
        if self.kind == TierKind::Sqlite && self.path.as_deref().map_or(true, str::is_empty) {
            return Err(Error::Config(format!("{} is required", field("path"))));
        }
        Ok(())
    }
}

// =============================================================================
// Placement
// =============================================================================

/// Size thresholds of the unhinted placement heuristic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlacementConfig {
    /// Payloads up to this size go to the fastest placement tier
    pub small_item_bytes: u64,
    /// Payloads above this size go to the slowest tier
    pub large_item_bytes: u64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            small_item_bytes: 1024,
            large_item_bytes: 64 * 1024,
        }
    }
}

impl PlacementConfig {
    fn validate(&self) -> Result<()> {
        if self.small_item_bytes > self.large_item_bytes {
            return Err(Error::Config(format!(
                "placement.small_item_bytes ({}) exceeds placement.large_item_bytes ({})",
                self.small_item_bytes, self.large_item_bytes
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Optimizer
// =============================================================================

/// One rung of the promotion ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromotionRuleConfig {
    /// The last access must be more recent than this
    pub max_idle_secs: u64,
    /// Window over which accesses are counted
    pub window_secs: u64,
    /// Accesses in the window must exceed this
    pub min_accesses: u64,
}

/// Promotion/demotion thresholds, prefetch and loop intervals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    /// Promotion rules from the slowest tier upwards; the last rule repeats
    pub promotion_rules: Vec<PromotionRuleConfig>,
    /// Idle time before demotion, from the fastest tier downwards; the last value repeats
    pub demotion_idle_secs: Vec<u64>,
    /// Access timestamps kept per key
    pub history_size: usize,
    /// Two accesses closer than this count as a co-access
    pub co_access_window_secs: u64,
    /// How many preceding keys each access is paired with
    pub co_access_depth: usize,
    /// Minimum transition probability for a prefetch candidate
    pub prefetch_threshold: f64,
    pub prefetch_max_candidates: usize,
    /// Predicted access probability that triggers write-through acceleration
    pub write_through_threshold: f64,
    pub prediction_window_secs: u64,
    /// Recent accesses that count as certainty
    pub prediction_saturation: u64,
    /// Items inspected per tier by one optimize pass
    pub sample_size: usize,
    /// Accesses a key needs before a custom scorer is consulted
    pub min_scorer_samples: u64,
    /// Patterns untouched this long are dropped during cleanup
    pub pattern_retention_secs: u64,
    pub optimize_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Start the maintenance loops with the engine
    pub background_enabled: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            promotion_rules: vec![
                PromotionRuleConfig {
                    max_idle_secs: 3600,
                    window_secs: 3600,
                    min_accesses: 10,
                },
                PromotionRuleConfig {
                    max_idle_secs: 300,
                    window_secs: 900,
                    min_accesses: 5,
                },
                PromotionRuleConfig {
                    max_idle_secs: 60,
                    window_secs: 300,
                    min_accesses: 5,
                },
            ],
            demotion_idle_secs: vec![3600, 6 * 3600, 24 * 3600, 7 * 24 * 3600],
            history_size: 64,
            co_access_window_secs: 60,
            co_access_depth: 4,
            prefetch_threshold: 0.3,
            prefetch_max_candidates: 3,
            write_through_threshold: 0.7,
            prediction_window_secs: 300,
            prediction_saturation: 10,
            sample_size: 100,
            min_scorer_samples: 20,
            pattern_retention_secs: 24 * 3600,
            optimize_interval_secs: 300,
            cleanup_interval_secs: 60,
            background_enabled: true,
        }
    }
}

impl OptimizerConfig {
    pub fn optimize_interval(&self) -> Duration {
        Duration::from_secs(self.optimize_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.promotion_rules.is_empty() {
            return Err(Error::Config("optimizer.promotion_rules must not be empty".into()));
        }
        for (i, rule) in self.promotion_rules.iter().enumerate() {
            check_positive(&format!("optimizer.promotion_rules[{}].window_secs", i), rule.window_secs)?;
            check_positive(&format!("optimizer.promotion_rules[{}].max_idle_secs", i), rule.max_idle_secs)?;
        }
        if self.demotion_idle_secs.is_empty() {
            return Err(Error::Config("optimizer.demotion_idle_secs must not be empty".into()));
        }
        for (i, idle) in self.demotion_idle_secs.iter().enumerate() {
            check_positive(&format!("optimizer.demotion_idle_secs[{}]", i), *idle)?;
        }
        check_positive("optimizer.history_size", self.history_size as u64)?;
        check_positive("optimizer.sample_size", self.sample_size as u64)?;
        check_positive("optimizer.prediction_saturation", self.prediction_saturation)?;
        check_positive("optimizer.optimize_interval_secs", self.optimize_interval_secs)?;
        check_positive("optimizer.cleanup_interval_secs", self.cleanup_interval_secs)?;
        check_probability("optimizer.prefetch_threshold", self.prefetch_threshold)?;
        check_probability("optimizer.write_through_threshold", self.write_through_threshold)?;
        Ok(())
    }
}

// =============================================================================
// Metrics
// =============================================================================

/// Alert thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertConfig {
    /// Rolling error rate (0.0 - 1.0) over the shortest window
    pub error_rate_threshold: f64,
    /// A single operation slower than this raises the latency alert
    pub latency_threshold_ms: u64,
    /// An alert clears after this long without a retrigger
    pub quiet_period_secs: u64,
    /// Operations required in the window before the error rate is judged
    pub min_operations: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            error_rate_threshold: 0.05,
            latency_threshold_ms: 1_000,
            quiet_period_secs: 300,
            min_operations: 20,
        }
    }
}

/// Sliding windows, sampling and flush cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Fraction of access events recorded
    pub sampling_rate: f64,
    pub windows_secs: Vec<u64>,
    pub flush_interval_secs: u64,
    pub alerts: AlertConfig,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sampling_rate: 1.0,
            windows_secs: vec![60, 300, 900, 3600],
            flush_interval_secs: 60,
            alerts: AlertConfig::default(),
        }
    }
}

impl MetricsConfig {
    pub fn windows(&self) -> Vec<Duration> {
        self.windows_secs.iter().map(|s| Duration::from_secs(*s)).collect()
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        check_probability("metrics.sampling_rate", self.sampling_rate)?;
        check_probability("metrics.alerts.error_rate_threshold", self.alerts.error_rate_threshold)?;
        if self.windows_secs.is_empty() {
            return Err(Error::Config("metrics.windows_secs must not be empty".into()));
        }
        for window in &self.windows_secs {
            check_positive("metrics.windows_secs", *window)?;
        }
        check_positive("metrics.flush_interval_secs", self.flush_interval_secs)?;
        check_positive("metrics.alerts.quiet_period_secs", self.alerts.quiet_period_secs)?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
engine:
  max_concurrency: 8
  default_ttl_secs: 3600
tiers:
  - name: hot
    kind: memory
    max_items: 100
    eviction_policy: lfu
  - name: durable
    kind: sqlite
    path: "sqlite::memory:"
    compression_threshold_bytes: 2048
  - name: recall
    kind: semantic
    min_similarity: 0.2
    enabled: false
optimizer:
  prefetch_threshold: 0.5
metrics:
  sampling_rate: 0.25
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.engine.max_concurrency, 8);
        assert_eq!(config.engine.default_ttl_secs, Some(3600));
        assert_eq!(config.tiers.len(), 3);
        assert_eq!(config.tiers[0].eviction_policy, EvictionPolicyKind::Lfu);
        assert_eq!(config.tiers[1].latency_class(), LatencyClass::Local);
        assert_eq!(config.enabled_tiers().count(), 2);
        assert_eq!(config.optimizer.prefetch_threshold, 0.5);
        assert_eq!(config.optimizer.sample_size, 100);
        assert_eq!(config.metrics.sampling_rate, 0.25);
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let yaml = r#"
tiers:
  - name: hot
    kind: memory
    eviction_policy: random
"#;
        assert_matches!(EngineConfig::from_yaml(yaml), Err(Error::ConfigParse(_)));
    }

    #[test]
    fn test_non_positive_capacity_rejected() {
        let mut config = EngineConfig::default();
        config.tiers[0].max_items = Some(0);
        assert_matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("max_items"));

        let mut config = EngineConfig::default();
        config.tiers[1].max_bytes = Some(0);
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let mut config = EngineConfig::default();
        config.engine.max_concurrency = 0;
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_out_of_range_probabilities_rejected() {
        let mut config = EngineConfig::default();
        config.optimizer.prefetch_threshold = 1.5;
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let mut config = EngineConfig::default();
        config.optimizer.write_through_threshold = -0.1;
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let mut config = EngineConfig::default();
        config.metrics.sampling_rate = f64::NAN;
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let mut config = EngineConfig::default();
        config.metrics.alerts.error_rate_threshold = 2.0;
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_tier_set_rejections() {
        let mut config = EngineConfig::default();
        config.tiers.iter_mut().for_each(|t| t.enabled = false);
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let mut config = EngineConfig::default();
        config.tiers[1].name = "hot".into();
        assert_matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("duplicate"));

        let mut config = EngineConfig::default();
        config.tiers[2].path = None;
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_placement_thresholds_ordered() {
        let mut config = EngineConfig::default();
        config.placement.small_item_bytes = 10_000;
        config.placement.large_item_bytes = 100;
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "engine:\n  max_concurency: 4\n";
        assert_matches!(EngineConfig::from_yaml(yaml), Err(Error::ConfigParse(_)));
    }

    #[test]
    fn test_load_missing_file() {
        assert_matches!(
            EngineConfig::load("/nonexistent/tiermem.yaml"),
            Err(Error::Config(_))
        );
    }
}
