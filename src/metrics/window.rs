//! Sliding time-window aggregation

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::tier::TierId;

/// Foreground operation kinds tracked for latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Get,
    Set,
    Delete,
    Exists,
    Search,
    Batch,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Get => "get",
            OperationKind::Set => "set",
            OperationKind::Delete => "delete",
            OperationKind::Exists => "exists",
            OperationKind::Search => "search",
            OperationKind::Batch => "batch",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an item changed tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationReason {
    Promotion,
    Demotion,
    Prefetch,
    WriteThrough,
}

impl MigrationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationReason::Promotion => "promotion",
            MigrationReason::Demotion => "demotion",
            MigrationReason::Prefetch => "prefetch",
            MigrationReason::WriteThrough => "write_through",
        }
    }
}

impl fmt::Display for MigrationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Read served by a tier
    Hit(TierId),
    /// Read found nothing
    Miss,
    Success,
    Failure,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure)
    }
}

/// One recorded event
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    Operation {
        kind: OperationKind,
        outcome: Outcome,
        latency: Duration,
    },
    Migration {
        from: TierId,
        to: TierId,
        reason: MigrationReason,
        latency: Duration,
    },
}

impl MetricEvent {
    fn is_operation(&self) -> bool {
        matches!(self, MetricEvent::Operation { .. })
    }

    fn is_failure(&self) -> bool {
        matches!(self, MetricEvent::Operation { outcome, .. } if outcome.is_failure())
    }
}

// =============================================================================
// Aggregates
// =============================================================================

/// Nearest-rank latency percentiles, in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencySummary {
    /// Summarize `samples`; sorts in place
    pub fn from_samples(samples: &mut [Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();
        let total: Duration = samples.iter().sum();

        Self {
            count: samples.len() as u64,
            mean_ms: millis(total) / samples.len() as f64,
            p50_ms: millis(nearest_rank(samples, 50.0)),
            p90_ms: millis(nearest_rank(samples, 90.0)),
            p95_ms: millis(nearest_rank(samples, 95.0)),
            p99_ms: millis(nearest_rank(samples, 99.0)),
            max_ms: millis(samples[samples.len() - 1]),
        }
    }
}

/// Value at rank `ceil(p/100 * n)` of a sorted, non-empty slice
pub fn nearest_rank(sorted: &[Duration], percentile: f64) -> Duration {
    let n = sorted.len();
    let rank = ((percentile / 100.0) * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Aggregate view of one window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub window_secs: u64,
    pub operations: u64,
    pub errors: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Share of reads served by each tier
    pub tier_hit_rates: BTreeMap<String, f64>,
    pub latency: BTreeMap<String, LatencySummary>,
    /// Counts keyed `"from->to"`
    pub migrations: BTreeMap<String, u64>,
    pub migrations_by_reason: BTreeMap<String, u64>,
}

// =============================================================================
// Aggregator
// =============================================================================

/// Events within a fixed trailing window
#[derive(Debug)]
pub struct TimeWindowAggregator {
    span: Duration,
    events: VecDeque<(Instant, MetricEvent)>,
    operations: u64,
    errors: u64,
}

impl TimeWindowAggregator {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            events: VecDeque::new(),
            operations: 0,
            errors: 0,
        }
    }

    pub fn span(&self) -> Duration {
        self.span
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Append an event, dropping everything older than the window
    pub fn push(&mut self, at: Instant, event: MetricEvent) {
        self.prune(at);
        if event.is_operation() {
            self.operations += 1;
        }
        if event.is_failure() {
            self.errors += 1;
        }
        self.events.push_back((at, event));
    }

    pub fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.span) else {
            return;
        };
        while let Some((at, _)) = self.events.front() {
            if *at >= cutoff {
                break;
            }
            if let Some((_, event)) = self.events.pop_front() {
                if event.is_operation() {
                    self.operations -= 1;
                }
                if event.is_failure() {
                    self.errors -= 1;
                }
            }
        }
    }

    /// Operations and failures currently in the window
    pub fn operation_counts(&self) -> (u64, u64) {
        (self.operations, self.errors)
    }

    pub fn stats(&mut self, now: Instant) -> WindowStats {
        self.prune(now);

        let mut stats = WindowStats {
            window_secs: self.span.as_secs(),
            operations: self.operations,
            errors: self.errors,
            ..WindowStats::default()
        };
        let mut tier_hits: BTreeMap<String, u64> = BTreeMap::new();
        let mut latencies: BTreeMap<&'static str, Vec<Duration>> = BTreeMap::new();

        for (_, event) in &self.events {
            match event {
                MetricEvent::Operation {
                    kind,
                    outcome,
                    latency,
                } => {
                    latencies.entry(kind.as_str()).or_default().push(*latency);
                    match outcome {
                        Outcome::Hit(tier) => {
                            stats.hits += 1;
                            *tier_hits.entry(tier.to_string()).or_insert(0) += 1;
                        }
                        Outcome::Miss => stats.misses += 1,
                        Outcome::Success | Outcome::Failure => {}
                    }
                }
                MetricEvent::Migration {
                    from, to, reason, ..
                } => {
                    *stats.migrations.entry(format!("{from}->{to}")).or_insert(0) += 1;
                    *stats
                        .migrations_by_reason
                        .entry(reason.as_str().to_string())
                        .or_insert(0) += 1;
                }
            }
        }

        let reads = stats.hits + stats.misses;
        stats.hit_rate = ratio(stats.hits, reads);
        stats.tier_hit_rates = tier_hits
            .into_iter()
            .map(|(tier, hits)| (tier, ratio(hits, reads)))
            .collect();
        stats.error_rate = ratio(stats.errors, stats.operations);
        stats.success_rate = if stats.operations == 0 {
            1.0
        } else {
            1.0 - stats.error_rate
        };
        stats.latency = latencies
            .into_iter()
            .map(|(kind, mut samples)| {
                (kind.to_string(), LatencySummary::from_samples(&mut samples))
            })
            .collect();

        stats
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: OperationKind, outcome: Outcome, ms: u64) -> MetricEvent {
        MetricEvent::Operation {
            kind,
            outcome,
            latency: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_nearest_rank() {
        let samples: Vec<Duration> = (1..=100).map(Duration::from_millis).collect();
        assert_eq!(nearest_rank(&samples, 50.0), Duration::from_millis(50));
        assert_eq!(nearest_rank(&samples, 99.0), Duration::from_millis(99));
        assert_eq!(nearest_rank(&samples, 100.0), Duration::from_millis(100));

        let one = [Duration::from_millis(7)];
        assert_eq!(nearest_rank(&one, 50.0), Duration::from_millis(7));
        assert_eq!(nearest_rank(&one, 0.0), Duration::from_millis(7));
    }

    #[test]
    fn test_latency_summary() {
        let mut samples: Vec<Duration> = [40, 10, 30, 20].map(Duration::from_millis).to_vec();
        let summary = LatencySummary::from_samples(&mut samples);

        assert_eq!(summary.count, 4);
        assert_eq!(summary.p50_ms, 20.0);
        assert_eq!(summary.p90_ms, 40.0);
        assert_eq!(summary.max_ms, 40.0);
        assert_eq!(summary.mean_ms, 25.0);
        assert_eq!(LatencySummary::from_samples(&mut []), LatencySummary::default());
    }

    #[test]
    fn test_prune_on_insert() {
        let base = Instant::now();
        let mut window = TimeWindowAggregator::new(Duration::from_secs(60));

        window.push(base, op(OperationKind::Get, Outcome::Miss, 1));
        let later = base + Duration::from_secs(30);
        window.push(later, op(OperationKind::Set, Outcome::Failure, 1));
        assert_eq!(window.len(), 2);
        assert_eq!(window.operation_counts(), (2, 1));

        let expired = base + Duration::from_secs(61);
        window.push(expired, op(OperationKind::Get, Outcome::Miss, 1));
        assert_eq!(window.len(), 2);
        assert_eq!(window.operation_counts(), (2, 1));

        window.prune(base + Duration::from_secs(200));
        assert!(window.is_empty());
        assert_eq!(window.operation_counts(), (0, 0));
    }

    #[test]
    fn test_window_stats() {
        let base = Instant::now();
        let mut window = TimeWindowAggregator::new(Duration::from_secs(60));

        window.push(base, op(OperationKind::Get, Outcome::Hit(TierId::new(0)), 1));
        window.push(base, op(OperationKind::Get, Outcome::Hit(TierId::new(0)), 3));
        window.push(base, op(OperationKind::Get, Outcome::Hit(TierId::new(1)), 5));
        window.push(base, op(OperationKind::Get, Outcome::Miss, 7));
        window.push(base, op(OperationKind::Set, Outcome::Failure, 9));
        window.push(
            base,
            MetricEvent::Migration {
                from: TierId::new(1),
                to: TierId::new(0),
                reason: MigrationReason::Promotion,
                latency: Duration::from_millis(2),
            },
        );

        let stats = window.stats(base);
        assert_eq!(stats.operations, 5);
        assert_eq!(stats.errors, 1);
        assert!((stats.error_rate - 0.2).abs() < 1e-9);
        assert!((stats.success_rate - 0.8).abs() < 1e-9);
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.75).abs() < 1e-9);
        assert!((stats.tier_hit_rates["T0"] - 0.5).abs() < 1e-9);
        assert!((stats.tier_hit_rates["T1"] - 0.25).abs() < 1e-9);
        assert_eq!(stats.latency["get"].count, 4);
        assert_eq!(stats.latency["get"].p50_ms, 3.0);
        assert_eq!(stats.latency["set"].max_ms, 9.0);
        assert_eq!(stats.migrations["T1->T0"], 1);
        assert_eq!(stats.migrations_by_reason["promotion"], 1);
    }

    #[test]
    fn test_empty_window_is_healthy() {
        let mut window = TimeWindowAggregator::new(Duration::from_secs(60));
        let stats = window.stats(Instant::now());
        assert_eq!(stats.operations, 0);
        assert_eq!(stats.success_rate, 1.0);
        assert_eq!(stats.error_rate, 0.0);
        assert!(stats.latency.is_empty());
    }
}
