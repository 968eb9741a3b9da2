//! Metrics Collector
//!
//! Feeds every event into each sliding window at once, keeps lifetime
//! counters next to them and mirrors both into a Prometheus registry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use rand::Rng;
use serde::Serialize;
use tracing::info;

use super::alerts::{Alert, AlertManager};
use super::window::{
    MetricEvent, MigrationReason, OperationKind, Outcome, TimeWindowAggregator, WindowStats,
};
use crate::config::MetricsConfig;
use crate::error::{Error, Result};
use crate::storage::BackendStats;
use crate::tier::TierId;

/// Counters since startup, never sampled
#[derive(Debug, Default)]
struct LifetimeCounters {
    operations: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    migrations: AtomicU64,
    prefetches: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LifetimeStats {
    pub operations: u64,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub migrations: u64,
    pub prefetches: u64,
}

/// Point-in-time view of all metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub lifetime: LifetimeStats,
    /// Shortest window first
    pub windows: Vec<WindowStats>,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub alerts: Vec<Alert>,
}

impl MetricsSnapshot {
    /// Stats of the window spanning `secs`
    pub fn window(&self, secs: u64) -> Option<&WindowStats> {
        self.windows.iter().find(|w| w.window_secs == secs)
    }
}

struct State {
    windows: Vec<TimeWindowAggregator>,
    alerts: AlertManager,
    errors_by_kind: BTreeMap<String, u64>,
}

impl State {
    fn push(&mut self, at: Instant, event: MetricEvent) {
        for window in &mut self.windows {
            window.push(at, event.clone());
        }
    }

    fn check_alerts(&mut self, operation: &str, latency: Duration, at: Instant) {
        self.alerts.check_latency(operation, latency, at);
        if let Some(shortest) = self.windows.first() {
            let (operations, errors) = shortest.operation_counts();
            self.alerts.check_error_rate(operations, errors, at);
        }
    }
}

// =============================================================================
// Prometheus
// =============================================================================

struct PrometheusMetrics {
    registry: Registry,
    operations: IntCounterVec,
    latency: HistogramVec,
    migrations: IntCounterVec,
    hit_rate: GaugeVec,
    error_rate: GaugeVec,
    active_alerts: IntGauge,
    tier_items: IntGaugeVec,
    tier_bytes: IntGaugeVec,
}

fn register<T>(registry: &Registry, metric: T) -> Result<T>
where
    T: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(metric.clone()))
        .map_err(|e| Error::Internal(format!("metric registration failed: {e}")))?;
    Ok(metric)
}

fn prometheus_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {e}"))
}

impl PrometheusMetrics {
    fn new() -> Result<Self> {
        let registry =
            Registry::new_custom(Some("tiermem".to_string()), None).map_err(prometheus_err)?;

        let operations = register(
            &registry,
            IntCounterVec::new(
                Opts::new("operations_total", "Operations by kind and outcome"),
                &["operation", "outcome"],
            )
            .map_err(prometheus_err)?,
        )?;
        let latency = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new("operation_duration_seconds", "Operation latency in seconds")
                    .buckets(vec![
                        0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
                    ]),
                &["operation"],
            )
            .map_err(prometheus_err)?,
        )?;
        let migrations = register(
            &registry,
            IntCounterVec::new(
                Opts::new("migrations_total", "Tier migrations by path and reason"),
                &["from", "to", "reason"],
            )
            .map_err(prometheus_err)?,
        )?;
        let hit_rate = register(
            &registry,
            GaugeVec::new(Opts::new("hit_rate", "Read hit rate per window"), &["window"])
                .map_err(prometheus_err)?,
        )?;
        let error_rate = register(
            &registry,
            GaugeVec::new(
                Opts::new("error_rate", "Operation error rate per window"),
                &["window"],
            )
            .map_err(prometheus_err)?,
        )?;
        let active_alerts = register(
            &registry,
            IntGauge::new("active_alerts", "Currently active alerts").map_err(prometheus_err)?,
        )?;
        let tier_items = register(
            &registry,
            IntGaugeVec::new(Opts::new("tier_items", "Items resident per tier"), &["tier"])
                .map_err(prometheus_err)?,
        )?;
        let tier_bytes = register(
            &registry,
            IntGaugeVec::new(Opts::new("tier_bytes", "Bytes resident per tier"), &["tier"])
                .map_err(prometheus_err)?,
        )?;

        Ok(Self {
            registry,
            operations,
            latency,
            migrations,
            hit_rate,
            error_rate,
            active_alerts,
            tier_items,
            tier_bytes,
        })
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// =============================================================================
// Collector
// =============================================================================

pub struct MetricsCollector {
    config: MetricsConfig,
    state: Mutex<State>,
    counters: LifetimeCounters,
    prometheus: PrometheusMetrics,
    started: Instant,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let mut spans = config.windows();
        spans.sort();
        spans.dedup();

        let state = State {
            windows: spans.into_iter().map(TimeWindowAggregator::new).collect(),
            alerts: AlertManager::new(config.alerts.clone()),
            errors_by_kind: BTreeMap::new(),
        };

        Ok(Self {
            prometheus: PrometheusMetrics::new()?,
            state: Mutex::new(state),
            counters: LifetimeCounters::default(),
            started: Instant::now(),
            config,
        })
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    fn sampled(&self) -> bool {
        let rate = self.config.sampling_rate;
        if rate >= 1.0 {
            true
        } else if rate <= 0.0 {
            false
        } else {
            rand::thread_rng().gen_bool(rate)
        }
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Record a read served by `tier`, or a miss when `None`
    pub fn record_get(&self, tier: Option<TierId>, latency: Duration) {
        match tier {
            Some(_) => self.counters.hits.fetch_add(1, Ordering::Relaxed),
            None => self.counters.misses.fetch_add(1, Ordering::Relaxed),
        };
        let outcome = tier.map_or(Outcome::Miss, Outcome::Hit);
        self.record(OperationKind::Get, outcome, latency, Instant::now());
    }

    /// Record a successful non-read operation
    pub fn record_operation(&self, kind: OperationKind, latency: Duration) {
        self.record(kind, Outcome::Success, latency, Instant::now());
    }

    /// Record a failed operation; failures are never sampled out
    pub fn record_error(&self, kind: OperationKind, error: &Error, latency: Duration) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        *self
            .state
            .lock()
            .errors_by_kind
            .entry(error.kind().to_string())
            .or_insert(0) += 1;
        self.record(kind, Outcome::Failure, latency, Instant::now());
    }

    fn record(&self, kind: OperationKind, outcome: Outcome, latency: Duration, at: Instant) {
        self.counters.operations.fetch_add(1, Ordering::Relaxed);

        let label = match outcome {
            Outcome::Hit(_) => "hit",
            Outcome::Miss => "miss",
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        };
        self.prometheus
            .operations
            .with_label_values(&[kind.as_str(), label])
            .inc();
        self.prometheus
            .latency
            .with_label_values(&[kind.as_str()])
            .observe(latency.as_secs_f64());

        if !self.config.enabled || (!outcome.is_failure() && !self.sampled()) {
            return;
        }

        let mut state = self.state.lock();
        state.push(
            at,
            MetricEvent::Operation {
                kind,
                outcome,
                latency,
            },
        );
        state.check_alerts(kind.as_str(), latency, at);
    }

    pub fn record_migration(
        &self,
        from: TierId,
        to: TierId,
        reason: MigrationReason,
        latency: Duration,
    ) {
        self.counters.migrations.fetch_add(1, Ordering::Relaxed);
        let (source, destination) = (from.to_string(), to.to_string());
        self.prometheus
            .migrations
            .with_label_values(&[source.as_str(), destination.as_str(), reason.as_str()])
            .inc();

        if !self.config.enabled {
            return;
        }
        self.state.lock().push(
            Instant::now(),
            MetricEvent::Migration {
                from,
                to,
                reason,
                latency,
            },
        );
    }

    pub fn record_prefetch(&self) {
        self.counters.prefetches.fetch_add(1, Ordering::Relaxed);
    }

    /// Refresh per-tier residency gauges
    pub fn update_tier(&self, tier: &str, stats: &BackendStats) {
        self.prometheus
            .tier_items
            .with_label_values(&[tier])
            .set(clamp_i64(stats.total_items));
        self.prometheus
            .tier_bytes
            .with_label_values(&[tier])
            .set(clamp_i64(stats.total_size_bytes));
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    pub fn lifetime(&self) -> LifetimeStats {
        LifetimeStats {
            operations: self.counters.operations.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            migrations: self.counters.migrations.load(Ordering::Relaxed),
            prefetches: self.counters.prefetches.load(Ordering::Relaxed),
        }
    }

    /// Pull-style view of the current aggregates
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> MetricsSnapshot {
        let mut state = self.state.lock();
        state.alerts.sweep(now);
        let windows = state.windows.iter_mut().map(|w| w.stats(now)).collect();

        MetricsSnapshot {
            uptime_secs: now.saturating_duration_since(self.started).as_secs(),
            lifetime: self.lifetime(),
            windows,
            errors_by_kind: state.errors_by_kind.clone(),
            alerts: state.alerts.active(),
        }
    }

    /// Push-style report: refresh gauges, log a summary and return it
    pub fn flush(&self) -> MetricsSnapshot {
        let snapshot = self.snapshot();

        for window in &snapshot.windows {
            let label = format!("{}s", window.window_secs);
            self.prometheus
                .hit_rate
                .with_label_values(&[label.as_str()])
                .set(window.hit_rate);
            self.prometheus
                .error_rate
                .with_label_values(&[label.as_str()])
                .set(window.error_rate);
        }
        self.prometheus
            .active_alerts
            .set(clamp_i64(snapshot.alerts.len() as u64));

        let shortest = snapshot.windows.first().cloned().unwrap_or_default();
        info!(
            operations = snapshot.lifetime.operations,
            hits = snapshot.lifetime.hits,
            misses = snapshot.lifetime.misses,
            errors = snapshot.lifetime.errors,
            migrations = snapshot.lifetime.migrations,
            window_secs = shortest.window_secs,
            hit_rate = shortest.hit_rate,
            error_rate = shortest.error_rate,
            alerts = snapshot.alerts.len(),
            "Metrics flush"
        );

        snapshot
    }

    /// Render the registry in the Prometheus text format
    pub fn export_prometheus(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.prometheus.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(prometheus_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
