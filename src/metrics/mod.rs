//! Metrics module
//!
//! Sliding-window aggregation of operation, hit/miss and migration events,
//! threshold alerts, and a Prometheus export of the same state.

mod alerts;
mod collector;
mod window;

pub use alerts::{Alert, AlertKind, AlertManager};
pub use collector::{LifetimeStats, MetricsCollector, MetricsSnapshot};
pub use window::{
    nearest_rank, LatencySummary, MetricEvent, MigrationReason, OperationKind, Outcome,
    TimeWindowAggregator, WindowStats,
};
