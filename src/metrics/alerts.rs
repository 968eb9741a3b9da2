//! Threshold alerts
//!
//! An alert is raised when its condition triggers, refreshed by every
//! retrigger, and cleared once a quiet period passes without one.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::AlertConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighErrorRate,
    HighLatency,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::HighErrorRate => "high_error_rate",
            AlertKind::HighLatency => "high_latency",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An active alert
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    /// Observed value at the latest trigger
    pub value: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Utc>,
    pub trigger_count: u64,
    #[serde(skip)]
    last_triggered: Instant,
}

#[derive(Debug)]
pub struct AlertManager {
    config: AlertConfig,
    active: BTreeMap<AlertKind, Alert>,
}

impl AlertManager {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            active: BTreeMap::new(),
        }
    }

    fn quiet_period(&self) -> Duration {
        Duration::from_secs(self.config.quiet_period_secs)
    }

    /// Check the error rate of the shortest window
    pub fn check_error_rate(&mut self, operations: u64, errors: u64, now: Instant) {
        if operations < self.config.min_operations.max(1) {
            return;
        }
        let rate = errors as f64 / operations as f64;
        if rate > self.config.error_rate_threshold {
            self.trigger(
                AlertKind::HighErrorRate,
                format!("error rate {:.1}% over {} operations", rate * 100.0, operations),
                rate,
                self.config.error_rate_threshold,
                now,
            );
        }
    }

    /// Check one operation's latency
    pub fn check_latency(&mut self, operation: &str, latency: Duration, now: Instant) {
        let threshold = Duration::from_millis(self.config.latency_threshold_ms);
        if latency > threshold {
            self.trigger(
                AlertKind::HighLatency,
                format!("{operation} took {}ms", latency.as_millis()),
                latency.as_secs_f64() * 1000.0,
                self.config.latency_threshold_ms as f64,
                now,
            );
        }
    }

    fn trigger(
        &mut self,
        kind: AlertKind,
        message: String,
        value: f64,
        threshold: f64,
        now: Instant,
    ) {
        match self.active.get_mut(&kind) {
            Some(alert) => {
                alert.value = value;
                alert.message = message;
                alert.trigger_count += 1;
                alert.last_triggered = now;
            }
            None => {
                warn!(alert = %kind, value, threshold, message = %message, "Alert raised");
                self.active.insert(
                    kind,
                    Alert {
                        kind,
                        message,
                        value,
                        threshold,
                        raised_at: Utc::now(),
                        trigger_count: 1,
                        last_triggered: now,
                    },
                );
            }
        }
    }

    /// Clear alerts that have been quiet for the full period
    pub fn sweep(&mut self, now: Instant) -> Vec<AlertKind> {
        let quiet = self.quiet_period();
        let cleared: Vec<AlertKind> = self
            .active
            .values()
            .filter(|alert| now.saturating_duration_since(alert.last_triggered) >= quiet)
            .map(|alert| alert.kind)
            .collect();

        for kind in &cleared {
            if let Some(alert) = self.active.remove(kind) {
                info!(
                    alert = %kind,
                    triggers = alert.trigger_count,
                    "Alert cleared"
                );
            }
        }
        cleared
    }

    pub fn active(&self) -> Vec<Alert> {
        self.active.values().cloned().collect()
    }

    pub fn is_active(&self, kind: AlertKind) -> bool {
        self.active.contains_key(&kind)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AlertManager {
        AlertManager::new(AlertConfig {
            error_rate_threshold: 0.1,
            latency_threshold_ms: 100,
            quiet_period_secs: 60,
            min_operations: 10,
        })
    }

    #[test]
    fn test_error_rate_needs_minimum_operations() {
        let mut alerts = manager();
        let now = Instant::now();

        alerts.check_error_rate(5, 5, now);
        assert!(!alerts.is_active(AlertKind::HighErrorRate));

        alerts.check_error_rate(20, 2, now);
        assert!(!alerts.is_active(AlertKind::HighErrorRate));

        alerts.check_error_rate(20, 3, now);
        assert!(alerts.is_active(AlertKind::HighErrorRate));
    }

    #[test]
    fn test_latency_alert() {
        let mut alerts = manager();
        let now = Instant::now();

        alerts.check_latency("get", Duration::from_millis(100), now);
        assert!(alerts.active().is_empty());

        alerts.check_latency("get", Duration::from_millis(250), now);
        let active = alerts.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind, AlertKind::HighLatency);
        assert_eq!(active[0].value, 250.0);
    }

    #[test]
    fn test_retrigger_refreshes_and_quiet_period_clears() {
        let mut alerts = manager();
        let start = Instant::now();

        alerts.check_latency("set", Duration::from_secs(1), start);
        alerts.check_latency("set", Duration::from_secs(2), start + Duration::from_secs(50));
        assert_eq!(alerts.active()[0].trigger_count, 2);

        assert!(alerts.sweep(start + Duration::from_secs(70)).is_empty());
        assert!(alerts.is_active(AlertKind::HighLatency));

        let cleared = alerts.sweep(start + Duration::from_secs(110));
        assert_eq!(cleared, vec![AlertKind::HighLatency]);
        assert!(alerts.active().is_empty());
    }
}
