//! Co-access tracking for prefetch
//!
//! Every access is paired with the few keys accessed just before it inside a
//! short window. The resulting transition counts estimate the probability
//! that one key follows another.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Key predicted to be accessed next
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrefetchCandidate {
    pub key: String,
    pub probability: f64,
}

#[derive(Debug)]
pub(crate) struct CoAccessTracker {
    window: chrono::Duration,
    depth: usize,
    recent: VecDeque<(String, DateTime<Utc>)>,
    transitions: HashMap<String, HashMap<String, u64>>,
    totals: HashMap<String, u64>,
}

impl CoAccessTracker {
    pub(crate) fn new(window: Duration, depth: usize) -> Self {
        Self {
            window: chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
            depth: depth.max(1),
            recent: VecDeque::new(),
            transitions: HashMap::new(),
            totals: HashMap::new(),
        }
    }

    pub(crate) fn record(&mut self, key: &str, at: DateTime<Utc>) {
        self.expire(at);

        for (previous, _) in self.recent.iter().rev() {
            if previous == key {
                continue;
            }
            *self
                .transitions
                .entry(previous.clone())
                .or_default()
                .entry(key.to_string())
                .or_insert(0) += 1;
            *self.totals.entry(previous.clone()).or_insert(0) += 1;
        }

        self.recent.retain(|(k, _)| k != key);
        self.recent.push_back((key.to_string(), at));
        while self.recent.len() > self.depth {
            self.recent.pop_front();
        }
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        let since = now - self.window;
        while self.recent.front().is_some_and(|(_, at)| *at < since) {
            self.recent.pop_front();
        }
    }

    /// Probability that `next` follows `key`
    pub(crate) fn probability(&self, key: &str, next: &str) -> f64 {
        let total = self.totals.get(key).copied().unwrap_or(0);
        if total == 0 {
            return 0.0;
        }
        let count = self
            .transitions
            .get(key)
            .and_then(|m| m.get(next))
            .copied()
            .unwrap_or(0);
        count as f64 / total as f64
    }

    /// Successors of `key` at or above `threshold`, most likely first
    pub(crate) fn candidates(
        &self,
        key: &str,
        threshold: f64,
        max: usize,
    ) -> Vec<PrefetchCandidate> {
        let Some(next) = self.transitions.get(key) else {
            return Vec::new();
        };

        let mut candidates: Vec<PrefetchCandidate> = next
            .keys()
            .map(|k| PrefetchCandidate {
                key: k.clone(),
                probability: self.probability(key, k),
            })
            .filter(|c| c.probability >= threshold)
            .collect();

        candidates.sort_by(|a, b| {
            b.probability
                .partial_cmp(&a.probability)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        candidates.truncate(max);
        candidates
    }

    /// Strongest prediction of `key` from what was accessed recently
    pub(crate) fn incoming_probability(&self, key: &str, now: DateTime<Utc>) -> f64 {
        let since = now - self.window;
        self.recent
            .iter()
            .filter(|(previous, at)| previous != key && *at >= since)
            .map(|(previous, _)| self.probability(previous, key))
            .fold(0.0, f64::max)
    }

    pub(crate) fn forget(&mut self, key: &str) {
        self.transitions.remove(key);
        self.totals.remove(key);
        self.recent.retain(|(k, _)| k != key);

        for (previous, next) in self.transitions.iter_mut() {
            if let Some(count) = next.remove(key) {
                if let Some(total) = self.totals.get_mut(previous) {
                    *total = total.saturating_sub(count);
                }
            }
        }
        self.transitions.retain(|_, next| !next.is_empty());
        self.totals.retain(|_, total| *total > 0);
    }

    pub(crate) fn tracked_keys(&self) -> usize {
        self.transitions.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
