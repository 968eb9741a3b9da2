//! Per-key access history

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Bounded sliding window of access timestamps for one key
#[derive(Debug, Clone, PartialEq)]
pub struct AccessPattern {
    history: VecDeque<DateTime<Utc>>,
    capacity: usize,
    total_accesses: u64,
    last_size: u64,
    first_seen: DateTime<Utc>,
}

impl AccessPattern {
    pub fn new(capacity: usize, first_seen: DateTime<Utc>) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            total_accesses: 0,
            last_size: 0,
            first_seen,
        }
    }

    /// Record one access; the oldest timestamp falls out when full
    pub fn record(&mut self, at: DateTime<Utc>, size_bytes: u64) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(at);
        self.total_accesses += 1;
        self.last_size = size_bytes;
    }

    pub fn total_accesses(&self) -> u64 {
        self.total_accesses
    }

    pub fn last_size(&self) -> u64 {
        self.last_size
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub fn last_access(&self) -> Option<DateTime<Utc>> {
        self.history.back().copied()
    }

    /// Time since the last recorded access
    pub fn idle(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_access()
            .map(|last| (now - last).to_std().unwrap_or_default())
    }

    /// Accesses recorded within `window` before `now`
    ///
    /// Bounded by the history capacity.
    pub fn accesses_within(&self, window: Duration, now: DateTime<Utc>) -> u64 {
        let Ok(window) = chrono::Duration::from_std(window) else {
            return self.history.len() as u64;
        };
        let since = now - window;
        self.history.iter().rev().take_while(|at| **at >= since).count() as u64
    }

    /// Gaps between consecutive accesses in the window
    pub fn intervals(&self) -> impl Iterator<Item = Duration> + '_ {
        self.history
            .iter()
            .zip(self.history.iter().skip(1))
            .map(|(a, b)| (*b - *a).to_std().unwrap_or_default())
    }

    pub fn mean_interval(&self) -> Option<Duration> {
        let count = self.history.len().checked_sub(1).filter(|n| *n > 0)?;
        let total: Duration = self.intervals().sum();
        Some(total / count as u32)
    }
}

// =============================================================================
// Tests
// =============================================================================
