//! Eviction Policies
//!
//! Bookkeeping strategies used by capacity-bounded tiers to choose which key
//! to drop when a new item does not fit.
//!
//! - [`LruPolicy`]: least recently touched key first
//! - [`LfuPolicy`]: least frequently touched key first, oldest arrival in
//!   the minimum-frequency bucket breaks ties
//! - [`FifoPolicy`]: oldest inserted key first, accesses ignored

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Eviction strategy contract
///
/// Implementations are plain synchronous state machines; the owning tier
/// serializes calls.
pub trait EvictionPolicy: Send + fmt::Debug {
    /// Short policy name
    fn name(&self) -> &'static str;

    /// A resident key was read
    fn on_access(&mut self, key: &str);

    /// A key was written (new or replaced)
    fn on_insert(&mut self, key: &str);

    /// Key that should leave next
    fn get_eviction_candidate(&self) -> Option<String>;

    /// Stop tracking a key
    fn remove(&mut self, key: &str);

    /// Number of tracked keys
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Policy selection, as named in configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicyKind {
    #[default]
    Lru,
    Lfu,
    Fifo,
}

impl EvictionPolicyKind {
    /// Instantiate an empty policy
    pub fn build(self) -> Box<dyn EvictionPolicy> {
        match self {
            EvictionPolicyKind::Lru => Box::new(LruPolicy::new()),
            EvictionPolicyKind::Lfu => Box::new(LfuPolicy::new()),
            EvictionPolicyKind::Fifo => Box::new(FifoPolicy::new()),
        }
    }
}

impl fmt::Display for EvictionPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionPolicyKind::Lru => write!(f, "lru"),
            EvictionPolicyKind::Lfu => write!(f, "lfu"),
            EvictionPolicyKind::Fifo => write!(f, "fifo"),
        }
    }
}

impl FromStr for EvictionPolicyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionPolicyKind::Lru),
            "lfu" => Ok(EvictionPolicyKind::Lfu),
            "fifo" => Ok(EvictionPolicyKind::Fifo),
            other => Err(Error::Config(format!(
                "unknown eviction policy '{}', expected one of lru, lfu, fifo",
                other
            ))),
        }
    }
}

// =============================================================================
// Ordered sequence
// =============================================================================

/// Keys ordered by a monotonically increasing stamp
///
/// Moving a key to the back is O(log n), the front is the oldest stamp.
#[derive(Debug, Default)]
struct StampedQueue {
    next_stamp: u64,
    stamps: HashMap<String, u64>,
    order: BTreeMap<u64, String>,
}

impl StampedQueue {
    fn push_back(&mut self, key: &str) {
        self.unlink(key);
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.stamps.insert(key.to_string(), stamp);
        self.order.insert(stamp, key.to_string());
    }

    fn contains(&self, key: &str) -> bool {
        self.stamps.contains_key(key)
    }

    fn front(&self) -> Option<&String> {
        self.order.values().next()
    }

    fn unlink(&mut self, key: &str) -> bool {
        match self.stamps.remove(key) {
            Some(stamp) => {
                self.order.remove(&stamp);
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.stamps.len()
    }
}

// =============================================================================
// LRU
// =============================================================================

/// Least-recently-used ordering
#[derive(Debug, Default)]
pub struct LruPolicy {
    queue: StampedQueue,
}

impl LruPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn on_access(&mut self, key: &str) {
        if self.queue.contains(key) {
            self.queue.push_back(key);
        }
    }

    fn on_insert(&mut self, key: &str) {
        self.queue.push_back(key);
    }

    fn get_eviction_candidate(&self) -> Option<String> {
        self.queue.front().cloned()
    }

    fn remove(&mut self, key: &str) {
        self.queue.unlink(key);
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

// =============================================================================
// LFU
// =============================================================================

/// Least-frequently-used buckets
#[derive(Debug, Default)]
pub struct LfuPolicy {
    frequencies: HashMap<String, u64>,
    buckets: HashMap<u64, StampedQueue>,
    min_frequency: u64,
}

impl LfuPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current frequency of a tracked key
    pub fn frequency(&self, key: &str) -> Option<u64> {
        self.frequencies.get(key).copied()
    }

    fn detach(&mut self, key: &str, frequency: u64) {
        let emptied = match self.buckets.get_mut(&frequency) {
            Some(bucket) => {
                bucket.unlink(key);
                bucket.len() == 0
            }
            None => false,
        };
        if emptied {
            self.buckets.remove(&frequency);
        }
    }

    fn attach(&mut self, key: &str, frequency: u64) {
        self.buckets.entry(frequency).or_default().push_back(key);
        self.frequencies.insert(key.to_string(), frequency);
    }

    fn recompute_min(&mut self) {
        self.min_frequency = self.buckets.keys().copied().min().unwrap_or(0);
    }
}

impl EvictionPolicy for LfuPolicy {
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn on_access(&mut self, key: &str) {
        let Some(frequency) = self.frequency(key) else {
            return;
        };
        self.detach(key, frequency);
        self.attach(key, frequency + 1);

        if self.min_frequency == frequency && !self.buckets.contains_key(&frequency) {
            self.min_frequency = frequency + 1;
        }
    }

    fn on_insert(&mut self, key: &str) {
        if self.frequencies.contains_key(key) {
            // A rewrite counts as a touch
            self.on_access(key);
            return;
        }
        self.attach(key, 1);
        self.min_frequency = 1;
    }

    fn get_eviction_candidate(&self) -> Option<String> {
        self.buckets
            .get(&self.min_frequency)
            .and_then(|bucket| bucket.front().cloned())
    }

    fn remove(&mut self, key: &str) {
        if let Some(frequency) = self.frequencies.remove(key) {
            self.detach(key, frequency);
            if frequency == self.min_frequency {
                self.recompute_min();
            }
        }
    }

    fn len(&self) -> usize {
        self.frequencies.len()
    }
}

// =============================================================================
// FIFO
// =============================================================================

/// Insertion-ordered queue
#[derive(Debug, Default)]
pub struct FifoPolicy {
    queue: StampedQueue,
}

impl FifoPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvictionPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn on_access(&mut self, _key: &str) {}

    fn on_insert(&mut self, key: &str) {
        // Replacing a value keeps the original position
        if !self.queue.contains(key) {
            self.queue.push_back(key);
        }
    }

    fn get_eviction_candidate(&self) -> Option<String> {
        self.queue.front().cloned()
    }

    fn remove(&mut self, key: &str) {
        self.queue.unlink(key);
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
