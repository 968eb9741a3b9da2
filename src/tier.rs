//! Tier Hierarchy
//!
//! Ordered registry of storage backends. Tier 0 is the fastest; every
//! lookup walks the tiers in ascending latency order.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::{EvictionPolicyKind, StorageBackend};

/// Ordinal position of a tier, 0 = fastest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TierId(usize);

impl TierId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Coarse latency class used to order tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyClass {
    /// In-process memory
    Memory,
    /// Local disk
    Local,
    /// Shared store reached over the network
    Network,
    /// Remote or compute-heavy store
    Remote,
}

impl fmt::Display for LatencyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LatencyClass::Memory => write!(f, "memory"),
            LatencyClass::Local => write!(f, "local"),
            LatencyClass::Network => write!(f, "network"),
            LatencyClass::Remote => write!(f, "remote"),
        }
    }
}

/// Static description of one tier
#[derive(Debug, Clone, PartialEq)]
pub struct TierDescriptor {
    pub name: String,
    pub latency: LatencyClass,
    /// Byte bound, `None` = unbounded
    pub max_bytes: Option<u64>,
    /// Item-count bound, `None` = unbounded
    pub max_items: Option<u64>,
    /// Survives a process restart
    pub persistent: bool,
    /// Eviction policy, bounded tiers only
    pub eviction: Option<EvictionPolicyKind>,
}

impl TierDescriptor {
    pub fn new(name: impl Into<String>, latency: LatencyClass) -> Self {
        Self {
            name: name.into(),
            latency,
            max_bytes: None,
            max_items: None,
            persistent: false,
            eviction: None,
        }
    }

    pub fn with_bounds(
        mut self,
        max_items: Option<u64>,
        max_bytes: Option<u64>,
        eviction: EvictionPolicyKind,
    ) -> Self {
        self.max_items = max_items;
        self.max_bytes = max_bytes;
        self.eviction = Some(eviction);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn is_bounded(&self) -> bool {
        self.max_bytes.is_some() || self.max_items.is_some()
    }

    /// Whether an item of `size` bytes could ever fit
    pub fn can_hold(&self, size: u64) -> bool {
        self.max_bytes.map_or(true, |max| size <= max)
    }
}

// =============================================================================
// Tier
// =============================================================================

/// A registered tier: descriptor plus backend handle
#[derive(Clone)]
pub struct Tier {
    id: TierId,
    descriptor: TierDescriptor,
    backend: Arc<dyn StorageBackend>,
}

impl Tier {
    pub fn id(&self) -> TierId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &TierDescriptor {
        &self.descriptor
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn is_bounded(&self) -> bool {
        self.descriptor.is_bounded()
    }
}

impl fmt::Debug for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tier")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .field("backend", &self.backend.name())
            .finish()
    }
}

// =============================================================================
// Hierarchy
// =============================================================================

/// Tiers ordered by ascending latency
///
/// Cloning is cheap; clones share the same backends.
#[derive(Debug, Clone)]
pub struct TierHierarchy {
    tiers: Arc<[Tier]>,
}

impl TierHierarchy {
    /// Build a hierarchy, ordering tiers by latency class
    ///
    /// Tiers of the same class keep their registration order.
    pub fn new(entries: Vec<(TierDescriptor, Arc<dyn StorageBackend>)>) -> Result<Self> {
        if entries.is_empty() {
            return Err(Error::Config("at least one tier is required".into()));
        }

        let mut seen = HashSet::new();
        for (descriptor, _) in &entries {
            if !seen.insert(descriptor.name.clone()) {
                return Err(Error::Config(format!(
                    "duplicate tier name: {}",
                    descriptor.name
                )));
            }
        }

        let mut entries = entries;
        entries.sort_by_key(|(descriptor, _)| descriptor.latency);

        let tiers: Vec<Tier> = entries
            .into_iter()
            .enumerate()
            .map(|(index, (descriptor, backend))| Tier {
                id: TierId::new(index),
                descriptor,
                backend,
            })
            .collect();

        Ok(Self {
            tiers: tiers.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// All tiers, fastest first
    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn get(&self, id: TierId) -> Option<&Tier> {
        self.tiers.get(id.index())
    }

    /// Like [`get`](Self::get) but an unknown id is a validation error
    pub fn tier(&self, id: TierId) -> Result<&Tier> {
        self.get(id)
            .ok_or_else(|| Error::Validation(format!("unknown tier {}", id)))
    }

    pub fn by_name(&self, name: &str) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.name() == name)
    }

    pub fn fastest(&self) -> &Tier {
        &self.tiers[0]
    }

    pub fn slowest(&self) -> &Tier {
        &self.tiers[self.tiers.len() - 1]
    }

    pub fn is_fastest(&self, id: TierId) -> bool {
        id.index() == 0
    }

    pub fn is_slowest(&self, id: TierId) -> bool {
        id.index() + 1 == self.tiers.len()
    }

    /// Next faster tier, if any
    pub fn faster(&self, id: TierId) -> Option<TierId> {
        id.index().checked_sub(1).map(TierId::new)
    }

    /// Next slower tier, if any
    pub fn slower(&self, id: TierId) -> Option<TierId> {
        let next = id.index() + 1;
        (next < self.tiers.len()).then_some(TierId::new(next))
    }

    /// Tiers able to answer semantic queries
    pub fn semantic_tiers(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.iter().filter(|t| t.backend.supports_semantic())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBackend, MemoryConfig, SemanticBackend};
    use assert_matches::assert_matches;

    fn memory(name: &str) -> Arc<dyn StorageBackend> {
        Arc::new(MemoryBackend::new(name, MemoryConfig::default()))
    }

    #[test]
    fn test_tiers_sorted_by_latency() {
        let hierarchy = TierHierarchy::new(vec![
            (TierDescriptor::new("cold", LatencyClass::Local), memory("cold")),
            (TierDescriptor::new("hot", LatencyClass::Memory), memory("hot")),
            (TierDescriptor::new("shared", LatencyClass::Network), memory("shared")),
        ])
        .unwrap();

        let names: Vec<_> = hierarchy.tiers().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["hot", "cold", "shared"]);
        assert_eq!(hierarchy.fastest().name(), "hot");
        assert_eq!(hierarchy.slowest().name(), "shared");
        assert_eq!(hierarchy.by_name("cold").map(|t| t.id()), Some(TierId::new(1)));
    }

    #[test]
    fn test_neighbours() {
        let hierarchy = TierHierarchy::new(vec![
            (TierDescriptor::new("a", LatencyClass::Memory), memory("a")),
            (TierDescriptor::new("b", LatencyClass::Local), memory("b")),
        ])
        .unwrap();

        assert_eq!(hierarchy.faster(TierId::new(0)), None);
        assert_eq!(hierarchy.faster(TierId::new(1)), Some(TierId::new(0)));
        assert_eq!(hierarchy.slower(TierId::new(0)), Some(TierId::new(1)));
        assert_eq!(hierarchy.slower(TierId::new(1)), None);
        assert!(hierarchy.is_fastest(TierId::new(0)));
        assert!(hierarchy.is_slowest(TierId::new(1)));
        assert_matches!(hierarchy.tier(TierId::new(5)), Err(Error::Validation(_)));
    }

    #[test]
    fn test_rejects_empty_and_duplicates() {
        assert_matches!(TierHierarchy::new(vec![]), Err(Error::Config(_)));

        let result = TierHierarchy::new(vec![
            (TierDescriptor::new("a", LatencyClass::Memory), memory("a")),
            (TierDescriptor::new("a", LatencyClass::Local), memory("a")),
        ]);
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[test]
    fn test_semantic_tiers() {
        let hierarchy = TierHierarchy::new(vec![
            (TierDescriptor::new("hot", LatencyClass::Memory), memory("hot")),
            (
                TierDescriptor::new("vectors", LatencyClass::Remote),
                Arc::new(SemanticBackend::new("vectors", Default::default())) as Arc<dyn StorageBackend>,
            ),
        ])
        .unwrap();

        let semantic: Vec<_> = hierarchy.semantic_tiers().map(|t| t.name()).collect();
        assert_eq!(semantic, vec!["vectors"]);
    }

    #[test]
    fn test_descriptor_bounds() {
        let unbounded = TierDescriptor::new("cold", LatencyClass::Local);
        assert!(!unbounded.is_bounded());
        assert!(unbounded.can_hold(u64::MAX));

        let bounded = TierDescriptor::new("hot", LatencyClass::Memory).with_bounds(
            Some(10),
            Some(1024),
            EvictionPolicyKind::Lru,
        );
        assert!(bounded.is_bounded());
        assert!(bounded.can_hold(1024));
        assert!(!bounded.can_hold(1025));
    }
}
