//! Stored Item Types
//!
//! An [`Item`] is an immutable value: touching it, moving it to another tier
//! or changing its bookkeeping always yields a new version.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::tier::TierId;

/// Longest accepted key, in bytes
pub const MAX_KEY_LEN: usize = 512;

/// Open string-keyed metadata attached to an item
pub type Metadata = BTreeMap<String, Value>;

/// Validate a key before it reaches any backend
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Validation("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::Validation(format!(
            "key is {} bytes, limit is {}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    if key.chars().any(|c| c.is_ascii_control()) {
        return Err(Error::Validation(format!(
            "key {:?} contains control characters",
            key
        )));
    }
    Ok(())
}

/// SHA-256 content hash, hex encoded
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// =============================================================================
// Item
// =============================================================================

/// One stored entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    key: String,
    value: Value,
    metadata: Metadata,
    tier: TierId,
    created_at: DateTime<Utc>,
    accessed_at: DateTime<Utc>,
    access_count: u64,
    size_bytes: u64,
    ttl_seconds: Option<u64>,
    checksum: String,
}

impl Item {
    /// Create a new item, computing its serialized size and checksum
    pub fn new(key: impl Into<String>, value: Value) -> Result<Self> {
        let key = key.into();
        validate_key(&key)?;

        let encoded = serde_json::to_vec(&value)?;
        let now = Utc::now();

        Ok(Self {
            key,
            size_bytes: encoded.len() as u64,
            checksum: checksum(&encoded),
            value,
            metadata: Metadata::new(),
            tier: TierId::default(),
            created_at: now,
            accessed_at: now,
            access_count: 0,
            ttl_seconds: None,
        })
    }

    /// Set the time-to-live in seconds
    pub fn with_ttl(mut self, ttl_seconds: Option<u64>) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Backdate (or postdate) the item for tests and for imports that carry
    /// their original timestamps
    ///
    /// Sets both the creation and the last access time. Since expiry is
    /// measured from creation, this also moves the TTL deadline: an item
    /// created an hour ago with a 60 second TTL is already expired.
    #[doc(hidden)]
    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.accessed_at = at;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Tier the item was read from or written to
    pub fn tier(&self) -> TierId {
        self.tier
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn accessed_at(&self) -> DateTime<Utc> {
        self.accessed_at
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn ttl_seconds(&self) -> Option<u64> {
        self.ttl_seconds
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Whether `other` holds the same write as `self`
    ///
    /// Access bookkeeping and tier placement are ignored. Creation times are
    /// compared at millisecond precision, which is what the durable tier keeps.
    pub fn same_version(&self, other: &Item) -> bool {
        self.key == other.key
            && self.checksum == other.checksum
            && self.created_at.timestamp_millis() == other.created_at.timestamp_millis()
    }

    /// New version with one more access recorded now
    pub fn touched(&self) -> Self {
        self.touched_at(Utc::now())
    }

    /// New version with one more access recorded at `at`
    pub fn touched_at(&self, at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.access_count = next.access_count.saturating_add(1);
        next.accessed_at = at.max(next.accessed_at);
        next
    }

    /// New version resident in `tier`
    pub fn placed_in(&self, tier: TierId) -> Self {
        let mut next = self.clone();
        next.tier = tier;
        next
    }

    /// Absolute expiry: creation time plus ttl
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = self.ttl_seconds?;
        let delta = i64::try_from(ttl)
            .ok()
            .and_then(chrono::Duration::try_seconds)?;
        self.created_at.checked_add_signed(delta)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expiry) => now >= expiry,
            None => false,
        }
    }

    /// Time since the last access
    pub fn idle_at(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.accessed_at).to_std().unwrap_or_default()
    }

    /// Recompute the checksum and compare with the stored one
    pub fn verify_integrity(&self) -> bool {
        match serde_json::to_vec(&self.value) {
            Ok(encoded) => checksum(&encoded) == self.checksum,
            Err(_) => false,
        }
    }

    /// Flatten into a persistable record
    pub fn to_record(&self) -> ItemRecord {
        ItemRecord {
            key: self.key.clone(),
            value: self.value.clone(),
            metadata: self.metadata.clone(),
            tier: self.tier.index(),
            created_at: self.created_at,
            accessed_at: self.accessed_at,
            access_count: self.access_count,
            size_bytes: self.size_bytes,
            ttl_seconds: self.ttl_seconds,
            checksum: self.checksum.clone(),
        }
    }

    /// Rebuild an item from a persisted record
    pub fn from_record(record: ItemRecord) -> Result<Self> {
        validate_key(&record.key)?;
        Ok(Self {
            key: record.key,
            value: record.value,
            metadata: record.metadata,
            tier: TierId::new(record.tier),
            created_at: record.created_at,
            accessed_at: record.accessed_at,
            access_count: record.access_count,
            size_bytes: record.size_bytes,
            ttl_seconds: record.ttl_seconds,
            checksum: record.checksum,
        })
    }
}

/// Column-by-column form of an [`Item`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub key: String,
    pub value: Value,
    pub metadata: Metadata,
    pub tier: usize,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub size_bytes: u64,
    pub ttl_seconds: Option<u64>,
    pub checksum: String,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn test_new_item_computes_size_and_checksum() {
        let item = Item::new("user:1", json!({"name": "A"})).unwrap();
        let encoded = serde_json::to_vec(&json!({"name": "A"})).unwrap();

        assert_eq!(item.size_bytes(), encoded.len() as u64);
        assert_eq!(item.checksum(), checksum(&encoded));
        assert_eq!(item.access_count(), 0);
        assert!(item.verify_integrity());
    }

    #[test]
    fn test_key_validation() {
        assert_matches!(Item::new("", json!(1)), Err(Error::Validation(_)));
        assert_matches!(
            Item::new("a".repeat(MAX_KEY_LEN + 1), json!(1)),
            Err(Error::Validation(_))
        );
        assert_matches!(Item::new("bad\nkey", json!(1)), Err(Error::Validation(_)));
        assert!(Item::new("a".repeat(MAX_KEY_LEN), json!(1)).is_ok());
    }

    #[test]
    fn test_touch_produces_new_version() {
        let item = Item::new("k", json!("v")).unwrap();
        let touched = item.touched();

        assert_eq!(item.access_count(), 0);
        assert_eq!(touched.access_count(), 1);
        assert!(touched.accessed_at() >= item.accessed_at());
        assert_eq!(touched.created_at(), item.created_at());
    }

    #[test]
    fn test_placed_in_keeps_lifetime() {
        let item = Item::new("k", json!("v")).unwrap().with_ttl(Some(60));
        let moved = item.placed_in(TierId::new(2));

        assert_eq!(moved.tier(), TierId::new(2));
        assert_eq!(moved.expires_at(), item.expires_at());
    }

    #[test]
    fn test_expiry_is_absolute_from_creation() {
        let created = Utc::now() - chrono::Duration::seconds(10);
        let item = Item::new("k", json!("v"))
            .unwrap()
            .with_ttl(Some(5))
            .created(created);

        assert!(item.is_expired());

        // Touching does not extend the lifetime
        assert!(item.touched().is_expired());

        let fresh = Item::new("k", json!("v")).unwrap().with_ttl(Some(60));
        assert!(!fresh.is_expired());

        let forever = Item::new("k", json!("v")).unwrap();
        assert!(forever.expires_at().is_none());
        assert!(!forever.is_expired());
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let item = Item::new("k", json!("v")).unwrap().with_ttl(Some(u64::MAX));
        assert!(item.expires_at().is_none());
        assert!(!item.is_expired());
    }

    #[test]
    fn test_record_conversion() {
        let mut metadata = Metadata::new();
        metadata.insert("owner".into(), json!("alice"));
        let item = Item::new("doc:1", json!([1, 2, 3]))
            .unwrap()
            .with_metadata(metadata)
            .placed_in(TierId::new(1));

        let restored = Item::from_record(item.to_record()).unwrap();
        assert_eq!(restored, item);
    }

    #[test]
    fn test_tampered_value_fails_integrity() {
        let item = Item::new("k", json!("v")).unwrap();
        let mut record = item.to_record();
        record.value = json!("tampered");

        let restored = Item::from_record(record).unwrap();
        assert!(!restored.verify_integrity());
    }

    #[test]
    fn test_same_version_ignores_access_and_placement() {
        let now = Utc::now();
        let item = Item::new("k", json!("v1")).unwrap().created(now);
        let moved = item.touched().placed_in(TierId::new(2));
        assert!(item.same_version(&moved));

        let rewritten = Item::new("k", json!("v2")).unwrap().created(now);
        assert!(!item.same_version(&rewritten));

        let later = Item::new("k", json!("v1"))
            .unwrap()
            .created(now + chrono::Duration::seconds(1));
        assert!(!item.same_version(&later));
    }

    #[test]
    fn test_created_moves_expiry() {
        let item = Item::new("k", json!("v"))
            .unwrap()
            .with_ttl(Some(60))
            .created(Utc::now() - chrono::Duration::hours(1));
        assert!(item.is_expired());
    }
}
