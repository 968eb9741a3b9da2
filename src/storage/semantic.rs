//! Semantic Backend
//!
//! In-process tier that can rank items by similarity to free text. Each item
//! is embedded as a hashed term-frequency vector over the words of its key,
//! its textual value and its metadata, normalized to unit length, so the dot
//! product of two embeddings is their cosine similarity.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry as Slot;
use dashmap::DashMap;
use serde_json::Value;

use super::{rank_by_access, BackendStats, SearchQuery, StorageBackend};
use crate::error::Result;
use crate::item::Item;

/// Semantic tier configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticConfig {
    /// Embedding width
    pub dimensions: usize,
    /// Results below this cosine similarity are dropped
    pub min_similarity: f32,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            dimensions: 256,
            min_similarity: 0.1,
        }
    }
}

#[derive(Clone)]
struct Entry {
    item: Item,
    embedding: Vec<f32>,
}

/// Vector-similarity tier
pub struct SemanticBackend {
    name: String,
    config: SemanticConfig,
    entries: DashMap<String, Entry>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    expired: AtomicU64,
}

impl SemanticBackend {
    pub fn new(name: impl Into<String>, config: SemanticConfig) -> Self {
        Self {
            name: name.into(),
            config: SemanticConfig {
                dimensions: config.dimensions.max(1),
                ..config
            },
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Embed free text into this backend's vector space
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.config.dimensions];
        for token in tokenize(text) {
            let bucket = (fnv1a(token.as_bytes()) % self.config.dimensions as u64) as usize;
            vector[bucket] += 1.0;
        }
        normalize(&mut vector);
        vector
    }

    fn embed_item(&self, item: &Item) -> Vec<f32> {
        let mut text = String::from(item.key());
        collect_text(item.value(), &mut text);
        for (key, value) in item.metadata() {
            text.push(' ');
            text.push_str(key);
            collect_text(value, &mut text);
        }
        self.embed_text(&text)
    }
}

#[async_trait]
impl StorageBackend for SemanticBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Item>> {
        let now = Utc::now();
        let mut expired = false;

        let found = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.item.is_expired_at(now) => {
                entry.item = entry.item.touched_at(now);
                Some(entry.item.clone())
            }
            Some(_) => {
                expired = true;
                None
            }
            None => None,
        };

        if expired {
            self.entries.remove(key);
            self.expired.fetch_add(1, Ordering::Relaxed);
        }
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        Ok(found)
    }

    async fn peek(&self, key: &str) -> Result<Option<Item>> {
        let now = Utc::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| !entry.item.is_expired_at(now))
            .map(|entry| entry.item.clone()))
    }

    async fn set(&self, item: Item) -> Result<()> {
        let embedding = self.embed_item(&item);
        self.entries
            .insert(item.key().to_string(), Entry { item, embedding });
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn set_if_absent(&self, item: Item) -> Result<bool> {
        let now = Utc::now();
        let embedding = self.embed_item(&item);
        match self.entries.entry(item.key().to_string()) {
            Slot::Occupied(slot) if !slot.get().item.is_expired_at(now) => return Ok(false),
            Slot::Occupied(mut slot) => {
                slot.insert(Entry { item, embedding });
            }
            Slot::Vacant(slot) => {
                slot.insert(Entry { item, embedding });
            }
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn delete_version(&self, item: &Item) -> Result<bool> {
        let removed = self
            .entries
            .remove_if(item.key(), |_, entry| entry.item.same_version(item))
            .is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.peek(key).await?.is_some())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Item>> {
        let now = Utc::now();
        let mut matches: Vec<Item> = self
            .entries
            .iter()
            .filter(|entry| !entry.item.is_expired_at(now) && query.matches(&entry.item))
            .map(|entry| entry.item.clone())
            .collect();
        rank_by_access(&mut matches, query.limit);
        Ok(matches)
    }

    fn supports_semantic(&self) -> bool {
        true
    }

    async fn semantic_search(&self, query: &str, limit: usize) -> Result<Vec<Item>> {
        let wanted = self.embed_text(query);
        if wanted.iter().all(|x| *x == 0.0) {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut scored: Vec<(f32, Item)> = self
            .entries
            .iter()
            .filter(|entry| !entry.item.is_expired_at(now))
            .map(|entry| (dot(&wanted, &entry.embedding), entry.item.clone()))
            .filter(|(score, _)| *score >= self.config.min_similarity)
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.key().cmp(b.1.key()))
        });
        scored.truncate(limit);
        Ok(scored.into_iter().map(|(_, item)| item).collect())
    }

    async fn stats(&self) -> Result<BackendStats> {
        let total_size_bytes = self.entries.iter().map(|e| e.item.size_bytes()).sum();
        Ok(BackendStats {
            total_items: self.entries.len() as u64,
            total_size_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: 0,
            expired: self.expired.load(Ordering::Relaxed),
            max_items: None,
            max_bytes: None,
        })
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.item.is_expired_at(now));
        let removed = before.saturating_sub(self.entries.len());
        self.expired.fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    async fn close(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

// =============================================================================
// Text features
// =============================================================================

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
}

/// Append every string, number and object key in a JSON value
fn collect_text(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push(' ');
            out.push_str(s);
        }
        Value::Number(n) => {
            out.push(' ');
            out.push_str(&n.to_string());
        }
        Value::Array(values) => values.iter().for_each(|v| collect_text(v, out)),
        Value::Object(map) => {
            for (k, v) in map {
                out.push(' ');
                out.push_str(k);
                collect_text(v, out);
            }
        }
        Value::Bool(_) | Value::Null => {}
    }
}

/// FNV-1a, stable across runs
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Metadata;
    use serde_json::json;

    fn backend() -> SemanticBackend {
        SemanticBackend::new("vectors", SemanticConfig::default())
    }

    #[test]
    fn test_embedding_is_unit_length_and_deterministic() {
        let backend = backend();
        let a = backend.embed_text("The cat sat on the mat");
        let b = backend.embed_text("the CAT sat on the mat");

        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_conditional_writes_respect_resident_version() {
        let backend = backend();
        let first = Item::new("note", json!("cats")).unwrap();
        assert!(backend.set_if_absent(first.clone()).await.unwrap());
        assert!(!backend
            .set_if_absent(Item::new("note", json!("dogs")).unwrap())
            .await
            .unwrap());

        let second = Item::new("note", json!("dogs")).unwrap();
        backend.set(second.clone()).await.unwrap();
        assert!(!backend.delete_version(&first).await.unwrap());
        assert!(backend.delete_version(&second).await.unwrap());
        assert!(!backend.exists("note").await.unwrap());
    }

    #[test]
    fn test_empty_text_embeds_to_zero() {
        let backend = backend();
        assert!(backend.embed_text("  ! ").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_single_letters_are_ignored() {
        let tokens: Vec<_> = tokenize("a Beta, c gamma").collect();
        assert_eq!(tokens, vec!["beta", "gamma"]);
    }

    #[tokio::test]
    async fn test_semantic_search_ranks_related_items_first() {
        let backend = backend();
        backend
            .set(Item::new("note:rust", json!("rust ownership and borrowing rules")).unwrap())
            .await
            .unwrap();
        backend
            .set(Item::new("note:garden", json!("tomato plants need sunlight and water")).unwrap())
            .await
            .unwrap();
        let mut metadata = Metadata::new();
        metadata.insert("topic".into(), json!("borrowing checker"));
        backend
            .set(
                Item::new("note:compiler", json!("the compiler rejects dangling references"))
                    .unwrap()
                    .with_metadata(metadata),
            )
            .await
            .unwrap();

        let results = backend
            .semantic_search("how does borrowing work in rust", 2)
            .await
            .unwrap();

        assert!(!results.is_empty());
        assert_eq!(results[0].key(), "note:rust");
        assert!(results.iter().all(|i| i.key() != "note:garden"));
    }

    #[tokio::test]
    async fn test_semantic_search_empty_query() {
        let backend = backend();
        backend.set(Item::new("k", json!("text")).unwrap()).await.unwrap();
        assert!(backend.semantic_search("", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_basic_storage_contract() {
        let backend = backend();
        backend.set(Item::new("k", json!("v")).unwrap()).await.unwrap();

        assert!(backend.exists("k").await.unwrap());
        assert_eq!(backend.get("k").await.unwrap().unwrap().access_count(), 1);
        assert_eq!(backend.peek("k").await.unwrap().unwrap().access_count(), 1);
        assert!(backend.delete("k").await.unwrap());
        assert!(backend.get("k").await.unwrap().is_none());

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.deletes, 1);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let backend = backend();
        let past = Utc::now() - chrono::Duration::seconds(10);
        backend
            .set(Item::new("old", json!(1)).unwrap().with_ttl(Some(1)).created(past))
            .await
            .unwrap();
        backend.set(Item::new("new", json!(1)).unwrap()).await.unwrap();

        assert_eq!(backend.cleanup_expired().await.unwrap(), 1);
        assert_eq!(backend.stats().await.unwrap().total_items, 1);
    }
}
