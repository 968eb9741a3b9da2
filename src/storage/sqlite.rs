//! Durable Relational Backend
//!
//! SQLite tier built on `sqlx`. One row per key; expiry is stored as an
//! absolute timestamp (creation time plus ttl) so sweeps are a single
//! indexed delete. Payloads above the compression threshold are stored LZ4
//! compressed with the algorithm recorded per row.

use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use super::compression::{CompressionAlgorithm, CompressionConfig, CompressionManager};
use super::{BackendStats, SearchQuery, StorageBackend};
use crate::error::{Error, Result};
use crate::item::{Item, ItemRecord, Metadata};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS memory_items (
        key TEXT PRIMARY KEY NOT NULL,
        payload BLOB NOT NULL,
        compression TEXT NOT NULL DEFAULT 'none',
        metadata TEXT NOT NULL DEFAULT '{}',
        tier INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        accessed_at INTEGER NOT NULL,
        access_count INTEGER NOT NULL DEFAULT 0,
        size_bytes INTEGER NOT NULL,
        ttl_seconds INTEGER,
        expires_at INTEGER,
        checksum TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_memory_items_expires_at ON memory_items(expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_memory_items_access_count ON memory_items(access_count)",
];

const COLUMNS: &str = "key, payload, compression, metadata, tier, created_at, accessed_at, \
                       access_count, size_bytes, ttl_seconds, expires_at, checksum";

const UPSERT: &str = r#"
    INSERT INTO memory_items
    (key, payload, compression, metadata, tier, created_at, accessed_at,
     access_count, size_bytes, ttl_seconds, expires_at, checksum)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
    ON CONFLICT(key) DO UPDATE SET
        payload = excluded.payload,
        compression = excluded.compression,
        metadata = excluded.metadata,
        tier = excluded.tier,
        created_at = excluded.created_at,
        accessed_at = excluded.accessed_at,
        access_count = excluded.access_count,
        size_bytes = excluded.size_bytes,
        ttl_seconds = excluded.ttl_seconds,
        expires_at = excluded.expires_at,
        checksum = excluded.checksum
"#;

const INSERT_IF_ABSENT: &str = r#"
    INSERT INTO memory_items
    (key, payload, compression, metadata, tier, created_at, accessed_at,
     access_count, size_bytes, ttl_seconds, expires_at, checksum)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
    ON CONFLICT(key) DO NOTHING
"#;

const BATCH_UPSERT: &str = r#"
    INSERT INTO memory_items
    (key, payload, compression, metadata, tier, created_at, accessed_at,
     access_count, size_bytes, ttl_seconds, expires_at, checksum)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
    ON CONFLICT(key) DO UPDATE SET
        payload = excluded.payload,
        compression = excluded.compression,
        metadata = excluded.metadata,
        tier = excluded.tier,
        accessed_at = excluded.accessed_at,
        access_count = memory_items.access_count + 1,
        size_bytes = excluded.size_bytes,
        ttl_seconds = excluded.ttl_seconds,
        expires_at = excluded.expires_at,
        checksum = excluded.checksum
"#;

/// SQLite tier configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SqliteConfig {
    /// Connection URL, e.g. `sqlite::memory:` or `sqlite:///var/lib/tiermem.db`
    pub url: String,
    /// Pool size (forced to 1 for in-memory databases)
    pub max_connections: u32,
    /// How long a writer waits on a locked database
    pub busy_timeout: Duration,
    pub compression: CompressionConfig,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl SqliteConfig {
    /// Private in-memory database, gone when the backend closes
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            busy_timeout: Duration::from_secs(5),
            compression: CompressionConfig::default(),
        }
    }

    /// Database file, created if missing
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            url: format!("sqlite://{}", path.as_ref().display()),
            max_connections: 4,
            ..Self::in_memory()
        }
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// Durable SQLite tier
pub struct SqliteBackend {
    name: String,
    pool: SqlitePool,
    codec: CompressionManager,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    expired: AtomicU64,
}

impl SqliteBackend {
    /// Create the backend; connections open lazily on first use
    pub fn new(name: impl Into<String>, config: SqliteConfig) -> Result<Self> {
        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .busy_timeout(config.busy_timeout);

        let mut pool_options = SqlitePoolOptions::new();
        if config.is_memory() {
            // Each connection to :memory: is its own database; keep exactly one alive
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            options = options.journal_mode(SqliteJournalMode::Wal);
            pool_options = pool_options.max_connections(config.max_connections.max(1));
        }

        Ok(Self {
            name: name.into(),
            pool: pool_options.connect_lazy_with(options),
            codec: CompressionManager::new(config.compression),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        })
    }

    fn decode_row(&self, row: &SqliteRow) -> Result<Item> {
        let algorithm: String = row.try_get("compression")?;
        let payload: Vec<u8> = row.try_get("payload")?;
        let metadata: String = row.try_get("metadata")?;
        let ttl_seconds: Option<i64> = row.try_get("ttl_seconds")?;

        let record = ItemRecord {
            key: row.try_get("key")?,
            value: self.codec.decode(&payload, algorithm.parse()?)?,
            metadata: serde_json::from_str::<Metadata>(&metadata)?,
            tier: from_i64(row.try_get("tier")?) as usize,
            created_at: self.timestamp(row.try_get("created_at")?)?,
            accessed_at: self.timestamp(row.try_get("accessed_at")?)?,
            access_count: from_i64(row.try_get("access_count")?),
            size_bytes: from_i64(row.try_get("size_bytes")?),
            ttl_seconds: ttl_seconds.map(from_i64),
            checksum: row.try_get("checksum")?,
        };
        Item::from_record(record)
    }

    fn timestamp(&self, millis: i64) -> Result<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
            Error::permanent(&self.name, format!("invalid stored timestamp {}", millis))
        })
    }

    /// Run one of the insert statements; returns the affected row count
    async fn upsert<'e, E>(&self, executor: E, statement: &str, item: &Item) -> Result<u64>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let (payload, algorithm) = self.codec.encode(item.value())?;
        let metadata = serde_json::to_string(item.metadata())?;

        let result = sqlx::query(statement)
            .bind(item.key())
            .bind(payload.as_ref())
            .bind(algorithm.name())
            .bind(metadata)
            .bind(to_i64(item.tier().index() as u64))
            .bind(item.created_at().timestamp_millis())
            .bind(item.accessed_at().timestamp_millis())
            .bind(to_i64(item.access_count()))
            .bind(to_i64(item.size_bytes()))
            .bind(item.ttl_seconds().map(to_i64))
            .bind(item.expires_at().map(|at| at.timestamp_millis()))
            .bind(item.checksum())
            .execute(executor)
            .await?;

        if algorithm.is_compressed() {
            debug!(tier = %self.name, key = %item.key(), stored = payload.len(), "compressed payload");
        }
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!(tier = %self.name, "durable tier ready");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Item>> {
        let now = Utc::now().timestamp_millis();
        let sql = format!(
            "UPDATE memory_items \
             SET access_count = access_count + 1, accessed_at = MAX(accessed_at, ?1) \
             WHERE key = ?2 AND (expires_at IS NULL OR expires_at > ?1) \
             RETURNING {}",
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(now)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(self.decode_row(&row)?))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn peek(&self, key: &str) -> Result<Option<Item>> {
        let sql = format!(
            "SELECT {} FROM memory_items \
             WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .bind(Utc::now().timestamp_millis())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| self.decode_row(&row)).transpose()
    }

    async fn set(&self, item: Item) -> Result<()> {
        self.upsert(&self.pool, UPSERT, &item).await?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Expired rows do not count as resident
    async fn set_if_absent(&self, item: Item) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM memory_items WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2")
            .bind(item.key())
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;
        let inserted = self.upsert(&mut *tx, INSERT_IF_ABSENT, &item).await? > 0;
        tx.commit().await?;

        if inserted {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(inserted)
    }

    async fn delete_version(&self, item: &Item) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM memory_items WHERE key = ?1 AND checksum = ?2 AND created_at = ?3",
        )
        .bind(item.key())
        .bind(item.checksum())
        .bind(item.created_at().timestamp_millis())
        .execute(&self.pool)
        .await?;
        let removed = result.rows_affected() > 0;
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM memory_items WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected() > 0;
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM memory_items WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        )
        .bind(key)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// All-or-nothing upsert; rewriting an existing key counts as an access
    async fn set_batch(&self, items: Vec<Item>) -> Result<Vec<Result<()>>> {
        let mut tx = self.pool.begin().await?;
        for item in &items {
            self.upsert(&mut *tx, BATCH_UPSERT, item).await?;
        }
        tx.commit().await?;

        self.writes.fetch_add(items.len() as u64, Ordering::Relaxed);
        Ok(items.iter().map(|_| Ok(())).collect())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Item>> {
        let glob = query
            .pattern
            .as_ref()
            .map(|p| p.as_str())
            .filter(|p| !p.contains('[') && !p.contains(']'));

        let mut sql = format!(
            "SELECT {} FROM memory_items WHERE (expires_at IS NULL OR expires_at > ?1)",
            COLUMNS
        );
        if glob.is_some() {
            sql.push_str(" AND key GLOB ?2");
        }
        sql.push_str(" ORDER BY access_count DESC, key ASC");
        let push_limit = query.metadata_filter.is_none() && glob.is_some() == query.pattern.is_some();
        if push_limit {
            sql.push_str(&format!(" LIMIT {}", to_i64(query.limit as u64)));
        }

        let mut statement = sqlx::query(&sql).bind(Utc::now().timestamp_millis());
        if let Some(glob) = glob {
            statement = statement.bind(glob);
        }
        let rows = statement.fetch_all(&self.pool).await?;

        let mut items = Vec::new();
        for row in &rows {
            let item = self.decode_row(row)?;
            if query.matches(&item) {
                items.push(item);
                if items.len() >= query.limit {
                    break;
                }
            }
        }
        Ok(items)
    }

    /// Least recently accessed items first
    async fn sample(&self, limit: usize) -> Result<Vec<Item>> {
        let sql = format!(
            "SELECT {} FROM memory_items \
             WHERE (expires_at IS NULL OR expires_at > ?1) \
             ORDER BY accessed_at ASC LIMIT ?2",
            COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(Utc::now().timestamp_millis())
            .bind(to_i64(limit as u64))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| self.decode_row(row)).collect()
    }

    async fn stats(&self) -> Result<BackendStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total_items, COALESCE(SUM(size_bytes), 0) AS total_size \
             FROM memory_items",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(BackendStats {
            total_items: from_i64(row.try_get("total_items")?),
            total_size_bytes: from_i64(row.try_get("total_size")?),
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
        let result = sqlx::query(
            "DELETE FROM memory_items WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        )
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        self.expired.fetch_add(removed, Ordering::Relaxed);
        Ok(removed as usize)
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KeyPattern;
    use crate::tier::TierId;
    use serde_json::json;

    async fn backend() -> SqliteBackend {
        let backend = SqliteBackend::new("durable", SqliteConfig::in_memory()).unwrap();
        backend.initialize().await.unwrap();
        backend
    }

    fn item(key: &str, value: serde_json::Value) -> Item {
        Item::new(key, value).unwrap()
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let backend = backend().await;
        let mut metadata = Metadata::new();
        metadata.insert("source".into(), json!("chat"));
        let original = item("user:1", json!({"name": "A"}))
            .with_metadata(metadata)
            .with_ttl(Some(3600))
            .placed_in(TierId::new(2));
        backend.set(original.clone()).await.unwrap();

        let found = backend.get("user:1").await.unwrap().unwrap();
        assert_eq!(found.value(), original.value());
        assert_eq!(found.metadata(), original.metadata());
        assert_eq!(found.tier(), TierId::new(2));
        assert_eq!(found.ttl_seconds(), Some(3600));
        assert_eq!(found.checksum(), original.checksum());
        assert_eq!(found.access_count(), 1);
        assert!(found.verify_integrity());
    }

    #[tokio::test]
    async fn test_conditional_writes_respect_resident_version() {
        let backend = backend().await;
        let first = item("k", json!("v1"));
        assert!(backend.set_if_absent(first.clone()).await.unwrap());
        assert!(!backend.set_if_absent(item("k", json!("v2"))).await.unwrap());

        let second = item("k", json!("v2")).created(first.created_at() + chrono::Duration::seconds(1));
        backend.set(second.clone()).await.unwrap();
        assert!(!backend.delete_version(&first).await.unwrap());
        assert!(backend.exists("k").await.unwrap());

        // version read back from the table, timestamps truncated to millis
        let stored = backend.peek("k").await.unwrap().unwrap();
        assert!(backend.delete_version(&stored).await.unwrap());
        assert!(!backend.exists("k").await.unwrap());

        let expired = item("gone", json!(0))
            .with_ttl(Some(1))
            .created(Utc::now() - chrono::Duration::seconds(10));
        backend.set(expired).await.unwrap();
        assert!(backend.set_if_absent(item("gone", json!(1))).await.unwrap());
        assert_eq!(backend.peek("gone").await.unwrap().unwrap().value(), &json!(1));
    }

    #[tokio::test]
    async fn test_get_increments_and_peek_does_not() {
        let backend = backend().await;
        backend.set(item("k", json!(1))).await.unwrap();

        backend.get("k").await.unwrap();
        backend.get("k").await.unwrap();
        assert_eq!(backend.peek("k").await.unwrap().unwrap().access_count(), 2);
        assert_eq!(backend.peek("k").await.unwrap().unwrap().access_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_key() {
        let backend = backend().await;
        assert!(backend.get("nope").await.unwrap().is_none());
        assert!(!backend.exists("nope").await.unwrap());
        assert!(!backend.delete("nope").await.unwrap());
        assert_eq!(backend.stats().await.unwrap().misses, 1);
    }

    #[tokio::test]
    async fn test_large_payload_compressed_transparently() {
        let backend = backend().await;
        let value = json!({"text": "tiered memory ".repeat(2000)});
        backend.set(item("big", value.clone())).await.unwrap();

        let row = sqlx::query("SELECT compression, LENGTH(payload) AS len, size_bytes FROM memory_items WHERE key = 'big'")
            .fetch_one(&backend.pool)
            .await
            .unwrap();
        let algorithm: String = row.try_get("compression").unwrap();
        let stored: i64 = row.try_get("len").unwrap();
        let logical: i64 = row.try_get("size_bytes").unwrap();
        assert_eq!(algorithm, "lz4");
        assert!(stored < logical);

        let found = backend.get("big").await.unwrap().unwrap();
        assert_eq!(found.value(), &value);
    }

    #[tokio::test]
    async fn test_expiry_is_absolute_and_swept() {
        let backend = backend().await;
        let past = Utc::now() - chrono::Duration::seconds(120);
        backend
            .set(item("stale", json!(1)).with_ttl(Some(60)).created(past))
            .await
            .unwrap();
        backend
            .set(item("fresh", json!(1)).with_ttl(Some(60)))
            .await
            .unwrap();

        assert!(backend.get("stale").await.unwrap().is_none());
        assert!(!backend.exists("stale").await.unwrap());
        assert!(backend.exists("fresh").await.unwrap());

        assert_eq!(backend.cleanup_expired().await.unwrap(), 1);
        assert_eq!(backend.stats().await.unwrap().total_items, 1);
    }

    #[tokio::test]
    async fn test_batch_upsert_increments_access_count() {
        let backend = backend().await;
        backend.set(item("a", json!(1))).await.unwrap();

        let outcomes = backend
            .set_batch(vec![item("a", json!(2)), item("b", json!(3))])
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.is_ok()));

        let a = backend.peek("a").await.unwrap().unwrap();
        assert_eq!(a.value(), &json!(2));
        assert_eq!(a.access_count(), 1);
        assert_eq!(backend.peek("b").await.unwrap().unwrap().access_count(), 0);
    }

    #[tokio::test]
    async fn test_search_glob_and_order() {
        let backend = backend().await;
        for key in ["user:1", "user:2", "user:3", "team:1"] {
            backend.set(item(key, json!(key))).await.unwrap();
        }
        for _ in 0..3 {
            backend.get("user:3").await.unwrap();
        }
        backend.get("user:1").await.unwrap();

        let query = SearchQuery::all(2).with_pattern(KeyPattern::new("user:*").unwrap());
        let found = backend.search(&query).await.unwrap();
        let keys: Vec<_> = found.iter().map(|i| i.key()).collect();
        assert_eq!(keys, vec!["user:3", "user:1"]);
    }

    #[tokio::test]
    async fn test_search_metadata_filter() {
        let backend = backend().await;
        let mut metadata = Metadata::new();
        metadata.insert("lang".into(), json!("en"));
        backend
            .set(item("a", json!(1)).with_metadata(metadata.clone()))
            .await
            .unwrap();
        backend.set(item("b", json!(2))).await.unwrap();

        let found = backend
            .search(&SearchQuery::all(10).with_metadata_filter(metadata))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key(), "a");
    }

    #[tokio::test]
    async fn test_sample_prefers_idle_items() {
        let backend = backend().await;
        let past = Utc::now() - chrono::Duration::hours(2);
        backend.set(item("idle", json!(1)).created(past)).await.unwrap();
        backend.set(item("busy", json!(1))).await.unwrap();

        let sample = backend.sample(1).await.unwrap();
        assert_eq!(sample.len(), 1);
        assert_eq!(sample[0].key(), "idle");
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiers.db");

        let first = SqliteBackend::new("durable", SqliteConfig::file(&path)).unwrap();
        first.initialize().await.unwrap();
        first.set(item("persisted", json!({"v": 1}))).await.unwrap();
        first.close().await.unwrap();

        let second = SqliteBackend::new("durable", SqliteConfig::file(&path)).unwrap();
        second.initialize().await.unwrap();
        let found = second.get("persisted").await.unwrap().unwrap();
        assert_eq!(found.value(), &json!({"v": 1}));
        second.close().await.unwrap();
    }
}
