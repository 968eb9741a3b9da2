//! tiermem Integration Tests
//!
//! Exercises the public API end to end:
//! - Engine facade: reads, writes, deletes, search, batch, TTL
//! - Bounded tiers and eviction order
//! - Optimizer decisions and the promotion scenario
//! - Configuration and the durable tier

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;

use tiermem::config::{EngineConfig, OptimizerConfig, TierConfig};
use tiermem::storage::{EvictionPolicyKind, MemoryBackend, MemoryConfig, StorageBackend};
use tiermem::{
    Error, Item, LatencyClass, Manager, Operation, ResultStatus, SearchRequest, SetOptions,
    TierDescriptor, TierId,
};

fn quiet(mut config: EngineConfig) -> EngineConfig {
    config.optimizer = OptimizerConfig {
        background_enabled: false,
        ..config.optimizer
    };
    config
}

async fn default_manager() -> Manager {
    Manager::from_config(quiet(EngineConfig::default()))
        .await
        .unwrap()
}

// =============================================================================
// Engine Facade
// =============================================================================

mod engine_tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get_returns_value() {
        let manager = default_manager().await;

        manager.set("user:1", json!({"name": "A"})).await.unwrap();
        assert_eq!(
            manager.get("user:1").await.unwrap(),
            Some(json!({"name": "A"}))
        );

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_large_payload_lands_in_durable_tier() {
        let manager = default_manager().await;
        let payload = json!("z".repeat(100 * 1024));

        manager.set("blob", payload.clone()).await.unwrap();
        let item = manager.get_item("blob").await.unwrap().unwrap();
        assert_eq!(item.tier(), TierId::new(2));
        assert_eq!(item.value(), &payload);
        assert!(item.verify_integrity());
    }

    #[tokio::test]
    async fn test_delete_clears_every_tier() {
        let manager = default_manager().await;
        for tier in manager.hierarchy().tiers() {
            let item = Item::new("dup", json!(tier.name())).unwrap();
            tier.backend().set(item.placed_in(tier.id())).await.unwrap();
        }

        assert!(manager.delete("dup").await.unwrap());
        assert_eq!(manager.get("dup").await.unwrap(), None);
        for tier in manager.hierarchy().tiers() {
            assert!(!tier.backend().exists("dup").await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_search_filters_dedups_and_ranks() {
        let manager = default_manager().await;
        for i in 0..5 {
            manager.set(&format!("user:{}", i), json!(i)).await.unwrap();
        }
        manager.set("order:1", json!("o")).await.unwrap();
        // stale copy in the durable tier must not produce a duplicate
        let durable = manager.hierarchy().slowest();
        durable
            .backend()
            .set(Item::new("user:0", json!("stale")).unwrap().placed_in(durable.id()))
            .await
            .unwrap();
        for _ in 0..4 {
            manager.get("user:3").await.unwrap();
        }
        manager.get("user:1").await.unwrap();

        let results = manager
            .search(SearchRequest::pattern("user:*").with_limit(3))
            .await
            .unwrap();

        let keys: Vec<&str> = results.iter().map(|i| i.key()).collect();
        assert_eq!(keys, vec!["user:3", "user:1", "user:0"]);
        assert_eq!(results[2].value(), &json!(0));
    }

    #[tokio::test]
    async fn test_ttl_expiry_and_cleanup() {
        let manager = default_manager().await;
        manager
            .set_with("session", json!("s"), SetOptions::default().ttl(1))
            .await
            .unwrap();
        assert!(manager.exists("session").await.unwrap());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        manager.cleanup().await.unwrap();

        assert_eq!(manager.get("session").await.unwrap(), None);
        assert!(!manager.exists("session").await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_preserves_input_order() {
        let manager = default_manager().await;
        manager.set("a", json!(1)).await.unwrap();

        let results = manager
            .batch(vec![
                Operation::get("missing"),
                Operation::set("", json!(0)),
                Operation::get("a"),
                Operation::delete("a"),
                Operation::set("b", json!(2)),
            ])
            .await
            .unwrap();

        let summary: Vec<(&str, ResultStatus)> =
            results.iter().map(|r| (r.key.as_str(), r.status)).collect();
        assert_eq!(
            summary,
            vec![
                ("missing", ResultStatus::NotFound),
                ("", ResultStatus::Failed),
                ("a", ResultStatus::Ok),
                ("a", ResultStatus::Ok),
                ("b", ResultStatus::Ok),
            ]
        );
        assert_eq!(results[2].value, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_concurrent_writers_last_write_wins() {
        let manager = default_manager().await;
        let hint = SetOptions::default().tier(TierId::new(1));

        let (first, second) = tokio::join!(
            manager.set_with("race", json!("v1"), hint.clone()),
            manager.set_with("race", json!("v2"), hint.clone()),
        );
        first.unwrap();
        second.unwrap();

        let value = manager.get("race").await.unwrap().unwrap();
        assert!(value == json!("v1") || value == json!("v2"));
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let manager = default_manager().await;
        manager.close().await.unwrap();

        assert_matches!(manager.get("k").await, Err(Error::Closed));
        assert_matches!(manager.delete("k").await, Err(Error::Closed));
        assert_matches!(
            manager.search(SearchRequest::default()).await,
            Err(Error::Closed)
        );
        manager.close().await.unwrap();
    }
}

// =============================================================================
// Eviction
// =============================================================================

mod eviction_tests {
    use super::*;

    #[tokio::test]
    async fn test_lru_evicts_least_recently_touched() {
        let backend = MemoryBackend::new(
            "lru",
            MemoryConfig::with_max_items(3, EvictionPolicyKind::Lru),
        );
        for key in ["a", "b", "c"] {
            backend.set(Item::new(key, json!(key)).unwrap()).await.unwrap();
        }
        backend.get("a").await.unwrap();
        backend.set(Item::new("d", json!("d")).unwrap()).await.unwrap();

        assert!(backend.contains("a"));
        assert!(!backend.contains("b"));
        assert!(backend.contains("c"));
        assert!(backend.contains("d"));
        assert_eq!(backend.stats().await.unwrap().evictions, 1);
    }

    #[tokio::test]
    async fn test_fifo_ignores_access() {
        let backend = MemoryBackend::new(
            "fifo",
            MemoryConfig::with_max_items(2, EvictionPolicyKind::Fifo),
        );
        backend.set(Item::new("first", json!(1)).unwrap()).await.unwrap();
        backend.set(Item::new("second", json!(2)).unwrap()).await.unwrap();
        for _ in 0..5 {
            backend.get("first").await.unwrap();
        }

        backend.set(Item::new("third", json!(3)).unwrap()).await.unwrap();
        assert!(!backend.contains("first"));

        backend.set(Item::new("fourth", json!(4)).unwrap()).await.unwrap();
        assert!(!backend.contains("second"));
        assert!(backend.contains("third"));
        assert!(backend.contains("fourth"));
    }
}

// =============================================================================
// Optimizer
// =============================================================================

mod optimizer_tests {
    use super::*;
    use chrono::Utc;
    use tiermem::{Optimizer, TierHierarchy};

    fn hierarchy() -> TierHierarchy {
        let tiers: Vec<(TierDescriptor, Arc<dyn StorageBackend>)> = ["hot", "warm", "cold"]
            .iter()
            .zip([LatencyClass::Memory, LatencyClass::Local, LatencyClass::Remote])
            .map(|(name, latency)| {
                let backend: Arc<dyn StorageBackend> =
                    Arc::new(MemoryBackend::new(*name, MemoryConfig::unbounded()));
                (TierDescriptor::new(*name, latency), backend)
            })
            .collect();
        TierHierarchy::new(tiers).unwrap()
    }

    #[test]
    fn test_burst_on_slowest_tier_promotes() {
        let optimizer = Optimizer::new(OptimizerConfig::default());
        optimizer.initialize(&hierarchy());
        let now = Utc::now();
        let item = Item::new("burst", json!(1)).unwrap().placed_in(TierId::new(2));

        for i in 0..50 {
            optimizer.record_access_at("burst", 8, now + chrono::Duration::milliseconds(i * 20));
        }

        let target = optimizer.should_promote_at(&item, now + chrono::Duration::seconds(1));
        assert_eq!(target, Some(TierId::new(1)));
    }

    #[test]
    fn test_idle_item_demotes_one_level() {
        let optimizer = Optimizer::new(OptimizerConfig::default());
        optimizer.initialize(&hierarchy());
        let now = Utc::now();
        let item = Item::new("idle", json!(1))
            .unwrap()
            .created(now - chrono::Duration::hours(2))
            .placed_in(TierId::new(0));

        assert_eq!(optimizer.should_demote_at(&item, now), Some(TierId::new(1)));

        let cold = item.placed_in(TierId::new(2));
        assert_eq!(optimizer.should_demote_at(&cold, now), None);
    }

    #[tokio::test]
    async fn test_repeated_reads_record_promotion() {
        let manager = default_manager().await;
        manager.set("user:1", json!({"name": "A"})).await.unwrap();

        for _ in 0..10 {
            manager.get("user:1").await.unwrap();
        }
        manager.optimize().await.unwrap();

        let mut promotions = 0;
        for _ in 0..50 {
            promotions = manager.metrics().windows[0]
                .migrations_by_reason
                .get("promotion")
                .copied()
                .unwrap_or(0);
            if promotions > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(promotions >= 1);
        assert!(manager.export_prometheus().unwrap().contains("promotion"));
    }
}

// =============================================================================
// Configuration and Durability
// =============================================================================

mod config_tests {
    use super::*;

    #[test]
    fn test_yaml_config_round_trip() {
        let yaml = r#"
engine:
  max_concurrency: 8
tiers:
  - name: hot
    kind: memory
    max_items: 1000
    eviction_policy: lfu
  - name: archive
    kind: sqlite
    path: "sqlite::memory:"
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.engine.max_concurrency, 8);
        assert_eq!(config.tiers.len(), 2);
        assert_eq!(config.tiers[0].eviction_policy, EvictionPolicyKind::Lfu);
        assert_eq!(config.tiers[1].latency_class(), LatencyClass::Local);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert_matches!(
            EngineConfig::from_yaml("tiers:\n  - name: t\n    kind: memory\n    max_items: 0\n"),
            Err(Error::Config(_))
        );
        assert_matches!(
            EngineConfig::from_yaml("tiers:\n  - name: t\n    kind: memory\n    eviction_policy: random\n"),
            Err(Error::ConfigParse(_))
        );
        assert_matches!(
            EngineConfig::from_yaml("tiers: []\n"),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_builder_requires_a_tier() {
        let result = tokio_test::block_on(Manager::builder().build());
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_sqlite_tier_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiermem.db");
        let config = quiet(EngineConfig {
            tiers: vec![TierConfig::sqlite("durable", &path.display().to_string())],
            ..EngineConfig::default()
        });

        let manager = Manager::from_config(config.clone()).await.unwrap();
        manager.set("persisted", json!({"v": 1})).await.unwrap();
        manager.close().await.unwrap();

        let reopened = Manager::from_config(config).await.unwrap();
        assert_eq!(
            reopened.get("persisted").await.unwrap(),
            Some(json!({"v": 1}))
        );
        reopened.close().await.unwrap();
    }
}
