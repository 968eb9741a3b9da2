//! Batched operations
//!
//! A batch takes a single admission slot. Operations are grouped by kind and
//! the groups run in the order each kind first appears; results come back in
//! input order, one per operation, and a failing operation never fails the
//! batch.

use std::collections::HashMap;
use std::time::Instant;

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Manager, SetOptions};
use crate::error::{Error, Result};
use crate::item::{validate_key, Item};
use crate::metrics::OperationKind;
use crate::tier::TierId;

/// One operation of a batch
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: Value,
        options: SetOptions,
    },
    Delete {
        key: String,
    },
}

impl Operation {
    pub fn get(key: impl Into<String>) -> Self {
        Operation::Get { key: key.into() }
    }

    pub fn set(key: impl Into<String>, value: Value) -> Self {
        Self::set_with(key, value, SetOptions::default())
    }

    pub fn set_with(key: impl Into<String>, value: Value, options: SetOptions) -> Self {
        Operation::Set {
            key: key.into(),
            value,
            options,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Operation::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Operation::Get { key } | Operation::Set { key, .. } | Operation::Delete { key } => key,
        }
    }

    fn kind(&self) -> OperationKind {
        match self {
            Operation::Get { .. } => OperationKind::Get,
            Operation::Set { .. } => OperationKind::Set,
            Operation::Delete { .. } => OperationKind::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Ok,
    NotFound,
    Failed,
}

/// Outcome of one batched operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    pub key: String,
    pub status: ResultStatus,
    /// Value read by a get
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error classification, see [`Error::kind`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl OperationResult {
    fn ok(key: &str, value: Option<Value>) -> Self {
        Self {
            key: key.to_string(),
            status: ResultStatus::Ok,
            value,
            error: None,
            error_kind: None,
        }
    }

    fn not_found(key: &str) -> Self {
        Self {
            status: ResultStatus::NotFound,
            ..Self::ok(key, None)
        }
    }

    fn failed(key: &str, error: &Error) -> Self {
        Self {
            status: ResultStatus::Failed,
            error: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
            ..Self::ok(key, None)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResultStatus::Ok
    }
}

impl Manager {
    /// Run `operations` under one admission slot
    pub async fn batch(&self, operations: Vec<Operation>) -> Result<Vec<OperationResult>> {
        let _permit = self.admit().await?;
        let start = Instant::now();

        let mut order: Vec<OperationKind> = Vec::new();
        let mut groups: HashMap<OperationKind, Vec<(usize, Operation)>> = HashMap::new();
        let keys: Vec<String> = operations.iter().map(|op| op.key().to_string()).collect();
        for (index, operation) in operations.into_iter().enumerate() {
            let kind = operation.kind();
            if !order.contains(&kind) {
                order.push(kind);
            }
            groups.entry(kind).or_default().push((index, operation));
        }

        let total = groups.values().map(Vec::len).sum();
        let mut results: Vec<Option<OperationResult>> = vec![None; total];
        for kind in order {
            let group = groups.remove(&kind).unwrap_or_default();
            let outcomes = match kind {
                OperationKind::Get => self.batch_get(group).await,
                OperationKind::Set => self.batch_set(group).await,
                _ => self.batch_delete(group).await,
            };
            for (index, result) in outcomes {
                results[index] = Some(result);
            }
        }

        self.inner
            .metrics
            .record_operation(OperationKind::Batch, start.elapsed());
        debug!(operations = total, elapsed = ?start.elapsed(), "Batch complete");

        Ok(results
            .into_iter()
            .zip(&keys)
            .map(|(result, key)| {
                result.unwrap_or_else(|| {
                    OperationResult::failed(key, &Error::Internal("missing batch result".into()))
                })
            })
            .collect())
    }

    /// Reads walk the tiers with one `get_batch` per tier for the keys still
    /// missing
    async fn batch_get(&self, group: Vec<(usize, Operation)>) -> Vec<(usize, OperationResult)> {
        let start = Instant::now();
        let mut outcomes = Vec::with_capacity(group.len());
        let mut pending: Vec<(usize, String)> = Vec::new();
        for (index, operation) in group {
            let key = operation.key().to_string();
            match validate_key(&key) {
                Ok(()) => pending.push((index, key)),
                Err(e) => outcomes.push((index, OperationResult::failed(&key, &e))),
            }
        }

        let mut failure: Option<Error> = None;
        for tier in self.inner.hierarchy.tiers() {
            if pending.is_empty() {
                break;
            }
            let keys: Vec<String> = pending.iter().map(|(_, key)| key.clone()).collect();
            let keys = &keys;
            let fetched = self
                .call(tier, "get_batch", |b| async move { b.get_batch(keys).await })
                .await;

            let mut found = match fetched {
                Ok(found) => found,
                Err(e) => {
                    warn!(tier = %tier.name(), error = %e, "Tier batch read failed");
                    failure.get_or_insert(e);
                    continue;
                }
            };

            pending.retain(|(index, key)| match found.remove(key) {
                Some(item) => {
                    let item = item.placed_in(tier.id());
                    self.on_hit(&item);
                    self.inner.metrics.record_get(Some(tier.id()), start.elapsed());
                    outcomes.push((*index, OperationResult::ok(key, Some(item.into_value()))));
                    false
                }
                None => true,
            });
        }

        for (index, key) in pending {
            let result = match &failure {
                Some(e) => {
                    self.inner
                        .metrics
                        .record_error(OperationKind::Get, e, start.elapsed());
                    OperationResult::failed(&key, e)
                }
                None => {
                    self.inner.metrics.record_get(None, start.elapsed());
                    OperationResult::not_found(&key)
                }
            };
            outcomes.push((index, result));
        }
        outcomes
    }

    /// Writes are grouped by preferred tier into one `set_batch` each; items
    /// that tier refuses fall back along their own placement order
    async fn batch_set(&self, group: Vec<(usize, Operation)>) -> Vec<(usize, OperationResult)> {
        let start = Instant::now();
        let mut outcomes = Vec::with_capacity(group.len());
        let mut by_tier: Vec<(TierId, Vec<(usize, Item, Vec<TierId>, bool)>)> = Vec::new();

        for (index, operation) in group {
            let (key, value, options) = match operation {
                Operation::Set {
                    key,
                    value,
                    options,
                } => (key, value, options),
                other => {
                    let e = Error::Internal(format!("{:?} routed to batch writes", other.kind()));
                    outcomes.push((index, OperationResult::failed(other.key(), &e)));
                    continue;
                }
            };
            let item = match self.prepare(&key, value, &options) {
                Ok(item) => item,
                Err(e) => {
                    self.inner
                        .metrics
                        .record_error(OperationKind::Set, &e, start.elapsed());
                    outcomes.push((index, OperationResult::failed(&key, &e)));
                    continue;
                }
            };

            let (order, pinned) = match options.tier {
                Some(tier) => (vec![tier], true),
                None => (self.placement_order(item.size_bytes()), false),
            };
            let Some((&primary, rest)) = order.split_first() else {
                let e = Error::Internal(format!("no tier can place key {}", key));
                self.inner
                    .metrics
                    .record_error(OperationKind::Set, &e, start.elapsed());
                outcomes.push((index, OperationResult::failed(&key, &e)));
                continue;
            };
            let entry = (index, item.placed_in(primary), rest.to_vec(), pinned);
            match by_tier.iter_mut().find(|(tier, _)| *tier == primary) {
                Some((_, entries)) => entries.push(entry),
                None => by_tier.push((primary, vec![entry])),
            }
        }

        for (tier_id, entries) in by_tier {
            let tier = match self.inner.hierarchy.tier(tier_id) {
                Ok(tier) => tier,
                Err(e) => {
                    for (index, item, _, _) in &entries {
                        self.inner
                            .metrics
                            .record_error(OperationKind::Set, &e, start.elapsed());
                        outcomes.push((*index, OperationResult::failed(item.key(), &e)));
                    }
                    continue;
                }
            };
            let items: Vec<Item> = entries.iter().map(|(_, item, _, _)| item.clone()).collect();
            let written = self
                .call(tier, "set_batch", |b| {
                    let items = items.clone();
                    async move { b.set_batch(items).await }
                })
                .await;

            let per_item: Vec<Result<()>> = match written {
                Ok(results) => results,
                Err(e) => {
                    warn!(tier = %tier.name(), error = %e, "Tier batch write failed");
                    let message = e.to_string();
                    entries
                        .iter()
                        .map(|_| Err(Error::transient(tier.name(), message.clone())))
                        .collect()
                }
            };

            for ((index, item, rest, pinned), written) in entries.into_iter().zip(per_item) {
                let outcome = match written {
                    Ok(()) => {
                        self.invalidate_except(item.key(), tier_id).await;
                        self.write_through(&item).await;
                        Ok(tier_id)
                    }
                    Err(Error::Capacity { .. }) if !pinned && !rest.is_empty() => {
                        self.write_ordered(item.clone(), rest, false).await
                    }
                    Err(e) => Err(e),
                };

                let result = match outcome {
                    Ok(_) => {
                        self.inner
                            .metrics
                            .record_operation(OperationKind::Set, start.elapsed());
                        OperationResult::ok(item.key(), None)
                    }
                    Err(e) => {
                        self.inner
                            .metrics
                            .record_error(OperationKind::Set, &e, start.elapsed());
                        OperationResult::failed(item.key(), &e)
                    }
                };
                outcomes.push((index, result));
            }
        }
        outcomes
    }

    async fn batch_delete(&self, group: Vec<(usize, Operation)>) -> Vec<(usize, OperationResult)> {
        let deletes = group.into_iter().map(|(index, operation)| async move {
            let key = operation.key();
            let result = match self.remove(key).await {
                Ok(true) => OperationResult::ok(key, None),
                Ok(false) => OperationResult::not_found(key),
                Err(e) => OperationResult::failed(key, &e),
            };
            (index, result)
        });
        join_all(deletes).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, OptimizerConfig};
    use crate::storage::{EvictionPolicyKind, MemoryBackend, MemoryConfig, StorageBackend};
    use crate::tier::{LatencyClass, TierDescriptor};
    use serde_json::json;
    use std::sync::Arc;

    async fn two_tiers() -> Manager {
        let config = EngineConfig {
            optimizer: OptimizerConfig {
                background_enabled: false,
                ..OptimizerConfig::default()
            },
            ..EngineConfig::default()
        };
        let hot: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new(
            "hot",
            MemoryConfig::with_max_items(10, EvictionPolicyKind::Lru),
        ));
        let warm: Arc<dyn StorageBackend> =
            Arc::new(MemoryBackend::new("warm", MemoryConfig::unbounded()));
        Manager::builder()
            .config(config)
            .tier(
                TierDescriptor::new("hot", LatencyClass::Memory).with_bounds(
                    Some(10),
                    None,
                    EvictionPolicyKind::Lru,
                ),
                hot,
            )
            .tier(TierDescriptor::new("warm", LatencyClass::Local), warm)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_batch_set_reports_every_key() {
        let manager = two_tiers().await;

        let outcomes = manager
            .batch_set(vec![
                (0, Operation::get("stray")),
                (1, Operation::set("kept", json!(1))),
            ])
            .await;

        assert_eq!(outcomes.len(), 2);
        let stray = outcomes.iter().find(|(index, _)| *index == 0).unwrap();
        assert_eq!(stray.1.key, "stray");
        assert_eq!(stray.1.status, ResultStatus::Failed);
        assert_eq!(stray.1.error_kind.as_deref(), Some("internal"));
        let kept = outcomes.iter().find(|(index, _)| *index == 1).unwrap();
        assert!(kept.1.is_ok());
    }

    #[tokio::test]
    async fn test_batch_results_in_input_order() {
        let manager = two_tiers().await;
        manager.set("existing", json!("v")).await.unwrap();

        let results = manager
            .batch(vec![
                Operation::get("existing"),
                Operation::set("new", json!(1)),
                Operation::get("absent"),
                Operation::delete("existing"),
                Operation::get("new"),
            ])
            .await
            .unwrap();

        let statuses: Vec<ResultStatus> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ResultStatus::Ok,
                ResultStatus::Ok,
                ResultStatus::NotFound,
                ResultStatus::Ok,
                ResultStatus::NotFound,
            ]
        );
        assert_eq!(results[0].value, Some(json!("v")));
        assert_eq!(results[2].key, "absent");
        // gets ran as one group before the first set
        assert_eq!(manager.get("new").await.unwrap(), Some(json!(1)));
        assert_eq!(manager.get("existing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let manager = two_tiers().await;

        let results = manager
            .batch(vec![
                Operation::set("", json!(1)),
                Operation::set("ok", json!(2)),
                Operation::set_with("pinned", json!(3), SetOptions::default().tier(TierId::new(7))),
                Operation::get(""),
            ])
            .await
            .unwrap();

        assert_eq!(results[0].status, ResultStatus::Failed);
        assert_eq!(results[0].error_kind.as_deref(), Some("validation"));
        assert!(results[1].is_ok());
        assert_eq!(results[2].status, ResultStatus::Failed);
        assert_eq!(results[3].status, ResultStatus::Failed);
        assert_eq!(manager.get("ok").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_batch_set_honours_hints() {
        let manager = two_tiers().await;

        let results = manager
            .batch(vec![
                Operation::set_with("a", json!(1), SetOptions::default().tier(TierId::new(0))),
                Operation::set("b", json!(2)),
            ])
            .await
            .unwrap();
        assert!(results.iter().all(OperationResult::is_ok));

        let a = manager.get_item("a").await.unwrap().unwrap();
        let b = manager.get_item("b").await.unwrap().unwrap();
        assert_eq!(a.tier(), TierId::new(0));
        assert_eq!(b.tier(), TierId::new(1));
    }

    #[tokio::test]
    async fn test_empty_batch_and_closed_manager() {
        let manager = two_tiers().await;
        assert!(manager.batch(Vec::new()).await.unwrap().is_empty());

        manager.close().await.unwrap();
        assert!(matches!(
            manager.batch(vec![Operation::get("k")]).await,
            Err(Error::Closed)
        ));
    }
}
