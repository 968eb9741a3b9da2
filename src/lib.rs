//! tiermem - Multi-Tier Memory Orchestration Engine
//!
//! Stores JSON values across an ordered hierarchy of storage tiers and moves
//! them between tiers according to observed access patterns.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!   get/set/delete ─▶│           Manager            │──▶ MetricsCollector
//!   batch/search     │  admission · timeout · retry │
//!                    └──────────────┬───────────────┘
//!                                   │          ▲
//!                                   ▼          │ promote / demote / prefetch
//!            ┌────────────┬─────────────┬──────┴─────┐
//!            │ T0 memory  │ T1 memory   │ T2 sqlite  │ ◀── Optimizer
//!            │ (hot)      │ (warm)      │ (durable)  │
//!            └────────────┴─────────────┴────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`] - YAML configuration and validation
//! - [`error`] - Error types
//! - [`item`] - The stored unit and its bookkeeping
//! - [`tier`] - Tier identities and the ordered hierarchy
//! - [`storage`] - Backends and eviction policies
//! - [`optimizer`] - Access tracking, tier recommendation and prediction
//! - [`metrics`] - Windowed statistics, alerts and Prometheus export
//! - [`manager`] - The engine facade

pub mod config;
pub mod error;
pub mod item;
pub mod manager;
pub mod metrics;
pub mod optimizer;
pub mod storage;
pub mod tier;

pub use config::{EngineConfig, TierConfig, TierKind};
pub use error::{Error, Result};
pub use item::{Item, Metadata};
pub use manager::{
    Manager, ManagerBuilder, ManagerStats, Operation, OperationResult, OptimizeReport,
    ResultStatus, SearchRequest, SetOptions,
};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use optimizer::{Optimizer, TierScorer};
pub use storage::{EvictionPolicyKind, StorageBackend};
pub use tier::{LatencyClass, TierDescriptor, TierHierarchy, TierId};
