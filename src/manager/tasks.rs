//! Background loops
//!
//! Every loop holds a weak reference to the engine and exits when the
//! shutdown token fires or the last [`Manager`] handle is dropped.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{Manager, ManagerInner};
use crate::error::Result;
use crate::metrics::MigrationReason;

impl Manager {
    pub(super) fn start_background(&self, prefetch_rx: mpsc::Receiver<String>) {
        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();
        let config = &self.inner.config;
        let mut tasks = self.inner.tasks.lock();

        tasks.push(tokio::spawn(prefetch_loop(
            weak.clone(),
            token.clone(),
            prefetch_rx,
        )));

        if config.optimizer.background_enabled {
            tasks.push(spawn_periodic(
                "optimize",
                config.optimizer.optimize_interval(),
                weak.clone(),
                token.clone(),
                |manager| async move { manager.optimize().await.map(|_| ()) },
            ));
            tasks.push(spawn_periodic(
                "cleanup",
                config.optimizer.cleanup_interval(),
                weak.clone(),
                token.clone(),
                |manager| async move { manager.cleanup().await.map(|_| ()) },
            ));
        }

        if config.metrics.enabled {
            tasks.push(spawn_periodic(
                "metrics-flush",
                config.metrics.flush_interval(),
                weak,
                token,
                |manager| async move { manager.flush_metrics().await },
            ));
        }

        debug!(tasks = tasks.len(), "Background tasks started");
    }

    /// Refresh tier gauges and evaluate alerts
    async fn flush_metrics(&self) -> Result<()> {
        for tier in self.inner.hierarchy.tiers() {
            let stats = self.call(tier, "stats", |b| async move { b.stats().await }).await?;
            self.inner.metrics.update_tier(tier.name(), &stats);
        }
        self.inner.metrics.flush();
        Ok(())
    }

    /// Copy `key` into the fastest tier ahead of a predicted read
    async fn prefetch(&self, key: &str) -> Result<bool> {
        let hierarchy = &self.inner.hierarchy;
        if hierarchy.len() < 2 || self.inner.shutdown.is_cancelled() {
            return Ok(false);
        }
        let fastest = hierarchy.fastest();
        if self
            .call(fastest, "exists", |b| async move { b.exists(key).await })
            .await?
        {
            return Ok(false);
        }
        if self.inner.in_flight.insert(key.to_string(), ()).is_some() {
            return Ok(false);
        }

        let result = self.copy_to_fastest(key).await;
        self.inner.in_flight.remove(key);
        result
    }

    /// The copy never replaces a resident entry, and it is withdrawn again
    /// when the tier it came from changes before the copy lands.
    async fn copy_to_fastest(&self, key: &str) -> Result<bool> {
        let start = Instant::now();
        let fastest = self.inner.hierarchy.fastest();

        for tier in &self.inner.hierarchy.tiers()[1..] {
            let peeked = self
                .call(tier, "peek", |b| async move { b.peek(key).await })
                .await?;
            let Some(item) = peeked else {
                continue;
            };
            if !fastest.descriptor().can_hold(item.size_bytes()) {
                return Ok(false);
            }

            let copy = item.placed_in(fastest.id());
            let inserted = self
                .call(fastest, "set_if_absent", |b| {
                    let copy = copy.clone();
                    async move { b.set_if_absent(copy).await }
                })
                .await?;
            if !inserted {
                return Ok(false);
            }

            let current = self
                .call(tier, "peek", |b| async move { b.peek(key).await })
                .await?;
            if !current.map_or(false, |current| current.same_version(&item)) {
                let copy = &copy;
                self.call(fastest, "delete_version", |b| async move {
                    b.delete_version(copy).await
                })
                .await?;
                debug!(key = %key, from = %tier.name(), "Source changed during prefetch, copy withdrawn");
                return Ok(false);
            }

            self.inner.metrics.record_migration(
                tier.id(),
                fastest.id(),
                MigrationReason::Prefetch,
                start.elapsed(),
            );
            self.inner.metrics.record_prefetch();
            debug!(key = %key, from = %tier.name(), "Prefetched item");
            return Ok(true);
        }
        Ok(false)
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    weak: Weak<ManagerInner>,
    token: CancellationToken,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Manager) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    if let Err(e) = tick(Manager { inner }).await {
                        error!(task = name, error = %e, "Background task failed");
                    }
                }
            }
        }
        info!(task = name, "Background task stopped");
    })
}

async fn prefetch_loop(
    weak: Weak<ManagerInner>,
    token: CancellationToken,
    mut rx: mpsc::Receiver<String>,
) {
    loop {
        let key = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            key = rx.recv() => match key {
                Some(key) => key,
                None => break,
            },
        };

        let Some(inner) = weak.upgrade() else { break };
        let manager = Manager { inner };
        if let Err(e) = manager.prefetch(&key).await {
            debug!(key = %key, error = %e, "Prefetch failed");
        }
    }
    debug!("Prefetch consumer stopped");
}

// =============================================================================
// Tests
// =============================================================================
