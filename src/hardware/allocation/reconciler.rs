//! Allocation Reconciler
//!
//! The kubelet never tells a plugin when a container stops. The reconciler
//! periodically compares reservations with the device ids running
//! containers actually hold: stale reservations are released after a grace
//! period and held-but-unreserved slots (after an agent restart) are adopted.

use super::allocator::DeviceAllocator;
use crate::config::AgentConfig;
use crate::domain::PodResourcesSource;
use crate::error::Result;
use crate::hardware::registry::{DeviceRegistry, ReconcileOutcome};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodic reservation cleanup
pub struct AllocationReconciler {
    source: Arc<dyn PodResourcesSource>,
    registry: Arc<DeviceRegistry>,
    allocator: Arc<DeviceAllocator>,
    /// (pool, fully qualified resource name)
    resources: Vec<(String, String)>,
    interval: Duration,
    grace: Duration,
}

impl std::fmt::Debug for AllocationReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationReconciler")
            .field("resources", &self.resources)
            .field("interval", &self.interval)
            .field("grace", &self.grace)
            .finish()
    }
}

impl AllocationReconciler {
    pub fn new(
        config: &AgentConfig,
        source: Arc<dyn PodResourcesSource>,
        registry: Arc<DeviceRegistry>,
        allocator: Arc<DeviceAllocator>,
    ) -> Self {
        Self {
            source,
            registry,
            allocator,
            resources: config
                .pools
                .iter()
                .map(|p| (p.name.clone(), config.resource_name(&p.name)))
                .collect(),
            interval: Duration::from_secs(config.reconcile.interval_secs),
            grace: Duration::from_secs(config.reconcile.grace_secs),
        }
    }

    /// One pass over every pool
    pub async fn reconcile_once(&self) -> Result<Vec<(String, ReconcileOutcome)>> {
        let assigned = self.source.assigned_devices().await?;
        let empty = BTreeSet::new();

        let mut outcomes = Vec::with_capacity(self.resources.len());
        for (pool, resource) in &self.resources {
            let in_use = assigned.get(resource).unwrap_or(&empty);
            let outcome = self
                .registry
                .reconcile_reservations(pool, in_use, self.grace)?;

            if !outcome.released.is_empty() || !outcome.adopted.is_empty() {
                info!(
                    pool = %pool,
                    released = outcome.released.len(),
                    adopted = outcome.adopted.len(),
                    "Reconciled reservations"
                );
            }
            let pruned = self.allocator.prune(pool)?;
            if pruned > 0 {
                debug!(pool = %pool, "Dropped {} finished allocations", pruned);
            }
            outcomes.push((pool.clone(), outcome));
        }
        Ok(outcomes)
    }

    /// Reconcile every interval until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!("Reservation reconcile failed, retrying next tick: {}", e);
                    }
                }
            }
        }
        debug!("Reconciler stopped");
    }
}
