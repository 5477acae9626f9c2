//! Agent
//!
//! Wires the device bus, classifier, registry, per-pool advertisers, the
//! reservation reconciler and the status API together and supervises them
//! until shutdown.
//!
//! A single writer task (the [`EventPipeline`]) owns every change to device
//! membership and health. Everything else only reads device state or flips
//! reservation flags.

use crate::config::{AgentConfig, HealthCheckConfig, HealthCheckMode};
use crate::domain::{DeviceEventSource, DeviceId, EventKind, EventStream, Health, RawEvent, SourceEvent};
use crate::error::{Error, Result};
use crate::hardware::allocation::{AllocationReconciler, DeviceAllocator};
use crate::hardware::classification::DeviceClassifier;
use crate::hardware::discovery::{ScannerConfig, UeventMonitor};
use crate::hardware::registry::{DeviceEvent, DeviceRegistry};
use crate::metrics::AgentMetrics;
use crate::plugin::api::{DEFAULT_PLUGIN_DIR, DEFAULT_POD_RESOURCES_SOCKET};
use crate::plugin::{Advertiser, KubeletPodResources};
use crate::status::{run_status_server, StatusRouter};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

// =============================================================================
// Options
// =============================================================================

/// Host paths and addresses that come from the command line
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Kubelet device plugin directory
    pub plugin_dir: PathBuf,
    /// Kubelet pod-resources socket
    pub pod_resources_socket: PathBuf,
    /// Status API bind address, disabled when `None`
    pub status_addr: Option<SocketAddr>,
    pub sysfs_root: PathBuf,
    /// Give up subscribing to the device bus after this long
    pub source_retry: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from(DEFAULT_PLUGIN_DIR),
            pod_resources_socket: PathBuf::from(DEFAULT_POD_RESOURCES_SOCKET),
            status_addr: None,
            sysfs_root: PathBuf::from("/sys"),
            source_retry: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Event Pipeline
// =============================================================================

/// The sole writer of device membership and health
pub struct EventPipeline {
    classifier: DeviceClassifier,
    registry: Arc<DeviceRegistry>,
    metrics: AgentMetrics,
    health: HealthCheckConfig,
    /// Devices reported since `ReplayStarted`, while a replay is running
    replayed: Option<BTreeSet<DeviceId>>,
}

impl EventPipeline {
    pub fn new(
        classifier: DeviceClassifier,
        registry: Arc<DeviceRegistry>,
        metrics: AgentMetrics,
        health: HealthCheckConfig,
    ) -> Self {
        Self {
            classifier,
            registry,
            metrics,
            health,
            replayed: None,
        }
    }

    /// Apply one stream item; a finished replay drops devices it did not report
    pub fn accept(&mut self, event: SourceEvent) -> bool {
        match event {
            SourceEvent::Device(event) => {
                if let Some(replayed) = self.replayed.as_mut() {
                    if event.kind != EventKind::Remove {
                        replayed.extend(event.device_id());
                    }
                }
                self.handle(event)
            }
            SourceEvent::ReplayStarted => {
                self.replayed = Some(BTreeSet::new());
                false
            }
            SourceEvent::ReplayFinished => match self.replayed.take() {
                Some(present) => self.resync(&present) > 0,
                None => false,
            },
        }
    }

    /// Remove every known device not in `present`; returns how many went
    pub fn resync(&self, present: &BTreeSet<DeviceId>) -> usize {
        let gone: Vec<DeviceId> = self
            .registry
            .all_devices()
            .into_iter()
            .map(|device| device.id)
            .filter(|id| !present.contains(id))
            .collect();

        let mut removed = 0;
        for id in gone {
            if self.registry.apply(DeviceEvent::Remove(id.clone())) {
                info!(device_id = %id, "Device missing after resync, removed");
                removed += 1;
            }
        }
        if removed > 0 {
            self.refresh_gauges();
        }
        removed
    }

    /// Classify one raw event and apply it; returns whether anything changed
    ///
    /// A moved device drops its old identity first. An `Add` or `Change`
    /// that no longer matches any pool removes the device.
    pub fn handle(&self, event: RawEvent) -> bool {
        self.metrics.record_device_event(event.kind);

        let mut changed = false;
        if let Some(previous) = event.previous_device_id() {
            changed |= self.registry.apply(DeviceEvent::Remove(previous));
        }

        let update = match event.kind {
            EventKind::Remove => event.device_id().map(DeviceEvent::Remove),
            EventKind::Add | EventKind::Change => match self.classifier.classify(&event) {
                Some(device) if event.kind == EventKind::Add => Some(DeviceEvent::Add(device)),
                Some(device) => Some(DeviceEvent::Change(device)),
                None => event.device_id().map(DeviceEvent::Remove),
            },
        };

        if let Some(update) = update {
            trace!("Applying {:?}", update);
            changed |= self.registry.apply(update);
        }
        if changed {
            self.refresh_gauges();
        }
        changed
    }

    /// Stat every device node and flip health where it changed
    pub fn probe_health(&self) -> usize {
        let mut flipped = 0;
        for device in self.registry.all_devices() {
            let Some(devnode) = device.devnode() else {
                continue;
            };
            let health = if Path::new(&devnode).exists() {
                Health::Healthy
            } else {
                Health::Unhealthy
            };
            if health != device.health && self.registry.set_health(&device.id, health) {
                info!(
                    device_id = %device.id,
                    devnode = %devnode,
                    pool = %device.pool,
                    "Device is now {}",
                    health
                );
                flipped += 1;
            }
        }
        if flipped > 0 {
            self.refresh_gauges();
        }
        flipped
    }

    fn refresh_gauges(&self) {
        for pool in self.registry.pool_names() {
            if let Ok(slots) = self.registry.snapshot(&pool) {
                self.metrics.observe_pool(&pool, &slots);
            }
        }
    }

    /// Apply events and run the health probe until shutdown
    ///
    /// The device bus ending is fatal: no further device changes could ever
    /// be observed.
    pub async fn run(mut self, mut events: EventStream, shutdown: CancellationToken) -> Result<()> {
        let probing = self.health.mode == HealthCheckMode::Devnode;
        let mut ticker = tokio::time::interval(Duration::from_secs(self.health.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = events.next() => match event {
                    Some(event) => {
                        self.accept(event);
                    }
                    None => return Err(Error::SourceClosed),
                },
                _ = ticker.tick(), if probing => {
                    let flipped = self.probe_health();
                    if flipped > 0 {
                        debug!("Health probe flipped {} devices", flipped);
                    }
                }
            }
        }
    }
}

// =============================================================================
// Agent
// =============================================================================

/// The node agent
pub struct Agent {
    config: Arc<AgentConfig>,
    options: AgentOptions,
    classifier: DeviceClassifier,
    registry: Arc<DeviceRegistry>,
    allocator: Arc<DeviceAllocator>,
    metrics: AgentMetrics,
}

impl Agent {
    pub fn new(config: AgentConfig, options: AgentOptions, metrics: AgentMetrics) -> Result<Self> {
        let classifier = DeviceClassifier::new(&config)?;
        let registry = DeviceRegistry::from_config(&config);
        let allocator = DeviceAllocator::new(&config, registry.clone(), metrics.clone());

        Ok(Self {
            config: Arc::new(config),
            options,
            classifier,
            registry,
            allocator,
            metrics,
        })
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.registry.clone()
    }

    pub fn allocator(&self) -> Arc<DeviceAllocator> {
        self.allocator.clone()
    }

    /// Kernel uevent source reading sysfs under the configured root
    pub fn monitor(&self) -> UeventMonitor {
        UeventMonitor::new(
            ScannerConfig {
                sysfs_path: self.options.sysfs_root.clone(),
                ..Default::default()
            },
            self.config.event_buffer_size,
        )
    }

    /// Run every component until `shutdown` fires or one fails fatally
    pub async fn run<S>(self, source: S, shutdown: CancellationToken) -> Result<()>
    where
        S: DeviceEventSource + Clone,
    {
        let events = subscribe_with_backoff(source, self.options.source_retry).await?;
        let token = shutdown.child_token();
        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();

        let pipeline = EventPipeline::new(
            self.classifier,
            self.registry.clone(),
            self.metrics.clone(),
            self.config.health_check.clone(),
        );
        let pipeline_token = token.clone();
        tasks.spawn(async move {
            (
                "event-pipeline".to_string(),
                pipeline.run(events, pipeline_token).await,
            )
        });

        let mut states = Vec::with_capacity(self.config.pools.len());
        for pool in &self.config.pools {
            let advertiser = Advertiser::new(
                &self.config,
                &pool.name,
                &self.options.plugin_dir,
                self.registry.clone(),
                self.allocator.clone(),
                self.metrics.clone(),
            );
            states.push(advertiser.state());
            let name = format!("advertiser/{}", pool.name);
            let advertiser_token = token.clone();
            tasks.spawn(async move { (name, advertiser.run(advertiser_token).await) });
        }

        if self.config.reconcile.enabled {
            let reconciler = AllocationReconciler::new(
                &self.config,
                Arc::new(KubeletPodResources::new(&self.options.pod_resources_socket)),
                self.registry.clone(),
                self.allocator.clone(),
            );
            let reconciler_token = token.clone();
            tasks.spawn(async move {
                reconciler.run(reconciler_token).await;
                ("reconciler".to_string(), Ok(()))
            });
        }

        if let Some(addr) = self.options.status_addr {
            let app = StatusRouter::new(
                self.config.clone(),
                self.registry.clone(),
                self.allocator.clone(),
                self.metrics.clone(),
                states,
            )
            .build();
            let status_token = token.clone();
            tasks.spawn(async move {
                (
                    "status".to_string(),
                    run_status_server(addr, app, status_token).await,
                )
            });
        }

        info!(pools = self.config.pools.len(), "Agent running");

        let mut result = Ok(());
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((name, Ok(())))) => debug!(task = %name, "Task finished"),
                    Some(Ok((name, Err(e)))) => {
                        error!(task = %name, subsystem = %e.subsystem(), "Task failed: {}", e);
                        result = Err(e);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("Task panicked: {}", e);
                        result = Err(Error::Internal(format!("task panicked: {}", e)));
                        break;
                    }
                },
            }
        }

        token.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Ok((name, Err(e))) = joined {
                warn!(task = %name, "Task failed during shutdown: {}", e);
            }
        }
        info!("Agent stopped");
        result
    }
}

/// Subscribe to the device bus, retrying while it is unavailable
async fn subscribe_with_backoff<S>(source: S, max_elapsed: Duration) -> Result<EventStream>
where
    S: DeviceEventSource + Clone,
{
    let backoff = backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(200))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(max_elapsed))
        .build();

    backoff::future::retry_notify(
        backoff,
        || {
            let source = source.clone();
            async move {
                source.subscribe().map_err(|e| match e {
                    Error::SourceUnavailable { .. } => backoff::Error::transient(e),
                    other => backoff::Error::permanent(other),
                })
            }
        },
        |e: Error, wait: Duration| {
            warn!("Device bus unavailable, retrying in {:?}: {}", wait, e);
        },
    )
    .await
}
