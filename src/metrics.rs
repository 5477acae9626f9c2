//! Agent Metrics
//!
//! Prometheus collectors for slot inventory, allocations, registrations and
//! device bus traffic. Collectors are registered into a caller supplied
//! registry; the agent uses the process default one.

use crate::domain::{EventKind, Slot};
use crate::error::Result;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Prefix shared by every metric name
const NAMESPACE: &str = "udev_device_plugin";

/// Outcome label of an allocation or registration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

impl<T, E> From<&std::result::Result<T, E>> for Outcome {
    fn from(result: &std::result::Result<T, E>) -> Self {
        if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Collectors owned by the agent
#[derive(Debug, Clone)]
pub struct AgentMetrics {
    registry: Registry,
    slots: IntGaugeVec,
    allocations: IntCounterVec,
    registrations: IntCounterVec,
    device_events: IntCounterVec,
}

impl AgentMetrics {
    /// Create the collectors and register them into `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let slots = IntGaugeVec::new(
            Opts::new("slots", "Advertised slots by pool and state").namespace(NAMESPACE),
            &["pool", "state"],
        )?;
        let allocations = IntCounterVec::new(
            Opts::new("allocations_total", "Allocate container requests by outcome")
                .namespace(NAMESPACE),
            &["pool", "result"],
        )?;
        let registrations = IntCounterVec::new(
            Opts::new("registrations_total", "Kubelet registration attempts by outcome")
                .namespace(NAMESPACE),
            &["pool", "result"],
        )?;
        let device_events = IntCounterVec::new(
            Opts::new("device_events_total", "Device bus events applied to the registry")
                .namespace(NAMESPACE),
            &["kind"],
        )?;

        registry.register(Box::new(slots.clone()))?;
        registry.register(Box::new(allocations.clone()))?;
        registry.register(Box::new(registrations.clone()))?;
        registry.register(Box::new(device_events.clone()))?;

        Ok(Self {
            registry: registry.clone(),
            slots,
            allocations,
            registrations,
            device_events,
        })
    }

    /// Collectors on a private registry, for tests and tools
    pub fn detached() -> Result<Self> {
        Self::new(&Registry::new())
    }

    /// Refresh the slot gauges of a pool from a snapshot
    pub fn observe_pool(&self, pool: &str, slots: &[Slot]) {
        let reserved = slots.iter().filter(|s| s.reserved).count();
        let unhealthy = slots.iter().filter(|s| !s.health.is_healthy()).count();
        let free = slots
            .iter()
            .filter(|s| !s.reserved && s.health.is_healthy())
            .count();

        for (state, value) in [("free", free), ("reserved", reserved), ("unhealthy", unhealthy)] {
            self.slots
                .with_label_values(&[pool, state])
                .set(value as i64);
        }
    }

    pub fn record_allocation(&self, pool: &str, outcome: Outcome) {
        self.allocations
            .with_label_values(&[pool, outcome.as_str()])
            .inc();
    }

    pub fn record_registration(&self, pool: &str, outcome: Outcome) {
        self.registrations
            .with_label_values(&[pool, outcome.as_str()])
            .inc();
    }

    pub fn record_device_event(&self, kind: EventKind) {
        self.device_events.with_label_values(&[kind.as_str()]).inc();
    }

    /// Render every collector of the registry in the text exposition format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}
