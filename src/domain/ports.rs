//! Domain Ports - Core trait definitions for the device plugin
//!
//! These traits define the boundaries between the agent and the host: the
//! kernel device bus on one side and the kubelet's view of running
//! containers on the other.

use super::device::RawEvent;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;

// =============================================================================
// Device Event Source
// =============================================================================

/// One item of an event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// A device notification
    Device(RawEvent),
    /// A full enumeration of present devices follows
    ReplayStarted,
    /// The enumeration is complete; devices it did not report are gone
    ReplayFinished,
}

impl From<RawEvent> for SourceEvent {
    fn from(event: RawEvent) -> Self {
        SourceEvent::Device(event)
    }
}

/// Producer half of an event stream
pub type EventSender = mpsc::Sender<SourceEvent>;

/// Lazy, infinite sequence of raw device events
///
/// Backed by a bounded channel: producers wait for capacity instead of
/// dropping events. Dropping the stream stops the producer.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<SourceEvent>,
}

impl EventStream {
    /// Create a connected sender/stream pair holding at most `capacity` events
    pub fn channel(capacity: usize) -> (EventSender, EventStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, EventStream { rx })
    }

    /// Next event, or `None` once every producer has gone away
    pub async fn next(&mut self) -> Option<SourceEvent> {
        self.rx.recv().await
    }
}

/// Source of device add/remove/change notifications
pub trait DeviceEventSource: Send {
    /// Subscribe to the bus; fails fast with `SourceUnavailable`
    fn subscribe(self) -> Result<EventStream>
    where
        Self: Sized;
}

// =============================================================================
// Container Runtime View
// =============================================================================

/// Device ids the kubelet currently has assigned to containers
pub type AssignedDevices = BTreeMap<String, BTreeSet<String>>;

/// Read-only view of which devices running containers hold
#[async_trait]
pub trait PodResourcesSource: Send + Sync {
    /// Assigned device ids keyed by resource name
    async fn assigned_devices(&self) -> Result<AssignedDevices>;
}
