//! udev Device Plugin - Kubernetes device plugin for hot-pluggable devices
//!
//! Discovers host devices over the kernel uevent bus, sorts them into
//! configured pools and advertises every pool to the kubelet as an extended
//! resource through the device plugin API.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               Kubelet                                   │
//! │   Registration   DevicePlugin (per pool socket)   PodResourcesLister    │
//! └────────▲──────────────────▲─────────────────────────────────┬──────────┘
//!          │                  │                                 │
//! ┌────────┴──────────────────┴─────────────┐  ┌────────────────▼──────────┐
//! │        Resource Advertisers             │  │   Allocation Reconciler   │
//! │  (register, ListAndWatch, Allocate)     │  └────────────────┬──────────┘
//! └───────────────────┬─────────────────────┘                   │
//!                     │                                         │
//!          ┌──────────▼─────────────────────────────────────────▼──┐
//!          │              Device Registry (pools/slots)             │
//!          └──────────▲─────────────────────────────────────────────┘
//!                     │ sole writer
//!          ┌──────────┴──────────┐      ┌───────────────────────────┐
//!          │   Event Pipeline    │◄─────│  Device Classifier (pools) │
//!          │  (+ health probe)   │      └───────────────────────────┘
//!          └──────────▲──────────┘
//!                     │
//!          ┌──────────┴──────────┐
//!          │  Uevent Monitor     │  netlink + sysfs replay
//!          └─────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`agent`]: Wiring and supervision of every component
//! - [`hardware`]: Device discovery, classification, registry and allocation
//! - [`plugin`]: Kubelet gRPC APIs
//! - [`status`]: HTTP status and metrics surface
//! - [`config`]: Configuration file
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod agent;
pub mod config;
pub mod domain;
pub mod error;
pub mod hardware;
pub mod metrics;
pub mod plugin;
pub mod status;

// Re-export commonly used types
pub use agent::{Agent, AgentOptions, EventPipeline};

pub use config::{AgentConfig, ConfigFormat, PoolConfig};

pub use domain::{
    Access, Device, DeviceEventSource, DeviceId, EventKind, EventStream, Health, RawEvent, Slot,
    PodResourcesSource, SourceEvent,
};

pub use error::{Error, ErrorAction, RegistrationError, Result, Subsystem};

pub use hardware::{
    AllocationReconciler, DeviceAllocator, DeviceClassifier, DeviceEvent, DeviceRegistry,
    SysfsScanner, UeventMonitor,
};

pub use metrics::AgentMetrics;

pub use plugin::{Advertiser, AdvertiserState, DevicePluginService, RegistrationClient};

pub use status::{run_status_server, StatusRouter};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
