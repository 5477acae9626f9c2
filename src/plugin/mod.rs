//! Kubelet Device Plugin Module
//!
//! Everything that speaks the kubelet's gRPC APIs: the per-pool device
//! plugin service and its advertiser, registration, and the pod resources
//! client used for reconciliation.

pub mod advertiser;
pub mod api;
pub mod pod_resources;
pub mod registration;
pub mod service;
pub mod state;

pub use advertiser::{Advertiser, EndpointLoss};
pub use pod_resources::KubeletPodResources;
pub use registration::RegistrationClient;
pub use service::DevicePluginService;
pub use state::{AdvertiserState, StateHandle};
