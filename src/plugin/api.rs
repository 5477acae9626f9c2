//! Kubelet API Bindings
//!
//! Generated device plugin (`v1beta1`) and pod resources (`v1`) gRPC code,
//! plus conversions from agent types and the unix socket connector.

#![allow(clippy::doc_markdown)]

pub mod v1beta1 {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

pub mod podresources {
    tonic::include_proto!("v1");
}

use crate::config::MountConfig;
use crate::domain::Slot;
use crate::hardware::allocation::{ContainerGrant, DeviceNode};
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

// =============================================================================
// Constants
// =============================================================================

/// Device plugin API version sent on registration
pub const API_VERSION: &str = "v1beta1";

/// Registration socket file name inside the plugin directory
pub const KUBELET_SOCKET: &str = "kubelet.sock";

/// Default kubelet device plugin directory
pub const DEFAULT_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins";

/// Default kubelet pod resources socket
pub const DEFAULT_POD_RESOURCES_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";

/// Options every pool advertises
pub fn plugin_options() -> v1beta1::DevicePluginOptions {
    v1beta1::DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: true,
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<&Slot> for v1beta1::Device {
    fn from(slot: &Slot) -> Self {
        v1beta1::Device {
            id: slot.id.clone(),
            health: slot.health.as_str().to_string(),
            topology: None,
        }
    }
}

impl From<DeviceNode> for v1beta1::DeviceSpec {
    fn from(node: DeviceNode) -> Self {
        v1beta1::DeviceSpec {
            container_path: node.container_path,
            host_path: node.host_path,
            permissions: node.permissions,
        }
    }
}

impl From<MountConfig> for v1beta1::Mount {
    fn from(mount: MountConfig) -> Self {
        v1beta1::Mount {
            container_path: mount.container_path,
            host_path: mount.host_path,
            read_only: mount.read_only,
        }
    }
}

impl From<ContainerGrant> for v1beta1::ContainerAllocateResponse {
    fn from(grant: ContainerGrant) -> Self {
        v1beta1::ContainerAllocateResponse {
            envs: grant.envs.into_iter().collect(),
            mounts: grant.mounts.into_iter().map(Into::into).collect(),
            devices: grant.devices.into_iter().map(Into::into).collect(),
            annotations: Default::default(),
            cdi_devices: Vec::new(),
        }
    }
}

/// Full advertisement for a pool snapshot
pub fn list_and_watch_response(slots: &[Slot]) -> v1beta1::ListAndWatchResponse {
    v1beta1::ListAndWatchResponse {
        devices: slots.iter().map(Into::into).collect(),
    }
}

// =============================================================================
// Unix Socket Transport
// =============================================================================

/// Open a gRPC channel over a unix domain socket
///
/// The URI is a placeholder; every connection goes to `path`.
pub async fn connect_unix(path: impl Into<PathBuf>) -> Result<Channel, tonic::transport::Error> {
    let path = path.into();
    Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { UnixStream::connect(path).await.map(TokioIo::new) }
        }))
        .await
}
