//! Kubelet Pod Resources Client
//!
//! Lists which device ids the kubelet has handed to running containers via
//! the `v1.PodResourcesLister` service.

use super::api::connect_unix;
use super::api::podresources::pod_resources_lister_client::PodResourcesListerClient;
use super::api::podresources::{ListPodResourcesRequest, ListPodResourcesResponse};
use crate::domain::{AssignedDevices, PodResourcesSource};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

/// Pod resources API on the kubelet's unix socket
#[derive(Debug, Clone)]
pub struct KubeletPodResources {
    socket: PathBuf,
}

impl KubeletPodResources {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }
}

#[async_trait]
impl PodResourcesSource for KubeletPodResources {
    async fn assigned_devices(&self) -> Result<AssignedDevices> {
        let channel = connect_unix(&self.socket).await.map_err(|e| {
            Error::PodResources(format!(
                "failed to connect to {}: {}",
                self.socket.display(),
                e
            ))
        })?;
        let mut client = PodResourcesListerClient::new(channel);

        let response = client
            .list(tonic::Request::new(ListPodResourcesRequest {}))
            .await
            .map_err(|e| Error::PodResources(format!("failed to list pod resources: {}", e)))?
            .into_inner();

        debug!("Listed resources of {} pods", response.pod_resources.len());
        Ok(collect_assigned(&response))
    }
}

/// Group every container's device ids by resource name
pub fn collect_assigned(response: &ListPodResourcesResponse) -> AssignedDevices {
    let mut assigned = AssignedDevices::new();
    for pod in &response.pod_resources {
        for container in &pod.containers {
            for devices in &container.devices {
                assigned
                    .entry(devices.resource_name.clone())
                    .or_default()
                    .extend(devices.device_ids.iter().cloned());
            }
        }
    }
    assigned
}
