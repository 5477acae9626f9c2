//! Device Plugin Service
//!
//! gRPC implementation of the kubelet `DevicePlugin` service for one pool.

use super::api::v1beta1::device_plugin_server::DevicePlugin;
use super::api::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse,
    ContainerPreferredAllocationResponse, DevicePluginOptions, Empty, ListAndWatchResponse,
    PreStartContainerRequest, PreStartContainerResponse, PreferredAllocationRequest,
    PreferredAllocationResponse,
};
use super::api::{list_and_watch_response, plugin_options};
use super::state::StateHandle;
use crate::hardware::allocation::{AllocationRequest, DeviceAllocator};
use crate::hardware::registry::DeviceRegistry;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

/// DevicePlugin service bound to one pool
#[derive(Debug, Clone)]
pub struct DevicePluginService {
    pool: String,
    registry: Arc<DeviceRegistry>,
    allocator: Arc<DeviceAllocator>,
    state: StateHandle,
    /// Ends open ListAndWatch streams when the endpoint is torn down
    shutdown: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        allocator: Arc<DeviceAllocator>,
        state: StateHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool: state.pool().to_string(),
            registry,
            allocator,
            state,
            shutdown,
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(plugin_options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Full snapshot now, then a full snapshot on every pool change
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        let generation = self.registry.subscribe(&self.pool)?;
        info!(pool = %self.pool, "Kubelet started watching devices");

        let registry = self.registry.clone();
        let pool = self.pool.clone();
        let stream = WatchStream::new(generation)
            .map(move |_| -> Result<ListAndWatchResponse, Status> {
                let slots = registry.snapshot(&pool)?;
                debug!(pool = %pool, "Advertising {} slots", slots.len());
                Ok(list_and_watch_response(&slots))
            })
            .take_until(self.shutdown.clone().cancelled_owned());

        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        let req = request.into_inner();

        let container_responses = req
            .container_requests
            .iter()
            .map(|container| -> Result<_, Status> {
                let size = usize::try_from(container.allocation_size).unwrap_or(0);
                let device_ids = self.registry.preferred(
                    &self.pool,
                    &container.available_device_ids,
                    &container.must_include_device_ids,
                    size,
                )?;
                Ok(ContainerPreferredAllocationResponse { device_ids })
            })
            .collect::<Result<Vec<_>, Status>>()?;

        Ok(Response::new(PreferredAllocationResponse {
            container_responses,
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        self.state.ensure_serving()?;

        let requests: Vec<AllocationRequest> = request
            .into_inner()
            .container_requests
            .into_iter()
            .map(|container| AllocationRequest::ids(container.devices_ids))
            .collect();
        info!(pool = %self.pool, "Allocating for {} containers", requests.len());

        // Reservation may wait on the registry lock
        let allocator = self.allocator.clone();
        let pool = self.pool.clone();
        let allocations = tokio::task::spawn_blocking(move || allocator.allocate(&pool, &requests))
            .await
            .map_err(|e| Status::internal(format!("allocation task failed: {}", e)))??;

        let container_responses: Vec<ContainerAllocateResponse> = allocations
            .into_iter()
            .map(|allocation| allocation.grant.into())
            .collect();

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
