//! REST API Handlers
//!
//! Read-mostly operator surface: liveness and readiness, pool inventories,
//! active allocations, manual release, and Prometheus metrics.

use crate::config::AgentConfig;
use crate::domain::{Device, Slot};
use crate::error::Error;
use crate::hardware::allocation::{Allocation, DeviceAllocator};
use crate::hardware::registry::DeviceRegistry;
use crate::metrics::AgentMetrics;
use crate::plugin::{AdvertiserState, StateHandle};
use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Pool info response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolInfoResponse {
    pub name: String,
    pub resource_name: String,
    /// Advertiser state: unregistered, registering or serving
    pub state: String,
    pub device_count: usize,
    pub slot_count: usize,
    pub healthy_slots: usize,
    pub reserved_slots: usize,
}

/// Pool detail response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolDetailResponse {
    #[serde(flatten)]
    pub info: PoolInfoResponse,
    pub devices: Vec<Device>,
    pub slots: Vec<Slot>,
}

/// Manual release response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResponse {
    pub pool: String,
    pub released: usize,
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessResponse {
    pub ready: bool,
    pub pools: BTreeMap<String, String>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct StatusRouter {
    config: Arc<AgentConfig>,
    registry: Arc<DeviceRegistry>,
    allocator: Arc<DeviceAllocator>,
    metrics: AgentMetrics,
    states: Vec<StateHandle>,
}

impl StatusRouter {
    /// Create a new REST router
    pub fn new(
        config: Arc<AgentConfig>,
        registry: Arc<DeviceRegistry>,
        allocator: Arc<DeviceAllocator>,
        metrics: AgentMetrics,
        states: Vec<StateHandle>,
    ) -> Self {
        Self {
            config,
            registry,
            allocator,
            metrics,
            states,
        }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            config: self.config,
            registry: self.registry,
            allocator: self.allocator,
            metrics: self.metrics,
            states: Arc::new(
                self.states
                    .into_iter()
                    .map(|s| (s.pool().to_string(), s))
                    .collect(),
            ),
        };

        Router::new()
            // Pool endpoints
            .route("/v1/pools", get(list_pools))
            .route("/v1/pools/:name", get(get_pool))
            .route("/v1/pools/:name/release", post(release_pool))
            // Allocation endpoints
            .route("/v1/allocations", get(list_allocations))
            .route("/v1/allocations/:id", delete(delete_allocation))
            // Health and metrics
            .route("/healthz", get(health_check))
            .route("/readyz", get(readiness_check))
            .route("/metrics", get(metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    config: Arc<AgentConfig>,
    registry: Arc<DeviceRegistry>,
    allocator: Arc<DeviceAllocator>,
    metrics: AgentMetrics,
    states: Arc<BTreeMap<String, StateHandle>>,
}

impl AppState {
    fn advertiser_state(&self, pool: &str) -> AdvertiserState {
        self.states
            .get(pool)
            .map(|s| s.current())
            .unwrap_or(AdvertiserState::Unregistered)
    }

    fn pool_info(&self, pool: &str) -> crate::error::Result<PoolInfoResponse> {
        let summary = self.registry.summary(pool)?;
        Ok(PoolInfoResponse {
            resource_name: self.config.resource_name(pool),
            state: self.advertiser_state(pool).to_string(),
            device_count: summary.devices,
            slot_count: summary.slots,
            healthy_slots: summary.healthy_slots,
            reserved_slots: summary.reserved_slots,
            name: summary.name,
        })
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// List pools
async fn list_pools(State(state): State<AppState>) -> impl IntoResponse {
    let pools: crate::error::Result<Vec<PoolInfoResponse>> = state
        .config
        .pools
        .iter()
        .map(|p| state.pool_info(&p.name))
        .collect();

    match pools {
        Ok(pools) => (StatusCode::OK, Json(pools)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Get pool with its devices and slots
async fn get_pool(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
    let detail = state.pool_info(&name).and_then(|info| {
        Ok(PoolDetailResponse {
            devices: state.registry.devices(&name)?,
            slots: state.registry.snapshot(&name)?,
            info,
        })
    });

    match detail {
        Ok(detail) => (StatusCode::OK, Json(detail)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Release every reservation of a pool
async fn release_pool(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    info!(pool = %name, "Manual release requested");
    match state.allocator.release_pool(&name) {
        Ok(released) => (
            StatusCode::OK,
            Json(ReleaseResponse {
                pool: name,
                released,
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// List active allocations
async fn list_allocations(State(state): State<AppState>) -> Json<Vec<Allocation>> {
    Json(state.allocator.list())
}

/// Release one allocation
async fn delete_allocation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.allocator.release(&id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check: every advertiser must be serving
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let pools: BTreeMap<String, String> = state
        .states
        .iter()
        .map(|(pool, s)| (pool.clone(), s.current().to_string()))
        .collect();
    let ready = !state.states.is_empty()
        && state
            .states
            .values()
            .all(|s| s.current() == AdvertiserState::Serving);

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready, pools }))
}

/// Prometheus text exposition
async fn metrics(State(state): State<AppState>) -> Response {
    for pool in state.registry.pool_names() {
        if let Ok(slots) = state.registry.snapshot(&pool) {
            state.metrics.observe_pool(&pool, &slots);
        }
    }

    match state.metrics.encode() {
        Ok((content_type, body)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            error_response(&e)
        }
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

fn error_response(err: &Error) -> Response {
    let (status, code) = match err {
        Error::UnknownPool { .. } => (StatusCode::NOT_FOUND, "pool_not_found"),
        Error::AllocationNotFound { .. } => (StatusCode::NOT_FOUND, "allocation_not_found"),
        Error::ReserveTimeout { .. } => (StatusCode::SERVICE_UNAVAILABLE, "registry_busy"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };

    (
        status,
        Json(ApiErrorResponse {
            error: code.into(),
            message: err.to_string(),
            details: Some(err.subsystem().to_string()),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFormat;
    use crate::domain::{attr, Attributes, DeviceId, Health};
    use crate::hardware::allocation::AllocationRequest;
    use crate::hardware::registry::DeviceEvent;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    const CONFIG: &str = r#"
pools:
  - name: serial
  - name: coral
    access: 2
"#;

    struct Fixture {
        registry: Arc<DeviceRegistry>,
        allocator: Arc<DeviceAllocator>,
        states: Vec<StateHandle>,
        router: Router,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(AgentConfig::parse(CONFIG, ConfigFormat::Yaml).unwrap());
        let registry = DeviceRegistry::from_config(&config);
        let metrics = AgentMetrics::detached().unwrap();
        let allocator = DeviceAllocator::new(&config, registry.clone(), metrics.clone());
        let states = vec![StateHandle::new("serial"), StateHandle::new("coral")];

        let mut attributes = Attributes::new();
        attributes.insert(attr::DEVNAME.into(), "ttyUSB0".into());
        registry.apply(DeviceEvent::Add(Device {
            id: DeviceId::new("tty-a"),
            pool: "serial".into(),
            attributes,
            health: Health::Healthy,
        }));

        let router = StatusRouter::new(
            config,
            registry.clone(),
            allocator.clone(),
            metrics,
            states.clone(),
        )
        .build();
        Fixture {
            registry,
            allocator,
            states,
            router,
        }
    }

    async fn call(router: &Router, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let f = fixture();
        let (status, _) = call(&f.router, "GET", "/healthz").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&f.router, "GET", "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let readiness: ReadinessResponse = serde_json::from_slice(&body).unwrap();
        assert!(!readiness.ready);
        assert_eq!(readiness.pools["serial"], "unregistered");

        for state in &f.states {
            state.transition(AdvertiserState::Registering);
            state.transition(AdvertiserState::Serving);
        }
        let (status, _) = call(&f.router, "GET", "/readyz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_pools() {
        let f = fixture();
        let (status, body) = call(&f.router, "GET", "/v1/pools").await;
        assert_eq!(status, StatusCode::OK);
        let pools: Vec<PoolInfoResponse> = serde_json::from_slice(&body).unwrap();
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].name, "serial");
        assert_eq!(pools[0].resource_name, "devices.udev.io/serial");
        assert_eq!(pools[0].device_count, 1);

        let (status, body) = call(&f.router, "GET", "/v1/pools/serial").await;
        assert_eq!(status, StatusCode::OK);
        let detail: PoolDetailResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(detail.slots.len(), 1);
        assert_eq!(detail.devices[0].id, DeviceId::new("tty-a"));

        let (status, body) = call(&f.router, "GET", "/v1/pools/gpu").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let err: ApiErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error, "pool_not_found");
    }

    #[tokio::test]
    async fn test_allocations_and_release() {
        let f = fixture();
        let allocation = f
            .allocator
            .allocate("serial", &[AllocationRequest::count(1)])
            .unwrap()
            .remove(0);

        let (status, body) = call(&f.router, "GET", "/v1/allocations").await;
        assert_eq!(status, StatusCode::OK);
        let listed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(listed[0]["id"], allocation.id.as_str());
        assert_eq!(listed[0]["slotIds"][0], "tty-a");

        let uri = format!("/v1/allocations/{}", allocation.id);
        let (status, _) = call(&f.router, "DELETE", &uri).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&f.router, "DELETE", &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        f.registry.try_reserve("serial", 1).unwrap();
        let (status, body) = call(&f.router, "POST", "/v1/pools/serial/release").await;
        assert_eq!(status, StatusCode::OK);
        let release: ReleaseResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(release.released, 1);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let f = fixture();
        let (status, body) = call(&f.router, "GET", "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains(r#"udev_device_plugin_slots{pool="serial",state="free"} 1"#));
    }
}
