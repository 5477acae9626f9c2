//! Resource Advertiser
//!
//! Owns one pool's kubelet endpoint: binds `<pluginDir>/<socketPrefix>-<pool>.sock`,
//! serves the device plugin service on it, registers with the kubelet and
//! watches the plugin directory. When the socket file disappears or the
//! kubelet re-creates its own socket the endpoint is torn down and the cycle
//! starts over.

use super::api::v1beta1::device_plugin_server::DevicePluginServer;
use super::api::KUBELET_SOCKET;
use super::registration::RegistrationClient;
use super::service::DevicePluginService;
use super::state::{AdvertiserState, StateHandle};
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::hardware::allocation::DeviceAllocator;
use crate::hardware::registry::DeviceRegistry;
use crate::metrics::{AgentMetrics, Outcome};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsStr;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Endpoint Loss
// =============================================================================

/// Why a serving endpoint was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointLoss {
    SocketRemoved,
    KubeletRestarted,
    ServerExited,
    WatchClosed,
    Shutdown,
}

impl fmt::Display for EndpointLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            EndpointLoss::SocketRemoved => "plugin socket removed",
            EndpointLoss::KubeletRestarted => "kubelet socket re-created",
            EndpointLoss::ServerExited => "gRPC server exited",
            EndpointLoss::WatchClosed => "plugin directory watch closed",
            EndpointLoss::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// Interpret a plugin directory event for an endpoint named `socket_name`
pub fn classify_fs_event(event: &Event, socket_name: &str) -> Option<EndpointLoss> {
    let touches = |name: &str| {
        event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(OsStr::new(name)))
    };

    match event.kind {
        EventKind::Remove(_) if touches(socket_name) => Some(EndpointLoss::SocketRemoved),
        EventKind::Create(_) if touches(KUBELET_SOCKET) => Some(EndpointLoss::KubeletRestarted),
        _ => None,
    }
}

// =============================================================================
// Advertiser
// =============================================================================

/// Serves and registers one pool
pub struct Advertiser {
    pool: String,
    resource_name: String,
    socket_name: String,
    plugin_dir: PathBuf,
    registry: Arc<DeviceRegistry>,
    allocator: Arc<DeviceAllocator>,
    metrics: AgentMetrics,
    registration: RegistrationClient,
    state: StateHandle,
    /// Pause before retrying after registration gave up
    retry_delay: Duration,
}

impl fmt::Debug for Advertiser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Advertiser")
            .field("pool", &self.pool)
            .field("resource_name", &self.resource_name)
            .field("socket", &self.socket_path())
            .field("state", &self.state.current())
            .finish()
    }
}

impl Advertiser {
    pub fn new(
        config: &AgentConfig,
        pool: &str,
        plugin_dir: impl Into<PathBuf>,
        registry: Arc<DeviceRegistry>,
        allocator: Arc<DeviceAllocator>,
        metrics: AgentMetrics,
    ) -> Self {
        let plugin_dir = plugin_dir.into();
        Self {
            pool: pool.to_string(),
            resource_name: config.resource_name(pool),
            socket_name: config.socket_name(pool),
            registration: RegistrationClient::new(
                plugin_dir.join(KUBELET_SOCKET),
                config.registration.clone(),
            ),
            plugin_dir,
            registry,
            allocator,
            metrics,
            state: StateHandle::new(pool),
            retry_delay: Duration::from_millis(config.registration.max_backoff_ms),
        }
    }

    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    pub fn socket_path(&self) -> PathBuf {
        self.plugin_dir.join(&self.socket_name)
    }

    /// Keep the endpoint registered until `shutdown` fires
    ///
    /// Returns an error only when the kubelet rejects the registration.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(pool = %self.pool, resource = %self.resource_name, "Starting advertiser");

        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }

            match self.serve_once(&shutdown).await {
                Ok(EndpointLoss::Shutdown) => break Ok(()),
                Ok(loss) => {
                    warn!(pool = %self.pool, "Endpoint lost ({}), re-registering", loss);
                }
                Err(e) if e.is_fatal() => break Err(e),
                Err(e) => {
                    warn!(
                        pool = %self.pool,
                        "Endpoint unavailable, retrying in {:?}: {}",
                        self.retry_delay,
                        e
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        };

        self.remove_socket();
        info!(pool = %self.pool, "Advertiser stopped");
        result
    }

    /// One bind, serve, register, watch cycle
    async fn serve_once(&self, shutdown: &CancellationToken) -> Result<EndpointLoss> {
        let socket_path = self.socket_path();
        self.remove_socket();
        let listener = UnixListener::bind(&socket_path).map_err(|e| self.endpoint_error(e))?;
        let (_watcher, mut fs_events) = self.watch_plugin_dir()?;

        self.state.transition(AdvertiserState::Registering);

        let server_token = shutdown.child_token();
        let service = DevicePluginService::new(
            self.registry.clone(),
            self.allocator.clone(),
            self.state.clone(),
            server_token.clone(),
        );
        let mut server = tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    UnixListenerStream::new(listener),
                    server_token.clone().cancelled_owned(),
                ),
        );
        debug!(pool = %self.pool, socket = %socket_path.display(), "gRPC server bound");

        let registered = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = self.registration.register(&self.socket_name, &self.resource_name) => Some(result),
        };
        let registered = match registered {
            None => {
                server_token.cancel();
                self.state.transition(AdvertiserState::Unregistered);
                return Ok(EndpointLoss::Shutdown);
            }
            Some(result) => result,
        };

        self.metrics
            .record_registration(&self.pool, Outcome::from(&registered));
        if let Err(e) = registered {
            server_token.cancel();
            self.state.transition(AdvertiserState::Unregistered);
            return Err(e.into());
        }
        self.state.transition(AdvertiserState::Serving);

        let loss = tokio::select! {
            _ = shutdown.cancelled() => EndpointLoss::Shutdown,
            loss = wait_for_loss(&mut fs_events, &self.socket_name) => loss,
            exited = &mut server => {
                match exited {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(pool = %self.pool, "gRPC server failed: {}", e),
                    Err(e) => error!(pool = %self.pool, "gRPC server task failed: {}", e),
                }
                EndpointLoss::ServerExited
            }
        };

        server_token.cancel();
        self.state.transition(AdvertiserState::Unregistered);
        Ok(loss)
    }

    fn watch_plugin_dir(&self) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<Event>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = self.pool.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => error!(pool = %pool, "Plugin directory watch error: {}", e),
        })
        .map_err(|e| self.endpoint_error(e))?;

        watcher
            .watch(&self.plugin_dir, RecursiveMode::NonRecursive)
            .map_err(|e| self.endpoint_error(e))?;

        Ok((watcher, rx))
    }

    fn remove_socket(&self) {
        let path = self.socket_path();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(socket = %path.display(), "Removed plugin socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(socket = %path.display(), "Failed to remove plugin socket: {}", e),
        }
    }

    fn endpoint_error(&self, e: impl fmt::Display) -> Error {
        Error::Endpoint {
            pool: self.pool.clone(),
            reason: e.to_string(),
        }
    }
}

async fn wait_for_loss(events: &mut mpsc::UnboundedReceiver<Event>, socket_name: &str) -> EndpointLoss {
    while let Some(event) = events.recv().await {
        if let Some(loss) = classify_fs_event(&event, socket_name) {
            return loss;
        }
    }
    EndpointLoss::WatchClosed
}
