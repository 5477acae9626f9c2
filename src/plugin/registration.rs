//! Kubelet Registration Client
//!
//! Announces a pool's plugin endpoint on the kubelet's `Registration`
//! service. Unreachable sockets and `UNAVAILABLE` answers are retried with
//! bounded exponential backoff; any other answer is a rejection.

use super::api::v1beta1::registration_client::RegistrationClient as GrpcRegistrationClient;
use super::api::v1beta1::RegisterRequest;
use super::api::{connect_unix, plugin_options, API_VERSION};
use crate::config::RegistrationConfig;
use crate::error::RegistrationError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tonic::{Code, Request};
use tracing::{info, warn};

/// Client for the kubelet registration socket
#[derive(Debug, Clone)]
pub struct RegistrationClient {
    kubelet_socket: PathBuf,
    config: RegistrationConfig,
}

impl RegistrationClient {
    pub fn new(kubelet_socket: impl Into<PathBuf>, config: RegistrationConfig) -> Self {
        Self {
            kubelet_socket: kubelet_socket.into(),
            config,
        }
    }

    pub fn kubelet_socket(&self) -> &Path {
        &self.kubelet_socket
    }

    /// Register `endpoint` (a socket file name in the plugin directory)
    pub async fn register(
        &self,
        endpoint: &str,
        resource_name: &str,
    ) -> Result<(), RegistrationError> {
        let notify = |e: RegistrationError, wait: Duration| {
            warn!(
                resource = %resource_name,
                "Registration attempt failed, retrying in {:?}: {}",
                wait,
                e
            );
        };

        backoff::future::retry_notify(
            self.config.backoff(),
            || async {
                self.register_once(endpoint, resource_name)
                    .await
                    .map_err(|e| {
                        if e.is_permanent() {
                            backoff::Error::permanent(e)
                        } else {
                            backoff::Error::transient(e)
                        }
                    })
            },
            notify,
        )
        .await?;

        info!(resource = %resource_name, endpoint = %endpoint, "Registered with kubelet");
        Ok(())
    }

    async fn register_once(
        &self,
        endpoint: &str,
        resource_name: &str,
    ) -> Result<(), RegistrationError> {
        let channel = connect_unix(&self.kubelet_socket)
            .await
            .map_err(|e| RegistrationError::Unavailable(format!("{}: {}", self.kubelet_socket.display(), e)))?;
        let mut client = GrpcRegistrationClient::new(channel);

        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: endpoint.to_string(),
            resource_name: resource_name.to_string(),
            options: Some(plugin_options()),
        };

        client
            .register(Request::new(request))
            .await
            .map(|_| ())
            .map_err(|status| classify_status(resource_name, status))
    }
}

/// Map a kubelet answer onto transient or permanent failure
///
/// Only an answer about the request itself is a rejection. Timeouts,
/// cancellation and an overloaded kubelet are retried.
fn classify_status(resource_name: &str, status: tonic::Status) -> RegistrationError {
    match status.code() {
        Code::Unavailable
        | Code::DeadlineExceeded
        | Code::Cancelled
        | Code::ResourceExhausted => {
            RegistrationError::Unavailable(format!("{:?}: {}", status.code(), status.message()))
        }
        _ => RegistrationError::Rejected {
            resource: resource_name.to_string(),
            message: status.message().to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::api::v1beta1::registration_server::{Registration, RegistrationServer};
    use crate::plugin::api::v1beta1::Empty;
    use assert_matches::assert_matches;
    use std::sync::Mutex;
    use tokio::net::UnixListener;
    use tokio_stream::wrappers::UnixListenerStream;
    use tokio_util::sync::CancellationToken;

    /// Kubelet stand-in that answers with a fixed status
    struct FakeKubelet {
        reject: Option<Code>,
        seen: std::sync::Arc<Mutex<Vec<RegisterRequest>>>,
    }

    #[tonic::async_trait]
    impl Registration for FakeKubelet {
        async fn register(
            &self,
            request: Request<RegisterRequest>,
        ) -> Result<tonic::Response<Empty>, tonic::Status> {
            self.seen.lock().unwrap().push(request.into_inner());
            match self.reject {
                Some(code) => Err(tonic::Status::new(code, "nope")),
                None => Ok(tonic::Response::new(Empty {})),
            }
        }
    }

    fn fast_backoff() -> RegistrationConfig {
        RegistrationConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 20,
            max_elapsed_secs: 1,
        }
    }

    fn spawn_kubelet(socket: &Path, kubelet: FakeKubelet, token: CancellationToken) {
        let listener = UnixListener::bind(socket).unwrap();
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(RegistrationServer::new(kubelet))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), token.cancelled_owned())
                .await
        });
    }

    #[tokio::test]
    async fn test_register_success() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("kubelet.sock");
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();
        spawn_kubelet(
            &socket,
            FakeKubelet {
                reject: None,
                seen: seen.clone(),
            },
            token.clone(),
        );

        let client = RegistrationClient::new(&socket, fast_backoff());
        client
            .register("udev-serial.sock", "devices.udev.io/serial")
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].version, "v1beta1");
        assert_eq!(seen[0].endpoint, "udev-serial.sock");
        assert_eq!(seen[0].resource_name, "devices.udev.io/serial");
        assert!(seen[0].options.as_ref().unwrap().get_preferred_allocation_available);
        token.cancel();
    }

    #[tokio::test]
    async fn test_rejection_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("kubelet.sock");
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();
        spawn_kubelet(
            &socket,
            FakeKubelet {
                reject: Some(Code::InvalidArgument),
                seen: seen.clone(),
            },
            token.clone(),
        );

        let client = RegistrationClient::new(&socket, fast_backoff());
        let err = client
            .register("udev-serial.sock", "devices.udev.io/serial")
            .await
            .unwrap_err();
        assert_matches!(err, RegistrationError::Rejected { .. });

        // No retries after a rejection
        assert_eq!(seen.lock().unwrap().len(), 1);
        token.cancel();
    }

    #[tokio::test]
    async fn test_missing_socket_gives_up_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let client = RegistrationClient::new(dir.path().join("kubelet.sock"), fast_backoff());

        let err = client
            .register("udev-serial.sock", "devices.udev.io/serial")
            .await
            .unwrap_err();
        assert_matches!(err, RegistrationError::Unavailable(_));
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_status_classification() {
        assert_matches!(
            classify_status("r", tonic::Status::unavailable("busy")),
            RegistrationError::Unavailable(_)
        );
        for status in [
            tonic::Status::deadline_exceeded("slow"),
            tonic::Status::cancelled("gone"),
            tonic::Status::resource_exhausted("full"),
        ] {
            let err = classify_status("r", status);
            assert!(!err.is_permanent(), "{:?}", err);
            assert_matches!(err, RegistrationError::Unavailable(_));
        }
        assert_matches!(
            classify_status("r", tonic::Status::invalid_argument("bad version")),
            RegistrationError::Rejected { .. }
        );
        assert_matches!(
            classify_status("r", tonic::Status::already_exists("taken")),
            RegistrationError::Rejected { .. }
        );
    }
}
