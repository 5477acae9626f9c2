//! Status Server
//!
//! Serves the status router over HTTP until the agent shuts down.

use crate::error::{Error, Result};
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default status API bind address
pub const DEFAULT_STATUS_ADDR: &str = "0.0.0.0:8090";

/// Bind `addr` and serve `app` until `shutdown` fires
pub async fn run_status_server(
    addr: SocketAddr,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        Error::Internal(format!("Failed to bind status server on {}: {}", addr, e))
    })?;
    serve_status(listener, app, shutdown).await
}

/// Serve `app` on an already bound listener
pub async fn serve_status(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Status API listening on {}", addr);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Status server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("Status server error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn test_default_addr() {
        let addr: SocketAddr = DEFAULT_STATUS_ADDR.parse().unwrap();
        assert_eq!(addr.port(), 8090);
    }

    #[tokio::test]
    async fn test_serves_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let app = Router::new().route("/healthz", get(|| async { "ok" }));
        let server = tokio::spawn(serve_status(listener, app, token.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("ok"));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let result = run_status_server(addr, Router::new(), CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Internal(_))));
    }
}
