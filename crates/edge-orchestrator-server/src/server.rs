//! Listener lifecycle.
//!
//! The front door and the loopback server each run on a [`ServerHandle`],
//! which can be shut down and replaced independently.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use edge_orchestrator_common::OrchestratorError;

/// How long a graceful shutdown may wait for open connections.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running axum server.
#[derive(Debug)]
pub struct ServerHandle {
    /// The address the server is bound to.
    addr: SocketAddr,
    /// Shutdown signal sender.
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Server task handle.
    task: JoinHandle<std::io::Result<()>>,
}

impl ServerHandle {
    /// Bind `host:port` and serve `app` in the background.
    ///
    /// Port `0` asks the OS for a free port. Handlers can extract the peer
    /// address through `ConnectInfo<SocketAddr>`.
    ///
    /// # Errors
    ///
    /// Returns `StartupFailure` if the address cannot be bound.
    pub async fn bind(host: &str, port: u16, app: Router) -> Result<Self, OrchestratorError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|err| OrchestratorError::startup_io(format!("Failed to bind {host}:{port}"), err))?;
        let addr = listener
            .local_addr()
            .map_err(|err| OrchestratorError::startup_io("Failed to get local address", err))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
        });

        info!(%addr, "Listening");
        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shutdown the server, waiting briefly for open connections.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task).await {
            Ok(Ok(Ok(()))) => debug!(addr = %self.addr, "Server stopped"),
            Ok(Ok(Err(err))) => warn!(addr = %self.addr, error = %err, "Server stopped with error"),
            Ok(Err(err)) => warn!(addr = %self.addr, error = %err, "Server task failed"),
            Err(_) => {
                warn!(addr = %self.addr, "Server did not stop in time, aborting");
                self.task.abort();
            }
        }
    }
}

/// `addr` with an unspecified IP replaced by loopback, for connecting.
pub fn connectable(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        let ip = if addr.is_ipv4() {
            std::net::Ipv4Addr::LOCALHOST.into()
        } else {
            std::net::Ipv6Addr::LOCALHOST.into()
        };
        SocketAddr::new(ip, addr.port())
    } else {
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[tokio::test]
    async fn test_bind_serve_shutdown() {
        let app = Router::new().route("/", get(|| async { "OK" }));
        let handle = ServerHandle::bind("127.0.0.1", 0, app).await.unwrap();
        let addr = handle.addr();
        assert_ne!(addr.port(), 0);

        let body = reqwest::get(format!("http://{addr}/"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "OK");

        handle.shutdown().await;
    }

    #[test]
    fn test_connectable() {
        let addr: SocketAddr = "0.0.0.0:8787".parse().unwrap();
        assert_eq!(connectable(addr), "127.0.0.1:8787".parse().unwrap());

        let addr: SocketAddr = "[::]:1".parse().unwrap();
        assert_eq!(connectable(addr), "[::1]:1".parse().unwrap());

        let addr: SocketAddr = "10.0.0.2:80".parse().unwrap();
        assert_eq!(connectable(addr), addr);
    }
}
