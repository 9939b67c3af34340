//! Broker server: accept loops for client and worker sockets.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::client::ClientConnection;
use super::worker::{WorkerDispatch, WorkerHandler, WorkerRegistry};
use crate::bridge::codec::DEFAULT_MAX_BODY_SIZE;
use crate::slot::SlotStore;
use crate::webhook::WebhookInvoker;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Second port for worker processes. No worker listener when unset.
    pub worker_port: Option<u16>,
    /// Largest inbound body accepted before the connection is dropped.
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 12000,
            worker_port: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_worker_port(mut self, port: u16) -> Self {
        self.worker_port = Some(port);
        self
    }

    pub fn with_max_body_size(mut self, max: usize) -> Self {
        self.max_body_size = max;
        self
    }
}

/// Bound listeners plus the state every connection shares.
pub struct BrokerServer {
    config: ServerConfig,
    client_listener: TcpListener,
    worker_listener: Option<TcpListener>,
    local_addr: SocketAddr,
    worker_addr: Option<SocketAddr>,
    store: Arc<SlotStore>,
    workers: Arc<WorkerRegistry>,
    worker_handler: WorkerHandler,
}

impl BrokerServer {
    pub async fn bind(
        config: ServerConfig,
        invoker: Arc<dyn WebhookInvoker>,
        dispatch: Arc<dyn WorkerDispatch>,
    ) -> anyhow::Result<Self> {
        let client_listener = listen(&config.host, config.port, "client").await?;
        let local_addr = client_listener.local_addr()?;

        let (worker_listener, worker_addr) = match config.worker_port {
            Some(port) => {
                let listener = listen(&config.host, port, "worker").await?;
                let bound = listener.local_addr()?;
                (Some(listener), Some(bound))
            }
            None => (None, None),
        };

        let worker_handler = WorkerHandler::new(dispatch).with_max_body_size(config.max_body_size);

        Ok(Self {
            config,
            client_listener,
            worker_listener,
            local_addr,
            worker_addr,
            store: Arc::new(SlotStore::new(invoker)),
            workers: Arc::new(WorkerRegistry::new()),
            worker_handler,
        })
    }

    /// Address the client listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn worker_addr(&self) -> Option<SocketAddr> {
        self.worker_addr
    }

    pub fn store(&self) -> &Arc<SlotStore> {
        &self.store
    }

    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    /// Accept until `shutdown` fires. Open connections are cancelled with it.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(addr = %self.local_addr, worker_addr = ?self.worker_addr, "Broker listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.client_listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_client(stream, peer, &shutdown),
                    Err(e) => accept_failed("client", e).await,
                },
                accepted = accept_optional(self.worker_listener.as_ref()) => match accepted {
                    Ok((stream, peer)) => self.spawn_worker(stream, peer, &shutdown),
                    Err(e) => accept_failed("worker", e).await,
                },
            }
        }

        info!("Broker stopped accepting connections");
        Ok(())
    }

    fn spawn_client(&self, stream: TcpStream, peer: SocketAddr, shutdown: &CancellationToken) {
        tracing::debug!(%peer, "Client connected");
        let conn = ClientConnection::new(Arc::clone(&self.store), peer, shutdown.child_token())
            .with_max_body_size(self.config.max_body_size);

        tokio::spawn(async move {
            match conn.serve(stream).await {
                Ok(()) => tracing::debug!(%peer, "Client disconnected"),
                Err(e) => tracing::error!(%peer, error = %e, "Client connection failed"),
            }
        });
    }

    fn spawn_worker(&self, stream: TcpStream, peer: SocketAddr, shutdown: &CancellationToken) {
        let (worker, task) = match self.worker_handler.spawn_tcp(stream, shutdown.child_token()) {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(%peer, error = %e, "Failed to start worker connection");
                return;
            }
        };

        self.workers.insert(Arc::clone(&worker));
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                tracing::error!(worker_id = %worker.id(), error = %e, "Worker task failed");
            }
            workers.remove(&worker.id());
        });
    }
}

/// Bind `host` (an IP literal, IPv6 included, or a resolvable name) on `port`.
async fn listen(host: &str, port: u16, role: &str) -> anyhow::Result<TcpListener> {
    TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {role} listener on {host} port {port}"))
}

async fn accept_optional(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn accept_failed(role: &str, e: io::Error) {
    // Usually fd exhaustion; back off instead of spinning on it.
    tracing::error!(role, error = %e, "Failed to accept connection");
    tokio::time::sleep(Duration::from_secs(1)).await;
}

/// Bind, serve and stop on SIGINT or SIGTERM.
pub async fn serve(
    config: ServerConfig,
    invoker: Arc<dyn WebhookInvoker>,
    dispatch: Arc<dyn WorkerDispatch>,
) -> anyhow::Result<()> {
    let server = BrokerServer::bind(config, invoker, dispatch).await?;

    let shutdown = CancellationToken::new();
    let signal = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    server.run(shutdown).await?;
    signal.abort();

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
///
/// If a handler cannot be installed that signal is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
