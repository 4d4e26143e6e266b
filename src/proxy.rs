//! TCP front-end: accepts client connections, asks the pool for a node and
//! relays bytes in both directions until either side closes.

use crate::controller::PoolController;
use crate::error::PoolError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// The main reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    controller: Arc<PoolController>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        controller: Arc<PoolController>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            controller,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let controller = Arc::clone(&self.controller);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, controller).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    mut client: TcpStream,
    addr: SocketAddr,
    controller: Arc<PoolController>,
) -> anyhow::Result<()> {
    let node = match controller.route() {
        Ok(node) => node,
        Err(PoolError::NoBackendsAvailable) => {
            warn!(client = %addr, "No backends available, closing connection");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    // Attached before connecting so a draining node waits for us
    let connection = node.connect();
    let port = node.port();

    let mut backend = TcpStream::connect((node.host(), port))
        .await
        .map_err(|e| {
            anyhow::anyhow!("Failed to connect to backend {}:{}: {}", node.host(), port, e)
        })?;

    let _ = client.set_nodelay(true);
    let _ = backend.set_nodelay(true);

    debug!(client = %addr, port, connection = %connection.id(), "Relaying connection");

    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((to_backend, to_client)) => {
            debug!(
                client = %addr,
                port,
                bytes_to_backend = to_backend,
                bytes_to_client = to_client,
                "Connection closed"
            );
        }
        Err(e) => {
            debug!(client = %addr, port, error = %e, "Relay ended with error");
        }
    }

    Ok(())
}
