//! Readiness probing for starting nodes
//!
//! A node is ready as soon as its port accepts a TCP connection; there is no
//! application-level handshake. Probes run on their own tasks so the control
//! loop never waits on a slow connect.

use crate::node::Node;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

/// Try to connect to `host:port` within `timeout`. Every address the host
/// resolves to is tried in turn.
pub async fn probe_port(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "Readiness probe refused");
            false
        }
        Err(_) => {
            debug!(host, port, timeout_ms = timeout.as_millis() as u64, "Readiness probe timed out");
            false
        }
    }
}

/// Probe a node in the background and call `on_ready` if it accepts a connection.
///
/// Returns None without probing if a probe for this node is still in flight.
pub fn spawn_probe<F>(node: Arc<Node>, timeout: Duration, on_ready: F) -> Option<JoinHandle<bool>>
where
    F: FnOnce(Arc<Node>) + Send + 'static,
{
    let Some(slot) = node.probe_slot() else {
        debug!(port = node.port(), "Readiness probe already in flight");
        return None;
    };

    // The slot travels with the task and is freed even if the task never starts
    Some(tokio::spawn(async move {
        let ready = probe_port(slot.node().host(), slot.node().port(), timeout).await;
        let node = Arc::clone(slot.node());
        drop(slot);
        if ready {
            on_ready(node);
        }
        ready
    }))
}
