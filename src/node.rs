//! A backend node: one local child process, the client connections routed
//! to it, and the number of requests it received since the last tick.

use crate::config::{BackendConfig, DEFAULT_BACKEND_HOST};
use crate::error::PoolError;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifier of a client connection attached to a node
pub type ConnectionId = Uuid;

/// Which pool queue a node currently sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Process launched, waiting for its port to accept connections
    Starting,
    /// Receiving routed connections
    Active,
    /// Retired; waiting for attached connections to finish
    Closing,
}

/// Point-in-time view of a node
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub port: u16,
    pub state: NodeState,
    pub pid: Option<u32>,
    pub connections: usize,
    pub pending_requests: u64,
    pub uptime_secs: u64,
}

/// One backend process in the pool.
///
/// Queue membership lives in the controller; the node only tracks what
/// belongs to it: the child process, attached connections and the request
/// counter.
pub struct Node {
    host: String,
    port: u16,
    process: Mutex<Option<Child>>,
    connections: Mutex<HashSet<ConnectionId>>,
    requests: AtomicU64,
    probing: AtomicBool,
    created_at: Instant,
}

impl Node {
    pub fn new(port: u16) -> Self {
        Self::with_host(DEFAULT_BACKEND_HOST, port)
    }

    /// A node whose backend is reached at `host:port`
    pub fn with_host(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            process: Mutex::new(None),
            connections: Mutex::new(HashSet::new()),
            requests: AtomicU64::new(0),
            probing: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Host the proxy and the readiness probe connect to
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Launch the backend process for this node.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, config: &BackendConfig) -> Result<(), PoolError> {
        if config.command.trim().is_empty() {
            return Err(PoolError::InvalidCommand);
        }

        let port = self.port;
        let mut cmd = Command::new(&config.command);
        cmd.args(config.args_for_port(port));
        cmd.stdin(Stdio::null());
        if config.log_output {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }

        if let Some(ref working_dir) = config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        cmd.env("PORT", port.to_string());

        // A node dropped without terminate() must not leave an orphan behind
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|source| PoolError::Spawn { port, source })?;
        let pid = child.id().unwrap_or(0);

        if config.log_output {
            if let Some(stdout) = child.stdout.take() {
                forward_output(port, "stdout", stdout);
            }
            if let Some(stderr) = child.stderr.take() {
                forward_output(port, "stderr", stderr);
            }
        }

        info!(port, pid, command = %config.command, "Backend node spawned");

        if let Some(previous) = self.process.lock().replace(child) {
            warn!(port, pid = ?previous.id(), "Replaced a running backend process");
        }
        Ok(())
    }

    /// Force-kill the backend process. Returns false if there was nothing to kill.
    pub fn terminate(&self) -> bool {
        let Some(mut child) = self.process.lock().take() else {
            return false;
        };

        let pid = child.id();
        if let Err(e) = child.start_kill() {
            // Usually means the process already exited on its own
            debug!(port = self.port, ?pid, error = %e, "Kill signal not delivered");
        }
        info!(port = self.port, ?pid, "Backend node terminated");

        // Reap the exit status in the background when a runtime is around
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = child.wait().await;
                });
            }
            Err(_) => drop(child),
        }
        true
    }

    /// Whether this node still owns a process handle
    pub fn has_process(&self) -> bool {
        self.process.lock().is_some()
    }

    /// Whether the owned process is still alive
    pub fn is_running(&self) -> bool {
        self.process
            .lock()
            .as_mut()
            .map(|child| matches!(child.try_wait(), Ok(None)))
            .unwrap_or(false)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.lock().as_ref().and_then(|child| child.id())
    }

    /// Register a client connection. Returns false if it was already attached.
    pub fn attach(&self, id: ConnectionId) -> bool {
        self.connections.lock().insert(id)
    }

    /// Unregister a client connection. Returns false if it was not attached.
    pub fn detach(&self, id: ConnectionId) -> bool {
        self.connections.lock().remove(&id)
    }

    /// Attach a fresh connection id that is detached when the guard drops
    pub fn connect(self: &Arc<Self>) -> ConnectionGuard {
        let id = Uuid::new_v4();
        self.attach(id);
        ConnectionGuard {
            node: Arc::clone(self),
            id,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn has_connections(&self) -> bool {
        !self.connections.lock().is_empty()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests recorded since the last drain
    pub fn pending_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Read and zero the request counter in one step
    pub fn drain_and_reset_count(&self) -> u64 {
        self.requests.swap(0, Ordering::AcqRel)
    }

    /// Claim the probe slot. Returns None if a probe is already in flight.
    ///
    /// The slot is released when the returned guard drops, including during
    /// a panic unwind.
    pub(crate) fn probe_slot(self: &Arc<Self>) -> Option<ProbeSlot> {
        self.probing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ProbeSlot {
                node: Arc::clone(self),
            })
    }

    pub fn is_probing(&self) -> bool {
        self.probing.load(Ordering::Acquire)
    }

    pub fn status(&self, state: NodeState) -> NodeStatus {
        NodeStatus {
            port: self.port,
            state,
            pid: self.pid(),
            connections: self.connection_count(),
            pending_requests: self.pending_requests(),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("pid", &self.pid())
            .field("connections", &self.connection_count())
            .field("requests", &self.pending_requests())
            .finish()
    }
}

/// Keeps a connection attached to its node for as long as it lives
#[derive(Debug)]
pub struct ConnectionGuard {
    node: Arc<Node>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.node.detach(self.id);
    }
}

/// Exclusive right to probe a node
#[derive(Debug)]
pub(crate) struct ProbeSlot {
    node: Arc<Node>,
}

impl ProbeSlot {
    pub(crate) fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Drop for ProbeSlot {
    fn drop(&mut self) {
        self.node.probing.store(false, Ordering::Release);
    }
}

/// Copy a child's output stream into the log, line by line
fn forward_output<R>(port: u16, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end();
                    if !line.is_empty() {
                        info!(target: "backend", port, stream, "{}", line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(port, stream, error = %e, "Backend output stream closed");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleep_config() -> BackendConfig {
        BackendConfig::new("sleep").with_args(vec!["60".to_string()])
    }

    #[test]
    fn test_new_node_is_idle() {
        let node = Node::new(8080);
        assert_eq!(node.port(), 8080);
        assert!(!node.has_process());
        assert!(!node.is_running());
        assert_eq!(node.pid(), None);
        assert_eq!(node.connection_count(), 0);
        assert_eq!(node.pending_requests(), 0);
    }

    #[test]
    fn test_attach_and_detach() {
        let node = Node::new(8080);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(node.attach(a));
        assert!(node.attach(b));
        assert!(!node.attach(a));
        assert_eq!(node.connection_count(), 2);

        assert!(node.detach(a));
        assert!(!node.detach(a));
        assert_eq!(node.connection_count(), 1);
        assert!(node.has_connections());

        node.detach(b);
        assert!(!node.has_connections());
    }

    #[test]
    fn test_connection_guard_detaches_on_drop() {
        let node = Arc::new(Node::new(8080));

        let first = node.connect();
        let second = node.connect();
        assert_ne!(first.id(), second.id());
        assert_eq!(node.connection_count(), 2);

        drop(first);
        assert_eq!(node.connection_count(), 1);
        drop(second);
        assert_eq!(node.connection_count(), 0);
    }

    #[test]
    fn test_concurrent_attach_detach() {
        let node = Arc::new(Node::new(8080));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let node = Arc::clone(&node);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let guard = node.connect();
                        node.record_request();
                        drop(guard);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(node.connection_count(), 0);
        assert_eq!(node.pending_requests(), 1600);
    }

    #[test]
    fn test_drain_and_reset_count() {
        let node = Node::new(8080);
        node.record_request();
        node.record_request();
        node.record_request();

        assert_eq!(node.drain_and_reset_count(), 3);
        assert_eq!(node.drain_and_reset_count(), 0);

        node.record_request();
        assert_eq!(node.pending_requests(), 1);
    }

    #[test]
    fn test_probe_slot_is_exclusive() {
        let node = Arc::new(Node::new(8080));
        let slot = node.probe_slot().unwrap();
        assert!(node.is_probing());
        assert!(node.probe_slot().is_none());
        drop(slot);
        assert!(!node.is_probing());
        assert!(node.probe_slot().is_some());
    }

    #[test]
    fn test_probe_slot_released_on_panic() {
        let node = Arc::new(Node::new(8080));
        let held = Arc::clone(&node);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _slot = held.probe_slot().unwrap();
            panic!("probe task could not start");
        }));
        assert!(result.is_err());
        assert!(!node.is_probing());
    }

    #[test]
    fn test_node_host() {
        assert_eq!(Node::new(8080).host(), "127.0.0.1");
        let node = Node::with_host("localhost", 8081);
        assert_eq!(node.host(), "localhost");
        assert_eq!(node.port(), 8081);
    }

    #[test]
    fn test_terminate_without_process_is_noop() {
        let node = Node::new(8080);
        assert!(!node.terminate());
        assert!(!node.terminate());
    }

    #[test]
    fn test_spawn_rejects_empty_command() {
        let node = Node::new(8080);
        let result = node.spawn(&BackendConfig::default());
        assert!(matches!(result, Err(PoolError::InvalidCommand)));
        assert!(!node.has_process());
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let node = Node::new(8080);
        let config = BackendConfig::new("/nonexistent/scalegate-backend");

        match node.spawn(&config) {
            Err(PoolError::Spawn { port, .. }) => assert_eq!(port, 8080),
            other => panic!("expected spawn error, got {:?}", other),
        }
        assert!(!node.has_process());
    }

    #[tokio::test]
    async fn test_spawn_and_terminate() {
        let node = Node::new(8080);
        node.spawn(&sleep_config()).unwrap();

        assert!(node.has_process());
        assert!(node.is_running());
        assert!(node.pid().is_some());

        assert!(node.terminate());
        assert!(!node.has_process());
        assert!(!node.is_running());

        // Idempotent
        assert!(!node.terminate());
    }

    #[tokio::test]
    async fn test_spawn_with_log_output() {
        let node = Node::new(8080);
        let mut config = BackendConfig::new("echo").with_args(vec!["listening on {port}".to_string()]);
        config.log_output = true;

        node.spawn(&config).unwrap();

        // echo exits immediately; give it a moment
        let start = Instant::now();
        while node.is_running() && start.elapsed() < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!node.is_running());
        // Exited on its own, but the handle is still owned until terminate
        assert!(node.has_process());
        assert!(node.terminate());
    }

    #[test]
    fn test_status_reports_state() {
        let node = Node::new(9000);
        node.attach(Uuid::new_v4());
        node.record_request();

        let status = node.status(NodeState::Closing);
        assert_eq!(status.port, 9000);
        assert_eq!(status.state, NodeState::Closing);
        assert_eq!(status.connections, 1);
        assert_eq!(status.pending_requests, 1);
        assert_eq!(status.pid, None);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "closing");
    }
}
