//! Backend pool controller
//!
//! Owns the three node queues (starting, active, closing), runs the periodic
//! control loop and hands out nodes to the proxy front-end.
//!
//! # Locking
//!
//! All queues sit behind one `parking_lot::RwLock`. [`PoolController::tick`],
//! [`PoolController::promote`], [`PoolController::shutdown`] and
//! [`PoolController::apply_settings`] take the write side, so topology changes
//! are serialised with each other. [`PoolController::route`] only takes the
//! read side; the selection policy advances its cursor atomically, so routing
//! threads never queue up behind each other.
//!
//! Readiness probes are the only operation that waits on the network. They run
//! on their own tasks and report back through `promote`, so a slow backend
//! never holds the write lock.

use crate::balancer::SelectionPolicy;
use crate::config::{BackendConfig, PoolSettings};
use crate::error::PoolError;
use crate::node::{Node, NodeState, NodeStatus};
use crate::probe;
use crate::scaling::{self, LoadSample, ScaleDecision};
use parking_lot::RwLock;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

struct PoolState {
    starting: Vec<Arc<Node>>,
    active: Vec<Arc<Node>>,
    closing: Vec<Arc<Node>>,
    /// Next port to hand out; wider than u16 so exhaustion is detectable
    next_port: u32,
    alive: bool,
    /// Set when a reload raised `min_nodes`; the next tick spawns the shortfall
    floor_raised: bool,
    settings: PoolSettings,
    backend: BackendConfig,
}

impl PoolState {
    fn allocate_port(&mut self) -> Result<u16, PoolError> {
        let port = u16::try_from(self.next_port)
            .map_err(|_| PoolError::PortsExhausted { last: u16::MAX })?;
        self.next_port += 1;
        Ok(port)
    }

    /// Spawn up to `count` nodes into `starting`. Nodes whose process fails
    /// to launch are dropped; their ports are not reused.
    fn spawn_nodes(&mut self, count: usize) -> Result<usize, PoolError> {
        let mut started = 0;
        for _ in 0..count {
            let port = self.allocate_port()?;
            let node = Arc::new(Node::with_host(self.backend.host(), port));
            match node.spawn(&self.backend) {
                Ok(()) => {
                    self.starting.push(node);
                    started += 1;
                }
                Err(e) => {
                    error!(port, error = %e, "Failed to start backend node, dropping it");
                }
            }
        }
        Ok(started)
    }

    fn state_of(&self, node: &Arc<Node>) -> Option<NodeState> {
        let contains = |queue: &[Arc<Node>]| queue.iter().any(|n| Arc::ptr_eq(n, node));
        if contains(self.starting.as_slice()) {
            Some(NodeState::Starting)
        } else if contains(self.active.as_slice()) {
            Some(NodeState::Active)
        } else if contains(self.closing.as_slice()) {
            Some(NodeState::Closing)
        } else {
            None
        }
    }
}

/// What a single control loop step did
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    /// Probes launched for starting nodes
    pub probes_issued: usize,
    /// Closing nodes that were drained and terminated
    pub reaped: usize,
    /// Requests per active node since the previous tick, None with no active nodes
    pub average_load: Option<f64>,
    pub decision: ScaleDecision,
    /// Nodes whose process actually launched
    pub spawned: usize,
}

impl TickReport {
    fn skipped() -> Self {
        Self {
            probes_issued: 0,
            reaped: 0,
            average_load: None,
            decision: ScaleDecision::NoChange,
            spawned: 0,
        }
    }
}

/// Point-in-time view of the whole pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub alive: bool,
    pub strategy: &'static str,
    pub min_nodes: usize,
    pub next_port: u32,
    pub starting: usize,
    pub active: usize,
    pub closing: usize,
    pub nodes: Vec<NodeStatus>,
}

/// Manages the elastic pool of backend nodes.
///
/// `PoolController` is shared behind an `Arc` between the control loop, the
/// proxy front-end, the probe tasks and the admin API; [`new`](Self::new)
/// returns `Arc<Self>` directly.
pub struct PoolController {
    state: RwLock<PoolState>,
    policy: Box<dyn SelectionPolicy>,
}

impl PoolController {
    /// Create a controller using the strategy named in `settings`
    pub fn new(settings: PoolSettings, backend: BackendConfig) -> Arc<Self> {
        let policy = settings.strategy.build();
        Self::with_policy(settings, backend, policy)
    }

    /// Create a controller with a custom selection policy
    pub fn with_policy(
        settings: PoolSettings,
        backend: BackendConfig,
        policy: Box<dyn SelectionPolicy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(PoolState {
                starting: Vec::new(),
                active: Vec::new(),
                closing: Vec::new(),
                next_port: u32::from(settings.base_port),
                alive: true,
                floor_raised: false,
                settings,
                backend,
            }),
            policy,
        })
    }

    /// Spawn the floor's worth of nodes. Must be called from within a tokio runtime.
    ///
    /// Fails if not a single node could be launched, since an empty pool
    /// never produces a load sample to scale up from.
    pub fn bootstrap(&self) -> Result<usize, PoolError> {
        let mut state = self.state.write();
        if !state.alive {
            return Ok(0);
        }
        let count = state.settings.min_nodes;
        let started = state.spawn_nodes(count)?;
        if started == 0 && count > 0 {
            return Err(PoolError::NoNodesStarted { requested: count });
        }
        info!(requested = count, started, "Initial backend nodes launched");
        Ok(started)
    }

    /// Pick the node for a new client connection and count the request
    pub fn route(&self) -> Result<Arc<Node>, PoolError> {
        let node = {
            let state = self.state.read();
            self.policy.choose(&state.active)?
        };
        node.record_request();
        Ok(node)
    }

    /// Move a node from starting to active. Called when its readiness probe succeeds.
    pub fn promote(&self, node: &Arc<Node>) -> bool {
        let mut state = self.state.write();
        if !state.alive {
            return false;
        }
        let Some(pos) = state.starting.iter().position(|n| Arc::ptr_eq(n, node)) else {
            debug!(port = node.port(), "Promotion ignored, node is not starting");
            return false;
        };

        let node = state.starting.remove(pos);
        info!(
            port = node.port(),
            pid = ?node.pid(),
            active = state.active.len() + 1,
            "Backend node is ready"
        );
        state.active.push(node);
        true
    }

    /// Run one control loop step.
    ///
    /// Steps run in a fixed order: issue readiness probes, reap drained
    /// closing nodes, measure load, then scale. Does nothing after shutdown.
    pub fn tick(self: &Arc<Self>) -> Result<TickReport, PoolError> {
        let mut state = self.state.write();
        if !state.alive {
            return Ok(TickReport::skipped());
        }

        // Probes report back on their own; results land on a later tick
        let timeout = state.settings.probe_timeout();
        let mut probes_issued = 0;
        for node in &state.starting {
            let controller = Arc::downgrade(self);
            let issued = probe::spawn_probe(Arc::clone(node), timeout, move |node| {
                if let Some(controller) = controller.upgrade() {
                    controller.promote(&node);
                }
            });
            if issued.is_some() {
                probes_issued += 1;
            }
        }

        // Closing nodes go away only once their last client has left
        let before = state.closing.len();
        state.closing.retain(|node| {
            if node.has_connections() {
                return true;
            }
            node.terminate();
            false
        });
        let reaped = before - state.closing.len();
        if reaped > 0 {
            info!(reaped, closing = state.closing.len(), "Drained backend nodes terminated");
        }

        let total: u64 = state
            .active
            .iter()
            .map(|node| node.drain_and_reset_count())
            .sum();
        let Some(sample) = LoadSample::from_total(total, state.active.len(), state.starting.len())
        else {
            debug!(starting = state.starting.len(), "No active nodes, skipping scaling");
            return Ok(TickReport {
                probes_issued,
                reaped,
                ..TickReport::skipped()
            });
        };

        debug!(
            average_load = sample.average,
            active = sample.active,
            starting = sample.starting,
            closing = state.closing.len(),
            "Pool load measured"
        );

        let decision = scaling::evaluate(&sample, &state.settings);
        let mut spawned = 0;
        match decision {
            ScaleDecision::RetireOne => {
                if let Some(node) = state.active.pop() {
                    info!(
                        port = node.port(),
                        average_load = sample.average,
                        active = state.active.len(),
                        "Scaling down, draining backend node"
                    );
                    state.closing.push(node);
                }
            }
            ScaleDecision::Spawn(count) => {
                info!(
                    count,
                    average_load = sample.average,
                    active = sample.active,
                    starting = sample.starting,
                    "Scaling up"
                );
                spawned = state.spawn_nodes(count)?;
            }
            ScaleDecision::NoChange => {}
        }

        if std::mem::take(&mut state.floor_raised) {
            let shortfall = state
                .settings
                .min_nodes
                .saturating_sub(state.active.len() + state.starting.len());
            if shortfall > 0 {
                info!(
                    shortfall,
                    min_nodes = state.settings.min_nodes,
                    "Raising pool to the new floor"
                );
                spawned += state.spawn_nodes(shortfall)?;
            }
        }

        Ok(TickReport {
            probes_issued,
            reaped,
            average_load: Some(sample.average),
            decision,
            spawned,
        })
    }

    /// Run one tick, logging errors and panics instead of propagating them
    pub fn run_tick(self: &Arc<Self>) -> Option<TickReport> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.tick())) {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                error!(error = %e, code = e.code(), "Pool tick failed");
                None
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(panic = %message, "Pool tick panicked");
                None
            }
        }
    }

    /// Drive the control loop until shutdown.
    ///
    /// Each tick runs to completion before the next interval starts, so ticks
    /// never overlap.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_ms = self.tick_interval().as_millis() as u64,
            strategy = self.policy.name(),
            "Pool control loop started"
        );

        loop {
            if !self.is_alive() || *shutdown_rx.borrow() {
                break;
            }

            self.run_tick();

            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval()) => {}
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Pool control loop stopped");
    }

    /// Stop the pool: terminate every node in every queue, ignoring attached
    /// connections. Later ticks and promotions do nothing.
    pub fn shutdown(&self) -> usize {
        let nodes: Vec<Arc<Node>> = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            state.alive = false;
            state
                .starting
                .drain(..)
                .chain(state.active.drain(..))
                .chain(state.closing.drain(..))
                .collect()
        };

        let mut terminated = 0;
        for node in &nodes {
            let connections = node.connection_count();
            if connections > 0 {
                warn!(port = node.port(), connections, "Terminating node with attached connections");
            }
            if node.terminate() {
                terminated += 1;
            }
        }

        info!(nodes = nodes.len(), terminated, "Backend pool shut down");
        terminated
    }

    /// Replace the runtime tunables and launch configuration.
    ///
    /// The base port and strategy are fixed at startup; changes to them are
    /// logged and ignored. New backend settings apply to future spawns only.
    pub fn apply_settings(&self, mut settings: PoolSettings, backend: BackendConfig) -> bool {
        let mut state = self.state.write();

        if settings.base_port != state.settings.base_port {
            warn!(
                current = state.settings.base_port,
                requested = settings.base_port,
                "Ignoring base_port change until restart"
            );
            settings.base_port = state.settings.base_port;
        }
        if settings.strategy != state.settings.strategy {
            warn!(
                current = ?state.settings.strategy,
                requested = ?settings.strategy,
                "Ignoring strategy change until restart"
            );
            settings.strategy = state.settings.strategy;
        }

        let changed = settings != state.settings || backend != state.backend;
        if changed {
            if settings.min_nodes > state.settings.min_nodes {
                state.floor_raised = true;
            }
            info!(
                min_nodes = settings.min_nodes,
                tick_interval_ms = settings.tick_interval_ms,
                probe_timeout_secs = settings.probe_timeout_secs,
                scale_down_threshold = settings.scale_down_threshold,
                scale_up_threshold = settings.scale_up_threshold,
                "Pool settings updated"
            );
            state.settings = settings;
            state.backend = backend;
        }
        changed
    }

    pub fn is_alive(&self) -> bool {
        self.state.read().alive
    }

    pub fn tick_interval(&self) -> Duration {
        self.state.read().settings.tick_interval()
    }

    pub fn settings(&self) -> PoolSettings {
        self.state.read().settings.clone()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Number of nodes in one queue
    pub fn count(&self, queue: NodeState) -> usize {
        let state = self.state.read();
        match queue {
            NodeState::Starting => state.starting.len(),
            NodeState::Active => state.active.len(),
            NodeState::Closing => state.closing.len(),
        }
    }

    /// Which queue a node is in, None if it has left the pool
    pub fn state_of(&self, node: &Arc<Node>) -> Option<NodeState> {
        self.state.read().state_of(node)
    }

    /// Nodes currently receiving traffic, in routing order
    pub fn active_nodes(&self) -> Vec<Arc<Node>> {
        self.state.read().active.clone()
    }

    pub fn starting_nodes(&self) -> Vec<Arc<Node>> {
        self.state.read().starting.clone()
    }

    pub fn closing_nodes(&self) -> Vec<Arc<Node>> {
        self.state.read().closing.clone()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.read();
        let nodes = state
            .starting
            .iter()
            .map(|n| n.status(NodeState::Starting))
            .chain(state.active.iter().map(|n| n.status(NodeState::Active)))
            .chain(state.closing.iter().map(|n| n.status(NodeState::Closing)))
            .collect();

        PoolSnapshot {
            alive: state.alive,
            strategy: self.policy.name(),
            min_nodes: state.settings.min_nodes,
            next_port: state.next_port,
            starting: state.starting.len(),
            active: state.active.len(),
            closing: state.closing.len(),
            nodes,
        }
    }
}

#[cfg(test)]
impl PoolController {
    /// Place a node directly into a queue
    pub(crate) fn insert_for_test(&self, queue: NodeState, node: Arc<Node>) {
        let mut state = self.state.write();
        match queue {
            NodeState::Starting => state.starting.push(node),
            NodeState::Active => state.active.push(node),
            NodeState::Closing => state.closing.push(node),
        }
    }
}
