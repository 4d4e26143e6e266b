//! Error types for the backend pool

use thiserror::Error;

/// Errors produced by the pool controller and its nodes
#[derive(Debug, Error)]
pub enum PoolError {
    /// The active set is empty, so a connection cannot be routed
    #[error("no backends available")]
    NoBackendsAvailable,

    /// The OS refused to launch the backend process
    #[error("failed to spawn backend on port {port}: {source}")]
    Spawn {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The backend launch configuration has no command
    #[error("backend command is empty")]
    InvalidCommand,

    /// Every port above the base port has already been handed out
    #[error("no ports left to assign above {last}")]
    PortsExhausted { last: u16 },

    /// None of the initial nodes could be launched
    #[error("none of the {requested} initial backend nodes started")]
    NoNodesStarted { requested: usize },
}

impl PoolError {
    /// Short machine-readable code, used in logs and admin responses
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::NoBackendsAvailable => "NO_BACKENDS_AVAILABLE",
            PoolError::Spawn { .. } => "SPAWN_FAILED",
            PoolError::InvalidCommand => "INVALID_COMMAND",
            PoolError::PortsExhausted { .. } => "PORTS_EXHAUSTED",
            PoolError::NoNodesStarted { .. } => "NO_NODES_STARTED",
        }
    }
}
