use crate::balancer::LoadBalanceStrategy;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Placeholder in backend arguments that is replaced with the node's port
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Host the proxy and readiness probes connect to when none is configured
pub const DEFAULT_BACKEND_HOST: &str = "127.0.0.1";

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Pool sizing and control loop settings
    #[serde(default)]
    pub pool: PoolSettings,

    /// How to launch a backend node
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port the proxy accepts client connections on (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the internal admin API, always bound to 127.0.0.1
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for admin API (required for /nodes and /shutdown)
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pid_file: None,
        }
    }
}

/// Tunables of the pool controller
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PoolSettings {
    /// First port handed to a backend node; later nodes count upward
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Minimum number of active nodes kept by scale-down
    #[serde(default = "default_min_nodes")]
    pub min_nodes: usize,

    /// Control loop period in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Readiness probe connect timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Average requests per node per tick below which one node is retired
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: f64,

    /// Average requests per node per tick at or above which nodes are added
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: f64,

    /// Node selection strategy for routed connections
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            min_nodes: default_min_nodes(),
            tick_interval_ms: default_tick_interval(),
            probe_timeout_secs: default_probe_timeout(),
            scale_down_threshold: default_scale_down_threshold(),
            scale_up_threshold: default_scale_up_threshold(),
            strategy: LoadBalanceStrategy::default(),
        }
    }
}

impl PoolSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Validate the pool settings
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.base_port == 0 {
            errors.push("pool: 'base_port' must be greater than 0".to_string());
        }
        if self.min_nodes == 0 {
            errors.push("pool: 'min_nodes' must be at least 1".to_string());
        }
        if self.tick_interval_ms == 0 {
            errors.push("pool: 'tick_interval_ms' must be greater than 0".to_string());
        }
        if self.probe_timeout_secs == 0 {
            errors.push("pool: 'probe_timeout_secs' must be greater than 0".to_string());
        }
        if !self.scale_up_threshold.is_finite() || self.scale_up_threshold <= 0.0 {
            errors.push("pool: 'scale_up_threshold' must be a finite number greater than 0".to_string());
        }
        if !self.scale_down_threshold.is_finite() {
            errors.push("pool: 'scale_down_threshold' must be a finite number".to_string());
        } else if self.scale_down_threshold > self.scale_up_threshold {
            errors.push(format!(
                "pool: 'scale_down_threshold' ({}) must not exceed 'scale_up_threshold' ({})",
                self.scale_down_threshold, self.scale_up_threshold
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Launch configuration shared by every backend node
///
/// # Security Warning
///
/// The `command` and `args` fields allow arbitrary command execution.
/// Configuration files must be protected with appropriate file permissions
/// (e.g., readable only by the service user).
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct BackendConfig {
    /// Command to execute to start a node
    #[serde(default)]
    pub command: String,

    /// Arguments to pass to the command; `{port}` is replaced with the node's port
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Environment variables to set (PORT is always set)
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Forward the node's stdout/stderr into the proxy log
    #[serde(default)]
    pub log_output: bool,

    /// Host the backend listens on (default: 127.0.0.1). A name such as
    /// `localhost` is resolved and every address is tried.
    pub host: Option<String>,
}

impl BackendConfig {
    /// Create a backend config for the given command
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Self::default()
        }
    }

    /// Set arguments for this backend config (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: &str) -> Self {
        self.working_dir = Some(dir.to_string());
        self
    }

    /// Host to reach nodes on
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_BACKEND_HOST)
    }

    /// Arguments with the port placeholder substituted
    pub fn args_for_port(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }

    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("backend: 'command' is required".to_string());
        }
        if self.host.as_deref().is_some_and(|h| h.trim().is_empty()) {
            return Err("backend: 'host' must not be empty".to_string());
        }
        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_base_port() -> u16 {
    8080
}

fn default_min_nodes() -> usize {
    3
}

fn default_tick_interval() -> u64 {
    1000 // 1 second
}

fn default_probe_timeout() -> u64 {
    30 // 30 seconds
}

fn default_scale_down_threshold() -> f64 {
    1.0
}

fn default_scale_up_threshold() -> f64 {
    3.0
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.backend.validate() {
            errors.push(e);
        }

        if let Err(mut pool_errors) = self.pool.validate() {
            errors.append(&mut pool_errors);
        }

        if self.server.port == self.pool.base_port {
            errors.push(format!(
                "server: 'port' ({}) collides with pool 'base_port'",
                self.server.port
            ));
        }
        if self.server.admin_port == self.pool.base_port {
            errors.push(format!(
                "server: 'admin_port' ({}) collides with pool 'base_port'",
                self.server.admin_port
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
