use scalegate::admin::{AdminServer, PKG_NAME, VERSION};
use scalegate::config::Config;
use scalegate::controller::PoolController;
use scalegate::proxy::ProxyServer;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scalegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid proxy bind address");
            anyhow::anyhow!("Invalid proxy bind address: {}", e)
        })?;

    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    let controller = PoolController::new(config.pool.clone(), config.backend.clone());

    // Refuse to serve without the initial floor
    if let Err(e) = controller.bootstrap() {
        error!(error = %e, code = e.code(), "Failed to launch initial backend nodes");
        controller.shutdown();
        return Err(e.into());
    }

    // Control loop
    let control_handle = tokio::spawn(Arc::clone(&controller).run(shutdown_rx.clone()));

    // Proxy front-end
    let proxy = ProxyServer::new(proxy_addr, Arc::clone(&controller), shutdown_rx.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(
        admin_addr,
        Arc::clone(&controller),
        Arc::clone(&shutdown_tx),
        admin_token,
    );
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    wait_for_shutdown(&config_path, &controller, shutdown_rx).await?;

    // Signal shutdown
    shutdown_tx.send_replace(true);

    info!("Stopping all backends...");
    let terminated = controller.shutdown();
    info!(terminated, "Backends stopped");

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = control_handle.await;
        let _ = proxy_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Block until a shutdown trigger fires: Ctrl+C, SIGTERM, an `exit` line on
/// stdin or the admin API. SIGHUP reloads the pool settings in place.
async fn wait_for_shutdown(
    config_path: &Path,
    controller: &Arc<PoolController>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut console = spawn_console_reader();
    let mut console_open = true;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    reload_config(config_path, controller);
                }
                line = console.recv(), if console_open => {
                    if handle_console_line(line, &mut console_open) {
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown requested via admin API");
                        break;
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (config_path, controller);
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                    break;
                }
                line = console.recv(), if console_open => {
                    if handle_console_line(line, &mut console_open) {
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown requested via admin API");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Read console lines on a plain thread so a pending read never holds up
/// runtime shutdown
fn spawn_console_reader() -> mpsc::UnboundedReceiver<std::io::Result<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        use std::io::BufRead;
        for line in std::io::stdin().lock().lines() {
            let failed = line.is_err();
            if tx.send(line).is_err() || failed {
                break;
            }
        }
    });
    rx
}

/// Returns true when the operator typed `exit`
fn handle_console_line(line: Option<std::io::Result<String>>, console_open: &mut bool) -> bool {
    match line {
        Some(Ok(line)) => {
            if line.trim() == "exit" {
                info!("Received exit command, shutting down...");
                return true;
            }
            false
        }
        None => {
            // Detached or redirected stdin; keep serving
            *console_open = false;
            false
        }
        Some(Err(e)) => {
            warn!(error = %e, "Failed to read console input");
            *console_open = false;
            false
        }
    }
}

#[cfg(unix)]
fn reload_config(config_path: &Path, controller: &PoolController) {
    match Config::load(config_path) {
        Ok(config) => {
            if controller.apply_settings(config.pool, config.backend) {
                info!("Configuration reloaded successfully");
            } else {
                info!("Configuration unchanged");
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to reload configuration");
        }
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        "Server configuration"
    );
    info!(
        base_port = config.pool.base_port,
        min_nodes = config.pool.min_nodes,
        strategy = ?config.pool.strategy,
        tick_interval_ms = config.pool.tick_interval_ms,
        probe_timeout_secs = config.pool.probe_timeout_secs,
        "Pool settings"
    );
    info!(
        scale_down_threshold = config.pool.scale_down_threshold,
        scale_up_threshold = config.pool.scale_up_threshold,
        "Scaling thresholds"
    );
    info!(
        command = %config.backend.command,
        args = ?config.backend.args,
        host = config.backend.host(),
        working_dir = ?config.backend.working_dir,
        log_output = config.backend.log_output,
        "Backend command"
    );
}
