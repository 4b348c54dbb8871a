use devgate::config::Config;
use devgate::error::StartError;
use devgate::mode::ModeDetector;
use devgate::pool::{ConnectionPool, PoolConfig};
use devgate::process::{ProcessSupervisor, ShutdownGuard};
use devgate::proxy::{ProxyServer, ReverseProxyRouter};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_CONFIG_PATH: &str = "devgate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = load_config().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    let mode = ModeDetector::from_env(&config.profiles);
    print_startup_banner(&config, &mode);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = ProcessSupervisor::new(Arc::new(config.dev_server.clone()));
    let guard = ShutdownGuard::new(Arc::clone(&supervisor));

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let router = Arc::new(ReverseProxyRouter::new(
        Arc::clone(&supervisor),
        mode.clone(),
        config.server.excluded_prefixes.clone(),
        ConnectionPool::new(pool_config),
        config.server.request_timeout(),
    ));

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

    let server = ProxyServer::new(bind_addr, router, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Listen for Ctrl+C/SIGTERM before starting the dev server so a signal
    // during a slow start still tears the child down
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);
    let mut signalled = false;

    if mode.is_development() {
        tokio::select! {
            result = supervisor.auto_start() => match result {
                Ok(()) => {
                    info!(url = %supervisor.base_url(), "Dev server is up, proxying frontend requests");
                }
                Err(StartError::Disabled) => {
                    info!("Dev server auto-start disabled, frontend requests answer 503 until it runs");
                }
                Err(e) if config.dev_server.required => {
                    error!(error = %e, "Required dev server failed to start");
                    let _ = shutdown_tx.send(true);
                    guard.release().await;
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(error = %e, "Dev server failed to start, frontend requests answer 503");
                }
            },
            _ = &mut shutdown => {
                warn!("Shutdown requested while the dev server was starting");
                signalled = true;
            }
        }
    } else if mode.is_production() {
        info!(
            build_dir = %config.dev_server.build_path().display(),
            "Production mode, frontend is served from the build output"
        );
    } else {
        info!(
            profiles = ?mode.profiles(),
            "No development or production profile active, frontend requests answer 404"
        );
    }

    if !signalled {
        shutdown.await;
    }

    let _ = shutdown_tx.send(true);

    info!("Stopping dev server...");
    guard.release().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Config from the first argument, `devgate.toml` if present, or defaults
fn load_config() -> anyhow::Result<Config> {
    if let Some(path) = std::env::args().nth(1).map(PathBuf::from) {
        let config = Config::load(&path)?;
        info!(path = %path.display(), "Configuration loaded");
        return Ok(config);
    }

    let path = PathBuf::from(DEFAULT_CONFIG_PATH);
    if path.exists() {
        let config = Config::load(&path)?;
        info!(path = %path.display(), "Configuration loaded");
        return Ok(config);
    }

    info!("No configuration file found, using defaults");
    let config = Config::default();
    config.validate()?;
    Ok(config)
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config, mode: &ModeDetector) {
    info!(name = PKG_NAME, version = VERSION, "Starting development proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        excluded_prefixes = ?config.server.excluded_prefixes,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        profiles = ?mode.profiles(),
        mode = ?mode.mode(),
        "Runtime mode"
    );
    let dev = &config.dev_server;
    info!(
        url = %dev.base_url(),
        working_dir = %dev.working_dir.display(),
        enabled = dev.enabled,
        auto_start = dev.auto_start,
        required = dev.required,
        startup_timeout_secs = dev.startup_timeout_secs,
        shutdown_grace_period_secs = dev.shutdown_grace_period_secs,
        "Dev server settings"
    );
}
