use mavrouter_manager::api::{ApiServer, PKG_NAME, VERSION};
use mavrouter_manager::backend::BackendRegistry;
use mavrouter_manager::config::Config;
use mavrouter_manager::manager::Manager;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mavrouter_manager=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("mavrouter-manager.toml"));

    let mut config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        warn!(path = %config_path.display(), "Configuration file not found, using defaults");
        Config::default()
    };

    config.manager.settings_file = Some(config.manager.settings_path());
    print_startup_banner(&config);

    // Discover installed routers
    let registry =
        BackendRegistry::discover(&config.manager.binaries, config.manager.version_timeout()).await;
    if registry.is_empty() {
        error!("No MAVLink router backend is installed");
        anyhow::bail!("no router backend available");
    }
    info!(backends = ?registry.names(), "Router backends available");

    let manager = Manager::new(
        registry,
        &config.manager,
        config.default_endpoints()?,
        config.master()?,
    )?;

    match manager.load_settings() {
        Ok(loaded) => info!(
            path = %config.manager.settings_path().display(),
            loaded,
            "Settings loaded"
        ),
        Err(e) => warn!(
            error = %e,
            "Failed to load settings, continuing with defaults and without saving"
        ),
    }

    if config.manager.autostart && manager.master().is_some() {
        if let Err(e) = manager.start().await {
            error!(error = %e, "Failed to start router");
        }
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watchdog_handle = manager.spawn_watchdog(shutdown_rx.clone());

    // Create control API server (if port > 0)
    let api_handle = if config.server.port > 0 {
        let api_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
            .parse()
            .map_err(|e| {
                error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid API bind address");
                anyhow::anyhow!("Invalid API bind address: {}", e)
            })?;

        let api_server = ApiServer::new(api_addr, Arc::clone(&manager), shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = api_server.run().await {
                error!(error = %e, "Control API error");
            }
        }))
    } else {
        None
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping router...");
    manager.stop().await?;

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = watchdog_handle.await;
        if let Some(handle) = api_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting MAVLink router manager");
    info!(
        bind = %config.server.bind,
        port = if config.server.port > 0 { Some(config.server.port) } else { None },
        "Control API configuration"
    );
    info!(
        settings_file = %config.manager.settings_path().display(),
        preferred_backend = ?config.manager.preferred_backend,
        watchdog_interval_ms = config.manager.watchdog_interval_ms,
        settle_delay_ms = config.manager.settle_delay_ms,
        stop_timeout_secs = config.manager.stop_timeout_secs,
        autostart = config.manager.autostart,
        "Manager settings"
    );
}
