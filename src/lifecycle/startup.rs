//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Initialize all subsystems in dependency order
//! - Start background tasks (prober, watcher, signals, maintenance)
//! - Run the selected front until shutdown, then drain
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The front starts last (traffic only when the first generation is warm)
//! - File watcher and SIGHUP feed the same update channel

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::cache::CacheLayer;
use crate::config::watcher::ConfigWatcher;
use crate::config::{load_config, AggregatorConfig, ConfigError};
use crate::dispatch::Dispatcher;
use crate::health::ActiveProber;
use crate::http::HttpServer;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::{wait_for_signal, SignalEvent};
use crate::net::StdioFront;
use crate::observability::{logging, metrics};
use crate::reload::{ReloadError, ReloadManager};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Reload(#[from] ReloadError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid metrics address '{0}'")]
    MetricsAddress(String),

    #[error("failed to watch configuration: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Run the aggregator until a shutdown signal (or stdin EOF in stdio mode).
pub async fn start(config_path: &Path, stdio: bool) -> Result<(), StartupError> {
    let config = load_config(config_path)?;
    logging::init_logging(&config.observability.log_level);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        path = ?config_path,
        backends = config.backends.len(),
        front = if stdio { "stdio" } else { "http" },
        "mcp-aggregator starting"
    );

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|_| StartupError::MetricsAddress(config.observability.metrics_address.clone()))?;
        metrics::init_metrics(addr);
    }

    let cache = Arc::new(CacheLayer::new(config.cache.clone()));
    let manager = Arc::new(ReloadManager::new(config.clone(), cache).await?);
    let dispatcher = Dispatcher::new(manager.clone());
    let shutdown = Arc::new(Shutdown::new());

    let (watcher, updates) = ConfigWatcher::new(config_path);
    let reload_tx = watcher.sender();
    // Dropping the handle stops the watcher, so it lives as long as `start`.
    let _watcher = if config.reload.watch { Some(watcher.run()?) } else { None };

    tokio::spawn(ActiveProber::new(manager.clone()).run(shutdown.subscribe()));
    tokio::spawn(maintenance(manager.clone(), shutdown.subscribe()));
    tokio::spawn(handle_signals(config_path.to_path_buf(), reload_tx, shutdown.clone()));

    if stdio {
        let stop_reloads = CancellationToken::new();
        let reloads = tokio::spawn(manager.clone().follow(updates, stop_reloads.clone()));
        let served = StdioFront::new(dispatcher).run(shutdown.subscribe()).await;
        stop_reloads.cancel();
        if let Err(e) = reloads.await {
            tracing::error!(error = %e, "Config update task failed");
        }
        served?;
    } else {
        let listener = bind(&config).await?;
        HttpServer::new(dispatcher).run(listener, updates, shutdown.subscribe()).await?;
    }

    shutdown.trigger();
    manager.drain_all().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn bind(config: &AggregatorConfig) -> Result<TcpListener, StartupError> {
    let address = config.listener.bind_address.clone();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|source| StartupError::Bind { address, source })?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");
    Ok(listener)
}

async fn handle_signals(
    config_path: PathBuf,
    reload_tx: mpsc::UnboundedSender<AggregatorConfig>,
    shutdown: Arc<Shutdown>,
) {
    loop {
        match wait_for_signal().await {
            Ok(SignalEvent::Shutdown) => {
                shutdown.trigger();
                break;
            }
            Ok(SignalEvent::Reload) => match load_config(&config_path) {
                Ok(config) => {
                    let _ = reload_tx.send(config);
                }
                Err(e) => tracing::error!(error = %e, "Reload on SIGHUP failed, keeping current configuration"),
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
                break;
            }
        }
    }
}

/// Periodic housekeeping: expired cache entries and idle connections.
async fn maintenance(manager: Arc<ReloadManager>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let purged = manager.cache().purge_expired();
                let evicted = manager.current().pools().evict_idle();
                if purged > 0 || evicted > 0 {
                    tracing::debug!(purged, evicted, "Maintenance pass");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
