//! Socks Relay - Entry Point
//!
//! Loads the proxy list, then starts the relay, the maintenance services and
//! the status API with graceful shutdown support.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use socks_relay::api::StatusServer;
use socks_relay::config::{Config, LogConfig};
use socks_relay::proxy::feed::source_from_config;
use socks_relay::proxy::{PoolManager, RelayServer, SessionHandler, UpstreamConnector};
use socks_relay::services::{
    BlacklistDecayService, FeedRefreshService, ServiceHandle, StatsReporterService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;
    init_tracing(&config.log, config.relay.verbose);

    info!("Starting Socks Relay");

    let source = source_from_config(&config.feed).context("Invalid proxy list source")?;
    let pool = Arc::new(PoolManager::new(source, config.feed_filter()));

    pool.load_candidates()
        .await
        .context("Failed to load the initial proxy list")?;
    let Some(active) = pool.ensure_active() else {
        bail!("No proxy could be selected from the proxy list");
    };
    info!("Using upstream proxy {}", active);

    let relay_addr: SocketAddr = config
        .relay_addr()
        .parse()
        .with_context(|| format!("Invalid relay address {}", config.relay_addr()))?;

    let handler = Arc::new(SessionHandler::new(
        pool.clone(),
        UpstreamConnector::new(config.upstream.clone()),
        config.session(),
    ));
    let relay = RelayServer::bind(relay_addr, handler)
        .await
        .with_context(|| format!("Failed to bind relay on {}", relay_addr))?;

    let status = if config.status.enabled {
        let status_addr: SocketAddr = config
            .status_addr()
            .parse()
            .with_context(|| format!("Invalid status address {}", config.status_addr()))?;
        Some(
            StatusServer::bind(status_addr, pool.clone())
                .await
                .with_context(|| format!("Failed to bind status API on {}", status_addr))?,
        )
    } else {
        None
    };

    let (handle, refresh_shutdown) = ServiceHandle::new();

    let refresh = FeedRefreshService::new(pool.clone(), config.feed.refresh_interval);
    let refresh_task = tokio::spawn(async move {
        refresh.run(refresh_shutdown).await;
    });

    let decay = BlacklistDecayService::new(pool.clone(), config.maintenance.blacklist_decay_interval);
    let decay_shutdown = handle.subscribe();
    let decay_task = tokio::spawn(async move {
        decay.run(decay_shutdown).await;
    });

    let stats = StatsReporterService::new(pool.clone(), config.maintenance.stats_interval);
    let stats_shutdown = handle.subscribe();
    let stats_task = tokio::spawn(async move {
        stats.run(stats_shutdown).await;
    });

    let relay_shutdown = handle.subscribe();
    let relay_task = tokio::spawn(async move {
        if let Err(e) = relay.run(relay_shutdown).await {
            error!("Relay server error: {}", e);
        }
    });

    let status_shutdown = handle.subscribe();
    let status_task = tokio::spawn(async move {
        match status {
            Some(server) => {
                if let Err(e) = server.run(status_shutdown).await {
                    error!("Status API error: {}", e);
                }
            }
            None => info!("Status API disabled"),
        }
    });

    info!("Relay started - SOCKS5: {}", relay_addr);

    shutdown_signal().await;
    info!("Shutdown signal received");

    handle.shutdown();

    let _ = tokio::join!(refresh_task, decay_task, stats_task, relay_task, status_task);

    info!("Socks Relay stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig, verbose: bool) {
    let default_filter = if verbose {
        "socks_relay=debug,tower_http=info".to_string()
    } else {
        format!("socks_relay={},tower_http=info", log.level)
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
