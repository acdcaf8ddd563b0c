//! Status API server using Axum

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::error::{RelayError, Result};
use crate::proxy::pool::PoolManager;

use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<PoolManager>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(pool: Arc<PoolManager>) -> Self {
        Self {
            pool,
            started_at: Instant::now(),
        }
    }
}

/// Status API server
pub struct StatusServer {
    listener: TcpListener,
    state: AppState,
}

impl StatusServer {
    /// Bind the listening socket
    pub async fn bind(addr: SocketAddr, pool: Arc<PoolManager>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: AppState::new(pool),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Build the router
    pub fn build_router(state: AppState) -> Router {
        routes::create_router(state).layer(TraceLayer::new_for_http())
    }

    /// Run the status API server
    #[instrument(skip(self, shutdown))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Status API listening on {}", self.local_addr()?);

        let router = Self::build_router(self.state);

        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        info!("Status API shut down");
        Ok(())
    }
}
