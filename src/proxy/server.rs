//! SOCKS5 relay listener
//!
//! Accepts local clients and runs one session task per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::error::{ErrorKind, Result};
use crate::proxy::session::SessionHandler;

/// Relay server
pub struct RelayServer {
    listener: TcpListener,
    handler: Arc<SessionHandler>,
}

impl RelayServer {
    /// Bind the listening socket
    pub async fn bind(addr: SocketAddr, handler: Arc<SessionHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown is signalled.
    ///
    /// Sessions already running are left to finish on their own.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("SOCKS5 relay listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let _ = stream.set_nodelay(true);
                            let handler = self.handler.clone();

                            tokio::spawn(async move {
                                match handler.handle(stream, client_addr).await {
                                    Ok(stats) => debug!(
                                        "Session from {} closed ({} bytes out, {} bytes in)",
                                        client_addr,
                                        stats.client_to_upstream,
                                        stats.upstream_to_client
                                    ),
                                    Err(e) if e.kind() == ErrorKind::Internal => {
                                        error!("Session from {} failed: {}", client_addr, e)
                                    }
                                    Err(e) => debug!("Session from {} ended: {}", client_addr, e),
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Relay server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}
