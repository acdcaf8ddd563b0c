//! Client-facing SOCKS5 session
//!
//! Parses the greeting and CONNECT request, obtains an upstream tunnel
//! through the active proxy and hands both streams to the forwarder.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::{ErrorKind, RelayError, Result};
use crate::models::ProxyKey;
use crate::proxy::pool::PoolManager;
use crate::proxy::socks5::{self, Reply, TargetAddr};
use crate::proxy::tunnel::{Forwarder, TransferStats};
use crate::proxy::upstream::UpstreamConnector;

/// Invalid greetings are logged once per this many occurrences
const INVALID_LOG_EVERY: u64 = 10;

/// Configuration for client sessions
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on each client handshake read
    pub client_timeout: Duration,
    /// Forwarding buffer size per direction
    pub buffer_size: usize,
    /// Log every invalid request and session error
    pub verbose: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_timeout: Duration::from_secs(10),
            buffer_size: 8192,
            verbose: false,
        }
    }
}

/// Everything a session needs, shared across connections
pub struct SessionHandler {
    pool: Arc<PoolManager>,
    connector: UpstreamConnector,
    config: SessionConfig,
}

impl SessionHandler {
    pub fn new(pool: Arc<PoolManager>, connector: UpstreamConnector, config: SessionConfig) -> Self {
        Self {
            pool,
            connector,
            config,
        }
    }

    /// Serve one client connection to completion.
    ///
    /// Both streams are owned by this call and dropped on every exit path.
    #[instrument(skip(self, client), fields(client = %peer))]
    pub async fn handle<S>(&self, mut client: S, peer: SocketAddr) -> Result<TransferStats>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let target = match self.negotiate(&mut client).await {
            Ok(target) => target,
            Err(e) => {
                self.reject(&mut client, &e).await;
                return Err(e);
            }
        };

        let upstream = match self.open_upstream(&target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                self.reject(&mut client, &e).await;
                return Err(e);
            }
        };

        client
            .write_all(&Reply::Succeeded.encode())
            .await
            .map_err(RelayError::ClientIo)?;
        client.flush().await.map_err(RelayError::ClientIo)?;

        let successful = self.pool.record_success();
        let total = self.pool.snapshot().total_connections;
        info!(
            "Connected to {} via {} [successful: {}/{}]",
            target, upstream.proxy, successful, total
        );

        let stats = Forwarder::new(self.config.buffer_size)
            .run(client, upstream.stream)
            .await;

        Ok(stats)
    }

    /// Read the greeting and the CONNECT request, answering the method selection
    async fn negotiate<S>(&self, client: &mut S) -> Result<TargetAddr>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut greeting = [0u8; 2];
        self.bounded(client.read_exact(&mut greeting)).await?;
        if greeting[0] != socks5::VERSION {
            self.count_invalid(greeting[0]);
            return Err(RelayError::InvalidVersion(greeting[0]));
        }

        let mut methods = vec![0u8; greeting[1] as usize];
        self.bounded(client.read_exact(&mut methods)).await?;

        client
            .write_all(&socks5::NO_AUTH_REPLY)
            .await
            .map_err(RelayError::ClientIo)?;
        client.flush().await.map_err(RelayError::ClientIo)?;

        let mut request = [0u8; 4];
        self.bounded(client.read_exact(&mut request)).await?;
        let [version, command, _reserved, atyp] = request;
        if version != socks5::VERSION {
            return Err(RelayError::InvalidRequestVersion(version));
        }
        if command != socks5::CMD_CONNECT {
            return Err(RelayError::UnsupportedCommand(command));
        }

        let target = self
            .bounded_result(async {
                socks5::read_target(client, atyp).await.map_err(|e| match e {
                    RelayError::Io(e) => RelayError::ClientIo(e),
                    other => other,
                })
            })
            .await?;
        debug!("CONNECT request to {}", target);
        Ok(target)
    }

    async fn open_upstream(&self, target: &TargetAddr) -> Result<Upstream> {
        let proxy = self.pool.active().ok_or(RelayError::NoActiveProxy)?;

        self.pool.record_attempt();

        match self.connector.connect(&proxy, target).await {
            Ok(stream) => Ok(Upstream {
                proxy: proxy.key(),
                stream,
            }),
            Err(e) => {
                if e.is_upstream_failure() {
                    let outcome = self.pool.report_failure(&proxy.key(), &e);
                    if let Some(next) = outcome.rotated_to {
                        info!("Rotated upstream proxy to {}", next.key());
                    }
                }
                Err(e)
            }
        }
    }

    /// Send the reply matching `err`, if the protocol defines one
    async fn reject<S>(&self, client: &mut S, err: &RelayError)
    where
        S: AsyncWrite + Unpin,
    {
        match err.kind() {
            ErrorKind::Upstream => debug!("Upstream failure: {}", err),
            _ if self.config.verbose => warn!("Client session failed: {}", err),
            _ => debug!("Client session failed: {}", err),
        }

        if let Some(reply) = err.reply_code() {
            let _ = client.write_all(&reply.encode()).await;
            let _ = client.flush().await;
        }
    }

    fn count_invalid(&self, version: u8) {
        let count = self.pool.record_invalid_request();
        if self.config.verbose || count % INVALID_LOG_EVERY == 1 {
            warn!("Invalid SOCKS version: {} (total: {})", version, count);
        }
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        self.bounded_result(async { op.await.map_err(RelayError::ClientIo) })
            .await
    }

    async fn bounded_result<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        timeout(self.config.client_timeout, op)
            .await
            .map_err(|_| RelayError::ClientTimeout)?
    }
}

struct Upstream {
    proxy: ProxyKey,
    stream: TcpStream,
}
