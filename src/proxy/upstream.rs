//! Upstream SOCKS5 handshake
//!
//! Dials the active proxy and asks it to CONNECT to the client's destination.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::error::{RelayError, Result};
use crate::models::ProxyDescriptor;
use crate::proxy::socks5::{self, TargetAddr};

/// Timeouts for establishing an upstream connection
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Bound on the TCP dial
    pub connect_timeout: Duration,
    /// Bound on each handshake read
    pub handshake_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// SOCKS5 client toward the selected upstream proxy
#[derive(Debug, Clone, Default)]
pub struct UpstreamConnector {
    config: UpstreamConfig,
}

impl UpstreamConnector {
    pub fn new(config: UpstreamConfig) -> Self {
        Self { config }
    }

    /// Dial `proxy` and establish a tunnel to `target`.
    ///
    /// The destination is always sent as a domain name, so IP literals are
    /// passed to the upstream as text.
    #[instrument(skip(self, proxy), fields(proxy = %proxy.key(), target = %target))]
    pub async fn connect(&self, proxy: &ProxyDescriptor, target: &TargetAddr) -> Result<TcpStream> {
        debug!("Connecting to upstream proxy at {}", proxy.address());

        let mut stream = bounded(
            "connect",
            self.config.connect_timeout,
            TcpStream::connect(proxy.address()),
        )
        .await?;
        let _ = stream.set_nodelay(true);

        self.handshake(&mut stream, &target.host.to_string(), target.port)
            .await?;

        debug!("Upstream tunnel established");
        Ok(stream)
    }

    /// Run the client side of the SOCKS5 handshake over an already open stream
    pub async fn handshake<S>(&self, stream: &mut S, host: &str, port: u16) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = socks5::encode_connect_request(host, port)?;

        stream
            .write_all(&socks5::encode_greeting())
            .await
            .map_err(RelayError::UpstreamIo)?;

        let mut method = [0u8; 2];
        bounded(
            "greeting",
            self.config.handshake_timeout,
            stream.read_exact(&mut method),
        )
        .await?;
        if method != socks5::NO_AUTH_REPLY {
            return Err(RelayError::UpstreamHandshake(format!(
                "unexpected method reply {:02x}{:02x}",
                method[0], method[1]
            )));
        }

        stream
            .write_all(&request)
            .await
            .map_err(RelayError::UpstreamIo)?;

        let mut reply = [0u8; 4];
        bounded(
            "connect reply",
            self.config.handshake_timeout,
            stream.read_exact(&mut reply),
        )
        .await?;
        if reply[1] != socks5::Reply::Succeeded as u8 {
            return Err(RelayError::UpstreamConnect(reply[1]));
        }

        self.skip_bound_address(stream, reply[3]).await
    }

    /// Consume and discard `BND.ADDR` / `BND.PORT`
    async fn skip_bound_address<S>(&self, stream: &mut S, atyp: u8) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let len = match socks5::bound_address_len(atyp) {
            Some(len) => len,
            None if atyp == socks5::ATYP_DOMAIN => {
                let mut domain_len = [0u8; 1];
                bounded(
                    "bound address",
                    self.config.handshake_timeout,
                    stream.read_exact(&mut domain_len),
                )
                .await?;
                domain_len[0] as usize + 2
            }
            None => {
                return Err(RelayError::UpstreamHandshake(format!(
                    "unknown bound address type {:#04x}",
                    atyp
                )))
            }
        };

        let mut discard = vec![0u8; len];
        bounded(
            "bound address",
            self.config.handshake_timeout,
            stream.read_exact(&mut discard),
        )
        .await?;
        Ok(())
    }
}

/// Run an upstream I/O step under a deadline
async fn bounded<T, F>(phase: &'static str, limit: Duration, op: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match timeout(limit, op).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RelayError::UpstreamIo(e)),
        Err(_) => Err(RelayError::UpstreamTimeout { phase }),
    }
}
