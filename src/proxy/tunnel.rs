//! Bidirectional forwarding between the client and the upstream tunnel

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, instrument};

/// Bytes moved in each direction once a relay has finished
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Pumps bytes between two streams until either side closes
#[derive(Debug, Clone, Copy)]
pub struct Forwarder {
    buffer_size: usize,
}

impl Forwarder {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    /// Relay until both directions have stopped.
    ///
    /// When one direction ends (EOF or error) it shuts down its destination
    /// and signals the other direction, which stops at its next suspension
    /// point and shuts down its own destination. Transfer errors are
    /// swallowed here and only reflected in the returned counts.
    #[instrument(skip(self, client, upstream))]
    pub async fn run<C, U>(&self, client: C, upstream: U) -> TransferStats
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        U: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

        let (done_tx, done_rx) = watch::channel(false);

        let client_to_upstream = pump(
            "client->upstream",
            &mut client_read,
            &mut upstream_write,
            self.buffer_size,
            &done_tx,
            done_rx.clone(),
        );
        let upstream_to_client = pump(
            "upstream->client",
            &mut upstream_read,
            &mut client_write,
            self.buffer_size,
            &done_tx,
            done_rx,
        );

        let (client_to_upstream, upstream_to_client) =
            tokio::join!(client_to_upstream, upstream_to_client);

        let stats = TransferStats {
            client_to_upstream,
            upstream_to_client,
        };

        debug!(
            bytes_sent = stats.client_to_upstream,
            bytes_received = stats.upstream_to_client,
            "Relay closed"
        );

        stats
    }
}

/// Copy `reader` into `writer` until EOF, an error, or the peer direction finishes
async fn pump<R, W>(
    direction: &'static str,
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    done: &watch::Sender<bool>,
    mut peer_done: watch::Receiver<bool>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut transferred = 0u64;

    loop {
        let step = async {
            let n = reader.read(&mut buf).await?;
            if n > 0 {
                writer.write_all(&buf[..n]).await?;
            }
            Ok::<usize, std::io::Error>(n)
        };

        tokio::select! {
            result = step => match result {
                Ok(0) => break,
                Ok(n) => transferred += n as u64,
                Err(e) => {
                    debug!("{} ended: {}", direction, e);
                    break;
                }
            },
            _ = peer_done.changed() => break,
        }
    }

    let _ = writer.shutdown().await;
    done.send_replace(true);

    transferred
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_forwards_both_directions() {
        let (relay_client, mut client) = tokio::io::duplex(1024);
        let (relay_upstream, mut upstream) = tokio::io::duplex(1024);

        let handle = tokio::spawn(async move {
            Forwarder::new(16).run(relay_client, relay_upstream).await
        });

        client.write_all(b"hello from client").await.unwrap();
        let mut buf = vec![0u8; 17];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from client");

        upstream.write_all(b"hello from upstream").await.unwrap();
        let mut buf = vec![0u8; 19];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from upstream");

        drop(client);

        let stats = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("forwarder did not stop")
            .unwrap();
        assert_eq!(
            stats,
            TransferStats {
                client_to_upstream: 17,
                upstream_to_client: 19,
            }
        );
    }

    #[tokio::test]
    async fn test_client_close_closes_upstream() {
        let (relay_client, client) = tokio::io::duplex(1024);
        let (relay_upstream, mut upstream) = tokio::io::duplex(1024);

        let handle = tokio::spawn(async move {
            Forwarder::new(1024).run(relay_client, relay_upstream).await
        });

        drop(client);

        // Upstream observes EOF even though it never closed its own side.
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(1), upstream.read(&mut buf))
            .await
            .expect("upstream was not closed")
            .unwrap();
        assert_eq!(n, 0);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("forwarder did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_upstream_close_closes_client() {
        let (relay_client, mut client) = tokio::io::duplex(1024);
        let (relay_upstream, mut upstream) = tokio::io::duplex(1024);

        let handle = tokio::spawn(async move {
            Forwarder::new(1024).run(relay_client, relay_upstream).await
        });

        upstream.write_all(b"bye").await.unwrap();
        upstream.shutdown().await.unwrap();

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut received))
            .await
            .expect("client was not closed")
            .unwrap();
        assert_eq!(received, b"bye");

        let stats = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("forwarder did not stop")
            .unwrap();
        assert_eq!(stats.upstream_to_client, 3);
        assert_eq!(stats.client_to_upstream, 0);
    }
}
