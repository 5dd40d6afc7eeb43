//! Raw bidirectional byte pump for CONNECT and upgraded connections

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

const COPY_BUF_SIZE: usize = 8 * 1024;

/// Bytes moved in each direction before the tunnel closed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Pump bytes between `client` and `upstream` until either side hangs up.
///
/// Upstream → client runs in a spawned task, client → upstream in the
/// calling task. Whichever finishes first ends the tunnel and both streams
/// are dropped, so half-close is not supported. With a deadline, both
/// directions are cut when it passes and a `TimedOut` error is returned.
pub async fn tunnel<C, U>(client: C, upstream: U, deadline: Option<Instant>) -> io::Result<TunnelStats>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    // Counted as it goes so the total survives the task being aborted
    let received = Arc::new(AtomicU64::new(0));
    let counter = received.clone();
    let mut downstream = tokio::spawn(async move {
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = upstream_read.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), io::Error>(());
            }
            client_write.write_all(&buf[..n]).await?;
            counter.fetch_add(n as u64, Ordering::Relaxed);
            client_write.flush().await?;
        }
    });

    let pump = async {
        let mut stats = TunnelStats::default();
        let downstream_done = tokio::select! {
            sent = tokio::io::copy(&mut client_read, &mut upstream_write) => {
                stats.client_to_upstream = sent.unwrap_or(0);
                false
            }
            _ = &mut downstream => true,
        };
        (stats, downstream_done)
    };

    let (mut outcome, downstream_done) = match deadline {
        Some(deadline) => match timeout_at(deadline, pump).await {
            Ok((stats, done)) => (Ok(stats), done),
            Err(_) => (
                Err(io::Error::new(io::ErrorKind::TimedOut, "tunnel deadline reached")),
                false,
            ),
        },
        None => {
            let (stats, done) = pump.await;
            (Ok(stats), done)
        }
    };

    // Either side finishing closes the whole tunnel
    if !downstream_done {
        downstream.abort();
        let _ = downstream.await;
    }
    drop(client_read);
    drop(upstream_write);

    if let Ok(stats) = &mut outcome {
        stats.upstream_to_client = received.load(Ordering::Relaxed);
        debug!(
            "Tunnel closed ({} bytes up, {} bytes down)",
            stats.client_to_upstream, stats.upstream_to_client
        );
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, mut upstream_peer) = duplex(1024);

        let handle = tokio::spawn(tunnel(client, upstream, None));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_peer.write_all(b"pong").await.unwrap();
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client_peer);
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(
            stats,
            TunnelStats {
                client_to_upstream: 4,
                upstream_to_client: 4,
            }
        );

        // The upstream side observes the hang-up too
        let n = upstream_peer.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_upstream_hangup_closes_client() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, upstream_peer) = duplex(1024);

        let handle = tokio::spawn(tunnel(client, upstream, None));
        drop(upstream_peer);

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.client_to_upstream, 0);
        let mut buf = [0u8; 1];
        assert_eq!(client_peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deadline_cuts_idle_tunnel() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, _upstream_peer) = duplex(1024);

        let deadline = Instant::now() + Duration::from_millis(50);
        let err = tunnel(client, upstream, Some(deadline)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let mut buf = [0u8; 1];
        assert_eq!(client_peer.read(&mut buf).await.unwrap(), 0);
    }
}
