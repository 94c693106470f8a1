//! Per-connection stream pump.
//!
//! A connection moves through `Resolving -> Dialing -> Relaying -> Closed`.
//! Resolving and dialing share one deadline derived from the connect timeout
//! and both abort when the connection token is cancelled. While relaying,
//! each direction races its reads and writes against the token; whichever
//! direction finishes first cancels it, which unblocks the other one.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::listener::ListenerStats;
use super::target::TargetSpec;
use crate::discovery::ServiceLookup;
use crate::error::ProxyError;

/// Size of the per-direction relay buffer.
pub const RELAY_BUFFER_SIZE: usize = 128 * 1024;

/// Lifecycle state of a proxied connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Resolving,
    Dialing,
    Relaying,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Resolving => "resolving",
            ConnectionState::Dialing => "dialing",
            ConnectionState::Relaying => "relaying",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Bytes moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayTotals {
    pub to_target: u64,
    pub from_target: u64,
}

/// Shared per-server state needed to serve one connection.
pub(crate) struct ConnectionHandler {
    pub(crate) target: TargetSpec,
    pub(crate) lookup: Arc<dyn ServiceLookup>,
    pub(crate) connect_timeout: Duration,
    pub(crate) stats: Arc<ListenerStats>,
}

impl ConnectionHandler {
    /// Serve one accepted client until both relays have returned.
    ///
    /// Both sockets are owned here and dropped exactly once on return.
    pub(crate) async fn handle(&self, client: TcpStream, token: CancellationToken) {
        let Some((target_addr, target)) = self.connect(&token).await else {
            debug!(state = ConnectionState::Closed.as_str(), "Connection not forwarded");
            return;
        };

        debug!(
            state = ConnectionState::Relaying.as_str(),
            target = %target_addr,
            "Relaying"
        );
        let totals = relay_bidirectional(client, target, &token).await;

        self.stats
            .bytes_to_target
            .fetch_add(totals.to_target, Ordering::Relaxed);
        self.stats
            .bytes_from_target
            .fetch_add(totals.from_target, Ordering::Relaxed);

        debug!(
            state = ConnectionState::Closed.as_str(),
            bytes_to_target = totals.to_target,
            bytes_from_target = totals.from_target,
            "Relay finished"
        );
    }

    /// Resolve and dial the target inside the connection scope.
    async fn connect(&self, token: &CancellationToken) -> Option<(SocketAddr, TcpStream)> {
        let attempt = async {
            let deadline = Instant::now() + self.connect_timeout;

            debug!(state = ConnectionState::Resolving.as_str(), target = %self.target);
            let addr = timeout_at(deadline, self.target.resolve(self.lookup.as_ref()))
                .await
                .map_err(|_| ProxyError::Timeout {
                    operation: "resolve",
                    after: self.connect_timeout,
                })??;

            info!(
                state = ConnectionState::Dialing.as_str(),
                target = %addr,
                "connecting to target"
            );
            let stream = timeout_at(deadline, TcpStream::connect(addr))
                .await
                .map_err(|_| ProxyError::Timeout {
                    operation: "dial",
                    after: self.connect_timeout,
                })?
                .map_err(|source| ProxyError::Dial { addr, source })?;

            Ok::<_, ProxyError>((addr, stream))
        };

        let result = tokio::select! {
            _ = token.cancelled() => {
                debug!("Connection cancelled before relaying");
                return None;
            }
            result = attempt => result,
        };

        match result {
            Ok(connected) => Some(connected),
            Err(e) => {
                let counter = match &e {
                    ProxyError::Dial { .. }
                    | ProxyError::Timeout {
                        operation: "dial", ..
                    } => &self.stats.dial_failed,
                    _ => &self.stats.resolve_failed,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, target = %self.target, "failed to connect to target");
                None
            }
        }
    }
}

/// Relay bytes in both directions until either side finishes.
///
/// `token` is cancelled as soon as one direction ends, so the other direction
/// returns even if it is parked in a read with no pending data. Returns once
/// both directions have returned.
pub async fn relay_bidirectional<C, T>(client: C, target: T, token: &CancellationToken) -> RelayTotals
where
    C: AsyncRead + AsyncWrite,
    T: AsyncRead + AsyncWrite,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (target_read, target_write) = tokio::io::split(target);

    let upstream = async {
        let (bytes, result) = relay(client_read, target_write, token).await;
        token.cancel();
        log_relay_end("client_to_target", bytes, &result);
        bytes
    };
    let downstream = async {
        let (bytes, result) = relay(target_read, client_write, token).await;
        token.cancel();
        log_relay_end("target_to_client", bytes, &result);
        bytes
    };

    let (to_target, from_target) = tokio::join!(upstream, downstream);
    RelayTotals {
        to_target,
        from_target,
    }
}

fn log_relay_end(direction: &'static str, bytes: u64, result: &io::Result<()>) {
    match result {
        Ok(()) => debug!(direction, bytes, "Relay ended"),
        Err(e) => warn!(direction, bytes, error = %e, "Relay failed"),
    }
}

/// Copy `src` into `dst` until end of stream, cancellation, or an error.
///
/// Returns the bytes written to `dst` together with how the relay ended. End
/// of stream, cancellation and timeout-class errors end it cleanly.
async fn relay<R, W>(mut src: R, mut dst: W, token: &CancellationToken) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = token.cancelled() => break,
            read = src.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if is_timeout(&e) => break,
                Err(e) => return (total, Err(e)),
            },
        };

        tokio::select! {
            _ = token.cancelled() => break,
            written = dst.write_all(&buf[..n]) => match written {
                Ok(()) => total += n as u64,
                Err(e) if is_timeout(&e) => break,
                Err(e) => return (total, Err(e)),
            },
        }
    }

    (total, Ok(()))
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    /// Echo everything read on `stream` until EOF.
    async fn echo<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) {
        let mut buf = vec![0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn relays_payloads_through_echo() {
        for size in [1usize, 4096, RELAY_BUFFER_SIZE, RELAY_BUFFER_SIZE * 3 + 17] {
            let (mut client, proxy_client) = duplex(64 * 1024);
            let (proxy_target, target) = duplex(64 * 1024);
            tokio::spawn(echo(target));

            let token = CancellationToken::new();
            let relay_token = token.clone();
            let relay = tokio::spawn(async move {
                relay_bidirectional(proxy_client, proxy_target, &relay_token).await
            });

            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let expected = payload.clone();
            let (mut client_read, mut client_write) = tokio::io::split(&mut client);
            let writer = async move { client_write.write_all(&payload).await.unwrap() };
            let reader = async move {
                let mut received = vec![0u8; size];
                client_read.read_exact(&mut received).await.unwrap();
                received
            };
            let ((), received) = tokio::join!(writer, reader);
            assert_eq!(received, expected, "payload of {size} bytes");

            drop(client);
            let totals = relay.await.unwrap();
            assert_eq!(totals.to_target, size as u64);
            assert_eq!(totals.from_target, size as u64);
            assert!(token.is_cancelled());
        }
    }

    #[tokio::test]
    async fn target_close_ends_both_directions() {
        let (mut client, proxy_client) = duplex(1024);
        let (proxy_target, target) = duplex(1024);

        let token = CancellationToken::new();
        let relay_token = token.clone();
        let relay = tokio::spawn(async move {
            relay_bidirectional(proxy_client, proxy_target, &relay_token).await
        });

        drop(target);
        let totals = relay.await.unwrap();
        assert_eq!(totals, RelayTotals::default());

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn external_cancel_unblocks_idle_relay() {
        let (_client, proxy_client) = duplex(1024);
        let (proxy_target, _target) = duplex(1024);

        let token = CancellationToken::new();
        let relay_token = token.clone();
        let relay = tokio::spawn(async move {
            relay_bidirectional(proxy_client, proxy_target, &relay_token).await
        });

        tokio::task::yield_now().await;
        assert!(!relay.is_finished());

        token.cancel();
        let totals = tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .expect("relay should stop after cancellation")
            .unwrap();
        assert_eq!(totals, RelayTotals::default());
    }

    /// Yields `data` once, then fails with a connection reset.
    struct ResetAfter {
        data: Option<Vec<u8>>,
    }

    impl AsyncRead for ResetAfter {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            match self.data.take() {
                Some(data) => {
                    buf.put_slice(&data);
                    std::task::Poll::Ready(Ok(()))
                }
                None => std::task::Poll::Ready(Err(io::ErrorKind::ConnectionReset.into())),
            }
        }
    }

    #[tokio::test]
    async fn failed_relay_keeps_byte_count() {
        let src = ResetAfter {
            data: Some(vec![7u8; 5000]),
        };
        let token = CancellationToken::new();

        let (bytes, result) = relay(src, tokio::io::sink(), &token).await;

        assert_eq!(bytes, 5000);
        assert_eq!(
            result.unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );
    }

    #[test]
    fn timeout_class_errors() {
        assert!(is_timeout(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(is_timeout(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!is_timeout(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }
}
