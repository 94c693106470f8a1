//! TCP listener and proxy lifecycle.
//!
//! [`Server`] owns the listening socket, spawns one task per accepted
//! connection, and coordinates shutdown:
//! - [`Server::close`] cancels the server token; the accept loop drops the
//!   listener and every connection scope (a child token) is cancelled too
//! - [`Server::wait_for_termination`] returns once the accept loop and all
//!   connection tasks have finished
//!
//! An accept error other than the shutdown-triggered one is logged and ends
//! the accept loop; connections already running are left alone.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, Instrument};

use super::pump::ConnectionHandler;
use super::target::{resolve_host, TargetSpec};
use crate::discovery::ServiceLookup;
use crate::error::ProxyError;

/// Default timeout for resolving and dialing a target.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a proxy server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub listen_addr: SocketAddr,
    /// Bound on resolving plus dialing the target for one connection.
    pub connect_timeout: Duration,
}

impl ServerConfig {
    /// Create a new server configuration.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Statistics for a server.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections dropped because the target could not be resolved.
    pub resolve_failed: AtomicU64,
    /// Connections dropped because the target could not be dialed.
    pub dial_failed: AtomicU64,
    /// Bytes relayed from clients to targets.
    pub bytes_to_target: AtomicU64,
    /// Bytes relayed from targets to clients.
    pub bytes_from_target: AtomicU64,
}

/// Parse a listen address.
///
/// `:<port>` binds all IPv4 interfaces; anything else is resolved as
/// `host:port`.
pub async fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ProxyError> {
    if let Some(port) = addr.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| ProxyError::InvalidListenAddress {
                addr: addr.to_string(),
                reason: format!("invalid port {port:?}"),
            })?;
        return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    }

    resolve_host(addr)
        .await
        .map_err(|e| ProxyError::InvalidListenAddress {
            addr: addr.to_string(),
            reason: e.to_string(),
        })
}

/// A running proxy server.
pub struct Server {
    local_addr: SocketAddr,
    token: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<ListenerStats>,
}

impl Server {
    /// Bind the listener and start accepting connections.
    pub async fn bind(
        config: ServerConfig,
        target: TargetSpec,
        lookup: Arc<dyn ServiceLookup>,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ProxyError::Bind {
            addr: config.listen_addr,
            source,
        })?;

        info!(
            bind_addr = %local_addr,
            target = %target,
            connect_timeout_secs = config.connect_timeout.as_secs_f64(),
            "Listener bound"
        );

        let stats = Arc::new(ListenerStats::default());
        let handler = Arc::new(ConnectionHandler {
            target,
            lookup,
            connect_timeout: config.connect_timeout,
            stats: Arc::clone(&stats),
        });

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(accept_loop(
            listener,
            handler,
            token.clone(),
            tracker.clone(),
            Arc::clone(&stats),
        ));

        Ok(Self {
            local_addr,
            token,
            tracker,
            stats,
        })
    }

    /// Get the local address this server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get server statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Begin shutdown. Safe to call more than once.
    pub fn close(&self) {
        if !self.token.is_cancelled() {
            info!(bind_addr = %self.local_addr, "shutdown initiated");
        }
        self.token.cancel();
    }

    /// Whether shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the accept loop and every connection task have finished.
    pub async fn wait_for_termination(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Serve until `shutdown` resolves, then close and drain.
    ///
    /// A failed `shutdown` future does not stop the server; it keeps serving
    /// until the listener stops on its own.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = io::Result<()>>,
    {
        tokio::select! {
            result = shutdown => match result {
                Ok(()) => self.close(),
                Err(e) => error!(error = %e, "Shutdown trigger failed; serving until the listener stops"),
            },
            _ = self.wait_for_termination() => {
                error!("Listener stopped accepting connections");
            }
        }

        self.wait_for_termination().await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<ConnectionHandler>,
    token: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<ListenerStats>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Listener closing");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Accept error");
                break;
            }
        };

        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let handler = Arc::clone(&handler);
        let stats = Arc::clone(&stats);
        let conn_token = token.child_token();

        tracker.spawn(
            async move {
                serve(handler.as_ref(), stream, peer_addr, conn_token).await;
                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
            }
            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
        );
    }
    // Listener is dropped here, closing the socket.
}

async fn serve(
    handler: &ConnectionHandler,
    stream: TcpStream,
    peer_addr: SocketAddr,
    token: CancellationToken,
) {
    let local_addr = stream
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    info!(
        local_addr = %local_addr,
        remote_addr = %peer_addr,
        "server accepted new connection"
    );

    handler.handle(stream, token).await;

    info!(
        local_addr = %local_addr,
        remote_addr = %peer_addr,
        "connection closed"
    );
}
