//! TCP listener for redirected connections.
//!
//! The kernel steers classified traffic to this socket. Every accepted
//! connection is handed to the [`ConnectionHandler`] on its own task.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::handler::{ConnectionHandler, HandleError, RelayOutcome};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Redirect lookups that failed.
    pub lookups_failed: AtomicU64,
    /// Destinations that could not be parsed.
    pub addresses_invalid: AtomicU64,
    /// Outbound ids outside the table.
    pub outbounds_out_of_range: AtomicU64,
    /// Groups with no eligible dialer.
    pub selections_failed: AtomicU64,
    /// Upstream dials that failed.
    pub dials_failed: AtomicU64,
    /// Relays that ended with a real failure.
    pub relays_failed: AtomicU64,
    /// Relays that ended with a benign error.
    pub relays_suppressed: AtomicU64,
    /// Bytes relayed client to upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed upstream to client.
    pub bytes_from_upstream: AtomicU64,
}

impl ListenerStats {
    /// Account for one finished connection.
    pub fn record(&self, result: &Result<RelayOutcome, HandleError>) {
        let (counter, bytes) = match result {
            Ok(RelayOutcome::Completed(stats)) => (None, Some(stats)),
            Ok(RelayOutcome::Suppressed(stats)) => (Some(&self.relays_suppressed), Some(stats)),
            Err(HandleError::Lookup(_)) => (Some(&self.lookups_failed), None),
            Err(HandleError::AddressParse(_)) => (Some(&self.addresses_invalid), None),
            Err(HandleError::OutboundRange(_)) => (Some(&self.outbounds_out_of_range), None),
            Err(HandleError::Selection { .. }) => (Some(&self.selections_failed), None),
            Err(HandleError::Dial { .. }) => (Some(&self.dials_failed), None),
            Err(HandleError::Relay { stats, .. }) => (Some(&self.relays_failed), Some(stats)),
        };

        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(stats) = bytes {
            self.bytes_to_upstream
                .fetch_add(stats.client_to_upstream, Ordering::Relaxed);
            self.bytes_from_upstream
                .fetch_add(stats.upstream_to_client, Ordering::Relaxed);
        }
    }
}

/// A TCP listener for redirected traffic.
pub struct Listener {
    /// The TCP listener.
    listener: TcpListener,
    /// Per-connection handler.
    handler: Arc<ConnectionHandler>,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(config: ListenerConfig, handler: Arc<ConnectionHandler>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections.max(1))),
            listener,
            handler,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Connections already being relayed keep running on their own tasks.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(bind_addr = %local_addr, "Listener stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.spawn_connection(stream, peer_addr),
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        // Brief sleep to avoid tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        // Try to acquire a permit
        let permit = match self.conn_semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                return;
            }
        };

        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats
            .connections_active
            .fetch_add(1, Ordering::Relaxed);

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let handler = Arc::clone(&self.handler);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(
            async move {
                let result = handler.handle(stream, peer_addr).await;
                match &result {
                    Ok(RelayOutcome::Completed(bytes)) => debug!(
                        bytes_to_upstream = bytes.client_to_upstream,
                        bytes_from_upstream = bytes.upstream_to_client,
                        "Connection closed"
                    ),
                    Ok(RelayOutcome::Suppressed(bytes)) => debug!(
                        bytes_to_upstream = bytes.client_to_upstream,
                        bytes_from_upstream = bytes.upstream_to_client,
                        "Connection closed after linger"
                    ),
                    Err(e) => warn!(reason = e.reason(), error = %e, "Connection aborted"),
                }
                stats.record(&result);

                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                drop(permit);
            }
            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::outbound::OutboundTable;
    use crate::proxy::redirect::StaticRedirectTable;
    use crate::proxy::relay::RelayStats;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new("[::]:12345".parse().unwrap());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn test_stats_record() {
        let stats = ListenerStats::default();
        stats.record(&Ok(RelayOutcome::Completed(RelayStats {
            client_to_upstream: 3,
            upstream_to_client: 5,
        })));
        stats.record(&Ok(RelayOutcome::Suppressed(RelayStats {
            client_to_upstream: 10,
            upstream_to_client: 20,
        })));
        stats.record(&Err(HandleError::Relay {
            stats: RelayStats {
                client_to_upstream: 100,
                upstream_to_client: 0,
            },
            source: io::Error::other("boom"),
        }));

        // Lingered and failed relays still count their bytes.
        assert_eq!(stats.bytes_to_upstream.load(Ordering::Relaxed), 113);
        assert_eq!(stats.bytes_from_upstream.load(Ordering::Relaxed), 25);
        assert_eq!(stats.relays_suppressed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.relays_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unknown_connection_is_closed() {
        let handler = Arc::new(ConnectionHandler::new(
            Arc::new(StaticRedirectTable::new()),
            Arc::new(OutboundTable::new(Vec::new())),
        ));
        let listener = Arc::new(
            Listener::bind(ListenerConfig::new("127.0.0.1:0".parse().unwrap()), handler)
                .await
                .unwrap(),
        );
        let addr = listener.local_addr().unwrap();
        let running = Arc::clone(&listener);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            running
                .run_until(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf)
            .await
            .unwrap_or(0);
        assert_eq!(n, 0, "connection without a redirect record must be closed");

        // The handler task may still be accounting.
        for _ in 0..50 {
            if listener.stats().connections_closed.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(listener.stats().lookups_failed.load(Ordering::Relaxed), 1);
        assert_eq!(listener.stats().connections_active.load(Ordering::Relaxed), 0);

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
