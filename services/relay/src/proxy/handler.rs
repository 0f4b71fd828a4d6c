//! Per-connection handling.
//!
//! lookup redirect record → resolve outbound → select dialer → dial → relay
//!
//! Every failure aborts only the connection at hand. The client connection
//! is owned by [`ConnectionHandler::handle`] and dropped on every path.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use redirector_networking::{display_addr, display_source, NetworkError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use super::dialer::Network;
use super::outbound::{OutboundRangeError, OutboundTable};
use super::redirect::{LookupError, RedirectKey, RedirectTable};
use super::relay::{relay, RelayStats, DEFAULT_LINGER_TIMEOUT};
use super::selector::SelectError;

/// Why a connection was aborted.
#[derive(Debug, Error)]
pub enum HandleError {
    /// Redirect record missing or unreadable.
    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// Kernel-supplied destination is unusable.
    #[error("failed to parse dest ip: {0}")]
    AddressParse(#[from] NetworkError),

    /// Outbound identifier outside the table.
    #[error(transparent)]
    OutboundRange(#[from] OutboundRangeError),

    /// The outbound's policy had nothing to offer.
    #[error("failed to select dialer from group {outbound}: {source}")]
    Selection {
        outbound: String,
        #[source]
        source: SelectError,
    },

    /// Upstream connection could not be established.
    #[error("failed to dial {destination}: {source}")]
    Dial {
        destination: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Relay ended with a non-benign I/O failure.
    #[error("relay error: {source}")]
    Relay {
        /// Bytes moved before the failure.
        stats: RelayStats,
        #[source]
        source: io::Error,
    },
}

impl HandleError {
    /// Stable reason code for logs and counters.
    pub fn reason(&self) -> &'static str {
        match self {
            HandleError::Lookup(_) => "lookup_failed",
            HandleError::AddressParse(_) => "address_parse_failed",
            HandleError::OutboundRange(_) => "outbound_out_of_range",
            HandleError::Selection { .. } => "selection_failed",
            HandleError::Dial { .. } => "dial_failed",
            HandleError::Relay { .. } => "relay_failed",
        }
    }
}

/// Relay errors that are the expected result of teardown.
///
/// A write after the peer went away and a read cut by the linger deadline
/// both mean the exchange is over.
pub fn is_benign_relay_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::TimedOut
    )
}

/// Outcome of a relay as seen by the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Both directions finished cleanly.
    Completed(RelayStats),
    /// The relay ended with a benign error after moving these bytes.
    Suppressed(RelayStats),
}

/// Apply the benign-error table to a relay result.
pub fn classify_relay_result(
    stats: RelayStats,
    result: io::Result<()>,
) -> Result<RelayOutcome, HandleError> {
    match result {
        Ok(()) => Ok(RelayOutcome::Completed(stats)),
        Err(e) if is_benign_relay_error(&e) => Ok(RelayOutcome::Suppressed(stats)),
        Err(source) => Err(HandleError::Relay { stats, source }),
    }
}

/// Drives one redirected connection from lookup to relay teardown.
pub struct ConnectionHandler {
    redirects: Arc<dyn RedirectTable>,
    outbounds: Arc<OutboundTable>,
    linger: Duration,
}

impl ConnectionHandler {
    pub fn new(redirects: Arc<dyn RedirectTable>, outbounds: Arc<OutboundTable>) -> Self {
        Self {
            redirects,
            outbounds,
            linger: DEFAULT_LINGER_TIMEOUT,
        }
    }

    /// Override the linger deadline applied after a half-close.
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Handle a redirected connection.
    ///
    /// `peer_addr` is the connection's remote endpoint as reported by the
    /// accept call; it doubles as the redirect lookup key.
    pub async fn handle<C>(&self, client: C, peer_addr: SocketAddr) -> Result<RelayOutcome, HandleError>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let key = RedirectKey::from_socket_addr(peer_addr);
        let record = self.redirects.lookup(&key)?;
        let destination = record.destination()?;

        let outbound = self.outbounds.resolve(record.outbound)?;
        let dialer = outbound.select().map_err(|source| HandleError::Selection {
            outbound: outbound.name().to_string(),
            source,
        })?;

        let network = Network::Tcp;
        let upstream = dialer
            .dial(network, destination)
            .await
            .map_err(|source| HandleError::Dial {
                destination,
                source,
            })?;

        info!(
            l4proto = network.l4proto(),
            outbound = %outbound.name(),
            dialer = %dialer.name(),
            "{} <-> {}",
            display_source(peer_addr, destination.ip()),
            display_addr(destination)
        );

        let (stats, result) = relay(client, upstream, self.linger).await;
        classify_relay_result(stats, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::dialer::{BlockDialer, Dialer};
    use crate::proxy::outbound::Outbound;
    use crate::proxy::redirect::{RedirectRecord, StaticRedirectTable};
    use crate::proxy::selector::SelectionPolicy;

    fn handler(table: StaticRedirectTable, outbounds: Vec<Outbound>) -> ConnectionHandler {
        ConnectionHandler::new(Arc::new(table), Arc::new(OutboundTable::new(outbounds)))
    }

    fn block_group(name: &str) -> Outbound {
        Outbound::with_policy(
            name,
            SelectionPolicy::Fixed,
            vec![Arc::new(BlockDialer::new(name)) as Arc<dyn Dialer>],
        )
    }

    #[test]
    fn test_benign_error_table() {
        let broken = io::Error::new(io::ErrorKind::BrokenPipe, "write: broken pipe");
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "i/o timeout");
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer");
        let other = io::Error::other("unexpected eof");

        let stats = RelayStats {
            client_to_upstream: 12,
            upstream_to_client: 34,
        };

        assert_eq!(
            classify_relay_result(stats, Err(broken)).unwrap(),
            RelayOutcome::Suppressed(stats)
        );
        assert_eq!(
            classify_relay_result(stats, Err(timeout)).unwrap(),
            RelayOutcome::Suppressed(stats)
        );

        let err = classify_relay_result(stats, Err(reset)).unwrap_err();
        assert_eq!(err.reason(), "relay_failed");
        assert!(err.to_string().contains("connection reset by peer"));

        match classify_relay_result(stats, Err(other)) {
            Err(HandleError::Relay { stats: carried, .. }) => assert_eq!(carried, stats),
            other => panic!("Expected Relay, got {:?}", other),
        }

        assert_eq!(
            classify_relay_result(stats, Ok(())).unwrap(),
            RelayOutcome::Completed(stats)
        );
    }

    #[tokio::test]
    async fn test_missing_record_aborts() {
        let handler = handler(StaticRedirectTable::new(), vec![block_group("direct")]);
        let (client, _peer) = tokio::io::duplex(64);

        let err = handler
            .handle(client, "203.0.113.5:443".parse().unwrap())
            .await
            .unwrap_err();
        match err {
            HandleError::Lookup(e) => assert_eq!(e.key.to_string(), "203.0.113.5:443"),
            other => panic!("Expected Lookup, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_destination_aborts() {
        let peer: SocketAddr = "203.0.113.5:443".parse().unwrap();
        let table = StaticRedirectTable::from_entries([(
            peer,
            RedirectRecord {
                ip: [0; 4],
                port: 443u16.to_be(),
                outbound: 0,
            },
        )]);
        let handler = handler(table, vec![block_group("direct")]);
        let (client, _peer) = tokio::io::duplex(64);

        let err = handler.handle(client, peer).await.unwrap_err();
        assert_eq!(err.reason(), "address_parse_failed");
    }

    #[tokio::test]
    async fn test_out_of_range_aborts() {
        let peer: SocketAddr = "203.0.113.5:443".parse().unwrap();
        let table = StaticRedirectTable::from_entries([(
            peer,
            RedirectRecord::new("1.1.1.1:443".parse().unwrap(), 9),
        )]);
        let handler = handler(table, vec![block_group("direct"), block_group("block")]);
        let (client, _peer) = tokio::io::duplex(64);

        match handler.handle(client, peer).await.unwrap_err() {
            HandleError::OutboundRange(e) => {
                assert_eq!(e.id, 9);
                assert_eq!(e.max, 1);
            }
            other => panic!("Expected OutboundRange, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_group_aborts() {
        let peer: SocketAddr = "203.0.113.5:443".parse().unwrap();
        let table = StaticRedirectTable::from_entries([(
            peer,
            RedirectRecord::new("1.1.1.1:443".parse().unwrap(), 0),
        )]);
        let handler = handler(
            table,
            vec![Outbound::with_policy("empty", SelectionPolicy::RoundRobin, Vec::new())],
        );
        let (client, _peer) = tokio::io::duplex(64);

        let err = handler.handle(client, peer).await.unwrap_err();
        assert_eq!(err.reason(), "selection_failed");
        assert_eq!(
            err.to_string(),
            "failed to select dialer from group empty: no dialer in group"
        );
    }

    #[tokio::test]
    async fn test_dial_failure_aborts() {
        let peer: SocketAddr = "203.0.113.5:443".parse().unwrap();
        let table = StaticRedirectTable::from_entries([(
            peer,
            RedirectRecord::new("1.1.1.1:443".parse().unwrap(), 1),
        )]);
        let handler = handler(table, vec![block_group("direct"), block_group("block")]);
        let (client, _peer) = tokio::io::duplex(64);

        match handler.handle(client, peer).await.unwrap_err() {
            HandleError::Dial {
                destination,
                source,
            } => {
                assert_eq!(destination.to_string(), "1.1.1.1:443");
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("Expected Dial, got {:?}", other),
        }
    }
}
