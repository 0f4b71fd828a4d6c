//! Dialers: concrete upstream transports.
//!
//! A dialer opens one upstream connection to a destination. Outbound groups
//! own their dialers; selection lends out `Arc` handles per connection.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Anything the relay can copy bytes through.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Upstream connection handed out by dialers.
pub type BoxedConnection = Box<dyn Connection>;

/// Transport kind requested from a dialer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
        }
    }

    /// Label used for the `l4proto` log field.
    pub fn l4proto(&self) -> &'static str {
        match self {
            Network::Tcp => "TCP",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core trait for upstream transports.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Name for observability.
    fn name(&self) -> &str;

    /// Whether the dialer is currently eligible for selection.
    ///
    /// Liveness is owned by whatever health-checks the group; dialers that
    /// are never checked are always alive.
    fn is_alive(&self) -> bool {
        true
    }

    /// Open a connection to `destination`.
    async fn dial(&self, network: Network, destination: SocketAddr) -> io::Result<BoxedConnection>;
}

/// Plain TCP connect from this host.
#[derive(Debug, Clone)]
pub struct DirectDialer {
    name: String,
    connect_timeout: Option<Duration>,
}

impl DirectDialer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connect_timeout: None,
        }
    }

    /// Bound the connect phase. Unbounded by default.
    pub fn with_connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dial(&self, network: Network, destination: SocketAddr) -> io::Result<BoxedConnection> {
        debug!(dialer = %self.name, %network, destination = %destination, "Dialing");

        let stream = match self.connect_timeout {
            Some(limit) => match timeout(limit, TcpStream::connect(destination)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout"));
                }
            },
            None => TcpStream::connect(destination).await?,
        };

        // Relayed traffic is latency sensitive.
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Refuses every connection.
#[derive(Debug, Clone)]
pub struct BlockDialer {
    name: String,
}

impl BlockDialer {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Dialer for BlockDialer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dial(&self, _network: Network, destination: SocketAddr) -> io::Result<BoxedConnection> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("connection to {} blocked", destination),
        ))
    }
}
