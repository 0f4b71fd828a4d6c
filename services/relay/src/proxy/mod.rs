//! Redirection and relay engine.
//!
//! This module provides:
//! - Redirect table lookup (true destination + routing decision)
//! - Outbound resolution and dialer selection
//! - Upstream dialing
//! - Bidirectional relay with half-close and linger teardown
//!
//! ## Architecture
//!
//! ```text
//! Kernel redirect -> Listener -> Redirect Table -> Outbound Table -> Selector -> Dialer
//!                                                                                 |
//!                              Client <======== Relay (half-close + linger) ======> Upstream
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{ConnectionHandler, Listener, ListenerConfig, OutboundTable, StaticRedirectTable};
//!
//! let handler = Arc::new(ConnectionHandler::new(redirects, outbounds));
//! let listener = Listener::bind(ListenerConfig::new("[::]:12345".parse()?), handler).await?;
//! Arc::new(listener).run().await?;
//! ```

mod dialer;
mod handler;
mod listener;
mod outbound;
mod redirect;
mod relay;
mod selector;

pub use dialer::{BlockDialer, BoxedConnection, Connection, Dialer, DirectDialer, Network};
pub use handler::{
    classify_relay_result, is_benign_relay_error, ConnectionHandler, HandleError, RelayOutcome,
};
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use outbound::{rewrite, Outbound, OutboundIndex, OutboundRangeError, OutboundTable, OUTBOUND_REWRITES};
pub use redirect::{LookupError, RedirectKey, RedirectRecord, RedirectTable, StaticRedirectTable};
pub use relay::{relay, RelayStats, DEFAULT_LINGER_TIMEOUT};
pub use selector::{
    DialerSelector, FixedSelector, RandomSelector, RoundRobinSelector, SelectError,
    SelectionPolicy,
};
