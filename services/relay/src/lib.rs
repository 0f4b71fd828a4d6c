pub mod config;
pub mod proxy;
pub mod snapshot;

pub use proxy::{
    relay, BlockDialer, ConnectionHandler, Dialer, DirectDialer, HandleError, Listener,
    ListenerConfig, Network, Outbound, OutboundIndex, OutboundTable, RedirectKey, RedirectRecord,
    RedirectTable, RelayOutcome, RelayStats, SelectionPolicy, StaticRedirectTable,
};
