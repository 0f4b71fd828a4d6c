//! Redirection table lookup.
//!
//! The kernel-side classifier records, for every connection it redirects into
//! this process, the true destination and the routing decision. Entries are
//! keyed by the intercepted connection's peer endpoint in 16-byte form with
//! the port in network byte order.
//!
//! This module only reads the table. [`StaticRedirectTable`] is an in-process
//! implementation backed by an atomically swapped snapshot, used when the
//! table is loaded from a snapshot file and in tests.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use redirector_networking::{endpoint_from_words, htons, ip_to_words, ntohs, words_to_ip, NetworkError};
use thiserror::Error;
use tracing::debug;

/// Lookup key: the intercepted connection's endpoint as seen by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RedirectKey {
    /// Address in 16-byte form, packed as four words.
    pub ip: [u32; 4],
    /// Port in network byte order.
    pub port: u16,
}

impl RedirectKey {
    /// Derive the key from a peer endpoint.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            ip: ip_to_words(addr.ip()),
            port: htons(addr.port()),
        }
    }

    /// The endpoint this key was derived from.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(words_to_ip(self.ip), ntohs(self.port))
    }
}

impl fmt::Display for RedirectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Value written by the kernel classifier for a redirected connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectRecord {
    /// True destination address in 16-byte word form.
    pub ip: [u32; 4],
    /// True destination port in network byte order.
    pub port: u16,
    /// Raw outbound identifier.
    pub outbound: u8,
}

impl RedirectRecord {
    /// Build a record from a host-order destination.
    pub fn new(destination: SocketAddr, outbound: u8) -> Self {
        Self {
            ip: ip_to_words(destination.ip()),
            port: htons(destination.port()),
            outbound,
        }
    }

    /// Parse the true destination.
    pub fn destination(&self) -> Result<SocketAddr, NetworkError> {
        endpoint_from_words(self.ip, self.port)
    }
}

/// No record exists for the queried key.
#[derive(Debug, Error)]
#[error("no redirect record for key {key}")]
pub struct LookupError {
    pub key: RedirectKey,
}

/// Read access to a redirection table.
///
/// Implementations must be safe for concurrent readers; the engine never
/// writes through this trait.
pub trait RedirectTable: Send + Sync {
    fn lookup(&self, key: &RedirectKey) -> Result<RedirectRecord, LookupError>;
}

/// In-process redirection table.
///
/// Uses ArcSwap so lookups never block behind updates.
pub struct StaticRedirectTable {
    entries: ArcSwap<HashMap<RedirectKey, RedirectRecord>>,
}

impl StaticRedirectTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Create a table from (key endpoint, record) pairs.
    pub fn from_entries(entries: impl IntoIterator<Item = (SocketAddr, RedirectRecord)>) -> Self {
        Self {
            entries: ArcSwap::from_pointee(index_entries(entries)),
        }
    }

    /// Replace the whole table in a single swap.
    ///
    /// Lookups already in flight keep the snapshot they loaded.
    pub fn replace(&self, entries: impl IntoIterator<Item = (SocketAddr, RedirectRecord)>) {
        let map = index_entries(entries);
        debug!(entry_count = map.len(), "Redirect table replaced");
        self.entries.store(Arc::new(map));
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}

fn index_entries(
    entries: impl IntoIterator<Item = (SocketAddr, RedirectRecord)>,
) -> HashMap<RedirectKey, RedirectRecord> {
    entries
        .into_iter()
        .map(|(addr, record)| (RedirectKey::from_socket_addr(addr), record))
        .collect()
}

impl Default for StaticRedirectTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RedirectTable for StaticRedirectTable {
    fn lookup(&self, key: &RedirectKey) -> Result<RedirectRecord, LookupError> {
        self.entries
            .load()
            .get(key)
            .copied()
            .ok_or(LookupError { key: *key })
    }
}
