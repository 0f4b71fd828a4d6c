//! Snapshot file with outbound groups and static redirects.
//!
//! When no kernel table is attached, the relay can run from a JSON snapshot:
//! - Outbound groups (name, selection policy, dialers)
//! - Redirect entries (intercepted endpoint → destination + outbound id)
//!
//! Outbound groups are read once at startup. Redirect entries can be
//! reloaded into a running [`StaticRedirectTable`].

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::proxy::{
    rewrite, BlockDialer, Dialer, DirectDialer, Outbound, OutboundIndex, RedirectRecord,
    SelectionPolicy, StaticRedirectTable,
};

/// Snapshot file format version.
const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version.
    pub version: u32,
    /// User-defined outbound groups, in index order starting at 2.
    #[serde(default)]
    pub outbounds: Vec<OutboundSpec>,
    /// Static redirect entries.
    #[serde(default)]
    pub redirects: Vec<RedirectEntry>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            outbounds: Vec::new(),
            redirects: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundSpec {
    pub name: String,
    pub policy: SelectionPolicy,
    pub dialers: Vec<DialerSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialerSpec {
    pub name: String,
    pub kind: DialerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialerKind {
    Direct,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectEntry {
    /// Intercepted endpoint (the lookup key).
    pub key: SocketAddr,
    /// True destination.
    pub destination: SocketAddr,
    /// Raw outbound id.
    pub outbound: u8,
}

impl DialerSpec {
    fn build(&self, dial_timeout: Option<Duration>) -> Arc<dyn Dialer> {
        match self.kind {
            DialerKind::Direct => {
                Arc::new(DirectDialer::new(&self.name).with_connect_timeout(dial_timeout))
            }
            DialerKind::Block => Arc::new(BlockDialer::new(&self.name)),
        }
    }
}

impl Snapshot {
    /// Build the full outbound table contents.
    ///
    /// The reserved `direct` and `block` outbounds always occupy indices 0
    /// and 1; snapshot groups follow.
    pub fn build_outbounds(&self, dial_timeout: Option<Duration>) -> Vec<Outbound> {
        let mut outbounds = vec![
            Outbound::with_policy(
                OutboundIndex::DIRECT.to_string(),
                SelectionPolicy::Fixed,
                vec![Arc::new(
                    DirectDialer::new("direct").with_connect_timeout(dial_timeout),
                ) as Arc<dyn Dialer>],
            ),
            Outbound::with_policy(
                OutboundIndex::BLOCK.to_string(),
                SelectionPolicy::Fixed,
                vec![Arc::new(BlockDialer::new("block")) as Arc<dyn Dialer>],
            ),
        ];

        for spec in &self.outbounds {
            let dialers = spec
                .dialers
                .iter()
                .map(|d| d.build(dial_timeout))
                .collect();
            outbounds.push(Outbound::with_policy(&spec.name, spec.policy, dialers));
        }

        outbounds
    }

    /// Redirect entries whose outbound id has no group in this snapshot.
    ///
    /// Such entries still load; connections hitting them fail the range
    /// check.
    pub fn dangling_redirects(&self) -> impl Iterator<Item = &RedirectEntry> + '_ {
        let table_len = OutboundIndex::USER_DEFINED_MIN.as_usize() + self.outbounds.len();
        self.redirects
            .iter()
            .filter(move |e| rewrite(OutboundIndex(e.outbound)).as_usize() >= table_len)
    }

    /// Redirect entries in the shape the redirect table expects.
    pub fn redirect_entries(&self) -> impl Iterator<Item = (SocketAddr, RedirectRecord)> + '_ {
        self.redirects
            .iter()
            .map(|e| (e.key, RedirectRecord::new(e.destination, e.outbound)))
    }
}

/// Snapshot file manager.
pub struct SnapshotStore {
    /// Path to the snapshot file.
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the snapshot from disk.
    ///
    /// Returns an empty snapshot if the file doesn't exist or has a
    /// different format version. Returns an error if the file exists but is
    /// invalid.
    pub fn load(&self) -> Result<Snapshot> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No snapshot file, starting empty");
            return Ok(Snapshot::default());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read snapshot file: {}", self.path.display()))?;

        let snapshot: Snapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot file: {}", self.path.display()))?;

        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                file_version = snapshot.version,
                current_version = SNAPSHOT_VERSION,
                "Snapshot version mismatch, starting empty"
            );
            return Ok(Snapshot::default());
        }

        info!(
            path = %self.path.display(),
            outbound_count = snapshot.outbounds.len(),
            redirect_count = snapshot.redirects.len(),
            "Loaded snapshot from disk"
        );

        let dangling = snapshot.dangling_redirects().count();
        if dangling > 0 {
            warn!(
                dangling_count = dangling,
                "Redirect entries reference outbound ids without a group"
            );
        }

        Ok(snapshot)
    }

    /// Reload redirect entries into `table`, leaving outbounds untouched.
    ///
    /// On error the table keeps its current entries. Returns the new entry
    /// count.
    pub fn reload_redirects(&self, table: &StaticRedirectTable) -> Result<usize> {
        let snapshot = self.load()?;
        table.replace(snapshot.redirect_entries());
        info!(redirect_count = table.len(), "Redirect entries reloaded");
        Ok(table.len())
    }
}
