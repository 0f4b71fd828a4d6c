//! Outbound table and routing resolution.
//!
//! The kernel classifier tags every redirected connection with an outbound
//! identifier. Identifiers index a fixed table of outbound groups:
//!
//! | id | outbound |
//! |----|----------|
//! | 0 | direct |
//! | 1 | block |
//! | 2.. | user-defined groups |
//! | 0xFD | control-plane-direct (rewritten to direct) |
//!
//! Resolution applies the rewrite table first, then bounds-checks the
//! identifier. An out-of-range identifier is never clamped.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use super::dialer::Dialer;
use super::selector::{DialerSelector, SelectError, SelectionPolicy};

/// Raw outbound identifier as stored in redirect records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutboundIndex(pub u8);

impl OutboundIndex {
    pub const DIRECT: Self = Self(0);
    pub const BLOCK: Self = Self(1);
    pub const USER_DEFINED_MIN: Self = Self(2);
    pub const CONTROL_PLANE_DIRECT: Self = Self(0xFD);

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OutboundIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::DIRECT => f.write_str("direct"),
            Self::BLOCK => f.write_str("block"),
            Self::CONTROL_PLANE_DIRECT => f.write_str("control-plane-direct"),
            Self(id) => write!(f, "{}", id),
        }
    }
}

/// Identifier rewrites applied before indexing.
///
/// Control-plane direct traffic is routed exactly like user direct traffic.
pub const OUTBOUND_REWRITES: &[(OutboundIndex, OutboundIndex)] = &[(
    OutboundIndex::CONTROL_PLANE_DIRECT,
    OutboundIndex::DIRECT,
)];

/// Apply [`OUTBOUND_REWRITES`] to an identifier.
pub fn rewrite(id: OutboundIndex) -> OutboundIndex {
    OUTBOUND_REWRITES
        .iter()
        .find(|(from, _)| *from == id)
        .map(|(_, to)| *to)
        .unwrap_or(id)
}

/// Identifier outside the configured table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("outbound id {id} is out of range: not in [0, {max}]")]
pub struct OutboundRangeError {
    pub id: u8,
    /// Highest valid index; -1 for an empty table.
    pub max: i64,
}

/// A named group of dialers plus its selection policy.
pub struct Outbound {
    name: String,
    selector: Box<dyn DialerSelector>,
}

impl Outbound {
    pub fn new(name: impl Into<String>, selector: Box<dyn DialerSelector>) -> Self {
        Self {
            name: name.into(),
            selector,
        }
    }

    /// Build a group from a policy and its members.
    pub fn with_policy(
        name: impl Into<String>,
        policy: SelectionPolicy,
        dialers: Vec<Arc<dyn Dialer>>,
    ) -> Self {
        Self::new(name, policy.build(dialers))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.selector.policy()
    }

    /// Ask the policy for one dialer.
    pub fn select(&self) -> Result<Arc<dyn Dialer>, SelectError> {
        self.selector.select()
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("name", &self.name)
            .field("policy", &self.policy())
            .finish()
    }
}

/// Fixed table of outbounds indexed by [`OutboundIndex`].
///
/// Built once at startup and shared read-only between connections.
pub struct OutboundTable {
    outbounds: Vec<Arc<Outbound>>,
}

impl OutboundTable {
    pub fn new(outbounds: Vec<Outbound>) -> Self {
        Self {
            outbounds: outbounds.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.outbounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbounds.is_empty()
    }

    /// Outbound names in index order.
    pub fn names(&self) -> Vec<String> {
        self.outbounds
            .iter()
            .map(|o| o.name().to_string())
            .collect()
    }

    /// Resolve a raw identifier to an outbound.
    pub fn resolve(&self, raw: u8) -> Result<Arc<Outbound>, OutboundRangeError> {
        let id = rewrite(OutboundIndex(raw));
        if id.0 != raw {
            trace!(from = %OutboundIndex(raw), to = %id, "Outbound rewritten");
        }

        self.outbounds
            .get(id.as_usize())
            .cloned()
            .ok_or(OutboundRangeError {
                id: id.0,
                max: self.outbounds.len() as i64 - 1,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::dialer::{BlockDialer, DirectDialer};
    use proptest::prelude::*;

    fn table(user_groups: usize) -> OutboundTable {
        let mut outbounds = vec![
            Outbound::with_policy(
                "direct",
                SelectionPolicy::Fixed,
                vec![Arc::new(DirectDialer::new("direct")) as Arc<dyn Dialer>],
            ),
            Outbound::with_policy(
                "block",
                SelectionPolicy::Fixed,
                vec![Arc::new(BlockDialer::new("block")) as Arc<dyn Dialer>],
            ),
        ];
        for i in 0..user_groups {
            outbounds.push(Outbound::with_policy(
                format!("group-{}", i),
                SelectionPolicy::RoundRobin,
                vec![Arc::new(DirectDialer::new(format!("member-{}", i))) as Arc<dyn Dialer>],
            ));
        }
        OutboundTable::new(outbounds)
    }

    #[test]
    fn test_index_display() {
        assert_eq!(OutboundIndex::DIRECT.to_string(), "direct");
        assert_eq!(OutboundIndex::BLOCK.to_string(), "block");
        assert_eq!(
            OutboundIndex::CONTROL_PLANE_DIRECT.to_string(),
            "control-plane-direct"
        );
        assert_eq!(OutboundIndex(7).to_string(), "7");
    }

    #[test]
    fn test_rewrite_table() {
        assert_eq!(rewrite(OutboundIndex::CONTROL_PLANE_DIRECT), OutboundIndex::DIRECT);
        assert_eq!(rewrite(OutboundIndex::BLOCK), OutboundIndex::BLOCK);
        assert_eq!(rewrite(OutboundIndex(2)), OutboundIndex(2));
    }

    #[test]
    fn test_control_plane_direct_resolves_to_direct() {
        let table = table(1);
        let direct = table.resolve(OutboundIndex::DIRECT.0).unwrap();
        let cp = table.resolve(OutboundIndex::CONTROL_PLANE_DIRECT.0).unwrap();
        assert!(Arc::ptr_eq(&direct, &cp));
    }

    #[test]
    fn test_out_of_range() {
        let table = table(1);
        let err = table.resolve(3).unwrap_err();
        assert_eq!(err, OutboundRangeError { id: 3, max: 2 });
        assert_eq!(err.to_string(), "outbound id 3 is out of range: not in [0, 2]");

        let empty = OutboundTable::new(Vec::new());
        assert_eq!(empty.resolve(0).unwrap_err().max, -1);
        // The sentinel still fails on a table without a direct entry.
        assert!(empty.resolve(OutboundIndex::CONTROL_PLANE_DIRECT.0).is_err());
    }

    #[test]
    fn test_table_names() {
        let table = table(1);
        assert_eq!(table.names(), ["direct", "block", "group-0"]);
        assert!(!table.is_empty());
        assert!(OutboundTable::new(Vec::new()).is_empty());
    }

    proptest! {
        #[test]
        fn resolve_is_identity_in_range(groups in 0usize..8, raw in 0u8..=255) {
            let table = table(groups);
            let n = table.len();
            let effective = rewrite(OutboundIndex(raw)).as_usize();

            match table.resolve(raw) {
                Ok(outbound) => {
                    prop_assert!(effective < n);
                    let names = table.names();
                    prop_assert_eq!(outbound.name(), names[effective].as_str());
                }
                Err(err) => {
                    prop_assert!(effective >= n);
                    prop_assert_eq!(err.id as usize, effective);
                }
            }
        }
    }
}
