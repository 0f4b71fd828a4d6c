//! Dialer selection policies.
//!
//! An outbound asks its policy for one dialer per connection. Policies only
//! consider dialers that report themselves alive.
//!
//! - `Fixed`: always the same dialer
//! - `RoundRobin`: rotate across alive dialers
//! - `Random`: uniform choice across alive dialers

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::dialer::Dialer;

/// Selection failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectError {
    /// The group has no dialers at all.
    #[error("no dialer in group")]
    Empty,

    /// Every dialer in the group is currently not alive.
    #[error("no alive dialer in group ({total} total)")]
    NoAliveDialer { total: usize },
}

/// Capability to pick one dialer.
pub trait DialerSelector: Send + Sync {
    fn select(&self) -> Result<Arc<dyn Dialer>, SelectError>;

    /// Policy name for observability.
    fn policy(&self) -> SelectionPolicy;
}

/// Policy identifiers as written in snapshot files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    Fixed,
    RoundRobin,
    Random,
}

impl SelectionPolicy {
    /// Build a selector of this policy over `dialers`.
    ///
    /// `Fixed` uses the first dialer.
    pub fn build(self, dialers: Vec<Arc<dyn Dialer>>) -> Box<dyn DialerSelector> {
        match self {
            SelectionPolicy::Fixed => Box::new(FixedSelector::new(dialers.into_iter().next())),
            SelectionPolicy::RoundRobin => Box::new(RoundRobinSelector::new(dialers)),
            SelectionPolicy::Random => Box::new(RandomSelector::new(dialers)),
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SelectionPolicy::Fixed => "fixed",
            SelectionPolicy::RoundRobin => "round_robin",
            SelectionPolicy::Random => "random",
        };
        f.write_str(s)
    }
}

fn alive(dialers: &[Arc<dyn Dialer>]) -> Result<Vec<&Arc<dyn Dialer>>, SelectError> {
    if dialers.is_empty() {
        return Err(SelectError::Empty);
    }
    let eligible: Vec<_> = dialers.iter().filter(|d| d.is_alive()).collect();
    if eligible.is_empty() {
        return Err(SelectError::NoAliveDialer {
            total: dialers.len(),
        });
    }
    Ok(eligible)
}

/// Always selects one dialer.
pub struct FixedSelector {
    dialer: Option<Arc<dyn Dialer>>,
}

impl FixedSelector {
    pub fn new(dialer: Option<Arc<dyn Dialer>>) -> Self {
        Self { dialer }
    }
}

impl DialerSelector for FixedSelector {
    fn select(&self) -> Result<Arc<dyn Dialer>, SelectError> {
        match &self.dialer {
            None => Err(SelectError::Empty),
            Some(d) if !d.is_alive() => Err(SelectError::NoAliveDialer { total: 1 }),
            Some(d) => Ok(Arc::clone(d)),
        }
    }

    fn policy(&self) -> SelectionPolicy {
        SelectionPolicy::Fixed
    }
}

/// Rotates across alive dialers.
pub struct RoundRobinSelector {
    dialers: Vec<Arc<dyn Dialer>>,
    counter: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new(dialers: Vec<Arc<dyn Dialer>>) -> Self {
        Self {
            dialers,
            counter: AtomicUsize::new(0),
        }
    }
}

impl DialerSelector for RoundRobinSelector {
    fn select(&self) -> Result<Arc<dyn Dialer>, SelectError> {
        let eligible = alive(&self.dialers)?;
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Ok(Arc::clone(eligible[idx]))
    }

    fn policy(&self) -> SelectionPolicy {
        SelectionPolicy::RoundRobin
    }
}

/// Uniform random choice across alive dialers.
pub struct RandomSelector {
    dialers: Vec<Arc<dyn Dialer>>,
}

impl RandomSelector {
    pub fn new(dialers: Vec<Arc<dyn Dialer>>) -> Self {
        Self { dialers }
    }
}

impl DialerSelector for RandomSelector {
    fn select(&self) -> Result<Arc<dyn Dialer>, SelectError> {
        let eligible = alive(&self.dialers)?;
        let idx = rand::rng().random_range(0..eligible.len());
        Ok(Arc::clone(eligible[idx]))
    }

    fn policy(&self) -> SelectionPolicy {
        SelectionPolicy::Random
    }
}
