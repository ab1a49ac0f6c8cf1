use std::fmt;

use serde::{Deserialize, Serialize};

mod route_table;

pub use route_table::RouteTable;

/// Hop count to a node. Anything past [`Distance::MAX_HOPS`] is unreachable.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub struct Distance(u32);

impl Distance {
    pub const MAX_HOPS: u32 = 16;
    pub const ZERO: Distance = Distance(0);
    pub const INFINITY: Distance = Distance(u32::MAX);

    pub fn hops(hops: u32) -> Distance {
        if hops > Self::MAX_HOPS {
            Self::INFINITY
        } else {
            Distance(hops)
        }
    }
    pub fn is_reachable(&self) -> bool {
        self.0 <= Self::MAX_HOPS
    }
    /// The distance as seen one hop further away.
    pub fn next_hop(self) -> Distance {
        if self.is_reachable() {
            Self::hops(self.0 + 1)
        } else {
            Self::INFINITY
        }
    }
    pub fn get(&self) -> Option<u32> {
        self.is_reachable().then_some(self.0)
    }
}

impl From<u32> for Distance {
    fn from(value: u32) -> Self {
        Distance::hops(value)
    }
}

impl From<Distance> for u32 {
    fn from(value: Distance) -> Self {
        value.0
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(hops) => write!(f, "{hops}"),
            None => f.write_str("inf"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Route {
    pub destination: String,
    pub distance: Distance,
    pub next: String,
}

impl Route {
    pub fn is_reachable(&self) -> bool {
        self.distance.is_reachable()
    }
}

/// One entry of a `route` advertisement, keyed by destination.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RouteAdvert {
    pub distance: Distance,
    pub next: String,
}

/// When an advertised route replaces the one already held.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum AcceptPolicy {
    /// Accept anything from the current next hop, better routes from others.
    #[default]
    TrustSameSource,
    /// Accept only strictly shorter routes, except withdrawals from the
    /// current next hop.
    StrictlyBetter,
}
