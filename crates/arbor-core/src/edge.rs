//! Edge model
//!
//! One [`Edge`] exists per server connection. Edges are totally ordered by
//! [`EdgeWeight`]: lag first, then the link [`Identifier`]. Every node uses
//! the same order, so two fragments pick the same minimum outgoing edge
//! without talking to each other.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Identifier, PeerId};

/// Classification of an edge in the evolving spanning tree
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeState {
    /// Not yet known to be inside or outside the tree
    #[default]
    Unclassified,
    /// Part of the spanning tree
    Branch,
    /// Joins two nodes of the same fragment; never part of the tree
    Rejected,
}

/// Outcome of a classification request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Changed,
    Unchanged,
    /// The request would move the edge backwards or across Branch/Rejected
    Refused,
}

/// Total-order key of an edge.
///
/// Field order matters: the derived `Ord` compares lag first and falls back
/// to the identifier, which is unique per link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeWeight {
    pub lag: u64,
    pub identifier: Identifier,
}

impl EdgeWeight {
    pub fn new(lag: u64, identifier: Identifier) -> Self {
        EdgeWeight { lag, identifier }
    }
}

/// Best known outgoing weight of a fragment.
///
/// `Infinite` sorts after every finite weight and travels on the wire as
/// `null`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Option<EdgeWeight>", into = "Option<EdgeWeight>")]
pub enum Weight {
    Finite(EdgeWeight),
    Infinite,
}

impl Weight {
    pub fn is_infinite(&self) -> bool {
        matches!(self, Weight::Infinite)
    }

    pub fn finite(&self) -> Option<EdgeWeight> {
        match self {
            Weight::Finite(w) => Some(*w),
            Weight::Infinite => None,
        }
    }
}

impl Default for Weight {
    fn default() -> Self {
        Weight::Infinite
    }
}

impl From<Option<EdgeWeight>> for Weight {
    fn from(value: Option<EdgeWeight>) -> Self {
        match value {
            Some(w) => Weight::Finite(w),
            None => Weight::Infinite,
        }
    }
}

impl From<Weight> for Option<EdgeWeight> {
    fn from(value: Weight) -> Self {
        value.finite()
    }
}

impl From<EdgeWeight> for Weight {
    fn from(value: EdgeWeight) -> Self {
        Weight::Finite(value)
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Weight::Finite(w) => write!(f, "{}@{}", w.lag, w.identifier),
            Weight::Infinite => write!(f, "inf"),
        }
    }
}

/// Per-neighbor edge record, owned by the engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Edge {
    peer: PeerId,
    lag: u64,
    identifier: Identifier,
    state: EdgeState,
}

impl Edge {
    pub fn new(local: PeerId, peer: PeerId, lag: u64) -> Self {
        Edge {
            peer,
            lag,
            identifier: Identifier::new(local, peer),
            state: EdgeState::Unclassified,
        }
    }

    #[inline]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    #[inline]
    pub fn lag(&self) -> u64 {
        self.lag
    }

    #[inline]
    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    #[inline]
    pub fn state(&self) -> EdgeState {
        self.state
    }

    #[inline]
    pub fn weight(&self) -> EdgeWeight {
        EdgeWeight::new(self.lag, self.identifier)
    }

    pub fn is_branch(&self) -> bool {
        self.state == EdgeState::Branch
    }

    pub fn is_unclassified(&self) -> bool {
        self.state == EdgeState::Unclassified
    }

    /// Move the edge to `next`. Classification only advances out of
    /// `Unclassified`; repeating the current state is a no-op.
    pub fn classify(&mut self, next: EdgeState) -> Transition {
        if self.state == next {
            return Transition::Unchanged;
        }
        if self.state != EdgeState::Unclassified || next == EdgeState::Unclassified {
            return Transition::Refused;
        }
        self.state = next;
        Transition::Changed
    }

    /// Compare two edges by weight, ties broken by identifier
    pub fn cmp_weight(&self, other: &Edge) -> Ordering {
        self.weight().cmp(&other.weight())
    }
}
