//! Identity types for the Arbor overlay
//!
//! Peer identities are random 64-bit values generated once per process.
//! Links between two peers are named by an [`Identifier`], the canonical
//! unordered pair of the two peer identities.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Peer identity - opaque, random per server process
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl PeerId {
    #[inline]
    pub fn new(id: u64) -> Self {
        PeerId(id)
    }

    /// Generate a fresh random identity
    pub fn random() -> Self {
        PeerId(rand::thread_rng().gen())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({:016x})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Local handle of one open connection
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Pseudo-connection for events raised by the local process itself
    pub const LOCAL: ConnectionId = ConnectionId(u64::MAX);

    #[inline]
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == ConnectionId::LOCAL {
            write!(f, "Conn(local)")
        } else {
            write!(f, "Conn({})", self.0)
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Canonical name of the link between two peers.
///
/// Always stored with `low <= high`, so both ends of a link build the same
/// value. Ordering is lexicographic over `(low, high)`; fragments are named
/// after the identifier of their core edge.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Identifier {
    low: PeerId,
    high: PeerId,
}

impl Identifier {
    pub fn new(a: PeerId, b: PeerId) -> Self {
        if a <= b {
            Identifier { low: a, high: b }
        } else {
            Identifier { low: b, high: a }
        }
    }

    /// Identifier a fresh node uses before it joins any fragment
    pub fn solitary(peer: PeerId) -> Self {
        Identifier::new(peer, peer)
    }

    #[inline]
    pub fn low(&self) -> PeerId {
        self.low
    }

    #[inline]
    pub fn high(&self) -> PeerId {
        self.high
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.low == peer || self.high == peer
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ident({:016x}-{:016x})", self.low.0, self.high.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}
