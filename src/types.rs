use serde::{Deserialize, Serialize};
use std::fmt;

/// Term is a raft election epoch. Monotonically non-decreasing for any machine.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn incr(&mut self) {
        self.0 += 1;
    }

    pub fn next(&self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index is the position of an entry in the replicated log. The log starts at
/// index 1; index 0 means "empty log". `Index::NAN` marks a peer whose log
/// position we have not yet learned from a reply.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Index(u64);

impl Index {
    pub const ZERO: Index = Index(0);
    /// First valid log index.
    pub const MIN_START: Index = Index(1);
    /// Sentinel for "position unknown" (peer views before any reply arrives).
    pub const NAN: Index = Index(u64::MAX);

    pub fn new(index: u64) -> Self {
        Index(index)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_nan(&self) -> bool {
        *self == Index::NAN
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index(self.0 + delta)
    }

    /// Saturating decrement; never goes below the empty-log index.
    pub fn minus(&self, delta: u64) -> Index {
        Index(self.0.saturating_sub(delta))
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nan() {
            write!(f, "NAN")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// PeerId identifies one cluster member. Ids are assigned by configuration and
/// are stable across restarts. 0 is reserved as the invalid/absent id.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u64);

impl PeerId {
    pub const INVALID: PeerId = PeerId(0);

    pub fn new(id: u64) -> Self {
        PeerId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        *self != PeerId::INVALID
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
