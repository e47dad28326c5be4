//! Causal identity attached to every atomic operation.

use serde::{Deserialize, Serialize};

/// Index of a canonical operation. Strictly increasing on the sequencer.
pub type Base = u64;

/// Identifier of the peer that issued an operation. `0` means "not yet assigned".
pub type OriginId = u64;

/// Per-peer counter, assigned at creation and never reused.
pub type Sequence = u64;

/// Identity and ordering tuple of an atomic operation.
///
/// Marks are compared structurally for identity only. Echo detection
/// (recognising one's own operation coming back from the sequencer) uses
/// [`Mark::same_edit`], which ignores `base` since the sequencer rewrites it.
///
/// On the wire a mark is the array `[base, origin, sequence]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u64; 3]", into = "[u64; 3]")]
pub struct Mark {
    /// Canon position this operation was issued against, or its own
    /// canonical index once committed.
    pub base: Base,
    /// Issuing peer.
    pub origin: OriginId,
    /// Local counter on the issuing peer.
    pub sequence: Sequence,
}

impl Mark {
    pub fn new(base: Base, origin: OriginId, sequence: Sequence) -> Self {
        Self {
            base,
            origin,
            sequence,
        }
    }

    /// Whether both marks denote the same edit, regardless of its base.
    pub fn same_edit(&self, other: &Mark) -> bool {
        self.origin == other.origin && self.sequence == other.sequence
    }

    /// Same mark, re-addressed against another base.
    pub fn with_base(mut self, base: Base) -> Self {
        self.base = base;
        self
    }
}

impl From<[u64; 3]> for Mark {
    fn from([base, origin, sequence]: [u64; 3]) -> Self {
        Mark::new(base, origin, sequence)
    }
}

impl From<Mark> for [u64; 3] {
    fn from(mark: Mark) -> Self {
        [mark.base, mark.origin, mark.sequence]
    }
}

impl std::fmt::Display for Mark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}, {}]", self.base, self.origin, self.sequence)
    }
}
