//! Positional side-effects of atomic operations.

use serde::{Deserialize, Serialize};

/// How an insert or delete shifts the offsets around it.
///
/// ```text
///        low        high
///         |          |
/// unchanged  context   shifted by delta
/// ```
///
/// Offsets at or past `high` shift by `delta`. Offsets in `[low, high)` are
/// context consumed by the edit: for an insertion they shift (with a
/// tie-break at `low`), for a deletion they are lost unless a later
/// [mirror](PosChange::is_mirror_of) brings the context back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosChange {
    pub low: usize,
    pub high: usize,
    pub delta: isize,
    /// Bounds of the edit before it was ever rebased.
    pub original_low: usize,
    pub original_high: usize,
    pub inverted: bool,
}

impl PosChange {
    /// Change produced by inserting `len` chars at `offset`.
    pub fn insertion(offset: usize, len: usize) -> Self {
        Self::new(offset, len, len as isize)
    }

    /// Change produced by deleting `len` chars at `offset`.
    pub fn deletion(offset: usize, len: usize) -> Self {
        Self::new(offset, len, -(len as isize))
    }

    fn new(offset: usize, len: usize, delta: isize) -> Self {
        PosChange {
            low: offset,
            high: offset.saturating_add(len),
            delta,
            original_low: offset,
            original_high: offset.saturating_add(len),
            inverted: false,
        }
    }

    /// Record the pre-rebase bounds of the edit.
    pub fn with_original(mut self, offset: usize, len: usize) -> Self {
        self.original_low = offset;
        self.original_high = offset.saturating_add(len);
        self
    }

    /// Map `key` across this change. `original_key` is the value `key` had
    /// before the whole fold began; it breaks ties between insertions at the
    /// same offset. Returns `None` when `key` was inside deleted context.
    pub fn update(&self, key: usize, original_key: usize) -> Option<usize> {
        if key >= self.high {
            return key.checked_add_signed(self.delta);
        }
        if key < self.low {
            return Some(key);
        }
        if self.delta >= 0 {
            // Two insertions at the same spot keep their original order.
            if self.low < key || self.original_low < original_key {
                key.checked_add_signed(self.delta)
            } else {
                Some(key)
            }
        } else if self.low < key {
            None
        } else {
            Some(key)
        }
    }

    /// The change that undoes this one.
    pub fn inverse(&self) -> Self {
        PosChange {
            delta: -self.delta,
            inverted: !self.inverted,
            ..self.clone()
        }
    }

    /// Whether `other` exactly reverses this change, e.g. a deletion later
    /// followed by the re-insertion of the same span.
    pub fn is_mirror_of(&self, other: &PosChange) -> bool {
        self.delta == -other.delta
            && self.original_low == other.original_low
            && self.original_high == other.original_high
            && self.inverted != other.inverted
    }
}
