//! The rebase engine: remapping offsets and operations across history.

use crate::operation::AtomicOperation;
use crate::pos_change::PosChange;

/// Outcome of a lost-context step during a fold.
enum Lost {
    /// A later mirror restores the context; resume after this index.
    Resume(usize),
    /// No mirror exists.
    Gone,
}

fn recover(changes: &[PosChange], at: usize) -> Lost {
    let change = &changes[at];
    changes[at + 1..]
        .iter()
        .position(|later| change.is_mirror_of(later))
        .map_or(Lost::Gone, |offset| Lost::Resume(at + 1 + offset))
}

/// Fold `key` through `changes` in order.
///
/// When `key` falls inside deleted context, the fold jumps past the next
/// mirror of the offending change if there is one. Otherwise it returns
/// `None`, or with `best_guess` the last key it knew.
///
/// For any `key` and `changes`, mapping the result back through the inverse
/// changes yields `key` again or `None`.
pub fn change_position(key: usize, changes: &[PosChange], best_guess: bool) -> Option<usize> {
    let original_key = key;
    let mut key = key;
    let mut i = 0;
    while i < changes.len() {
        match changes[i].update(key, original_key) {
            Some(next) => key = next,
            None => match recover(changes, i) {
                Lost::Resume(mirror) => i = mirror,
                Lost::Gone if best_guess => return Some(key),
                Lost::Gone => return None,
            },
        }
        i += 1;
    }
    Some(key)
}

/// Fold an insertion anchor through `changes`.
///
/// Same as [`change_position`], except that an anchor swallowed by a
/// deletion with no mirror settles on the low bound of the deleted span and
/// keeps folding, so concurrent insertions survive concurrent deletions.
pub fn anchor_position(key: usize, changes: &[PosChange]) -> usize {
    let original_key = key;
    let mut key = key;
    let mut i = 0;
    while i < changes.len() {
        match changes[i].update(key, original_key) {
            Some(next) => key = next,
            None => match recover(changes, i) {
                Lost::Resume(mirror) => i = mirror,
                Lost::Gone => key = changes[i].low,
            },
        }
        i += 1;
    }
    key
}

/// Pending operations after a rebase, with the change chain that produced them.
#[derive(Clone, Debug, Default)]
pub struct Rebased {
    pub ops: Vec<AtomicOperation>,
    /// Undo of the pending operations, then `settled`, then the rebased
    /// pending operations. Suitable for remapping carets.
    pub changes: Vec<PosChange>,
}

/// Rebase `pending` (oldest first) onto `settled`.
///
/// `settled` is the history between the state `pending` was issued on and the
/// new tip, expressed as changes that come after undoing `pending`: typically
/// the inverse of already-acknowledged operations followed by the forward
/// changes of the canon.
///
/// Each pending operation only sees changes strictly later than itself in the
/// cumulative chain: the undo of earlier pending operations, `settled`, and
/// the rebased forms of earlier pending operations.
pub fn rebase_pending(pending: &[AtomicOperation], settled: &[PosChange]) -> Rebased {
    let undo: Vec<Option<PosChange>> = pending
        .iter()
        .map(|op| op.change().map(|c| c.inverse()))
        .collect();

    let mut changes: Vec<PosChange> = undo.iter().rev().flatten().cloned().collect();
    changes.extend_from_slice(settled);

    let mut ops = Vec::with_capacity(pending.len());
    for (i, op) in pending.iter().enumerate() {
        let cut = undo[i..].iter().filter(|c| c.is_some()).count();
        let rebased = op.modified_by(&changes[cut..]);
        if let Some(change) = rebased.change() {
            changes.push(change);
        }
        ops.push(rebased);
    }

    Rebased { ops, changes }
}
