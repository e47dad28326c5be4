//! Atomic operations: the indivisible edits every log is made of.

use crate::mark::Mark;
use crate::pos_change::PosChange;
use crate::rebase::{anchor_position, change_position};
use crate::text::{char_len, take_chars};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What an atomic operation does to the string value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// No effect. Rebasing degrades an edit whose context vanished to this.
    Pass,
    /// Replace the whole value. `old` is required to invert it.
    Set { value: String, old: Option<String> },
    /// Insert `text` at char `offset`.
    Insert { offset: usize, text: String },
    /// Delete `text` starting at char `offset`.
    Delete { offset: usize, text: String },
}

impl Action {
    /// Wire tag of this action.
    pub fn tag(&self) -> u8 {
        match self {
            Action::Pass => 0,
            Action::Set { .. } => 1,
            Action::Insert { .. } => 8,
            Action::Delete { .. } => 9,
        }
    }

    /// The action undoing this one, if it can be undone.
    pub fn inverse(&self) -> Option<Action> {
        match self {
            Action::Pass => Some(Action::Pass),
            Action::Set { value, old } => old.as_ref().map(|old| Action::Set {
                value: old.clone(),
                old: Some(value.clone()),
            }),
            Action::Insert { offset, text } => Some(Action::Delete {
                offset: *offset,
                text: text.clone(),
            }),
            Action::Delete { offset, text } => Some(Action::Insert {
                offset: *offset,
                text: text.clone(),
            }),
        }
    }

    /// Offset and text of a positional action.
    pub fn span(&self) -> Option<(usize, &str)> {
        match self {
            Action::Insert { offset, text } | Action::Delete { offset, text } => {
                Some((*offset, text.as_str()))
            }
            _ => None,
        }
    }
}

/// Snapshot of an operation taken before its first rebase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Original {
    pub mark: Mark,
    pub action: Action,
}

/// One indivisible edit, identified by its [`Mark`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicOperation {
    pub mark: Mark,
    pub action: Action,
    /// Set by the first rebase. Used for insertion tie-breaks and to recover
    /// what the issuing peer actually submitted.
    pub original: Option<Original>,
}

impl AtomicOperation {
    pub fn new(mark: Mark, action: Action) -> Self {
        Self {
            mark,
            action,
            original: None,
        }
    }

    pub fn insert(mark: Mark, offset: usize, text: impl Into<String>) -> Self {
        Self::new(
            mark,
            Action::Insert {
                offset,
                text: text.into(),
            },
        )
    }

    pub fn delete(mark: Mark, offset: usize, text: impl Into<String>) -> Self {
        Self::new(
            mark,
            Action::Delete {
                offset,
                text: text.into(),
            },
        )
    }

    pub fn set(mark: Mark, value: impl Into<String>, old: Option<String>) -> Self {
        Self::new(
            mark,
            Action::Set {
                value: value.into(),
                old,
            },
        )
    }

    /// Positional side-effect of this operation. `Pass` has none worth
    /// tracking but still yields a zero-width change; `Set` yields nothing.
    pub fn change(&self) -> Option<PosChange> {
        let change = match &self.action {
            Action::Insert { offset, text } => PosChange::insertion(*offset, char_len(text)),
            Action::Delete { offset, text } => PosChange::deletion(*offset, char_len(text)),
            Action::Pass => return Some(PosChange::insertion(0, 0)),
            Action::Set { .. } => return None,
        };
        match self.original.as_ref().and_then(|o| o.action.span()) {
            Some((offset, text)) => Some(change.with_original(offset, char_len(text))),
            None => Some(change),
        }
    }

    /// The operation undoing this one, if any.
    pub fn inverse(&self) -> Option<AtomicOperation> {
        Some(AtomicOperation {
            mark: self.mark,
            action: self.action.inverse()?,
            original: self.original.clone(),
        })
    }

    /// The operation as its issuer submitted it, before any rebase.
    pub fn as_submitted(&self) -> AtomicOperation {
        match &self.original {
            Some(original) => AtomicOperation {
                mark: self.mark,
                action: original.action.clone(),
                original: None,
            },
            None => self.clone(),
        }
    }

    /// This operation remapped across `changes`.
    ///
    /// If an endpoint of a deletion lost its context, the result degrades to
    /// [`Action::Pass`] rather than failing the surrounding rebase. Deleted
    /// text is clipped or space-padded so its length matches the remapped span.
    pub fn modified_by(&self, changes: &[PosChange]) -> AtomicOperation {
        let mut op = self.clone();
        let action = match &self.action {
            Action::Pass | Action::Set { .. } => return op,
            Action::Insert { offset, text } => Action::Insert {
                offset: anchor_position(*offset, changes),
                text: text.clone(),
            },
            Action::Delete { offset, text } => {
                let len = char_len(text);
                let start = change_position(*offset, changes, false);
                let end = change_position(offset.saturating_add(len), changes, false);
                match (start, end) {
                    (Some(start), Some(end)) => {
                        let span = end.saturating_sub(start);
                        let text = if span < len {
                            take_chars(text, span)
                        } else {
                            let mut padded = text.clone();
                            padded.extend(std::iter::repeat(' ').take(span - len));
                            padded
                        };
                        Action::Delete {
                            offset: start,
                            text,
                        }
                    }
                    _ => {
                        debug!(mark = %self.mark, "deletion lost its context, degrading to pass");
                        Action::Pass
                    }
                }
            }
        };
        if op.original.is_none() {
            op.original = Some(Original {
                mark: self.mark,
                action: self.action.clone(),
            });
        }
        op.action = action;
        op
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark(seq: u64) -> Mark {
        Mark::new(1, 1, seq)
    }

    #[test]
    fn test_inverse() {
        let ins = AtomicOperation::insert(mark(0), 3, "abc");
        assert_eq!(
            ins.inverse().unwrap().action,
            Action::Delete {
                offset: 3,
                text: "abc".to_string()
            }
        );

        let set = AtomicOperation::set(mark(1), "new", Some("old".to_string()));
        assert_eq!(
            set.inverse().unwrap().action,
            Action::Set {
                value: "old".to_string(),
                old: Some("new".to_string())
            }
        );

        let reset = AtomicOperation::set(mark(2), "snapshot", None);
        assert!(reset.inverse().is_none());
    }

    #[test]
    fn test_change() {
        let del = AtomicOperation::delete(mark(0), 2, "xyz");
        let change = del.change().unwrap();
        assert_eq!((change.low, change.high, change.delta), (2, 5, -3));

        assert!(AtomicOperation::set(mark(1), "v", None).change().is_none());

        let pass = AtomicOperation::new(mark(2), Action::Pass).change().unwrap();
        assert_eq!(pass.update(4, 4), Some(4));
    }

    #[test]
    fn test_modified_by_snapshots_once() {
        let op = AtomicOperation::insert(mark(0), 2, "d");
        let once = op.modified_by(&[PosChange::insertion(0, 1)]);
        let twice = once.modified_by(&[PosChange::insertion(0, 1)]);

        assert_eq!(twice.action.span(), Some((4, "d")));
        assert_eq!(twice.original.as_ref().unwrap().action, op.action);
        assert_eq!(twice.change().unwrap().original_low, 2);
    }

    #[test]
    fn test_set_and_pass_are_not_rebased() {
        let changes = [PosChange::insertion(0, 4)];
        let set = AtomicOperation::set(mark(0), "v", None);
        let rebased = set.modified_by(&changes);
        assert_eq!(rebased.action, set.action);
        assert!(rebased.original.is_none());

        let pass = AtomicOperation::new(mark(1), Action::Pass);
        assert!(pass.modified_by(&changes).original.is_none());
    }

    #[test]
    fn test_delete_at_max_offset_does_not_overflow() {
        let op = AtomicOperation::delete(mark(0), usize::MAX - 1, "abc");
        let rebased = op.modified_by(&[PosChange::insertion(0, 1)]);
        assert_eq!(rebased.action, Action::Pass);
    }

    #[test]
    fn test_delete_inside_deleted_span_degrades() {
        let op = AtomicOperation::delete(mark(0), 3, "y");
        let rebased = op.modified_by(&[PosChange::deletion(2, 3)]);
        assert_eq!(rebased.action, Action::Pass);
        assert!(rebased.original.is_some());
    }

    #[test]
    fn test_delete_text_clipped_to_span() {
        // "xyze" at 2, with "xyz" concurrently deleted: only "e" remains to delete.
        let op = AtomicOperation::delete(mark(0), 2, "xyze");
        let rebased = op.modified_by(&[PosChange::deletion(2, 3)]);
        assert_eq!(
            rebased.action,
            Action::Delete {
                offset: 2,
                text: "x".to_string()
            }
        );
    }

    #[test]
    fn test_delete_text_padded_to_span() {
        // A concurrent insertion inside the deleted span widens it.
        let op = AtomicOperation::delete(mark(0), 2, "xyz");
        let rebased = op.modified_by(&[PosChange::insertion(4, 2)]);
        assert_eq!(
            rebased.action,
            Action::Delete {
                offset: 2,
                text: "xyz  ".to_string()
            }
        );
    }

    #[test]
    fn test_set_is_not_rebased() {
        let op = AtomicOperation::set(mark(0), "v", None);
        let rebased = op.modified_by(&[PosChange::insertion(0, 4)]);
        assert_eq!(rebased, op);
    }

    #[test]
    fn test_as_submitted() {
        let op = AtomicOperation::delete(mark(0), 5, "ab");
        let rebased = op.modified_by(&[PosChange::deletion(0, 2)]);
        assert_eq!(rebased.action.span(), Some((3, "ab")));
        assert_eq!(rebased.as_submitted().action, op.action);
    }
}
