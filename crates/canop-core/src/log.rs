//! Operation logs: ordered transactions of atomic operations.

use crate::mark::Base;
use crate::operation::{Action, AtomicOperation};
use crate::pos_change::PosChange;
use crate::text::{char_len, insert_at, remove_at};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An ordered sequence of atomic operations.
///
/// Insertion order is causal submission order. Logs are concatenated with
/// [`apply`](OperationLog::apply) and [`combine`](OperationLog::combine);
/// callers keep them free of duplicate marks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationLog {
    ops: Vec<AtomicOperation>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: AtomicOperation) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AtomicOperation> {
        self.ops.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, AtomicOperation> {
        self.ops.iter_mut()
    }

    pub fn as_slice(&self) -> &[AtomicOperation] {
        &self.ops
    }

    pub fn first(&self) -> Option<&AtomicOperation> {
        self.ops.first()
    }

    pub fn last(&self) -> Option<&AtomicOperation> {
        self.ops.last()
    }

    pub fn into_ops(self) -> Vec<AtomicOperation> {
        self.ops
    }

    /// Empty this log, returning what it held.
    pub fn take(&mut self) -> OperationLog {
        std::mem::take(self)
    }

    /// Append `other` to this log.
    pub fn apply(&mut self, other: &OperationLog) {
        self.ops.extend(other.ops.iter().cloned());
    }

    /// This log followed by `other`, without mutating either.
    pub fn combine(&self, other: &OperationLog) -> OperationLog {
        let mut combined = self.clone();
        combined.apply(other);
        combined
    }

    /// The log undoing this one: members inverted, in reverse order.
    /// `None` if any member cannot be inverted.
    pub fn inverse(&self) -> Option<OperationLog> {
        self.ops
            .iter()
            .rev()
            .map(AtomicOperation::inverse)
            .collect::<Option<Vec<_>>>()
            .map(OperationLog::from)
    }

    /// Positional changes of the members, in order.
    pub fn changes(&self) -> Vec<PosChange> {
        self.ops.iter().filter_map(AtomicOperation::change).collect()
    }

    /// Positional changes undoing the members, last member first.
    pub fn inverse_changes(&self) -> Vec<PosChange> {
        self.ops
            .iter()
            .rev()
            .filter_map(AtomicOperation::change)
            .map(|c| c.inverse())
            .collect()
    }

    /// Play this log on top of `value`.
    pub fn apply_to(&self, value: &mut String) {
        for op in &self.ops {
            apply_action(value, &op.action);
        }
    }

    /// The value this log produces from the empty string.
    pub fn render(&self) -> String {
        let mut value = String::new();
        self.apply_to(&mut value);
        value
    }

    /// Members committed after canonical index `base`.
    ///
    /// Members must be ordered by `mark.base`, as canon logs are. Whether the
    /// answer is complete depends on what was pruned; callers check that.
    pub fn since(&self, base: Base) -> &[AtomicOperation] {
        let start = self.ops.partition_point(|op| op.mark.base <= base);
        &self.ops[start..]
    }

    /// Drop members committed before canonical index `floor`.
    pub fn retain_from(&mut self, floor: Base) {
        self.ops.retain(|op| op.mark.base >= floor);
    }

    /// Keep only the `count` most recent members.
    pub fn keep_last(&mut self, count: usize) {
        if self.ops.len() > count {
            self.ops.drain(..self.ops.len() - count);
        }
    }
}

/// Apply a single action to `value`.
pub fn apply_action(value: &mut String, action: &Action) {
    match action {
        Action::Pass => {}
        Action::Set { value: new, .. } => *value = new.clone(),
        Action::Insert { offset, text } => insert_at(value, *offset, text),
        Action::Delete { offset, text } => {
            let removed = remove_at(value, *offset, char_len(text));
            if removed != *text {
                debug!(
                    offset,
                    expected = %text,
                    found = %removed,
                    "deleted text differs from intent"
                );
            }
        }
    }
}

impl From<Vec<AtomicOperation>> for OperationLog {
    fn from(ops: Vec<AtomicOperation>) -> Self {
        Self { ops }
    }
}

impl FromIterator<AtomicOperation> for OperationLog {
    fn from_iter<I: IntoIterator<Item = AtomicOperation>>(iter: I) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for OperationLog {
    type Item = AtomicOperation;
    type IntoIter = std::vec::IntoIter<AtomicOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

impl<'a> IntoIterator for &'a OperationLog {
    type Item = &'a AtomicOperation;
    type IntoIter = std::slice::Iter<'a, AtomicOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}

impl std::fmt::Display for OperationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mark::Mark;

    fn mark(base: u64, seq: u64) -> Mark {
        Mark::new(base, 1, seq)
    }

    #[test]
    fn test_render() {
        let log: OperationLog = vec![
            AtomicOperation::insert(mark(0, 0), 0, "A D"),
            AtomicOperation::insert(mark(0, 1), 2, "B "),
            AtomicOperation::delete(mark(0, 2), 0, "A "),
        ]
        .into();
        assert_eq!(log.render(), "B D");
    }

    #[test]
    fn test_set_replaces_value() {
        let log: OperationLog = vec![
            AtomicOperation::insert(mark(0, 0), 0, "old"),
            AtomicOperation::set(mark(0, 1), "fresh", Some("old".into())),
            AtomicOperation::insert(mark(0, 2), 5, "!"),
        ]
        .into();
        assert_eq!(log.render(), "fresh!");
    }

    #[test]
    fn test_combine_and_inverse() {
        let base: OperationLog = vec![AtomicOperation::insert(mark(0, 0), 0, "hello")].into();
        let edit: OperationLog = vec![
            AtomicOperation::insert(mark(0, 1), 5, " world"),
            AtomicOperation::delete(mark(0, 2), 0, "h"),
        ]
        .into();

        let combined = base.combine(&edit);
        assert_eq!(combined.render(), "ello world");
        assert_eq!(base.len(), 1);

        let undone = combined.combine(&edit.inverse().unwrap());
        assert_eq!(undone.render(), "hello");
    }

    #[test]
    fn test_inverse_fails_on_reset() {
        let log: OperationLog = vec![
            AtomicOperation::insert(mark(0, 0), 0, "a"),
            AtomicOperation::set(mark(0, 1), "b", None),
        ]
        .into();
        assert!(log.inverse().is_none());
    }

    #[test]
    fn test_inverse_changes_order() {
        let log: OperationLog = vec![
            AtomicOperation::insert(mark(0, 0), 0, "ab"),
            AtomicOperation::delete(mark(0, 1), 4, "c"),
        ]
        .into();
        let changes = log.inverse_changes();
        assert_eq!(changes[0].delta, 1);
        assert_eq!(changes[0].low, 4);
        assert_eq!(changes[1].delta, -2);
        assert!(changes.iter().all(|c| c.inverted));
    }

    #[test]
    fn test_since_and_retention() {
        let mut canon: OperationLog = (1..=5)
            .map(|base| AtomicOperation::insert(Mark::new(base, 1, base), 0, "x"))
            .collect();

        assert!(canon.since(5).is_empty());
        assert_eq!(canon.since(3).len(), 2);
        assert_eq!(canon.since(0).len(), 5);

        canon.retain_from(3);
        assert_eq!(canon.len(), 3);
        assert_eq!(canon.since(3).len(), 2);
        assert_eq!(canon.since(1).len(), 3);
    }

    #[test]
    fn test_keep_last() {
        let mut log: OperationLog = (0..4)
            .map(|seq| AtomicOperation::insert(mark(0, seq), 0, "x"))
            .collect();
        log.keep_last(2);
        assert_eq!(log.len(), 2);
        assert_eq!(log.first().unwrap().mark.sequence, 2);
    }
}
