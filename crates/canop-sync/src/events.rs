//! Typed events emitted by peers and the sequencer.

use crate::protocol::{Path, SignalData};
use crate::sequencer::ConnectionId;
use canop_core::{change_position, Action, AtomicOperation, OriginId, PosChange};

/// One edit an editor binding applies to its widget.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub path: Path,
    pub action: Action,
}

/// A batch of edits, with the positional chain that produced them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeEvent {
    pub changes: Vec<Change>,
    pub pos_changes: Vec<PosChange>,
}

impl ChangeEvent {
    pub fn new(changes: Vec<Change>, pos_changes: Vec<PosChange>) -> Self {
        Self {
            changes,
            pos_changes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Where a caret at `caret` lands after this event.
    pub fn remap(&self, caret: usize) -> usize {
        change_position(caret, &self.pos_changes, true).unwrap_or(caret)
    }
}

/// Events emitted by a [`Peer`](crate::peer::Peer).
#[derive(Clone, Debug)]
pub enum PeerEvent {
    /// Canonical operations changed the visible value.
    Change(ChangeEvent),
    /// A local mutation changed the visible value.
    LocalChange(ChangeEvent),
    Signal {
        peer_id: OriginId,
        data: Option<SignalData>,
    },
    /// A batch of local operations was sent.
    Syncing,
    /// Nothing is pending: the visible value is canonical.
    Synced,
    /// The peer cannot reach the sequencer.
    Unsyncable(String),
}

/// Events emitted by a [`Sequencer`](crate::sequencer::Sequencer).
#[derive(Clone, Debug)]
pub enum SequencerEvent {
    Committed {
        ops: Vec<AtomicOperation>,
        pos_changes: Vec<PosChange>,
    },
    PeerJoined {
        connection: ConnectionId,
        peer_id: OriginId,
    },
    PeerLeft {
        connection: ConnectionId,
        peer_id: OriginId,
    },
}
