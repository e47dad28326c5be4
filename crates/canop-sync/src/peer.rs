//! The client role.
//!
//! A [`Peer`] keeps three logs:
//!  - `canon`: operations the sequencer committed, in canonical order
//!  - `sent`: the one batch submitted and not yet acknowledged
//!  - `local`: edits not sent yet
//!
//! The visible value is the canon value with `sent` then `local` replayed on
//! top. Whenever canonical operations arrive, `sent` and `local` are rebased
//! onto them so the visible value stays consistent with the new canon.

use crate::config::PeerConfig;
use crate::error::{Result, SyncError};
use crate::events::{Change, ChangeEvent, PeerEvent};
use crate::network::Outbox;
use crate::protocol::{Message, Path, SignalData, WARN_UNKNOWN_BASE};
use canop_core::{
    apply_action, minimal_diff, rebase_pending, Action, AtomicOperation, Base, Mark,
    OperationLog, OriginId, PosChange, Rebased, Sequence,
};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Synchronization state of a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    /// No usable connection to the sequencer.
    Unsyncable,
    /// Handshake sent, waiting for `STATE` or `DELTA_SINCE`.
    Loading,
    /// In sync; canonical updates are integrated as they arrive.
    Ready,
}

/// A participant editing the shared value.
pub struct Peer {
    config: PeerConfig,
    state: PeerState,
    /// Assigned by the sequencer; 0 until the first `STATE`.
    peer_id: OriginId,
    base: Base,
    next_sequence: Sequence,
    local: OperationLog,
    sent: OperationLog,
    canon: OperationLog,
    canon_value: String,
    value: String,
    signals: HashMap<OriginId, SignalData>,
    outbox: Box<dyn Outbox>,
    events: broadcast::Sender<PeerEvent>,
}

impl Peer {
    pub fn new(outbox: impl Outbox + 'static, config: PeerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            state: PeerState::Unsyncable,
            peer_id: 0,
            base: 0,
            next_sequence: 0,
            local: OperationLog::new(),
            sent: OperationLog::new(),
            canon: OperationLog::new(),
            canon_value: String::new(),
            value: String::new(),
            signals: HashMap::new(),
            outbox: Box::new(outbox),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn peer_id(&self) -> OriginId {
        self.peer_id
    }

    /// Canonical index of the newest canon operation known.
    pub fn base(&self) -> Base {
        self.base
    }

    /// The visible value, pending edits included.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The value as last committed by the sequencer.
    pub fn canon_value(&self) -> &str {
        &self.canon_value
    }

    pub fn local(&self) -> &OperationLog {
        &self.local
    }

    pub fn sent(&self) -> &OperationLog {
        &self.sent
    }

    /// Recent canonical operations, bounded by [`PeerConfig::canon_history`].
    pub fn canon(&self) -> &OperationLog {
        &self.canon
    }

    /// Latest signal data per other peer.
    pub fn signals(&self) -> &HashMap<OriginId, SignalData> {
        &self.signals
    }

    /// Number of connected peers, this one included.
    pub fn connected(&self) -> usize {
        if self.state == PeerState::Unsyncable {
            return 0;
        }
        let connected = Value::Bool(true);
        1 + self
            .signals
            .values()
            .filter(|data| data.get("connected") == Some(&connected))
            .count()
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Start a handshake: `PLEASE` if never synced, `SINCE` otherwise.
    pub fn connect(&mut self) -> Result<()> {
        let message = if self.peer_id == 0 {
            Message::Please {
                version: self.config.protocol_version,
            }
        } else {
            Message::Since {
                peer_id: self.peer_id,
                base: self.base,
            }
        };
        match self.outbox.send(message.encode()) {
            Ok(()) => {
                debug!(peer_id = self.peer_id, base = self.base, "handshake sent");
                self.state = PeerState::Loading;
                Ok(())
            }
            Err(err) => {
                self.fail(err.to_string());
                Err(err.into())
            }
        }
    }

    /// Swap the transport after a reconnect. Follow with [`connect`](Self::connect).
    pub fn set_outbox(&mut self, outbox: impl Outbox + 'static) {
        self.outbox = Box::new(outbox);
    }

    /// The transport went away. Pending edits are kept for the next sync.
    pub fn transport_lost(&mut self, reason: impl Into<String>) {
        if self.state != PeerState::Unsyncable {
            self.fail(reason.into());
        }
    }

    fn fail(&mut self, reason: String) {
        warn!(peer_id = self.peer_id, %reason, "peer is unsyncable");
        self.state = PeerState::Unsyncable;
        self.emit(PeerEvent::Unsyncable(reason));
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Insert `text` at char `offset`.
    pub fn add(&mut self, path: &Path, offset: usize, text: impl Into<String>) -> Result<()> {
        self.act(
            path,
            Action::Insert {
                offset,
                text: text.into(),
            },
        )
    }

    /// Delete `text`, which starts at char `offset`.
    pub fn remove(&mut self, path: &Path, offset: usize, text: impl Into<String>) -> Result<()> {
        self.act(
            path,
            Action::Delete {
                offset,
                text: text.into(),
            },
        )
    }

    /// Replace the whole value. Without `old` the edit cannot be inverted.
    pub fn set(
        &mut self,
        path: &Path,
        value: impl Into<String>,
        old: Option<String>,
    ) -> Result<()> {
        self.act(
            path,
            Action::Set {
                value: value.into(),
                old,
            },
        )
    }

    pub fn act(&mut self, path: &Path, action: Action) -> Result<()> {
        self.act_atomically(path, vec![action])
    }

    /// Commit several actions, reported as one local change.
    pub fn act_atomically(&mut self, path: &Path, actions: Vec<Action>) -> Result<()> {
        path.require_root()?;

        let mut changes = Vec::with_capacity(actions.len());
        let mut pos_changes = Vec::with_capacity(actions.len());
        for action in actions {
            if action == Action::Pass {
                continue;
            }
            let mark = Mark::new(self.base, self.peer_id, self.next_sequence);
            self.next_sequence += 1;

            let op = AtomicOperation::new(mark, action);
            apply_action(&mut self.value, &op.action);
            pos_changes.extend(op.change());
            changes.push(Change {
                path: path.clone(),
                action: op.action.clone(),
            });
            self.local.push(op);
        }
        if changes.is_empty() {
            return Ok(());
        }

        self.emit(PeerEvent::LocalChange(ChangeEvent::new(changes, pos_changes)));
        self.flush();
        Ok(())
    }

    /// Broadcast ephemeral metadata (a caret, a user name) to the other peers.
    pub fn signal(&mut self, data: SignalData) -> Result<()> {
        if self.state != PeerState::Ready {
            return Err(SyncError::NotReady);
        }
        let message = Message::Signal {
            peer_id: self.peer_id,
            data: Some(data),
        };
        match self.outbox.send(message.encode()) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.transport_lost(err.to_string());
                Err(err.into())
            }
        }
    }

    // ========================================================================
    // Outgoing
    // ========================================================================

    /// Submit `local` as one batch.
    ///
    /// Does nothing unless the peer is ready and no batch is in flight.
    pub fn send_to_server(&mut self) -> Result<()> {
        if self.state != PeerState::Ready || !self.sent.is_empty() || self.local.is_empty() {
            return Ok(());
        }
        self.emit(PeerEvent::Syncing);

        let message = Message::Delta {
            path: Path::root(),
            deltas: self.local.as_slice().to_vec(),
        };
        match self.outbox.send(message.encode()) {
            Ok(()) => {
                debug!(peer_id = self.peer_id, count = self.local.len(), "batch sent");
                self.local_to_sent();
                Ok(())
            }
            Err(err) => {
                self.transport_lost(err.to_string());
                Err(err.into())
            }
        }
    }

    /// Move every local operation to `sent`.
    pub fn local_to_sent(&mut self) {
        let local = self.local.take();
        self.sent.apply(&local);
    }

    fn flush(&mut self) {
        if let Err(err) = self.send_to_server() {
            warn!(peer_id = self.peer_id, error = %err, "could not send pending edits");
        }
    }

    // ========================================================================
    // Incoming
    // ========================================================================

    /// Handle one message from the sequencer.
    ///
    /// Malformed messages are logged and dropped without touching the state.
    pub fn receive(&mut self, message: &str) -> Result<()> {
        let message = match Message::decode(message) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping malformed message");
                return Err(err.into());
            }
        };

        match message {
            Message::State {
                value,
                base,
                peer_id,
            } => {
                self.reset(value, base, peer_id);
                self.state = PeerState::Ready;
                self.flush();
                Ok(())
            }
            Message::DeltaSince { path, deltas } => {
                path.require_root()?;
                self.receive_change(deltas);
                // Whatever is still unacknowledged never reached the canon.
                self.requeue_sent();
                self.state = PeerState::Ready;
                self.flush();
                Ok(())
            }
            Message::Delta { path, deltas } => {
                if self.state != PeerState::Ready {
                    debug!(state = ?self.state, "ignoring delta before sync");
                    return Ok(());
                }
                path.require_root()?;
                self.receive_change(deltas);
                self.flush();
                Ok(())
            }
            Message::Signal { peer_id, data } => {
                if self.state == PeerState::Ready {
                    self.receive_signal(peer_id, data);
                }
                Ok(())
            }
            Message::Warning(notices) => {
                for notice in notices {
                    if notice.code == WARN_UNKNOWN_BASE {
                        warn!(base = self.base, "sequencer lost our base, resyncing");
                        self.fail(notice.message);
                        self.peer_id = 0;
                        self.connect()?;
                    } else {
                        warn!(code = notice.code, message = %notice.message, "sequencer warning");
                    }
                }
                Ok(())
            }
            Message::Error(notices) => {
                for notice in &notices {
                    error!(code = notice.code, message = %notice.message, "sequencer error");
                }
                match notices.into_iter().next() {
                    Some(notice) => Err(SyncError::Remote {
                        code: notice.code,
                        message: notice.message,
                    }),
                    None => Ok(()),
                }
            }
            other => {
                warn!(message = other.name(), "unexpected message for a peer");
                Err(SyncError::UnexpectedMessage(other.name()))
            }
        }
    }

    /// Integrate canonical operations and rebase `sent` and `local` onto them.
    ///
    /// Returns the positional chain from the old visible value to the new one:
    /// undo of `local`, undo of `sent`, the canon, then the rebased `sent`
    /// and `local`.
    pub fn receive_canon(&mut self, canon: Vec<AtomicOperation>) -> Vec<PosChange> {
        let tip = match canon.last() {
            Some(last) => last.mark.base,
            None => return Vec::new(),
        };
        // Snapshots taken on the sequencer describe another peer's history.
        let canon: OperationLog = canon
            .into_iter()
            .map(|mut op| {
                op.original = None;
                op
            })
            .collect();

        let mut sent = self.sent.take().into_ops();
        let mut acked = Vec::new();
        for op in &canon {
            if sent.first().map_or(false, |s| s.mark.same_edit(&op.mark)) {
                acked.push(sent.remove(0));
            }
        }

        // Acknowledged operations are undone here and replayed by the canon.
        let mut settled = OperationLog::from(acked).inverse_changes();
        settled.extend(canon.changes());

        let sent_count = sent.len();
        let mut pending = sent;
        pending.extend(self.local.take());
        let Rebased { mut ops, changes } = rebase_pending(&pending, &settled);
        let mut local = ops.split_off(sent_count);
        for op in ops.iter_mut().chain(local.iter_mut()) {
            op.mark.base = tip;
        }
        self.sent = ops.into();
        self.local = local.into();

        canon.apply_to(&mut self.canon_value);
        self.canon.apply(&canon);
        self.canon.keep_last(self.config.canon_history);
        self.base = tip;
        self.value = self.render_visible();

        debug!(
            peer_id = self.peer_id,
            base = tip,
            unacknowledged = self.sent.len(),
            local = self.local.len(),
            "integrated canon"
        );
        changes
    }

    fn receive_change(&mut self, deltas: Vec<AtomicOperation>) {
        // A second catch-up from the same base repeats operations we have.
        let base = self.base;
        let canon: Vec<_> = deltas
            .into_iter()
            .skip_while(|op| op.mark.base <= base)
            .collect();
        if canon.is_empty() {
            return;
        }

        let old_value = self.value.clone();
        let pos_changes = self.receive_canon(canon);
        self.emit_change(&old_value, pos_changes);
        if self.local.is_empty() && self.sent.is_empty() {
            self.emit(PeerEvent::Synced);
        }
    }

    /// Adopt a snapshot. Pending edits are kept, re-marked, and resent.
    fn reset(&mut self, value: String, base: Base, peer_id: OriginId) {
        let old_value = self.value.clone();

        let mut pending = self.sent.take();
        pending.apply(&self.local);
        for op in pending.iter_mut() {
            op.mark = Mark::new(base, peer_id, op.mark.sequence);
            op.original = None;
        }
        self.local = pending;

        self.peer_id = peer_id;
        self.base = base;
        self.canon = OperationLog::from(vec![AtomicOperation::set(
            Mark::new(base, peer_id, 0),
            value.clone(),
            None,
        )]);
        self.canon_value = value;
        self.value = self.render_visible();
        self.signals.clear();

        debug!(peer_id, base, pending = self.local.len(), "adopted snapshot");
        self.emit_change(&old_value, Vec::new());
        if self.local.is_empty() {
            self.emit(PeerEvent::Synced);
        }
    }

    fn requeue_sent(&mut self) {
        if self.sent.is_empty() {
            return;
        }
        let mut pending = self.sent.take();
        debug!(count = pending.len(), "requeueing unacknowledged batch");
        pending.apply(&self.local);
        self.local = pending;
    }

    fn receive_signal(&mut self, peer_id: OriginId, data: Option<SignalData>) {
        let entry = self.signals.entry(peer_id).or_default();
        if let Some(data) = &data {
            for (key, value) in data {
                entry.insert(key.clone(), value.clone());
            }
            if data.get("connected") == Some(&Value::Bool(false)) {
                self.signals.remove(&peer_id);
            }
        }
        self.emit(PeerEvent::Signal { peer_id, data });
    }

    fn render_visible(&self) -> String {
        let mut value = self.canon_value.clone();
        self.sent.apply_to(&mut value);
        self.local.apply_to(&mut value);
        value
    }

    fn emit_change(&self, old_value: &str, pos_changes: Vec<PosChange>) {
        let changes: Vec<Change> = minimal_diff(old_value, &self.value)
            .into_iter()
            .map(|action| Change {
                path: Path::root(),
                action,
            })
            .collect();
        if !changes.is_empty() {
            self.emit(PeerEvent::Change(ChangeEvent::new(changes, pos_changes)));
        }
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}
