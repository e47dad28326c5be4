//! The server role.
//!
//! The sequencer is the single authority over the canon: it rebases every
//! submitted batch onto the history committed since the batch's base,
//! numbers the result, broadcasts it, and prunes history no connected peer
//! can still need. Feeding it messages one at a time, in arrival order, is
//! what makes the canon a total order.

use crate::config::SequencerConfig;
use crate::error::{Result, SyncError};
use crate::events::SequencerEvent;
use crate::network::Outbox;
use crate::protocol::{Message, Notice, Path, SignalData};
use canop_core::{char_len, rebase_pending, Action, AtomicOperation, Base, OperationLog, OriginId};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Identifies one transport connection. Unlike peer ids, never reused.
pub type ConnectionId = u64;

struct Connection {
    outbox: Box<dyn Outbox>,
    peer_id: OriginId,
    /// Newest canon index the peer is known to hold; 0 until it syncs.
    base: Base,
}

pub struct Sequencer {
    config: SequencerConfig,
    value: String,
    base: Base,
    /// Oldest base an incremental catch-up can still start from.
    floor: Base,
    canon: OperationLog,
    connections: BTreeMap<ConnectionId, Connection>,
    next_connection: ConnectionId,
    next_peer_id: OriginId,
    signals: BTreeMap<OriginId, SignalData>,
    events: broadcast::Sender<SequencerEvent>,
}

impl Sequencer {
    pub fn new(config: SequencerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let base = config.initial_base.max(1);
        Self {
            value: config.initial_value.clone(),
            base,
            floor: base,
            canon: OperationLog::new(),
            connections: BTreeMap::new(),
            next_connection: 1,
            next_peer_id: 1,
            signals: BTreeMap::new(),
            events,
            config,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequencerEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<SequencerEvent> {
        self.events.clone()
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// The canonical value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Canonical index of the newest committed operation.
    pub fn base(&self) -> Base {
        self.base
    }

    /// Retained canonical history.
    pub fn canon(&self) -> &OperationLog {
        &self.canon
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn peer_id(&self, connection: ConnectionId) -> Option<OriginId> {
        self.connections.get(&connection).map(|c| c.peer_id)
    }

    pub fn signals(&self) -> &BTreeMap<OriginId, SignalData> {
        &self.signals
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Register a connection and give it a fresh peer id.
    pub fn add_client(&mut self, outbox: impl Outbox + 'static) -> ConnectionId {
        let connection = self.next_connection;
        self.next_connection += 1;
        let peer_id = self.next_peer_id;
        self.next_peer_id = self.next_peer_id.saturating_add(1);

        self.connections.insert(
            connection,
            Connection {
                outbox: Box::new(outbox),
                peer_id,
                base: 0,
            },
        );
        self.signals
            .entry(peer_id)
            .or_default()
            .insert("connected".into(), Value::Bool(true));

        info!(connection, peer_id, "client connected");
        let _ = self.events.send(SequencerEvent::PeerJoined {
            connection,
            peer_id,
        });
        connection
    }

    /// Evict a connection and tell the remaining peers it left.
    pub fn remove_client(&mut self, connection: ConnectionId) -> Option<OriginId> {
        let removed = self.connections.remove(&connection)?;
        let peer_id = removed.peer_id;
        self.signals.remove(&peer_id);
        self.broadcast(&disconnect_signal(peer_id), None);

        info!(connection, peer_id, "client disconnected");
        let _ = self.events.send(SequencerEvent::PeerLeft {
            connection,
            peer_id,
        });
        Some(peer_id)
    }

    // ========================================================================
    // Incoming
    // ========================================================================

    /// Handle one message from `connection`.
    pub fn receive(&mut self, connection: ConnectionId, message: &str) -> Result<()> {
        if !self.connections.contains_key(&connection) {
            return Err(SyncError::UnknownConnection(connection));
        }
        let message = match Message::decode(message) {
            Ok(message) => message,
            Err(err) => {
                warn!(connection, error = %err, "dropping malformed message");
                return Err(err.into());
            }
        };

        match message {
            Message::Please { version } => {
                if version != self.config.protocol_version {
                    warn!(connection, version, "unsupported protocol version");
                    let error = Message::Error(vec![Notice::unsupported_version()]);
                    self.send_to(connection, &error);
                    return Ok(());
                }
                let (peer_id, state) = match self.connections.get_mut(&connection) {
                    Some(conn) => {
                        conn.base = self.base;
                        let state = Message::State {
                            value: self.value.clone(),
                            base: self.base,
                            peer_id: conn.peer_id,
                        };
                        (conn.peer_id, state)
                    }
                    None => return Err(SyncError::UnknownConnection(connection)),
                };
                debug!(connection, peer_id, base = self.base, "sending state");
                if self.send_to(connection, &state) {
                    self.send_signals_to(connection);
                }
                Ok(())
            }
            Message::Since { peer_id, base } => {
                self.claim_peer_id(connection, peer_id);
                let reply = match self.operations_since(base) {
                    Some(ops) => Message::DeltaSince {
                        path: Path::root(),
                        deltas: ops.to_vec(),
                    },
                    None => {
                        warn!(connection, peer_id, base, "catch-up from unknown base");
                        Message::Warning(vec![Notice::unknown_base()])
                    }
                };
                let known = matches!(reply, Message::DeltaSince { .. });
                if let Some(conn) = self.connections.get_mut(&connection) {
                    conn.base = if known { base } else { 0 };
                }
                if self.send_to(connection, &reply) {
                    self.send_signals_to(connection);
                }
                Ok(())
            }
            Message::Delta { path, deltas } => {
                path.require_root()?;
                let first_base = match deltas.first() {
                    Some(first) => first.mark.base,
                    None => return Ok(()),
                };
                if let Some(conn) = self.connections.get_mut(&connection) {
                    conn.base = first_base;
                }
                match self.receive_sent(deltas) {
                    Ok(committed) => {
                        if !committed.is_empty() {
                            let delta = Message::Delta {
                                path: Path::root(),
                                deltas: committed,
                            };
                            self.broadcast(&delta, None);
                        }
                        Ok(())
                    }
                    Err(SyncError::UnknownBase(base)) => {
                        warn!(connection, base, "batch from unknown base");
                        let warning = Message::Warning(vec![Notice::unknown_base()]);
                        self.send_to(connection, &warning);
                        Ok(())
                    }
                    Err(err @ SyncError::OutOfRange { .. }) => {
                        warn!(connection, error = %err, "dropping batch");
                        Err(err)
                    }
                    Err(err) => Err(err),
                }
            }
            Message::Signal { data, .. } => {
                // Relayed under the connection's own id.
                let peer_id = match self.connections.get(&connection) {
                    Some(conn) => conn.peer_id,
                    None => return Err(SyncError::UnknownConnection(connection)),
                };
                let entry = self.signals.entry(peer_id).or_default();
                if let Some(data) = &data {
                    for (key, value) in data {
                        entry.insert(key.clone(), value.clone());
                    }
                }
                self.broadcast(&Message::Signal { peer_id, data }, Some(connection));
                Ok(())
            }
            other => {
                warn!(connection, message = other.name(), "unexpected message for the sequencer");
                Err(SyncError::UnexpectedMessage(other.name()))
            }
        }
    }

    /// Canonicalize a submitted batch.
    ///
    /// Operations already committed (matched by origin and sequence) are
    /// stripped. The rest are rebased onto the canon committed since the
    /// batch's base, numbered, and appended. Returns what was committed.
    pub fn receive_sent(&mut self, sent: Vec<AtomicOperation>) -> Result<Vec<AtomicOperation>> {
        let (base, origin) = match sent.first() {
            Some(first) => (first.mark.base, first.mark.origin),
            None => return Ok(Vec::new()),
        };
        let canon = self
            .operations_since(base)
            .ok_or(SyncError::UnknownBase(base))?
            .to_vec();

        // The wire never carries snapshots; start from what the peer submitted.
        let sent: Vec<AtomicOperation> = sent
            .into_iter()
            .map(|mut op| {
                op.original = None;
                op
            })
            .collect();

        let mut acked = 0;
        let mut own_sent = Vec::new();
        for op in canon.iter().filter(|op| op.mark.origin == origin) {
            match sent.get(acked) {
                Some(next) if next.mark.sequence == op.mark.sequence => acked += 1,
                _ => own_sent.push(op.as_submitted()),
            }
        }
        let (committed_before, remaining) = sent.split_at(acked);

        let mut settled = OperationLog::from(committed_before.to_vec()).inverse_changes();
        settled.extend(OperationLog::from(own_sent).inverse_changes());
        settled.extend(OperationLog::from(canon).changes());
        let rebased = rebase_pending(remaining, &settled);
        self.check_extent(&rebased.ops)?;

        let mut committed = rebased.ops;
        for op in &mut committed {
            self.base += 1;
            op.mark.base = self.base;
            canop_core::apply_action(&mut self.value, &op.action);
            self.canon.push(op.clone());
        }

        debug!(
            origin,
            base,
            duplicates = acked,
            committed = committed.len(),
            tip = self.base,
            "canonized batch"
        );
        if !committed.is_empty() {
            let _ = self.events.send(SequencerEvent::Committed {
                ops: committed.clone(),
                pos_changes: rebased.changes,
            });
        }
        self.remove_common_ops();
        Ok(committed)
    }

    /// Refuse a batch whose insertions would pad the value by more than
    /// `max_padding` chars.
    fn check_extent(&self, ops: &[AtomicOperation]) -> Result<()> {
        let mut len = char_len(&self.value);
        for op in ops {
            len = match &op.action {
                Action::Pass => len,
                Action::Set { value, .. } => char_len(value),
                Action::Insert { offset, text } => {
                    if *offset > len.saturating_add(self.config.max_padding) {
                        return Err(SyncError::OutOfRange {
                            offset: *offset,
                            len,
                        });
                    }
                    (*offset).max(len).saturating_add(char_len(text))
                }
                Action::Delete { offset, text } => {
                    len - len.saturating_sub(*offset).min(char_len(text))
                }
            };
        }
        Ok(())
    }

    /// Canon committed after `base`.
    ///
    /// `Some(&[])` when `base` is the tip; `None` when the history needed
    /// was pruned or `base` was never issued.
    pub fn operations_since(&self, base: Base) -> Option<&[AtomicOperation]> {
        if base < self.floor || base > self.base {
            return None;
        }
        Some(self.canon.since(base))
    }

    /// Drop canon every initialized connection already holds.
    ///
    /// Nothing is dropped while no connection has synced.
    pub fn remove_common_ops(&mut self) {
        let floor = match self
            .connections
            .values()
            .map(|conn| conn.base)
            .filter(|base| *base != 0)
            .min()
        {
            Some(floor) => floor.min(self.base),
            None => return,
        };
        if floor > self.floor {
            self.canon.retain_from(floor);
            self.floor = floor;
            debug!(floor, retained = self.canon.len(), "pruned canon");
        }
    }

    // ========================================================================
    // Outgoing
    // ========================================================================

    fn claim_peer_id(&mut self, connection: ConnectionId, peer_id: OriginId) {
        let previous = match self.connections.get_mut(&connection) {
            Some(conn) if conn.peer_id != peer_id => std::mem::replace(&mut conn.peer_id, peer_id),
            _ => return,
        };
        self.next_peer_id = self.next_peer_id.max(peer_id.saturating_add(1));
        self.signals.remove(&previous);
        self.broadcast(&disconnect_signal(previous), Some(connection));
        self.signals
            .entry(peer_id)
            .or_default()
            .insert("connected".into(), Value::Bool(true));
        debug!(connection, previous, peer_id, "peer reclaimed its id");
    }

    /// Exchange signal state between `connection` and every other connection.
    fn send_signals_to(&mut self, connection: ConnectionId) {
        let peer_id = match self.connections.get(&connection) {
            Some(conn) => conn.peer_id,
            None => return,
        };
        let own = Message::Signal {
            peer_id,
            data: self.signals.get(&peer_id).cloned(),
        }
        .encode();

        let mut failed = Vec::new();
        if let Some(target) = self.connections.get(&connection) {
            for (&other, conn) in &self.connections {
                if other == connection {
                    continue;
                }
                let theirs = Message::Signal {
                    peer_id: conn.peer_id,
                    data: self.signals.get(&conn.peer_id).cloned(),
                };
                if target.outbox.send(theirs.encode()).is_err() {
                    failed.push(connection);
                }
                if conn.outbox.send(own.clone()).is_err() {
                    failed.push(other);
                }
            }
        }
        self.drop_failed(failed);
    }

    /// Send to one connection. A failed send evicts it.
    fn send_to(&mut self, connection: ConnectionId, message: &Message) -> bool {
        let result = match self.connections.get(&connection) {
            Some(conn) => conn.outbox.send(message.encode()),
            None => return false,
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(connection, error = %err, "send failed, dropping client");
                self.remove_client(connection);
                false
            }
        }
    }

    /// Send to every connection but `except`. Failed connections are evicted.
    fn broadcast(&mut self, message: &Message, except: Option<ConnectionId>) {
        let text = message.encode();
        let failed: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .filter(|(_, conn)| conn.outbox.send(text.clone()).is_err())
            .map(|(id, _)| *id)
            .collect();
        self.drop_failed(failed);
    }

    fn drop_failed(&mut self, mut failed: Vec<ConnectionId>) {
        failed.sort_unstable();
        failed.dedup();
        for connection in failed {
            warn!(connection, "send failed, dropping client");
            self.remove_client(connection);
        }
    }
}

fn disconnect_signal(peer_id: OriginId) -> Message {
    let mut data = SignalData::new();
    data.insert("connected".into(), Value::Bool(false));
    Message::Signal {
        peer_id,
        data: Some(data),
    }
}
