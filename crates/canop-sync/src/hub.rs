//! Async hosting for the sequencer and its peers.
//!
//! The [`Hub`] owns a [`Sequencer`] inside a single tokio task and feeds it
//! one command at a time, which keeps commits totally ordered without any
//! lock around the canon. Each connection gets an unbounded channel for
//! the messages the sequencer sends it. [`PeerHandle`] wires a [`Peer`]
//! to one such connection and drives its receive loop.

use crate::config::{PeerConfig, SequencerConfig};
use crate::error::{NetworkError, Result, SyncError};
use crate::events::{PeerEvent, SequencerEvent};
use crate::network::{ChannelOutbox, Outbox};
use crate::peer::Peer;
use crate::sequencer::{ConnectionId, Sequencer};
use canop_core::Base;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum Command {
    Connect {
        reply: oneshot::Sender<(ConnectionId, mpsc::UnboundedReceiver<String>)>,
    },
    Message {
        connection: ConnectionId,
        text: String,
    },
    Disconnect {
        connection: ConnectionId,
    },
    Snapshot {
        reply: oneshot::Sender<HubSnapshot>,
    },
    Shutdown,
}

/// Point-in-time view of the hosted sequencer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubSnapshot {
    pub value: String,
    pub base: Base,
    pub connections: usize,
}

/// A sequencer running in its own task.
pub struct Hub {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SequencerEvent>,
    task: JoinHandle<Sequencer>,
}

impl Hub {
    /// Start a sequencer task. Must be called inside a tokio runtime.
    pub fn spawn(config: SequencerConfig) -> Self {
        let sequencer = Sequencer::new(config);
        let events = sequencer.event_sender();
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(sequencer, rx));
        info!("hub started");
        Self {
            commands,
            events,
            task,
        }
    }

    /// Open a new connection to the sequencer.
    pub async fn connect(&self) -> Result<HubConnection> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { reply })
            .map_err(|_| SyncError::HubClosed)?;
        let (id, incoming) = rx.await.map_err(|_| SyncError::HubClosed)?;
        Ok(HubConnection {
            id,
            outbox: HubOutbox {
                connection: id,
                commands: self.commands.clone(),
            },
            incoming,
        })
    }

    pub async fn snapshot(&self) -> Result<HubSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .map_err(|_| SyncError::HubClosed)?;
        rx.await.map_err(|_| SyncError::HubClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequencerEvent> {
        self.events.subscribe()
    }

    /// Stop the task and hand back the sequencer. Commands already queued
    /// are processed first.
    pub async fn shutdown(self) -> Result<Sequencer> {
        self.commands
            .send(Command::Shutdown)
            .map_err(|_| SyncError::HubClosed)?;
        let sequencer = self.task.await.map_err(|_| SyncError::HubClosed)?;
        info!(base = sequencer.base(), "hub stopped");
        Ok(sequencer)
    }
}

async fn run(mut sequencer: Sequencer, mut commands: mpsc::UnboundedReceiver<Command>) -> Sequencer {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Connect { reply } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let connection = sequencer.add_client(ChannelOutbox::new(tx));
                if reply.send((connection, rx)).is_err() {
                    sequencer.remove_client(connection);
                }
            }
            Command::Message { connection, text } => {
                if let Err(err) = sequencer.receive(connection, &text) {
                    warn!(connection, error = %err, "rejected message");
                }
            }
            Command::Disconnect { connection } => {
                sequencer.remove_client(connection);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(HubSnapshot {
                    value: sequencer.value().to_string(),
                    base: sequencer.base(),
                    connections: sequencer.connection_count(),
                });
            }
            Command::Shutdown => break,
        }
    }
    sequencer
}

/// The outgoing half of a hub connection.
#[derive(Clone, Debug)]
pub struct HubOutbox {
    connection: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Connect { .. } => "Connect",
            Command::Message { .. } => "Message",
            Command::Disconnect { .. } => "Disconnect",
            Command::Snapshot { .. } => "Snapshot",
            Command::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

impl Outbox for HubOutbox {
    fn send(&self, message: String) -> std::result::Result<(), NetworkError> {
        self.commands
            .send(Command::Message {
                connection: self.connection,
                text: message,
            })
            .map_err(|_| NetworkError::Disconnected)
    }
}

/// One open connection: its id, a way to send, and what the sequencer sent.
pub struct HubConnection {
    pub id: ConnectionId,
    pub outbox: HubOutbox,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

/// A peer attached to a hub, with its receive loop running.
pub struct PeerHandle {
    peer: Arc<Mutex<Peer>>,
    connection: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl PeerHandle {
    /// Connect a fresh peer and start its handshake.
    pub async fn join(hub: &Hub, config: PeerConfig) -> Result<Self> {
        let HubConnection {
            id,
            outbox,
            incoming,
        } = hub.connect().await?;
        let commands = outbox.commands.clone();

        let mut peer = Peer::new(outbox, config);
        peer.connect()?;
        Ok(Self::start(Arc::new(Mutex::new(peer)), id, commands, incoming))
    }

    /// Reattach a peer returned by [`disconnect`](Self::disconnect) over a
    /// new connection. Pending edits survive the resync.
    pub async fn rejoin(hub: &Hub, peer: Arc<Mutex<Peer>>) -> Result<Self> {
        let HubConnection {
            id,
            outbox,
            incoming,
        } = hub.connect().await?;
        let commands = outbox.commands.clone();
        {
            let mut peer = peer.lock();
            peer.set_outbox(outbox);
            peer.connect()?;
        }
        Ok(Self::start(peer, id, commands, incoming))
    }

    fn start(
        peer: Arc<Mutex<Peer>>,
        connection: ConnectionId,
        commands: mpsc::UnboundedSender<Command>,
        mut incoming: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        let shared = Arc::clone(&peer);
        let task = tokio::spawn(async move {
            while let Some(message) = incoming.recv().await {
                let result = shared.lock().receive(&message);
                if let Err(err) = result {
                    debug!(connection, error = %err, "peer rejected message");
                }
            }
            shared.lock().transport_lost("hub closed the connection");
        });

        Self {
            peer,
            connection,
            commands,
            task,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn lock(&self) -> MutexGuard<'_, Peer> {
        self.peer.lock()
    }

    /// Run `f` with the peer locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut Peer) -> R) -> R {
        f(&mut self.peer.lock())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.peer.lock().subscribe()
    }

    pub fn value(&self) -> String {
        self.peer.lock().value().to_string()
    }

    /// Whether the peer has nothing local or in flight.
    pub fn is_idle(&self) -> bool {
        let peer = self.peer.lock();
        peer.local().is_empty() && peer.sent().is_empty()
    }

    /// Close the connection and stop the receive loop.
    pub fn disconnect(self) -> Arc<Mutex<Peer>> {
        let _ = self.commands.send(Command::Disconnect {
            connection: self.connection,
        });
        self.task.abort();
        self.peer.lock().transport_lost("disconnected");
        self.peer
    }
}
