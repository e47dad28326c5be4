//! Transport seam and in-memory transports.
//!
//! The engine never touches sockets. A [`Peer`] hands encoded messages to
//! an [`Outbox`], and whoever owns the other end feeds replies back through
//! [`Peer::receive`]. The same holds for every connection of the
//! [`Sequencer`].

use crate::config::{PeerConfig, SequencerConfig};
use crate::error::{NetworkError, Result};
use crate::peer::Peer;
use crate::sequencer::{ConnectionId, Sequencer};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outgoing half of a connection.
pub trait Outbox: Send {
    fn send(&self, message: String) -> std::result::Result<(), NetworkError>;
}

/// An outbox that queues messages until someone drains them.
///
/// Clones share the queue. Once closed, sends fail until reopened.
#[derive(Clone, Debug, Default)]
pub struct QueueOutbox {
    queue: Arc<Mutex<VecDeque<String>>>,
    closed: Arc<AtomicBool>,
}

impl QueueOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<String> {
        self.queue.lock().pop_front()
    }

    pub fn drain(&self) -> Vec<String> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Fail further sends and drop what is queued.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.queue.lock().clear();
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Outbox for QueueOutbox {
    fn send(&self, message: String) -> std::result::Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Disconnected);
        }
        self.queue.lock().push_back(message);
        Ok(())
    }
}

/// An outbox writing to an unbounded tokio channel.
#[derive(Clone, Debug)]
pub struct ChannelOutbox {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelOutbox {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl Outbox for ChannelOutbox {
    fn send(&self, message: String) -> std::result::Result<(), NetworkError> {
        self.tx
            .send(message)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }
}

/// Both directions of one simulated connection.
#[derive(Clone, Debug)]
struct Link {
    connection: ConnectionId,
    to_server: QueueOutbox,
    to_peer: QueueOutbox,
}

/// A sequencer and its peers wired through queues, delivered by hand.
///
/// Delivery is explicit, so tests choose the exact interleaving of
/// submissions and broadcasts.
pub struct MemoryNetwork {
    pub sequencer: Sequencer,
    pub peers: Vec<Peer>,
    links: Vec<Link>,
}

impl MemoryNetwork {
    /// Create a sequencer with `count` peers, each with a handshake queued.
    pub fn new(config: SequencerConfig, count: usize) -> Result<Self> {
        let mut network = Self {
            sequencer: Sequencer::new(config),
            peers: Vec::with_capacity(count),
            links: Vec::with_capacity(count),
        };
        for _ in 0..count {
            network.add_peer(PeerConfig::default())?;
        }
        Ok(network)
    }

    /// Connect one more peer and queue its handshake. Returns its index.
    pub fn add_peer(&mut self, config: PeerConfig) -> Result<usize> {
        let to_server = QueueOutbox::new();
        let to_peer = QueueOutbox::new();
        let connection = self.sequencer.add_client(to_peer.clone());
        let mut peer = Peer::new(to_server.clone(), config);
        peer.connect()?;

        self.peers.push(peer);
        self.links.push(Link {
            connection,
            to_server,
            to_peer,
        });
        Ok(self.peers.len() - 1)
    }

    pub fn connection(&self, index: usize) -> ConnectionId {
        self.links[index].connection
    }

    /// Deliver everything peer `index` has sent. Returns the message count.
    pub fn deliver_to_server(&mut self, index: usize) -> Result<usize> {
        let link = &self.links[index];
        let messages = link.to_server.drain();
        for message in &messages {
            self.sequencer.receive(link.connection, message)?;
        }
        Ok(messages.len())
    }

    /// Deliver everything queued for peer `index`. Returns the message count.
    pub fn deliver_to_peer(&mut self, index: usize) -> Result<usize> {
        let messages = self.links[index].to_peer.drain();
        for message in &messages {
            self.peers[index].receive(message)?;
        }
        Ok(messages.len())
    }

    /// Drop whatever peer `index` has queued for the sequencer.
    pub fn lose_outgoing(&mut self, index: usize) -> usize {
        self.links[index].to_server.drain().len()
    }

    /// Deliver in both directions until every queue is empty.
    pub fn pump(&mut self) -> Result<()> {
        loop {
            let mut delivered = 0;
            for index in 0..self.links.len() {
                delivered += self.deliver_to_server(index)?;
                delivered += self.deliver_to_peer(index)?;
            }
            if delivered == 0 {
                return Ok(());
            }
        }
    }

    /// Cut peer `index` off the sequencer. Queued messages are lost.
    pub fn disconnect(&mut self, index: usize) {
        let link = &self.links[index];
        link.to_server.close();
        link.to_peer.close();
        self.sequencer.remove_client(link.connection);
        self.peers[index].transport_lost("connection closed");
    }

    /// Give peer `index` a fresh connection and queue its handshake.
    pub fn reconnect(&mut self, index: usize) -> Result<()> {
        let to_peer = QueueOutbox::new();
        let connection = self.sequencer.add_client(to_peer.clone());
        let link = &mut self.links[index];
        link.to_server.reopen();
        link.connection = connection;
        link.to_peer = to_peer;
        self.peers[index].connect()
    }

    /// Whether every peer shows the sequencer's value with nothing pending.
    pub fn converged(&self) -> bool {
        self.peers.iter().all(|peer| {
            peer.value() == self.sequencer.value() && peer.local().is_empty() && peer.sent().is_empty()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_outbox() {
        let outbox = QueueOutbox::new();
        let reader = outbox.clone();

        outbox.send("a".into()).unwrap();
        outbox.send("b".into()).unwrap();
        assert_eq!(reader.len(), 2);
        assert_eq!(reader.pop().as_deref(), Some("a"));

        outbox.close();
        assert!(reader.is_empty());
        assert_eq!(outbox.send("c".into()), Err(NetworkError::Disconnected));

        outbox.reopen();
        outbox.send("d".into()).unwrap();
        assert_eq!(reader.drain(), vec!["d".to_string()]);
    }

    #[tokio::test]
    async fn test_channel_outbox() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbox = ChannelOutbox::new(tx);

        outbox.send("hello".into()).unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));

        drop(rx);
        assert!(matches!(
            outbox.send("gone".into()),
            Err(NetworkError::SendFailed(_))
        ));
    }

    #[test]
    fn test_network_creation() {
        let mut network = MemoryNetwork::new(
            SequencerConfig::builder().initial_value("abc").build(),
            3,
        )
        .unwrap();
        network.pump().unwrap();

        assert!(network.converged());
        for (index, peer) in network.peers.iter().enumerate() {
            assert_eq!(peer.value(), "abc");
            assert_eq!(peer.peer_id(), index as u64 + 1);
            assert_eq!(peer.connected(), 3);
        }
    }
}
