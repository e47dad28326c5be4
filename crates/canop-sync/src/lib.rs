//! canop-sync - Wire protocol, peers and sequencer for Canop
//!
//! A sequencer holds the canonical value. Peers edit optimistically, submit
//! one batch at a time, and rebase whatever is pending whenever canonical
//! operations arrive. Every peer ends up showing the sequencer's value.
//!
//! # Quick Start
//!
//! ```rust
//! use canop_sync::{MemoryNetwork, Path, SequencerConfig};
//!
//! let config = SequencerConfig::builder().initial_value("bc").build();
//! let mut network = MemoryNetwork::new(config, 2).unwrap();
//! network.pump().unwrap();
//!
//! network.peers[0].add(&Path::root(), 0, "a").unwrap();
//! network.peers[1].add(&Path::root(), 2, "d").unwrap();
//! network.pump().unwrap();
//!
//! assert!(network.converged());
//! assert_eq!(network.sequencer.value(), "abcd");
//! ```
//!
//! # Architecture
//!
//! - [`protocol`] - JSON-array message codec
//! - [`peer`] - The client role
//! - [`sequencer`] - The server role
//! - [`network`] - Transport seam and in-memory transports
//! - [`hub`] - Async hosting on tokio
//! - [`events`] - Typed events for editor bindings
//! - [`config`] - Configuration builders
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod network;
pub mod peer;
pub mod protocol;
pub mod sequencer;

pub use config::{PeerConfig, PeerConfigBuilder, SequencerConfig, SequencerConfigBuilder};
pub use error::{NetworkError, ProtocolError, Result, SyncError};
pub use events::{Change, ChangeEvent, PeerEvent, SequencerEvent};
pub use hub::{Hub, HubConnection, HubOutbox, HubSnapshot, PeerHandle};
pub use network::{ChannelOutbox, MemoryNetwork, Outbox, QueueOutbox};
pub use peer::{Peer, PeerState};
pub use protocol::{Message, Notice, Path, PathKey, SignalData, PROTOCOL_VERSION};
pub use sequencer::{ConnectionId, Sequencer};
