//! Configuration for peers and the sequencer.

use crate::protocol::PROTOCOL_VERSION;
use canop_core::Base;

/// Configuration for a [`Peer`](crate::peer::Peer).
#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Number of canonical operations kept for inspection.
    pub canon_history: usize,
    /// Protocol version announced in the handshake.
    pub protocol_version: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            event_capacity: 100,
            canon_history: 1000,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl PeerConfig {
    pub fn builder() -> PeerConfigBuilder {
        PeerConfigBuilder::new()
    }
}

/// Builder for peer configuration.
pub struct PeerConfigBuilder {
    config: PeerConfig,
}

impl PeerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PeerConfig::default(),
        }
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn canon_history(mut self, count: usize) -> Self {
        self.config.canon_history = count;
        self
    }

    pub fn protocol_version(mut self, version: u64) -> Self {
        self.config.protocol_version = version;
        self
    }

    pub fn build(self) -> PeerConfig {
        self.config
    }
}

impl Default for PeerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a [`Sequencer`](crate::sequencer::Sequencer).
#[derive(Clone, Debug)]
pub struct SequencerConfig {
    /// Value of the document before any commit.
    pub initial_value: String,
    /// Canonical index of the initial value. Must be non-zero: peers use 0
    /// for "never synced".
    pub initial_base: Base,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Only handshakes with this version are accepted.
    pub protocol_version: u64,
    /// How far past the end of the value an insertion may land. Batches
    /// reaching further are refused.
    pub max_padding: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            initial_value: String::new(),
            initial_base: 1,
            event_capacity: 100,
            protocol_version: PROTOCOL_VERSION,
            max_padding: 4096,
        }
    }
}

impl SequencerConfig {
    pub fn builder() -> SequencerConfigBuilder {
        SequencerConfigBuilder::new()
    }
}

/// Builder for sequencer configuration.
pub struct SequencerConfigBuilder {
    config: SequencerConfig,
}

impl SequencerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SequencerConfig::default(),
        }
    }

    pub fn initial_value(mut self, value: impl Into<String>) -> Self {
        self.config.initial_value = value.into();
        self
    }

    pub fn initial_base(mut self, base: Base) -> Self {
        self.config.initial_base = base.max(1);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn protocol_version(mut self, version: u64) -> Self {
        self.config.protocol_version = version;
        self
    }

    pub fn max_padding(mut self, padding: usize) -> Self {
        self.config.max_padding = padding;
        self
    }

    pub fn build(self) -> SequencerConfig {
        self.config
    }
}

impl Default for SequencerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
