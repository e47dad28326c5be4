//! Error types for synchronization.

use canop_core::Base;
use thiserror::Error;

/// A wire message that failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not valid JSON.
    #[error("Invalid Canop message: {0}")]
    Json(String),

    /// Valid JSON, but not a message array.
    #[error("Invalid Canop message: toplevel is not an array")]
    NotAnArray,

    /// Missing or unknown type tag.
    #[error("Invalid Canop message: unknown message type {0}")]
    UnknownType(String),

    /// A field has the wrong shape or an out-of-range value.
    #[error("Invalid Canop message: {0}")]
    Invalid(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Json(err.to_string())
    }
}

/// Transport failures reported by an [`Outbox`](crate::network::Outbox).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// The transport refused the message.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The other end is gone.
    #[error("Disconnected")]
    Disconnected,
}

/// Errors surfaced by peers, the sequencer and the hub.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A message failed to decode.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A message could not be sent.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// The base is not in the retained canon.
    #[error("Unknown base: {0}")]
    UnknownBase(Base),

    /// An insertion lands too far past the end of the value.
    #[error("Offset {offset} is too far past the end of a {len}-char value")]
    OutOfRange { offset: usize, len: usize },

    /// Only the root path can be edited.
    #[error("Unsupported path: {0}")]
    UnsupportedPath(String),

    /// The sequencer answered with an error notice.
    #[error("Remote error {code}: {message}")]
    Remote { code: u64, message: String },

    /// A message this role never handles.
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    /// The peer has not finished its handshake.
    #[error("Peer is not ready")]
    NotReady,

    /// No such connection on the sequencer.
    #[error("Unknown connection: {0}")]
    UnknownConnection(u64),

    /// The hub task has stopped.
    #[error("Hub is closed")]
    HubClosed,
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.into())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
