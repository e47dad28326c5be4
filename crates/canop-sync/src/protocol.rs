//! Wire protocol.
//!
//! Every message is a JSON array whose first element is the message tag:
//!
//! | Tag | Message       | Payload                      |
//! |-----|---------------|------------------------------|
//! | 0   | `PLEASE`      | `[version]`                  |
//! | 1   | `STATE`       | `[value, base, peerId]`      |
//! | 2   | `DELTA`       | `[path, deltas]`             |
//! | 3   | `SIGNAL`      | `[peerId, data?]`            |
//! | 4   | `WARNING`     | `[[code, message], ...]`     |
//! | 5   | `ERROR`       | `[[code, message], ...]`     |
//! | 6   | `SINCE`       | `[peerId, base]`             |
//! | 7   | `DELTA_SINCE` | `[path, deltas]`             |
//!
//! A delta is `[[base, origin, sequence], [action, offset|value, text|old]]`.

use crate::error::{ProtocolError, SyncError};
use canop_core::{char_len, Action, AtomicOperation, Base, Mark, OriginId};
use serde_json::{json, Value};
use std::fmt;

pub const PROTOCOL_VERSION: u64 = 0;

/// Warning code: the requested base is no longer retained.
pub const WARN_UNKNOWN_BASE: u64 = 0;

/// Error code: the handshake asked for another protocol version.
pub const ERR_UNSUPPORTED_VERSION: u64 = 0;

pub mod tag {
    pub const PLEASE: u64 = 0;
    pub const STATE: u64 = 1;
    pub const DELTA: u64 = 2;
    pub const SIGNAL: u64 = 3;
    pub const WARNING: u64 = 4;
    pub const ERROR: u64 = 5;
    pub const SINCE: u64 = 6;
    pub const DELTA_SINCE: u64 = 7;
}

/// Ephemeral per-peer metadata relayed by signals.
pub type SignalData = serde_json::Map<String, Value>;

/// One key of a [`Path`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathKey {
    Index(u64),
    Field(String),
}

/// Location of the edited value inside the synchronized document.
///
/// Only the root (the empty path) is synchronized; peers and the sequencer
/// reject anything else.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Path(Vec<PathKey>);

impl Path {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn new(keys: Vec<PathKey>) -> Self {
        Self(keys)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> &[PathKey] {
        &self.0
    }

    /// Fail with [`SyncError::UnsupportedPath`] unless this is the root.
    pub fn require_root(&self) -> Result<(), SyncError> {
        if self.is_root() {
            Ok(())
        } else {
            Err(SyncError::UnsupportedPath(self.to_string()))
        }
    }

    fn to_json(&self) -> Value {
        Value::Array(
            self.0
                .iter()
                .map(|key| match key {
                    PathKey::Index(index) => json!(index),
                    PathKey::Field(field) => json!(field),
                })
                .collect(),
        )
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for key in &self.0 {
            match key {
                PathKey::Index(index) => write!(f, "/{}", index)?,
                PathKey::Field(field) => write!(f, "/{}", field)?,
            }
        }
        Ok(())
    }
}

/// A coded warning or error notice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub code: u64,
    pub message: String,
}

impl Notice {
    pub fn new(code: u64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unknown_base() -> Self {
        Self::new(WARN_UNKNOWN_BASE, "Unknown base")
    }

    pub fn unsupported_version() -> Self {
        Self::new(ERR_UNSUPPORTED_VERSION, "Unsupported protocol version")
    }
}

/// A decoded protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Handshake request from a peer that never synced.
    Please { version: u64 },
    /// Full snapshot: the canon value, its base and the assigned peer id.
    State {
        value: String,
        base: Base,
        peer_id: OriginId,
    },
    /// One transaction, submitted by a peer or broadcast once canonical.
    Delta {
        path: Path,
        deltas: Vec<AtomicOperation>,
    },
    Signal {
        peer_id: OriginId,
        data: Option<SignalData>,
    },
    Warning(Vec<Notice>),
    Error(Vec<Notice>),
    /// Incremental catch-up request from a peer that synced before.
    Since { peer_id: OriginId, base: Base },
    /// Canon committed after the base a `Since` asked for.
    DeltaSince {
        path: Path,
        deltas: Vec<AtomicOperation>,
    },
}

impl Message {
    pub fn tag(&self) -> u64 {
        match self {
            Message::Please { .. } => tag::PLEASE,
            Message::State { .. } => tag::STATE,
            Message::Delta { .. } => tag::DELTA,
            Message::Signal { .. } => tag::SIGNAL,
            Message::Warning(_) => tag::WARNING,
            Message::Error(_) => tag::ERROR,
            Message::Since { .. } => tag::SINCE,
            Message::DeltaSince { .. } => tag::DELTA_SINCE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Please { .. } => "PLEASE",
            Message::State { .. } => "STATE",
            Message::Delta { .. } => "DELTA",
            Message::Signal { .. } => "SIGNAL",
            Message::Warning(_) => "WARNING",
            Message::Error(_) => "ERROR",
            Message::Since { .. } => "SINCE",
            Message::DeltaSince { .. } => "DELTA_SINCE",
        }
    }

    pub fn to_json(&self) -> Value {
        let kind = self.tag();
        match self {
            Message::Please { version } => json!([kind, version]),
            Message::State {
                value,
                base,
                peer_id,
            } => json!([kind, value, base, peer_id]),
            Message::Delta { path, deltas } | Message::DeltaSince { path, deltas } => {
                let deltas: Vec<Value> = deltas.iter().map(delta_to_json).collect();
                json!([kind, path.to_json(), deltas])
            }
            Message::Signal { peer_id, data } => match data {
                Some(data) => json!([kind, peer_id, data]),
                None => json!([kind, peer_id]),
            },
            Message::Warning(notices) | Message::Error(notices) => {
                let notices: Vec<Value> = notices
                    .iter()
                    .map(|n| json!([n.code, n.message]))
                    .collect();
                json!([kind, notices])
            }
            Message::Since { peer_id, base } => json!([kind, peer_id, base]),
        }
    }

    pub fn encode(&self) -> String {
        self.to_json().to_string()
    }

    /// Parse and validate a message.
    pub fn decode(text: &str) -> Result<Message, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        Message::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Message, ProtocolError> {
        let items = value.as_array().ok_or(ProtocolError::NotAnArray)?;
        let kind = match items.first() {
            Some(first) => first
                .as_u64()
                .ok_or_else(|| ProtocolError::UnknownType(first.to_string()))?,
            None => return Err(ProtocolError::UnknownType("none".into())),
        };

        match kind {
            tag::PLEASE => Ok(Message::Please {
                version: number_at(items, 1, "version")?,
            }),
            tag::STATE => {
                let value = items
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid("non-string state"))?;
                Ok(Message::State {
                    value: value.to_string(),
                    base: number_at(items, 2, "base")?,
                    peer_id: number_at(items, 3, "machine")?,
                })
            }
            tag::DELTA | tag::DELTA_SINCE => {
                let path = path_at(items, 1)?;
                let deltas = items
                    .get(2)
                    .and_then(Value::as_array)
                    .ok_or_else(|| invalid("deltas are not an array"))?
                    .iter()
                    .enumerate()
                    .map(|(index, delta)| delta_from_json(index, delta))
                    .collect::<Result<Vec<_>, _>>()?;
                if kind == tag::DELTA {
                    Ok(Message::Delta { path, deltas })
                } else {
                    Ok(Message::DeltaSince { path, deltas })
                }
            }
            tag::SIGNAL => {
                let peer_id = number_at(items, 1, "machine")?;
                let data = match items.get(2) {
                    None | Some(Value::Null) => None,
                    Some(Value::Object(data)) => Some(data.clone()),
                    Some(_) => return Err(invalid("non-object signal")),
                };
                Ok(Message::Signal { peer_id, data })
            }
            tag::WARNING => Ok(Message::Warning(notices_at(items, 1)?)),
            tag::ERROR => Ok(Message::Error(notices_at(items, 1)?)),
            tag::SINCE => {
                let peer_id = number_at(items, 1, "machine")?;
                if peer_id == 0 {
                    return Err(invalid("catch-up without a machine id"));
                }
                Ok(Message::Since {
                    peer_id,
                    base: number_at(items, 2, "base")?,
                })
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

fn invalid(detail: impl Into<String>) -> ProtocolError {
    ProtocolError::Invalid(detail.into())
}

fn number_at(items: &[Value], index: usize, what: &str) -> Result<u64, ProtocolError> {
    items
        .get(index)
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid(format!("non-number {}", what)))
}

fn path_at(items: &[Value], index: usize) -> Result<Path, ProtocolError> {
    let keys = items
        .get(index)
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("delta path is not an array"))?;
    keys.iter()
        .map(|key| match key {
            Value::String(field) => Ok(PathKey::Field(field.clone())),
            other => other
                .as_u64()
                .map(PathKey::Index)
                .ok_or_else(|| invalid(format!("invalid path key {}", other))),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Path)
}

fn notices_at(items: &[Value], index: usize) -> Result<Vec<Notice>, ProtocolError> {
    let notices = items
        .get(index)
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("notices are not an array"))?;
    notices
        .iter()
        .map(|notice| {
            let code = notice
                .get(0)
                .and_then(Value::as_u64)
                .ok_or_else(|| invalid("non-number error code"))?;
            let message = notice
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("non-string error message"))?;
            Ok(Notice::new(code, message))
        })
        .collect()
}

fn delta_to_json(op: &AtomicOperation) -> Value {
    let mark = json!([op.mark.base, op.mark.origin, op.mark.sequence]);
    let action = match &op.action {
        Action::Pass => json!([op.action.tag(), 0, ""]),
        Action::Set { value, old } => json!([op.action.tag(), value, old]),
        Action::Insert { offset, text } | Action::Delete { offset, text } => {
            json!([op.action.tag(), offset, text])
        }
    };
    json!([mark, action])
}

fn delta_from_json(index: usize, delta: &Value) -> Result<AtomicOperation, ProtocolError> {
    let mark = delta
        .get(0)
        .and_then(Value::as_array)
        .ok_or_else(|| invalid(format!("delta {} has non-array mark", index)))?;
    let mark = mark
        .iter()
        .enumerate()
        .map(|(position, n)| {
            n.as_u64().ok_or_else(|| {
                invalid(format!(
                    "delta {} has a non-number in mark at position {}",
                    index, position
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let mark = match mark.as_slice() {
        [base, origin, sequence] => Mark::new(*base, *origin, *sequence),
        _ => {
            return Err(invalid(format!(
                "delta {} has a mark of length {}",
                index,
                mark.len()
            )))
        }
    };

    let op = delta
        .get(1)
        .and_then(Value::as_array)
        .ok_or_else(|| invalid(format!("delta {} has non-array operation", index)))?;

    let action = match op.first().and_then(Value::as_u64) {
        Some(0) => Action::Pass,
        Some(1) => {
            let value = op
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| invalid(format!("delta {} has non-string value", index)))?;
            let old = match op.get(2) {
                None | Some(Value::Null) => None,
                Some(Value::String(old)) => Some(old.clone()),
                Some(_) => {
                    return Err(invalid(format!(
                        "delta {} has non-string old value",
                        index
                    )))
                }
            };
            Action::Set {
                value: value.to_string(),
                old,
            }
        }
        Some(action @ (8 | 9)) => {
            let offset = op
                .get(1)
                .and_then(Value::as_u64)
                .and_then(|offset| usize::try_from(offset).ok())
                .ok_or_else(|| {
                    invalid(format!("delta {} has non-number string offset", index))
                })?;
            let text = op
                .get(2)
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    invalid(format!("delta {} has non-string string edition", index))
                })?
                .to_string();
            if offset.checked_add(char_len(&text)).is_none() {
                return Err(invalid(format!("delta {} has an out-of-range offset", index)));
            }
            if action == 8 {
                Action::Insert { offset, text }
            } else {
                Action::Delete { offset, text }
            }
        }
        _ => {
            return Err(invalid(format!(
                "delta {} has an unsupported operation type",
                index
            )))
        }
    };

    Ok(AtomicOperation::new(mark, action))
}
