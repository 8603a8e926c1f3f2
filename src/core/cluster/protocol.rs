// src/core/cluster/protocol.rs

//! The peer wire protocol: length-prefixed JSON framing and the message
//! schema.
//!
//! A frame is a 64-bit little-endian byte count followed by that many bytes
//! of UTF-8 JSON. A message is `{"jsonrpc":"2.0","method":…,"params":…,
//! "ts":…}` with dotted method names. Frames above the configured maximum
//! drop the link.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::core::VigilError;
use crate::core::checkresult::{CheckResult, CheckState, StateType};
use crate::core::events::Event;
use crate::core::now_ts;
use crate::core::objects::checkable::AckType;
use crate::core::objects::key::{ObjectKey, ObjectKind};
use crate::core::objects::runtime_objects::{Comment, Downtime};

pub mod methods {
    pub const CHECK_RESULT: &str = "event::CheckResult";
    pub const STATE_CHANGE: &str = "event::StateChange";
    pub const NEXT_CHECK_CHANGED: &str = "event::NextCheckChanged";
    pub const COMMENT_ADDED: &str = "event::CommentAdded";
    pub const COMMENT_REMOVED: &str = "event::CommentRemoved";
    pub const DOWNTIME_ADDED: &str = "event::DowntimeAdded";
    pub const DOWNTIME_REMOVED: &str = "event::DowntimeRemoved";
    pub const DOWNTIME_TRIGGERED: &str = "event::DowntimeTriggered";
    pub const ACK_SET: &str = "event::AcknowledgementSet";
    pub const ACK_CLEARED: &str = "event::AcknowledgementCleared";
    pub const CONFIG_UPDATE: &str = "config::Update";
    pub const HELLO: &str = "cluster::Hello";
    pub const HEARTBEAT: &str = "cluster::Heartbeat";
    pub const LOG_REPLAY: &str = "log::Replay";
    pub const LOG_REPLAY_COMPLETE: &str = "log::ReplayComplete";
    pub const LOG_SHUTDOWN: &str = "log::Shutdown";
}

pub const JSONRPC_VERSION: &str = "2.0";

/// One wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
    pub ts: f64,
}

impl Message {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            ts: now_ts(),
        }
    }

    /// Whether this is a replicable `event::` / `config::` message that
    /// belongs in the replay journal.
    pub fn is_journaled(&self) -> bool {
        self.method.starts_with("event::") || self.method == methods::CONFIG_UPDATE
    }

    /// The `(source, sequence)` dedup pair, present on every journaled
    /// message.
    pub fn envelope(&self) -> Option<(String, u64)> {
        let source = self.params.get("source")?.as_str()?.to_string();
        let sequence = self.params.get("sequence")?.as_u64()?;
        Some((source, sequence))
    }

    /// The authority claimed by an event message.
    pub fn claimed_authority(&self) -> Option<&str> {
        self.params.get("authority").and_then(Value::as_str)
    }
}

/// Dedup and origin metadata carried by every journaled message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub source: String,
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResultParams {
    pub object: ObjectKey,
    pub cr: CheckResult,
    pub authority: String,
    #[serde(flatten)]
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeParams {
    pub object: ObjectKey,
    pub state: CheckState,
    pub state_type: StateType,
    pub authority: String,
    #[serde(flatten)]
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextCheckParams {
    pub object: ObjectKey,
    pub next_check: f64,
    pub authority: String,
    #[serde(flatten)]
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentParams {
    pub object: ObjectKey,
    pub comment: Comment,
    pub authority: String,
    #[serde(flatten)]
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DowntimeParams {
    pub object: ObjectKey,
    pub downtime: Downtime,
    pub authority: String,
    #[serde(flatten)]
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckSetParams {
    pub object: ObjectKey,
    pub author: String,
    pub text: String,
    pub expiry: f64,
    #[serde(rename = "type")]
    pub ack_type: AckType,
    pub authority: String,
    #[serde(flatten)]
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckClearedParams {
    pub object: ObjectKey,
    pub authority: String,
    #[serde(flatten)]
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigUpdateParams {
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub name: String,
    pub properties: Value,
    pub authority: String,
    #[serde(flatten)]
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    /// Must match the peer certificate's CN.
    pub identity: String,
    /// Peer names this node currently has live links to.
    pub known_endpoints: Vec<String>,
    /// Highest journal timestamp the sender has recorded.
    pub log_position: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatParams {
    pub identity: String,
    /// Highest journal timestamp the sender has recorded; acknowledges
    /// everything at or before it.
    pub log_position: f64,
}

/// A journal entry re-sent during the handshake window, wrapping the
/// original message unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayParams {
    pub message: Box<Message>,
}

/// Builds the wire message for a locally originated event. Events that are
/// rederived by each peer (flapping, notifications, attribute internals)
/// return `None` and stay local.
pub fn message_for_event(event: &Event, source: &str, sequence: u64) -> Option<Message> {
    let envelope = Envelope {
        source: source.to_string(),
        sequence,
    };
    let (method, params) = match event {
        Event::CheckResult {
            object,
            cr,
            authority,
        } => (
            methods::CHECK_RESULT,
            serde_json::to_value(CheckResultParams {
                object: object.clone(),
                cr: cr.clone(),
                authority: authority.clone(),
                envelope,
            }),
        ),
        Event::StateChange {
            object,
            state,
            state_type,
            authority,
        } => (
            methods::STATE_CHANGE,
            serde_json::to_value(StateChangeParams {
                object: object.clone(),
                state: *state,
                state_type: *state_type,
                authority: authority.clone(),
                envelope,
            }),
        ),
        Event::NextCheckChanged {
            object,
            next_check,
            authority,
        } => (
            methods::NEXT_CHECK_CHANGED,
            serde_json::to_value(NextCheckParams {
                object: object.clone(),
                next_check: *next_check,
                authority: authority.clone(),
                envelope,
            }),
        ),
        Event::CommentAdded {
            object,
            comment,
            authority,
        } => (
            methods::COMMENT_ADDED,
            serde_json::to_value(CommentParams {
                object: object.clone(),
                comment: comment.clone(),
                authority: authority.clone(),
                envelope,
            }),
        ),
        Event::CommentRemoved {
            object,
            comment,
            authority,
        } => (
            methods::COMMENT_REMOVED,
            serde_json::to_value(CommentParams {
                object: object.clone(),
                comment: comment.clone(),
                authority: authority.clone(),
                envelope,
            }),
        ),
        Event::DowntimeAdded {
            object,
            downtime,
            authority,
        } => (
            methods::DOWNTIME_ADDED,
            serde_json::to_value(DowntimeParams {
                object: object.clone(),
                downtime: downtime.clone(),
                authority: authority.clone(),
                envelope,
            }),
        ),
        Event::DowntimeRemoved {
            object,
            downtime,
            authority,
        } => (
            methods::DOWNTIME_REMOVED,
            serde_json::to_value(DowntimeParams {
                object: object.clone(),
                downtime: downtime.clone(),
                authority: authority.clone(),
                envelope,
            }),
        ),
        Event::DowntimeTriggered {
            object,
            downtime,
            authority,
        } => (
            methods::DOWNTIME_TRIGGERED,
            serde_json::to_value(DowntimeParams {
                object: object.clone(),
                downtime: downtime.clone(),
                authority: authority.clone(),
                envelope,
            }),
        ),
        Event::AcknowledgementSet {
            object,
            author,
            text,
            ack_type,
            expiry,
            authority,
        } => (
            methods::ACK_SET,
            serde_json::to_value(AckSetParams {
                object: object.clone(),
                author: author.clone(),
                text: text.clone(),
                expiry: *expiry,
                ack_type: *ack_type,
                authority: authority.clone(),
                envelope,
            }),
        ),
        Event::AcknowledgementCleared { object, authority } => (
            methods::ACK_CLEARED,
            serde_json::to_value(AckClearedParams {
                object: object.clone(),
                authority: authority.clone(),
                envelope,
            }),
        ),
        Event::ConfigUpdated {
            object,
            properties,
            authority,
        } => (
            methods::CONFIG_UPDATE,
            serde_json::to_value(ConfigUpdateParams {
                kind: object.kind,
                name: object.name.clone(),
                properties: properties.clone(),
                authority: authority.clone(),
                envelope,
            }),
        ),
        // Derived locally on every peer from the replicated CheckResults.
        Event::FlappingChanged { .. }
        | Event::NotificationSent { .. }
        | Event::AttributeChanged { .. } => return None,
    };
    params.ok().map(|params| Message::new(method, params))
}

/// Length-prefixed JSON codec for peer links.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_size: usize,
}

impl MessageCodec {
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }
}

const LENGTH_PREFIX: usize = 8;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = VigilError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, VigilError> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LENGTH_PREFIX];
        len_bytes.copy_from_slice(&src[..LENGTH_PREFIX]);
        let len = u64::from_le_bytes(len_bytes) as usize;
        if len > self.max_size {
            return Err(VigilError::ProtocolViolation(format!(
                "frame of {len} bytes exceeds the {} byte limit",
                self.max_size
            )));
        }
        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX);
        let body = src.split_to(len);
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| VigilError::ProtocolViolation(format!("malformed message: {e}")))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = VigilError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), VigilError> {
        let body = serde_json::to_vec(&message)?;
        if body.len() > self.max_size {
            return Err(VigilError::ProtocolViolation(format!(
                "refusing to send a {} byte frame above the {} byte limit",
                body.len(),
                self.max_size
            )));
        }
        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_u64_le(body.len() as u64);
        dst.put_slice(&body);
        Ok(())
    }
}
