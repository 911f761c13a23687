//! Control protocol: messages carried on introduction links, and their codec

use crate::link::Frame;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Opaque peer identifier
pub type PeerId = String;

/// Opaque topic identifier
pub type TopicId = String;

/// Maximum control frame accepted on decode: 64 KB. Senders split topic
/// lists with [`ControlMessage::split_to_fit`] to stay under it.
pub const MAX_CONTROL_FRAME: usize = 64 * 1024;

/// A control message exchanged between a client session and the relay.
///
/// On the wire (JSON codec) the variant name is carried in a `type` field:
/// `{"type":"Introduction","peerId":"bob","topics":["doc-1"]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Client → server: add topics to the sender's interest set
    Join { topics: Vec<TopicId> },
    /// Client → server: remove topics from the sender's interest set
    Leave { topics: Vec<TopicId> },
    /// Client → server: keep-alive, never answered
    Heartbeat,
    /// Server → client: another peer shares these topics
    Introduction {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        topics: Vec<TopicId>,
    },
}

impl ControlMessage {
    /// Every `type` tag the protocol knows about
    pub const KNOWN_TYPES: [&'static str; 4] = ["Join", "Leave", "Heartbeat", "Introduction"];

    pub fn message_type(&self) -> &'static str {
        match self {
            ControlMessage::Join { .. } => "Join",
            ControlMessage::Leave { .. } => "Leave",
            ControlMessage::Heartbeat => "Heartbeat",
            ControlMessage::Introduction { .. } => "Introduction",
        }
    }

    /// Split a topic-carrying message into messages whose JSON encoding is at
    /// most `limit` bytes each, keeping topic order. A single topic too long
    /// to fit on its own still travels alone.
    pub fn split_to_fit(self, limit: usize) -> Vec<ControlMessage> {
        let topics = match &self {
            ControlMessage::Join { topics }
            | ControlMessage::Leave { topics }
            | ControlMessage::Introduction { topics, .. } => topics.clone(),
            ControlMessage::Heartbeat => return vec![self],
        };
        if encoded_len(&self) <= limit {
            return vec![self];
        }

        let base = encoded_len(&self.with_topics(Vec::new()));
        let mut chunks = Vec::new();
        let mut current = Vec::new();
        let mut size = base;
        for topic in topics {
            // Quoted, escaped topic plus its separating comma
            let cost = encoded_len(&topic) + 1;
            if !current.is_empty() && size + cost > limit {
                chunks.push(self.with_topics(std::mem::take(&mut current)));
                size = base;
            }
            size += cost;
            current.push(topic);
        }
        chunks.push(self.with_topics(current));
        chunks
    }

    fn with_topics(&self, topics: Vec<TopicId>) -> ControlMessage {
        match self {
            ControlMessage::Join { .. } => ControlMessage::Join { topics },
            ControlMessage::Leave { .. } => ControlMessage::Leave { topics },
            ControlMessage::Introduction { peer_id, .. } => ControlMessage::Introduction {
                peer_id: peer_id.clone(),
                topics,
            },
            ControlMessage::Heartbeat => ControlMessage::Heartbeat,
        }
    }
}

fn encoded_len<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_string(value).map_or(0, |text| text.len())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Encoding error: {0}")]
    Encode(String),
    #[error("Malformed control message: {0}")]
    Malformed(String),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Control frame too large: {0} bytes")]
    TooLarge(usize),
}

/// Encodes control messages into frames and back.
pub trait Codec: Send + Sync {
    fn encode(&self, message: &ControlMessage) -> Result<Frame, ProtocolError>;
    fn decode(&self, frame: &Frame) -> Result<ControlMessage, ProtocolError>;
}

/// JSON text frames. The default codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, message: &ControlMessage) -> Result<Frame, ProtocolError> {
        let text =
            serde_json::to_string(message).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Frame::Text(text))
    }

    fn decode(&self, frame: &Frame) -> Result<ControlMessage, ProtocolError> {
        let bytes = frame.as_bytes();
        if bytes.len() > MAX_CONTROL_FRAME {
            return Err(ProtocolError::TooLarge(bytes.len()));
        }

        // Check the tag first so protocol skew is distinguishable from garbage
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing \"type\" tag".to_string()))?;
        if !ControlMessage::KNOWN_TYPES.contains(&tag) {
            return Err(ProtocolError::UnknownType(tag.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
