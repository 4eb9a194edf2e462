use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{ConversationId, MessageId, ReactionId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: ReactionId,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRef {
    pub id: ReactionId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
}

/// Server -> client push envelope, `{"type": .., "payload": ..}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEnvelope {
    ConnectionAck,
    MessageCreated(MessagePayload),
    MessageUpdated(MessagePayload),
    MessageDeleted(MessageRef),
    ReactionCreated(Reaction),
    ReactionDeleted(ReactionRef),
    TypingStarted(TypingPayload),
    TypingStopped(TypingPayload),
    Ping,
    Pong,
}

impl ServerEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionAck => "connection.ack",
            Self::MessageCreated(_) => "message.created",
            Self::MessageUpdated(_) => "message.updated",
            Self::MessageDeleted(_) => "message.deleted",
            Self::ReactionCreated(_) => "reaction.created",
            Self::ReactionDeleted(_) => "reaction.deleted",
            Self::TypingStarted(_) => "typing.started",
            Self::TypingStopped(_) => "typing.stopped",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Decodes one text frame. Unknown envelope types yield `Ok(None)` so newer
    /// servers can add kinds without breaking older clients.
    pub fn decode(text: &str) -> Result<Option<Self>, EnvelopeError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        let payload = raw.payload;
        let envelope = match raw.kind.as_str() {
            "connection.ack" => Self::ConnectionAck,
            "message.created" => Self::MessageCreated(serde_json::from_value(payload)?),
            "message.updated" => Self::MessageUpdated(serde_json::from_value(payload)?),
            "message.deleted" => Self::MessageDeleted(serde_json::from_value(payload)?),
            "reaction.created" => Self::ReactionCreated(serde_json::from_value(payload)?),
            "reaction.deleted" => Self::ReactionDeleted(serde_json::from_value(payload)?),
            "typing.started" => Self::TypingStarted(serde_json::from_value(payload)?),
            "typing.stopped" => Self::TypingStopped(serde_json::from_value(payload)?),
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            _ => return Ok(None),
        };
        Ok(Some(envelope))
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        let payload = match self {
            Self::ConnectionAck | Self::Ping | Self::Pong => Value::Null,
            Self::MessageCreated(message) | Self::MessageUpdated(message) => {
                serde_json::to_value(message)?
            }
            Self::MessageDeleted(message_ref) => serde_json::to_value(message_ref)?,
            Self::ReactionCreated(reaction) => serde_json::to_value(reaction)?,
            Self::ReactionDeleted(reaction_ref) => serde_json::to_value(reaction_ref)?,
            Self::TypingStarted(typing) | Self::TypingStopped(typing) => {
                serde_json::to_value(typing)?
            }
        };
        Ok(serde_json::to_string(&RawEnvelope {
            kind: self.kind().to_string(),
            payload,
        })?)
    }
}

/// Client -> server control frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "typing.start")]
    TypingStart,
    #[serde(rename = "typing.stop")]
    TypingStop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub results: Vec<MessagePayload>,
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantPayload {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPayload {
    pub id: ConversationId,
    pub participants: Vec<ParticipantPayload>,
    #[serde(default)]
    pub is_archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReactionRequest {
    pub symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub last_read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRequest {
    pub is_archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub url: String,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
