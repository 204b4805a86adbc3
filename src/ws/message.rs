//! Wire envelope shared by every realtime feature, and its typed [`Event`] view.

use bon::Builder;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};

use super::error::WsError;
use crate::Result;

/// Closed set of `type` tags understood by this crate.
#[non_exhaustive]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageKind {
    Message,
    Typing,
    Status,
    Notification,
    Heartbeat,
    MessageDeleted,
    /// Any tag this crate does not know about. Logged and dropped by the dispatcher.
    #[serde(other)]
    Unknown,
}

/// JSON text frame exchanged with the realtime server.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct WebSocketMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default = "empty_object")]
    #[builder(default = empty_object())]
    pub data: Value,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    pub deletion_type: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Accepts RFC 3339 as well as offset-less ISO-8601 (read as UTC). Anything else
/// becomes `None` rather than failing the whole frame.
fn lenient_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
    let Some(Value::String(raw)) = Option::<Value>::deserialize(deserializer)? else {
        return Ok(None);
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }

    Ok(NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc()))
}

impl WebSocketMessage {
    /// Outbound chat message for `conversation_id`.
    #[must_use]
    pub fn chat(conversation_id: i64, text: &str, attachments: Vec<Value>) -> Self {
        Self::builder()
            .kind(MessageKind::Message)
            .conversation_id(conversation_id)
            .data(json!({ "content": text, "attachments": attachments }))
            .build()
    }

    /// Outbound typing indicator for `conversation_id`.
    #[must_use]
    pub fn typing(conversation_id: i64, is_typing: bool) -> Self {
        Self::builder()
            .kind(MessageKind::Typing)
            .conversation_id(conversation_id)
            .data(json!({ "is_typing": is_typing }))
            .build()
    }

    #[must_use]
    pub fn heartbeat() -> Self {
        Self::builder()
            .kind(MessageKind::Heartbeat)
            .timestamp(Utc::now())
            .build()
    }

    #[must_use]
    pub const fn is_heartbeat(&self) -> bool {
        matches!(self.kind, MessageKind::Heartbeat)
    }

    /// Decode `data` according to `kind`.
    pub fn event(&self) -> Result<Event> {
        let event = match self.kind {
            MessageKind::Message => Event::Chat(self.chat_payload()?),
            MessageKind::Typing => Event::Typing(self.typing_payload()?),
            MessageKind::Status => Event::Status(self.status_payload()?),
            MessageKind::Notification => Event::Notification(self.data.clone()),
            MessageKind::MessageDeleted => Event::MessageDeleted(self.deletion()?),
            MessageKind::Heartbeat => Event::Heartbeat,
            MessageKind::Unknown => Event::Unknown,
        };
        Ok(event)
    }

    fn chat_payload(&self) -> Result<ChatPayload> {
        let mut payload: ChatPayload =
            serde_json::from_value(self.data.clone()).map_err(WsError::MessageParse)?;
        payload.id = payload.id.or(self.message_id);
        payload.conversation_id = payload.conversation_id.or(self.conversation_id);
        payload.sender_id = payload.sender_id.or(self.sender_id);
        Ok(payload)
    }

    fn typing_payload(&self) -> Result<TypingPayload> {
        #[derive(Deserialize)]
        struct Raw {
            user_id: Option<i64>,
            #[serde(default)]
            user_name: Option<String>,
            #[serde(default)]
            is_typing: bool,
        }

        let raw: Raw = serde_json::from_value(self.data.clone()).map_err(WsError::MessageParse)?;
        let user_id = raw
            .user_id
            .or(self.sender_id)
            .ok_or_else(|| WsError::InvalidMessage("typing event without user_id".to_owned()))?;

        Ok(TypingPayload {
            user_id,
            user_name: raw.user_name.unwrap_or_default(),
            is_typing: raw.is_typing,
            conversation_id: self.conversation_id,
        })
    }

    fn status_payload(&self) -> Result<StatusPayload> {
        #[derive(Deserialize)]
        struct Raw {
            user_id: Option<i64>,
            #[serde(default)]
            is_online: bool,
        }

        let raw: Raw = serde_json::from_value(self.data.clone()).map_err(WsError::MessageParse)?;
        let user_id = raw
            .user_id
            .or(self.sender_id)
            .ok_or_else(|| WsError::InvalidMessage("status event without user_id".to_owned()))?;

        Ok(StatusPayload {
            user_id,
            is_online: raw.is_online,
        })
    }

    fn deletion(&self) -> Result<MessageDeleted> {
        let from_data = |key: &str| self.data.get(key);

        let message_id = self
            .message_id
            .or_else(|| from_data("message_id").and_then(Value::as_i64))
            .ok_or_else(|| {
                WsError::InvalidMessage("message_deleted event without message_id".to_owned())
            })?;
        let conversation_id = self
            .conversation_id
            .or_else(|| from_data("conversation_id").and_then(Value::as_i64));
        let deletion_type = self
            .deletion_type
            .clone()
            .or_else(|| {
                from_data("deletion_type")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| DEFAULT_DELETION_TYPE.to_owned());

        Ok(MessageDeleted {
            message_id,
            conversation_id,
            deletion_type,
        })
    }
}

/// Used when a `message_deleted` frame does not say how the message was deleted.
pub const DEFAULT_DELETION_TYPE: &str = "deleted";

/// Parse one inbound text frame.
pub fn parse_frame(text: &str) -> Result<WebSocketMessage> {
    Ok(serde_json::from_str(text).map_err(WsError::MessageParse)?)
}

/// Typed view of a [`WebSocketMessage`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Chat(ChatPayload),
    Typing(TypingPayload),
    Status(StatusPayload),
    Notification(Value),
    MessageDeleted(MessageDeleted),
    Heartbeat,
    Unknown,
}

/// A chat message as delivered by the server.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub conversation_id: Option<i64>,
    #[serde(default)]
    pub sender_id: Option<i64>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Value>,
    /// Set when the message has been soft-deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_type: Option<String>,
    /// Fields this crate does not interpret, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingPayload {
    pub user_id: i64,
    pub user_name: String,
    pub is_typing: bool,
    pub conversation_id: Option<i64>,
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPayload {
    pub user_id: i64,
    pub is_online: bool,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDeleted {
    pub message_id: i64,
    pub conversation_id: Option<i64>,
    pub deletion_type: String,
}
