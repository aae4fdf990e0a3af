use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One inbound conversational event as handed over by the transport,
/// before deduplication. Delivery is at-least-once; `platform_id` plus
/// `revision` is the only identity the transport guarantees.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Platform-stable identifier for the underlying message.
    pub platform_id: String,
    /// Platform identifier of the chat this event belongs to.
    pub chat_ref: String,
    /// Platform identifier of the sending user.
    pub sender_ref: String,
    /// Revision marker: 0 for the original delivery, bumped by the
    /// transport when the message is edited.
    pub revision: u32,
    pub payload: EventPayload,
    pub occurred_at: DateTime<Utc>,
}

impl RawEvent {
    pub fn message(
        platform_id: impl Into<String>,
        chat_ref: impl Into<String>,
        sender_ref: impl Into<String>,
        text: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            platform_id: platform_id.into(),
            chat_ref: chat_ref.into(),
            sender_ref: sender_ref.into(),
            revision: 0,
            payload: EventPayload::Message { text: text.into() },
            occurred_at,
        }
    }

    /// Conversational text carried by this event, if any. Commands carry
    /// no turn text and are never appended to the context window.
    pub fn turn_text(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Message { text } | EventPayload::Edit { text } => Some(text),
            EventPayload::Command { .. } => None,
        }
    }
}

/// Decoded event body. The closed set of shapes the engine understands;
/// anything else is rejected at ingestion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A new user message.
    Message { text: String },
    /// An edit of a previously delivered message.
    Edit { text: String },
    /// A bot command, e.g. "end". Handled out of band by the transport
    /// layer; recorded for dedup and session activity only.
    Command { name: String },
}
