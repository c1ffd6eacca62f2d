//! Inbound event from a channel: the normalized form every platform payload is turned into.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Message kinds the normalizer recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Audio => "audio",
            MessageKind::Video => "video",
        }
    }
}

/// Text content, or an identifier the channel can resolve to binary content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Text(String),
    Content(String),
}

/// One-time token for answering an event. Not `Clone`: emitting a reply consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct ReplyHandle {
    channel_id: String,
    token: String,
}

impl ReplyHandle {
    pub fn new(channel_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            token: token.into(),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// A message from a channel, routed once and answered once.
#[derive(Debug)]
pub struct InboundEvent {
    /// Correlates log lines for one event.
    pub id: Uuid,
    pub channel_id: String,
    pub kind: MessageKind,
    pub sender_id: String,
    pub payload: EventPayload,
    pub reply_handle: ReplyHandle,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(
        channel_id: impl Into<String>,
        kind: MessageKind,
        sender_id: impl Into<String>,
        payload: EventPayload,
        reply_token: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        let channel_id = channel_id.into();
        Self {
            id: Uuid::new_v4(),
            reply_handle: ReplyHandle::new(channel_id.clone(), reply_token),
            channel_id,
            kind,
            sender_id: sender_id.into(),
            payload,
            received_at,
        }
    }

    /// Text event received now; convenient for the CLI and tests.
    pub fn text(
        channel_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
        reply_token: impl Into<String>,
    ) -> Self {
        Self::new(
            channel_id,
            MessageKind::Text,
            sender_id,
            EventPayload::Text(text.into()),
            reply_token,
            Utc::now(),
        )
    }
}

/// Why a webhook payload produced no event.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("unsupported message kind: {0}")]
    UnsupportedMessageKind(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}
