//! LINE Messaging API channel: webhook signature check, event parsing, reply and content download.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;

use crate::channels::inbound::{EventPayload, InboundEvent, MessageKind, NormalizeError, ReplyHandle};
use crate::channels::registry::{truncate_chars, ChannelError, ChannelHandle};
use crate::llm::Attachment;

pub const CHANNEL_ID: &str = "line";
pub const SIGNATURE_HEADER: &str = "x-line-signature";

const LINE_API_BASE: &str = "https://api.line.me";
const LINE_DATA_API_BASE: &str = "https://api-data.line.me";
const MAX_TEXT_CHARS: usize = 5000;

type HmacSha256 = Hmac<Sha256>;

/// Base64 HMAC-SHA256 of the raw body keyed by the channel secret.
pub fn sign(channel_secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(channel_secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Constant-time check of the X-Line-Signature header against the raw body.
pub fn verify_signature(channel_secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(channel_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Deserialize)]
struct WebhookBody {
    #[serde(default)]
    events: Vec<LineEvent>,
}

/// One entry of the webhook `events` array.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub reply_token: Option<String>,
    #[serde(default)]
    pub source: Option<LineSource>,
    #[serde(default)]
    pub message: Option<LineMessage>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineSource {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LineMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Parse the webhook body into raw events.
pub fn parse_events(body: &[u8]) -> Result<Vec<LineEvent>, NormalizeError> {
    let data: WebhookBody =
        serde_json::from_slice(body).map_err(|e| NormalizeError::Malformed(e.to_string()))?;
    Ok(data.events)
}

/// Turn one LINE event into an [`InboundEvent`]. Non-message events and message types other
/// than text/image/audio/video are `UnsupportedMessageKind`.
pub fn normalize_event(event: LineEvent) -> Result<InboundEvent, NormalizeError> {
    if event.event_type != "message" {
        return Err(NormalizeError::UnsupportedMessageKind(event.event_type));
    }
    let message = event
        .message
        .ok_or_else(|| NormalizeError::Malformed("message event without message".to_string()))?;
    let reply_token = event
        .reply_token
        .ok_or_else(|| NormalizeError::Malformed("message event without replyToken".to_string()))?;
    let (kind, payload) = match message.msg_type.as_str() {
        "text" => (
            MessageKind::Text,
            EventPayload::Text(message.text.unwrap_or_default()),
        ),
        "image" => (MessageKind::Image, EventPayload::Content(message.id)),
        "audio" => (MessageKind::Audio, EventPayload::Content(message.id)),
        "video" => (MessageKind::Video, EventPayload::Content(message.id)),
        other => return Err(NormalizeError::UnsupportedMessageKind(other.to_string())),
    };
    let sender_id = event
        .source
        .and_then(|s| s.user_id.or(s.group_id).or(s.room_id))
        .unwrap_or_else(|| "unknown".to_string());
    let received_at = event
        .timestamp
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    Ok(InboundEvent::new(
        CHANNEL_ID,
        kind,
        sender_id,
        payload,
        reply_token,
        received_at,
    ))
}

/// Parse and normalize, skipping events without a supported kind.
pub fn normalize(body: &[u8]) -> Result<Vec<InboundEvent>, NormalizeError> {
    let mut out = Vec::new();
    for event in parse_events(body)? {
        match normalize_event(event) {
            Ok(e) => out.push(e),
            Err(NormalizeError::UnsupportedMessageKind(kind)) => {
                log::debug!("line: ignoring unsupported event/message kind {}", kind);
            }
            Err(e) => log::warn!("line: dropping event: {}", e),
        }
    }
    Ok(out)
}

/// LINE channel connector: reply API and message content download.
pub struct LineChannel {
    access_token: String,
    api_base: String,
    data_api_base: String,
    client: reqwest::Client,
}

impl LineChannel {
    pub fn new(access_token: impl Into<String>, timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            access_token: access_token.into(),
            api_base: LINE_API_BASE.to_string(),
            data_api_base: LINE_DATA_API_BASE.to_string(),
            client,
        })
    }

    /// Point both API hosts at another base URL (for tests or proxies).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/').to_string();
        self.api_base = base.clone();
        self.data_api_base = base;
        self
    }

    /// POST /v2/bot/message/reply with a single text message.
    pub async fn reply_text(&self, reply_token: &str, text: &str) -> Result<(), ChannelError> {
        let url = format!("{}/v2/bot/message/reply", self.api_base);
        let body = serde_json::json!({
            "replyToken": reply_token,
            "messages": [{ "type": "text", "text": truncate_chars(text, MAX_TEXT_CHARS) }],
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        if res.status().is_success() {
            return Ok(());
        }
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::BAD_REQUEST
            && body.to_ascii_lowercase().contains("reply token")
        {
            return Err(ChannelError::ReplyHandleExpired);
        }
        Err(ChannelError::Api(format!("reply failed: {} {}", status, body)))
    }

    /// GET /v2/bot/message/{id}/content on the data API host.
    pub async fn message_content(&self, message_id: &str) -> Result<Attachment, ChannelError> {
        let url = format!("{}/v2/bot/message/{}/content", self.data_api_base, message_id);
        let res = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ChannelError::Api(format!("content fetch failed: {} {}", status, body)));
        }
        let mime_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let data = res.bytes().await?.to_vec();
        Ok(Attachment { mime_type, data })
    }
}

#[async_trait]
impl ChannelHandle for LineChannel {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    async fn reply(&self, handle: ReplyHandle, text: &str) -> Result<(), ChannelError> {
        self.reply_text(handle.token(), text).await
    }

    async fn fetch_content(&self, content_id: &str) -> Result<Attachment, ChannelError> {
        self.message_content(content_id).await
    }
}
