//! Telegram channel: webhook or long-poll getUpdates, sendMessage replies, file download via getFile.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channels::inbound::{EventPayload, InboundEvent, MessageKind, NormalizeError, ReplyHandle};
use crate::channels::registry::{truncate_chars, ChannelError, ChannelHandle};
use crate::llm::Attachment;

pub const CHANNEL_ID: &str = "telegram";
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;
const MAX_TEXT_CHARS: usize = 4096;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram update payload (getUpdates result item or webhook POST body).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub date: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<TelegramPhotoSize>>,
    #[serde(default)]
    pub voice: Option<TelegramFileRef>,
    #[serde(default)]
    pub audio: Option<TelegramFileRef>,
    #[serde(default)]
    pub video: Option<TelegramFileRef>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramPhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Deserialize)]
pub struct TelegramFileRef {
    pub file_id: String,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    file_path: Option<String>,
}

/// Turn an update into an [`InboundEvent`]. The reply handle is the chat id.
pub fn normalize_update(update: TelegramUpdate) -> Result<InboundEvent, NormalizeError> {
    let msg = update
        .message
        .ok_or_else(|| NormalizeError::UnsupportedMessageKind("non-message update".to_string()))?;
    let (kind, payload) = if let Some(text) = msg.text {
        (MessageKind::Text, EventPayload::Text(text))
    } else if let Some(photo) = msg.photo.as_ref().and_then(|p| {
        p.iter()
            .max_by_key(|s| u64::from(s.width) * u64::from(s.height))
    }) {
        (MessageKind::Image, EventPayload::Content(photo.file_id.clone()))
    } else if let Some(f) = msg.voice.or(msg.audio) {
        (MessageKind::Audio, EventPayload::Content(f.file_id))
    } else if let Some(f) = msg.video {
        (MessageKind::Video, EventPayload::Content(f.file_id))
    } else {
        return Err(NormalizeError::UnsupportedMessageKind("other".to_string()));
    };
    let chat_id = msg.chat.id.to_string();
    let sender_id = msg
        .from
        .map(|u| u.id.to_string())
        .unwrap_or_else(|| chat_id.clone());
    let received_at = msg
        .date
        .and_then(|d| DateTime::<Utc>::from_timestamp(d, 0))
        .unwrap_or_else(Utc::now);
    Ok(InboundEvent::new(
        CHANNEL_ID,
        kind,
        sender_id,
        payload,
        chat_id,
        received_at,
    ))
}

/// MIME type for a downloaded file, guessed from its path.
fn mime_from_path(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
}

/// Telegram channel connector: long-polls for updates (when no webhook is set) and replies via sendMessage.
pub struct TelegramChannel {
    token: String,
    api_base: String,
    running: AtomicBool,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            token: token.into(),
            api_base: TELEGRAM_API_BASE.to_string(),
            running: AtomicBool::new(false),
            client,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.api_base = base_url.trim_end_matches('/').to_string();
        self
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<Option<T>, ChannelError> {
        self.call_with_timeout(method, body, None).await
    }

    /// `timeout` replaces the client-wide timeout for this request only.
    async fn call_with_timeout<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        body: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<Option<T>, ChannelError> {
        let mut req = self.client.post(self.method_url(method)).json(&body);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        let res = req.send().await?;
        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        let data: ApiResponse<T> = serde_json::from_str(&text)
            .map_err(|_| ChannelError::Api(format!("{} failed: {} {}", method, status, text)))?;
        if !status.is_success() || !data.ok {
            return Err(ChannelError::Api(format!(
                "{} failed: {} {}",
                method,
                status,
                data.description.unwrap_or_default()
            )));
        }
        Ok(data.result)
    }

    /// Start the getUpdates long-poll loop and forward events to the gateway. Returns a handle to await on shutdown.
    pub fn start_inbound(self: Arc<Self>, inbound_tx: mpsc::Sender<InboundEvent>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("telegram channel: starting getUpdates long-poll loop");
        tokio::spawn(async move {
            run_get_updates_loop(self, inbound_tx).await;
        })
    }

    /// Call Telegram getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(
        &self,
        offset: Option<i64>,
    ) -> Result<(Vec<TelegramUpdate>, Option<i64>), ChannelError> {
        let mut body = serde_json::json!({ "timeout": LONG_POLL_TIMEOUT });
        if let Some(off) = offset {
            body["offset"] = serde_json::Value::from(off);
        }
        // The request blocks server-side for LONG_POLL_TIMEOUT; leave headroom above it.
        let timeout = Duration::from_secs(LONG_POLL_TIMEOUT + 10);
        let updates: Vec<TelegramUpdate> = self
            .call_with_timeout("getUpdates", body, Some(timeout))
            .await?
            .unwrap_or_default();
        let next_offset = updates.iter().map(|u| u.update_id).max().map(|id| id + 1);
        Ok((updates, next_offset))
    }

    /// Set webhook URL (and optional secret). When set, Telegram POSTs updates to the URL instead of getUpdates.
    pub async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), ChannelError> {
        let mut body = serde_json::json!({ "url": url });
        if let Some(s) = secret {
            body["secret_token"] = serde_json::Value::String(s.to_string());
        }
        self.call::<serde_json::Value>("setWebhook", body).await?;
        Ok(())
    }

    /// Remove webhook so the bot can use getUpdates again.
    pub async fn delete_webhook(&self) -> Result<(), ChannelError> {
        self.call::<serde_json::Value>("deleteWebhook", serde_json::json!({}))
            .await?;
        Ok(())
    }

    /// Send a text message to a chat via sendMessage API.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": truncate_chars(text, MAX_TEXT_CHARS),
        });
        self.call::<serde_json::Value>("sendMessage", body).await?;
        Ok(())
    }

    /// getFile, then download the file bytes.
    pub async fn download_file(&self, file_id: &str) -> Result<Attachment, ChannelError> {
        let file: TelegramFile = self
            .call("getFile", serde_json::json!({ "file_id": file_id }))
            .await?
            .ok_or_else(|| ChannelError::Api("getFile returned no result".to_string()))?;
        let path = file
            .file_path
            .ok_or_else(|| ChannelError::Api("getFile returned no file_path".to_string()))?;
        let url = format!("{}/file/bot{}/{}", self.api_base, self.token, path);
        let res = self.client.get(&url).send().await?;
        if !res.status().is_success() {
            return Err(ChannelError::Api(format!("file download failed: {}", res.status())));
        }
        let data = res.bytes().await?.to_vec();
        Ok(Attachment {
            mime_type: mime_from_path(&path).to_string(),
            data,
        })
    }
}

async fn run_get_updates_loop(channel: Arc<TelegramChannel>, inbound_tx: mpsc::Sender<InboundEvent>) {
    let mut offset: Option<i64> = None;
    while channel.running() {
        match channel.get_updates(offset).await {
            Ok((updates, next)) => {
                offset = next.or(offset);
                for u in updates {
                    let event = match normalize_update(u) {
                        Ok(e) => e,
                        Err(e) => {
                            log::debug!("telegram: skipping update: {}", e);
                            continue;
                        }
                    };
                    if inbound_tx.send(event).await.is_err() {
                        log::debug!("telegram: inbound channel closed, stopping loop");
                        return;
                    }
                }
            }
            Err(e) => {
                log::debug!("telegram getUpdates error: {}", e);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
    log::info!("telegram channel: getUpdates loop stopped");
}

#[async_trait]
impl ChannelHandle for TelegramChannel {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn reply(&self, handle: ReplyHandle, text: &str) -> Result<(), ChannelError> {
        self.send_message(handle.token(), text).await
    }

    async fn fetch_content(&self, content_id: &str) -> Result<Attachment, ChannelError> {
        self.download_file(content_id).await
    }
}
