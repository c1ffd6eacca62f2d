//! Channel registry: register and lookup channels by id.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::channels::inbound::ReplyHandle;
use crate::llm::Attachment;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The platform rejected the reply token (already used or past its validity window).
    #[error("reply handle expired or already used")]
    ReplyHandleExpired,
    #[error("channel request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("channel api error: {0}")]
    Api(String),
    #[error("{0} not supported by this channel")]
    Unsupported(&'static str),
}

/// Handle to a running channel (stop, reply, fetch content).
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Channel id (e.g. "line").
    fn id(&self) -> &str;
    /// Stop the channel connector. Default does nothing (webhook-only channels).
    fn stop(&self) {}
    /// Send the single reply allowed for the handle.
    async fn reply(&self, handle: ReplyHandle, text: &str) -> Result<(), ChannelError>;
    /// Download binary content (e.g. an image) by the id carried in the event payload.
    async fn fetch_content(&self, _content_id: &str) -> Result<Attachment, ChannelError> {
        Err(ChannelError::Unsupported("content download"))
    }
}

/// Registry of channel ids to handles. Shared across gateway.
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn ChannelHandle>>>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, handle: Arc<dyn ChannelHandle>) {
        let mut g = self.inner.write().await;
        if let Some(old) = g.insert(handle.id().to_string(), handle) {
            old.stop();
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn ChannelHandle>> {
        let g = self.inner.read().await;
        g.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let g = self.inner.read().await;
        g.keys().cloned().collect()
    }
}

/// Cut `text` to at most `max` characters (platform message limits).
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("晴天，28度", 3), "晴天，");
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("", 0), "");
    }
}
