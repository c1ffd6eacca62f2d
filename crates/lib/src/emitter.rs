//! Reply emitter: deliver the one reply an inbound event allows. Never retries.

use std::sync::Arc;

use crate::channels::{ChannelError, ChannelRegistry, ReplyHandle};

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("reply handle expired or already used")]
    ReplyHandleExpired,
    #[error("no channel registered for {0}")]
    UnknownChannel(String),
    #[error("reply delivery failed: {0}")]
    Delivery(ChannelError),
}

impl From<ChannelError> for EmitError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::ReplyHandleExpired => EmitError::ReplyHandleExpired,
            other => EmitError::Delivery(other),
        }
    }
}

pub struct ReplyEmitter {
    channels: Arc<ChannelRegistry>,
}

impl ReplyEmitter {
    pub fn new(channels: Arc<ChannelRegistry>) -> Self {
        Self { channels }
    }

    /// Send `text` through the handle's channel. The handle is consumed either way.
    pub async fn emit(&self, handle: ReplyHandle, text: &str) -> Result<(), EmitError> {
        let channel = self
            .channels
            .get(handle.channel_id())
            .await
            .ok_or_else(|| EmitError::UnknownChannel(handle.channel_id().to_string()))?;
        channel.reply(handle, text).await?;
        Ok(())
    }
}
