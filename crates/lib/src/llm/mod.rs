//! Generative model abstraction and the Gemini client.
//!
//! The router only sees [`ModelBackend`]: list model ids at startup, generate text per message.

mod gemini;

pub use gemini::{GeminiClient, DEFAULT_BASE_URL};

use crate::session::Turn;
use async_trait::async_trait;

/// Binary part sent alongside the prompt (e.g. an image from the chat platform).
#[derive(Debug, Clone)]
pub struct Attachment {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Capabilities passed through to the provider untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolFlags {
    pub web_search: bool,
}

/// One generation call: prior turns, the composed prompt, optional binary parts.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub prompt: String,
    pub attachments: Vec<Attachment>,
    pub history: Vec<Turn>,
    pub tools: ToolFlags,
}

impl GenerateRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model request timed out: {0}")]
    Timeout(String),
    #[error("model request failed: {0}")]
    Request(String),
    #[error("model api error: {0}")]
    Api(String),
    #[error("malformed model response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ModelError::Timeout(e.to_string())
        } else if e.is_decode() {
            ModelError::Malformed(e.to_string())
        } else {
            ModelError::Request(e.to_string())
        }
    }
}

/// A hosted model reachable through a request/response contract.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Model ids that support text generation.
    async fn list_models(&self) -> Result<Vec<String>, ModelError>;

    /// Generate a text reply with the given model.
    async fn generate(&self, model: &str, request: GenerateRequest) -> Result<String, ModelError>;
}
