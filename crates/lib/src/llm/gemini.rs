//! Gemini REST client (generativelanguage.googleapis.com).
//! Supports listing models and non-streaming generateContent with inline image parts.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{GenerateRequest, ModelBackend, ModelError};
use crate::session::{Role, Turn};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const GENERATE_METHOD: &str = "generateContent";

/// Client for the Gemini HTTP API. The API key travels in a header so it never shows up in error URLs.
#[derive(Clone)]
pub struct GeminiClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url,
            api_key: api_key.into(),
            client,
        })
    }

    async fn error_from_response(res: reqwest::Response) -> ModelError {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .ok()
            .and_then(|e| e.error)
            .map(|e| e.message)
            .unwrap_or(body);
        ModelError::Api(format!("{} {}", status, message))
    }
}

#[async_trait]
impl ModelBackend for GeminiClient {
    /// GET /models: ids supporting generateContent.
    async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        let url = format!("{}/models?pageSize=1000", self.base_url);
        let res = self
            .client
            .get(&url)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(Self::error_from_response(res).await);
        }
        let data: ModelsResponse = res.json().await?;
        Ok(generation_models(data))
    }

    /// POST /models/{model}:generateContent: non-streaming generation.
    async fn generate(&self, model: &str, request: GenerateRequest) -> Result<String, ModelError> {
        let url = format!("{}/models/{}:{}", self.base_url, model, GENERATE_METHOD);
        let body = build_request(&request);
        let res = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(Self::error_from_response(res).await);
        }
        let data: GenerateResponse = res.json().await?;
        response_text(data)
    }
}

// --- wire types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<WireInlineData>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTool {
    google_search: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<WireContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    models: Vec<ModelObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelObject {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

fn text_part(text: &str) -> WirePart {
    WirePart {
        text: Some(text.to_string()),
        inline_data: None,
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "model",
    }
}

fn history_content(turn: &Turn) -> WireContent {
    WireContent {
        role: Some(role_name(turn.role).to_string()),
        parts: vec![text_part(&turn.text)],
    }
}

fn build_request(request: &GenerateRequest) -> WireRequest {
    let mut contents: Vec<WireContent> = request.history.iter().map(history_content).collect();
    let mut parts = vec![text_part(&request.prompt)];
    for a in &request.attachments {
        parts.push(WirePart {
            text: None,
            inline_data: Some(WireInlineData {
                mime_type: a.mime_type.clone(),
                data: base64::engine::general_purpose::STANDARD.encode(&a.data),
            }),
        });
    }
    contents.push(WireContent {
        role: Some("user".to_string()),
        parts,
    });
    let tools = if request.tools.web_search {
        vec![WireTool {
            google_search: serde_json::json!({}),
        }]
    } else {
        Vec::new()
    };
    WireRequest { contents, tools }
}

fn response_text(data: GenerateResponse) -> Result<String, ModelError> {
    if let Some(reason) = data.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ModelError::Api(format!("prompt blocked: {}", reason)));
    }
    let candidate = data
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::Malformed("no candidates in response".to_string()))?;
    let text: String = candidate
        .content
        .map(|c| c.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| p.text)
        .collect::<Vec<_>>()
        .join("");
    if text.trim().is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "unknown".to_string());
        return Err(ModelError::Malformed(format!(
            "no text in response (finish reason: {})",
            reason
        )));
    }
    Ok(text)
}

fn generation_models(data: ModelsResponse) -> Vec<String> {
    data.models
        .into_iter()
        .filter(|m| m.supported_generation_methods.iter().any(|s| s == GENERATE_METHOD))
        .map(|m| m.name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Attachment, ToolFlags};

    #[test]
    fn request_puts_history_before_prompt_and_encodes_images() {
        let request = GenerateRequest {
            prompt: "describe".to_string(),
            attachments: vec![Attachment {
                mime_type: "image/png".to_string(),
                data: vec![1, 2, 3],
            }],
            history: vec![Turn::user("hi"), Turn::model("hello")],
            tools: ToolFlags { web_search: true },
        };
        let json = serde_json::to_value(build_request(&request)).unwrap();
        let contents = json["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["text"], "hello");
        assert_eq!(contents[2]["parts"][0]["text"], "describe");
        assert_eq!(contents[2]["parts"][1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(contents[2]["parts"][1]["inlineData"]["data"], "AQID");
        assert!(json["tools"][0]["googleSearch"].is_object());
    }

    #[test]
    fn request_without_tools_omits_field() {
        let json = serde_json::to_value(build_request(&GenerateRequest::text("x"))).unwrap();
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn response_text_joins_parts() {
        let data: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"晴天，"},{"text":"28度"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(response_text(data).unwrap(), "晴天，28度");
    }

    #[test]
    fn blocked_prompt_is_api_error() {
        let data: GenerateResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert!(matches!(response_text(data), Err(ModelError::Api(m)) if m.contains("SAFETY")));
    }

    #[test]
    fn empty_candidates_are_malformed() {
        let data: GenerateResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(matches!(response_text(data), Err(ModelError::Malformed(_))));
    }

    #[test]
    fn list_filters_generation_capable_models() {
        let data: ModelsResponse = serde_json::from_str(
            r#"{"models":[
                {"name":"models/embedding-001","supportedGenerationMethods":["embedContent"]},
                {"name":"models/gemini-1.5-flash","supportedGenerationMethods":["generateContent","countTokens"]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(generation_models(data), vec!["models/gemini-1.5-flash"]);
    }
}
