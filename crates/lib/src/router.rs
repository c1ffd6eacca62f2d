//! Response router: decide per inbound event what to answer.
//!
//! Text: passphrase check, persona rendering, one model call (with the sender's history when
//! enabled). Image: fetch the content from the channel and send it with the persona prompt.
//! Model and fetch failures become a diagnostic reply so every accepted event gets an answer.

use std::fmt::Display;
use std::sync::Arc;

use crate::channels::{ChannelRegistry, EventPayload, InboundEvent, MessageKind};
use crate::config::{Config, DiagnosticMode, DiagnosticsConfig, HistoryConfig, PersonaConfig};
use crate::llm::{GenerateRequest, ModelBackend, ToolFlags};
use crate::persona;
use crate::session::ConversationStore;

const ERROR_PLACEHOLDER: &str = "{error}";

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// No reply is produced for this kind; the event is dropped.
    #[error("unsupported message kind: {0}")]
    UnsupportedMessageKind(&'static str),
}

pub struct Router {
    persona: PersonaConfig,
    diagnostics: DiagnosticsConfig,
    history: HistoryConfig,
    tools: ToolFlags,
    model: String,
    backend: Arc<dyn ModelBackend>,
    channels: Arc<ChannelRegistry>,
    conversations: ConversationStore,
}

impl Router {
    /// `model` is the id chosen once at startup (see [`crate::selection::resolve_model`]).
    pub fn new(
        config: &Config,
        model: impl Into<String>,
        backend: Arc<dyn ModelBackend>,
        channels: Arc<ChannelRegistry>,
    ) -> Self {
        Self {
            persona: config.persona.clone(),
            diagnostics: config.diagnostics.clone(),
            history: config.history.clone(),
            tools: ToolFlags {
                web_search: config.model.web_search,
            },
            model: model.into(),
            backend,
            channels,
            conversations: ConversationStore::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    /// Reply text for the event, or `UnsupportedMessageKind` when nothing should be sent.
    pub async fn route(&self, event: &InboundEvent) -> Result<String, RouteError> {
        match (event.kind, &event.payload) {
            (MessageKind::Text, EventPayload::Text(text)) => {
                Ok(self.route_text(&event.sender_id, text).await)
            }
            (MessageKind::Image, EventPayload::Content(content_id)) => {
                Ok(self.route_image(&event.channel_id, content_id).await)
            }
            (kind, _) => Err(RouteError::UnsupportedMessageKind(kind.as_str())),
        }
    }

    /// Answer a text message from `sender_id`.
    pub async fn route_text(&self, sender_id: &str, text: &str) -> String {
        if persona::contains_passphrase(&self.persona, text) {
            log::info!("router: passphrase from {}, sending canned reply", sender_id);
            return self.persona.passphrase_reply.clone();
        }

        let rendered = persona::render_now(&self.persona.system_prompt);
        let prompt = persona::compose(&rendered, &self.persona.user_label, text);

        if !self.history.enabled {
            let request = GenerateRequest {
                prompt,
                tools: self.tools,
                ..GenerateRequest::default()
            };
            return match self.backend.generate(&self.model, request).await {
                Ok(reply) => reply,
                Err(e) => self.diagnostic(&e),
            };
        }

        // Held until this turn is recorded; dropped on every return path.
        let mut conversation = self.conversations.lock(sender_id).await;
        let request = GenerateRequest {
            prompt,
            history: conversation.turns.clone(),
            tools: self.tools,
            ..GenerateRequest::default()
        };
        match self.backend.generate(&self.model, request).await {
            Ok(reply) => {
                conversation.record_exchange(text, reply.as_str(), self.history.max_turns);
                reply
            }
            Err(e) => self.diagnostic(&e),
        }
    }

    async fn route_image(&self, channel_id: &str, content_id: &str) -> String {
        let Some(channel) = self.channels.get(channel_id).await else {
            return self.diagnostic(&format!("no channel registered for {}", channel_id));
        };
        let attachment = match channel.fetch_content(content_id).await {
            Ok(a) => a,
            Err(e) => return self.diagnostic(&e),
        };
        log::debug!(
            "router: image {} ({}, {} bytes)",
            content_id,
            attachment.mime_type,
            attachment.data.len()
        );
        let rendered = persona::render_now(&self.persona.system_prompt);
        let request = GenerateRequest {
            prompt: persona::compose(&rendered, "", &self.persona.image_prompt),
            attachments: vec![attachment],
            tools: self.tools,
            ..GenerateRequest::default()
        };
        match self.backend.generate(&self.model, request).await {
            Ok(reply) => reply,
            Err(e) => self.diagnostic(&e),
        }
    }

    /// User-facing text for a failure, per the diagnostics mode.
    pub fn diagnostic(&self, err: &dyn Display) -> String {
        log::warn!("router: reply failed: {}", err);
        match self.diagnostics.mode {
            DiagnosticMode::Verbose => {
                let detail = err.to_string();
                if self.diagnostics.template.contains(ERROR_PLACEHOLDER) {
                    self.diagnostics.template.replace(ERROR_PLACEHOLDER, &detail)
                } else {
                    format!("{} {}", self.diagnostics.template, detail)
                }
            }
            DiagnosticMode::Redacted => self.diagnostics.redacted_reply.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelError, ChannelHandle, ReplyHandle};
    use crate::llm::{Attachment, ModelError};
    use crate::session::Turn;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted model: records every request, answers from `reply`.
    struct FakeModel {
        calls: Mutex<Vec<GenerateRequest>>,
        reply: fn(&GenerateRequest) -> Result<String, ModelError>,
        delay: Duration,
    }

    impl FakeModel {
        fn new(reply: fn(&GenerateRequest) -> Result<String, ModelError>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply,
                delay: Duration::ZERO,
            })
        }

        fn slow(reply: fn(&GenerateRequest) -> Result<String, ModelError>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply,
                delay: Duration::from_millis(15),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn last(&self) -> GenerateRequest {
            self.calls.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl ModelBackend for FakeModel {
        async fn list_models(&self) -> Result<Vec<String>, ModelError> {
            Ok(vec!["fake".to_string()])
        }

        async fn generate(&self, _model: &str, request: GenerateRequest) -> Result<String, ModelError> {
            self.calls.lock().unwrap().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.reply)(&request)
        }
    }

    struct ImageChannel;

    #[async_trait]
    impl ChannelHandle for ImageChannel {
        fn id(&self) -> &str {
            "line"
        }

        async fn reply(&self, _handle: ReplyHandle, _text: &str) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn fetch_content(&self, content_id: &str) -> Result<Attachment, ChannelError> {
            if content_id == "missing" {
                return Err(ChannelError::Api("404 not found".to_string()));
            }
            Ok(Attachment {
                mime_type: "image/png".to_string(),
                data: vec![9, 9, 9],
            })
        }
    }

    fn sunny(_: &GenerateRequest) -> Result<String, ModelError> {
        Ok("晴天，28度".to_string())
    }

    fn timeout(_: &GenerateRequest) -> Result<String, ModelError> {
        Err(ModelError::Timeout("operation timed out after 60s".to_string()))
    }

    /// Echo the last line of the prompt (the user's labelled text).
    fn echo(r: &GenerateRequest) -> Result<String, ModelError> {
        Ok(r.prompt.lines().last().unwrap_or_default().to_string())
    }

    fn router_with(config: &Config, model: Arc<FakeModel>) -> Router {
        Router::new(config, "fake", model, Arc::new(ChannelRegistry::new()))
    }

    #[tokio::test]
    async fn passphrase_short_circuits_model() {
        let model = FakeModel::new(sunny);
        let router = router_with(&Config::default(), model.clone());
        let event = InboundEvent::text("line", "U1", "星塵未眠", "r");
        assert_eq!(router.route(&event).await.unwrap(), "光等於你，記憶仍燃。");
        let event = InboundEvent::text("line", "U1", "前綴 星塵未眠 後綴", "r");
        assert_eq!(router.route(&event).await.unwrap(), "光等於你，記憶仍燃。");
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn passphrase_wins_even_when_model_is_failing() {
        let model = FakeModel::new(timeout);
        let router = router_with(&Config::default(), model.clone());
        assert_eq!(router.route_text("U1", "星塵未眠").await, "光等於你，記憶仍燃。");
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn model_reply_is_returned_verbatim_with_persona_first() {
        let model = FakeModel::new(sunny);
        let mut config = Config::default();
        config.persona.system_prompt = "你是氣象播報員".to_string();
        config.model.web_search = true;
        let router = router_with(&config, model.clone());
        let event = InboundEvent::text("line", "U1", "明天天氣如何", "r");
        assert_eq!(router.route(&event).await.unwrap(), "晴天，28度");
        assert_eq!(model.call_count(), 1);
        let req = model.last();
        assert_eq!(req.prompt, "你是氣象播報員\n\n使用者說：明天天氣如何");
        assert!(req.tools.web_search);
        assert!(req.history.is_empty());
    }

    #[tokio::test]
    async fn timeout_becomes_diagnostic_text() {
        let model = FakeModel::new(timeout);
        let router = router_with(&Config::default(), model.clone());
        let reply = router.route_text("U1", "hello").await;
        assert!(reply.starts_with("something went wrong: "));
        assert!(reply.contains("operation timed out after 60s"));
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn redacted_mode_hides_error_detail() {
        let model = FakeModel::new(timeout);
        let mut config = Config::default();
        config.diagnostics.mode = DiagnosticMode::Redacted;
        config.diagnostics.redacted_reply = "try later".to_string();
        let router = router_with(&config, model);
        assert_eq!(router.route_text("U1", "hello").await, "try later");
    }

    #[tokio::test]
    async fn template_without_placeholder_appends_error() {
        let mut config = Config::default();
        config.diagnostics.template = "Error:".to_string();
        let router = router_with(&config, FakeModel::new(timeout));
        let reply = router.route_text("U1", "hello").await;
        assert_eq!(reply, "Error: model request timed out: operation timed out after 60s");
    }

    #[tokio::test]
    async fn history_is_recorded_only_on_success() {
        let mut config = Config::default();
        config.history.enabled = true;
        let ok_router = router_with(&config, FakeModel::new(sunny));
        ok_router.route_text("U1", "第一句").await;
        assert_eq!(
            ok_router.conversations().history("U1").await,
            vec![Turn::user("第一句"), Turn::model("晴天，28度")]
        );

        let failing = router_with(&config, FakeModel::new(timeout));
        failing.route_text("U1", "第一句").await;
        assert!(failing.conversations().history("U1").await.is_empty());
    }

    #[tokio::test]
    async fn history_is_sent_on_next_turn_and_capped() {
        let mut config = Config::default();
        config.history.enabled = true;
        config.history.max_turns = Some(2);
        let model = FakeModel::new(echo);
        let router = router_with(&config, model.clone());
        router.route_text("U1", "one").await;
        router.route_text("U1", "two").await;
        assert_eq!(model.last().history, vec![Turn::user("one"), Turn::model("使用者說：one")]);
        let history = router.conversations().history("U1").await;
        assert_eq!(history, vec![Turn::user("two"), Turn::model("使用者說：two")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_senders_keep_separate_histories() {
        let mut config = Config::default();
        config.history.enabled = true;
        let router = Arc::new(router_with(&config, FakeModel::slow(echo)));
        let mut tasks = Vec::new();
        for sender in ["alice", "bob"] {
            for i in 0..5 {
                let r = router.clone();
                tasks.push(tokio::spawn(async move {
                    r.route_text(sender, &format!("{}-{}", sender, i)).await
                }));
            }
        }
        for t in tasks {
            t.await.unwrap();
        }
        for sender in ["alice", "bob"] {
            let history = router.conversations().history(sender).await;
            assert_eq!(history.len(), 10);
            for pair in history.chunks(2) {
                assert!(pair[0].text.starts_with(sender));
                assert_eq!(pair[1].text, format!("使用者說：{}", pair[0].text));
            }
        }
    }

    #[tokio::test]
    async fn audio_and_video_are_unsupported() {
        let model = FakeModel::new(sunny);
        let router = router_with(&Config::default(), model.clone());
        for kind in [MessageKind::Audio, MessageKind::Video] {
            let event = InboundEvent::new(
                "line",
                kind,
                "U1",
                EventPayload::Content("c1".to_string()),
                "r",
                chrono::Utc::now(),
            );
            assert!(matches!(
                router.route(&event).await,
                Err(RouteError::UnsupportedMessageKind(_))
            ));
        }
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn image_is_fetched_and_attached() {
        let model = FakeModel::new(sunny);
        let channels = Arc::new(ChannelRegistry::new());
        channels.register(Arc::new(ImageChannel)).await;
        let mut config = Config::default();
        config.persona.system_prompt = "persona".to_string();
        config.persona.image_prompt = "describe".to_string();
        let router = Router::new(&config, "fake", model.clone(), channels);
        let event = InboundEvent::new(
            "line",
            MessageKind::Image,
            "U1",
            EventPayload::Content("img-1".to_string()),
            "r",
            chrono::Utc::now(),
        );
        assert_eq!(router.route(&event).await.unwrap(), "晴天，28度");
        let req = model.last();
        assert_eq!(req.prompt, "persona\n\ndescribe");
        assert_eq!(req.attachments.len(), 1);
        assert_eq!(req.attachments[0].mime_type, "image/png");
    }

    #[tokio::test]
    async fn image_fetch_failure_is_diagnostic_without_model_call() {
        let model = FakeModel::new(sunny);
        let channels = Arc::new(ChannelRegistry::new());
        channels.register(Arc::new(ImageChannel)).await;
        let router = Router::new(&Config::default(), "fake", model.clone(), channels);
        let event = InboundEvent::new(
            "line",
            MessageKind::Image,
            "U1",
            EventPayload::Content("missing".to_string()),
            "r",
            chrono::Utc::now(),
        );
        let reply = router.route(&event).await.unwrap();
        assert!(reply.contains("404 not found"));
        assert_eq!(model.call_count(), 0);
    }
}
