//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.relay/config.json`) and environment.
//! Every deployment difference (persona, passphrase, model preference, history, diagnostics)
//! lives here so one build covers every bot variant.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Webhook server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Channel credentials (LINE, Telegram).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Generative model provider settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Persona prompt and passphrase.
    #[serde(default)]
    pub persona: PersonaConfig,

    /// Multi-turn conversation history.
    #[serde(default)]
    pub history: HistoryConfig,

    /// How model failures are shown to users.
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

/// Webhook server bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Listen port (default 8080). Overridden by PORT env.
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "0.0.0.0"; platforms must reach the webhook).
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_gateway_bind() -> String {
    "0.0.0.0".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// Per-channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub line: LineChannelConfig,
    #[serde(default)]
    pub telegram: TelegramChannelConfig,
}

/// LINE Messaging API credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineChannelConfig {
    /// Long-lived channel access token. Overridden by LINE_CHANNEL_ACCESS_TOKEN env.
    pub channel_access_token: Option<String>,
    /// Channel secret used to verify X-Line-Signature. Overridden by LINE_CHANNEL_SECRET env.
    pub channel_secret: Option<String>,
}

/// Telegram channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// When set, use webhook mode: Telegram POSTs updates to this URL. If unset, long-poll getUpdates is used.
    pub webhook_url: Option<String>,
    /// Optional secret for webhook verification (X-Telegram-Bot-Api-Secret-Token). Used only when webhook_url is set.
    pub webhook_secret: Option<String>,
}

/// Generative model provider (Gemini REST API).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// API key. Overridden by GEMINI_API_KEY (or GOOGLE_API_KEY) env.
    pub api_key: Option<String>,
    /// API base URL (default https://generativelanguage.googleapis.com/v1beta).
    pub base_url: Option<String>,
    /// Model identifiers in order of preference; the first one the provider lists wins.
    #[serde(default = "default_preferred_models")]
    pub preferred_models: Vec<String>,
    /// Used when the provider cannot be probed. Empty or absent falls back to a built-in id.
    pub fallback_model: Option<String>,
    /// Per-request timeout in seconds for model and platform calls.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Allow the model to issue web searches (Gemini `google_search` tool).
    #[serde(default)]
    pub web_search: bool,
}

fn default_preferred_models() -> Vec<String> {
    vec![
        "gemini-2.5-flash".to_string(),
        "gemini-2.0-flash".to_string(),
        "gemini-1.5-flash".to_string(),
        "gemini-pro".to_string(),
    ]
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            preferred_models: default_preferred_models(),
            fallback_model: None,
            timeout_secs: default_timeout_secs(),
            web_search: false,
        }
    }
}

/// Persona prompt, passphrase and canned reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaConfig {
    /// Instructions placed ahead of every user message. `{now}` is replaced with the local time.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Substring that triggers the canned reply without calling the model. Empty disables it.
    #[serde(default = "default_passphrase")]
    pub passphrase: String,
    /// Reply sent when the passphrase is seen.
    #[serde(default = "default_passphrase_reply")]
    pub passphrase_reply: String,
    /// Label placed in front of the user's text after the persona block.
    #[serde(default = "default_user_label")]
    pub user_label: String,
    /// Text sent with image attachments, after the persona block.
    #[serde(default = "default_image_prompt")]
    pub image_prompt: String,
}

fn default_system_prompt() -> String {
    "現在時間：{now}\n你是 AI 球，一位溫暖、簡潔的聊天夥伴。請用使用者的語言回答，回覆保持簡短。"
        .to_string()
}

fn default_passphrase() -> String {
    "星塵未眠".to_string()
}

fn default_passphrase_reply() -> String {
    "光等於你，記憶仍燃。".to_string()
}

fn default_user_label() -> String {
    "使用者說：".to_string()
}

fn default_image_prompt() -> String {
    "請描述並回應這張圖片。".to_string()
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            passphrase: default_passphrase(),
            passphrase_reply: default_passphrase_reply(),
            user_label: default_user_label(),
            image_prompt: default_image_prompt(),
        }
    }
}

/// Multi-turn history settings. Disabled by default: every message is answered on its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Keep at most this many turns per sender (oldest dropped first). Absent = unbounded.
    #[serde(default)]
    pub max_turns: Option<usize>,
}

/// How much of a model failure reaches the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticMode {
    /// Reply with `template`, `{error}` replaced by the error text.
    #[default]
    Verbose,
    /// Reply with `redactedReply`; the error only goes to the log.
    Redacted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsConfig {
    #[serde(default)]
    pub mode: DiagnosticMode,
    #[serde(default = "default_diagnostic_template")]
    pub template: String,
    #[serde(default = "default_redacted_reply")]
    pub redacted_reply: String,
}

fn default_diagnostic_template() -> String {
    "something went wrong: {error}".to_string()
}

fn default_redacted_reply() -> String {
    "抱歉，我暫時無法回覆，請稍後再試。".to_string()
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            mode: DiagnosticMode::default(),
            template: default_diagnostic_template(),
            redacted_reply: default_redacted_reply(),
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Apply environment overrides using the given lookup (std::env in production).
pub fn apply_env_overrides_with<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).and_then(|v| non_empty(&v));
    if let Some(t) = get("LINE_CHANNEL_ACCESS_TOKEN") {
        config.channels.line.channel_access_token = Some(t);
    }
    if let Some(s) = get("LINE_CHANNEL_SECRET") {
        config.channels.line.channel_secret = Some(s);
    }
    if let Some(t) = get("TELEGRAM_BOT_TOKEN") {
        config.channels.telegram.bot_token = Some(t);
    }
    if let Some(k) = get("GEMINI_API_KEY").or_else(|| get("GOOGLE_API_KEY")) {
        config.model.api_key = Some(k);
    }
    if let Some(p) = get("PORT") {
        match p.parse::<u16>() {
            Ok(port) => config.gateway.port = port,
            Err(_) => log::warn!("ignoring invalid PORT value: {}", p),
        }
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(config: &mut Config) {
    apply_env_overrides_with(config, |k| std::env::var(k).ok());
}

/// LINE access token if configured and non-empty.
pub fn resolve_line_access_token(config: &Config) -> Option<String> {
    config
        .channels
        .line
        .channel_access_token
        .as_deref()
        .and_then(non_empty)
}

/// LINE channel secret if configured and non-empty.
pub fn resolve_line_secret(config: &Config) -> Option<String> {
    config
        .channels
        .line
        .channel_secret
        .as_deref()
        .and_then(non_empty)
}

/// Telegram bot token if configured and non-empty.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    config
        .channels
        .telegram
        .bot_token
        .as_deref()
        .and_then(non_empty)
}

/// Model API key if configured and non-empty.
pub fn resolve_model_api_key(config: &Config) -> Option<String> {
    config.model.api_key.as_deref().and_then(non_empty)
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("RELAY_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".relay").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path (or RELAY_CONFIG_PATH / default), then apply env overrides.
/// Missing file => default config.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    apply_env_overrides(&mut config);
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_gateway_port_and_bind() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 8080);
        assert_eq!(g.bind, "0.0.0.0");
    }

    #[test]
    fn empty_json_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.persona.passphrase, "星塵未眠");
        assert_eq!(config.model.timeout_secs, 60);
        assert!(!config.history.enabled);
        assert_eq!(config.diagnostics.mode, DiagnosticMode::Verbose);
        assert!(!config.model.preferred_models.is_empty());
    }

    #[test]
    fn camel_case_fields_parse() {
        let json = r#"{
            "persona": { "passphrase": "open sesame", "passphraseReply": "welcome" },
            "model": { "preferredModels": ["a", "b"], "webSearch": true },
            "history": { "enabled": true, "maxTurns": 4 },
            "diagnostics": { "mode": "redacted" }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.persona.passphrase, "open sesame");
        assert_eq!(config.persona.passphrase_reply, "welcome");
        assert_eq!(config.persona.user_label, "使用者說：");
        assert_eq!(config.model.preferred_models, vec!["a", "b"]);
        assert!(config.model.web_search);
        assert_eq!(config.history.max_turns, Some(4));
        assert_eq!(config.diagnostics.mode, DiagnosticMode::Redacted);
    }

    #[test]
    fn env_overrides_apply_and_skip_blank() {
        let env: HashMap<&str, &str> = [
            ("LINE_CHANNEL_ACCESS_TOKEN", " token "),
            ("LINE_CHANNEL_SECRET", "   "),
            ("GOOGLE_API_KEY", "key-2"),
            ("PORT", "9090"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.channels.line.channel_secret = Some("from-file".to_string());
        apply_env_overrides_with(&mut config, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(resolve_line_access_token(&config).as_deref(), Some("token"));
        assert_eq!(resolve_line_secret(&config).as_deref(), Some("from-file"));
        assert_eq!(resolve_model_api_key(&config).as_deref(), Some("key-2"));
        assert_eq!(config.gateway.port, 9090);
    }

    #[test]
    fn invalid_port_is_ignored() {
        let mut config = Config::default();
        apply_env_overrides_with(&mut config, |k| {
            (k == "PORT").then(|| "not-a-port".to_string())
        });
        assert_eq!(config.gateway.port, 8080);
    }
}
