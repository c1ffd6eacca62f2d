//! Webhook HTTP server: LINE callback, Telegram webhook, health probe.

use crate::channels::{
    line, telegram, ChannelRegistry, InboundEvent, LineChannel, NormalizeError,
    TelegramChannel, TelegramUpdate,
};
use crate::config::{self, Config};
use crate::emitter::{EmitError, ReplyEmitter};
use crate::llm::{GeminiClient, ModelBackend};
use crate::router::{RouteError, Router as ResponseRouter};
use crate::selection;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

const INBOUND_QUEUE: usize = 64;

/// Shared state for the webhook handlers and the event processor.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub router: Arc<ResponseRouter>,
    pub emitter: Arc<ReplyEmitter>,
    pub channel_registry: Arc<ChannelRegistry>,
    /// In-process channel connector tasks; awaited during graceful shutdown.
    pub channel_tasks: Arc<RwLock<Vec<JoinHandle<()>>>>,
    /// Sender for normalized inbound events. Processor task receives.
    pub inbound_tx: mpsc::Sender<InboundEvent>,
}

impl GatewayState {
    /// State plus the receiving end of the inbound queue (hand it to [`serve`]).
    pub fn new(
        config: Config,
        router: ResponseRouter,
        channel_registry: Arc<ChannelRegistry>,
    ) -> (Self, mpsc::Receiver<InboundEvent>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let state = Self {
            config: Arc::new(config),
            router: Arc::new(router),
            emitter: Arc::new(ReplyEmitter::new(channel_registry.clone())),
            channel_registry,
            channel_tasks: Arc::new(RwLock::new(Vec::new())),
            inbound_tx,
        };
        (state, inbound_rx)
    }
}

/// Route one event and emit its reply. Exactly one emit per routed event; no retries.
async fn process_inbound_event(state: GatewayState, event: InboundEvent) {
    let event_id = event.id;
    log::info!(
        "event {}: {} message from {} via {}",
        event_id,
        event.kind.as_str(),
        event.sender_id,
        event.channel_id
    );
    let reply = match state.router.route(&event).await {
        Ok(r) => r,
        Err(RouteError::UnsupportedMessageKind(kind)) => {
            log::debug!("event {}: no reply for {} message", event_id, kind);
            return;
        }
    };
    match state.emitter.emit(event.reply_handle, &reply).await {
        Ok(()) => log::debug!("event {}: reply sent", event_id),
        Err(EmitError::ReplyHandleExpired) => {
            log::warn!("event {}: reply handle expired, reply lost", event_id)
        }
        Err(e) => log::warn!("event {}: {}", event_id, e),
    }
}

/// HTTP routes over the given state.
pub fn app(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/callback", post(line_callback))
        .route("/telegram/webhook", post(telegram_webhook))
        .with_state(state)
}

/// Serve on `listener` until `shutdown` completes. Spawns the processor that drains `inbound_rx`,
/// one task per event so slow model calls do not hold up other senders.
pub async fn serve<F>(
    listener: TcpListener,
    state: GatewayState,
    mut inbound_rx: mpsc::Receiver<InboundEvent>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    {
        let state_inbound = state.clone();
        tokio::spawn(async move {
            while let Some(event) = inbound_rx.recv().await {
                tokio::spawn(process_inbound_event(state_inbound.clone(), event));
            }
        });
    }
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server exited")?;
    Ok(())
}

/// Run the gateway; binds to config.gateway.bind:config.gateway.port.
/// Probes the model provider once for the model id, registers configured channels,
/// and blocks until shutdown (e.g. Ctrl+C).
pub async fn run_gateway(config: Config) -> Result<()> {
    let timeout = Duration::from_secs(config.model.timeout_secs);
    let api_key = config::resolve_model_api_key(&config)
        .context("model API key not configured (set model.apiKey or GEMINI_API_KEY)")?;
    let backend: Arc<dyn ModelBackend> = Arc::new(
        GeminiClient::new(api_key, config.model.base_url.clone(), timeout)
            .context("building model client")?,
    );
    let model = selection::resolve_model(
        backend.as_ref(),
        &config.model.preferred_models,
        config.model.fallback_model.as_deref(),
    )
    .await;

    let channel_registry = Arc::new(ChannelRegistry::new());
    match config::resolve_line_access_token(&config) {
        Some(token) => {
            let line = LineChannel::new(token, timeout).context("building LINE client")?;
            channel_registry.register(Arc::new(line)).await;
            log::info!("line channel registered");
        }
        None => log::info!("line channel disabled (no access token)"),
    }
    if config::resolve_line_secret(&config).is_none() {
        log::warn!("LINE channel secret not configured; /callback will reject every request");
    }

    let router = ResponseRouter::new(&config, model, backend, channel_registry.clone());
    let (state, inbound_rx) = GatewayState::new(config.clone(), router, channel_registry.clone());

    let telegram_webhook_for_shutdown: Option<Arc<TelegramChannel>> =
        if let Some(token) = config::resolve_telegram_token(&config) {
            let telegram =
                Arc::new(TelegramChannel::new(token, timeout).context("building Telegram client")?);
            if let Some(ref url) = config.channels.telegram.webhook_url {
                let secret = config
                    .channels
                    .telegram
                    .webhook_secret
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .context("channels.telegram.webhookSecret is required when webhookUrl is set")?;
                if let Err(e) = telegram.set_webhook(url, Some(secret)).await {
                    log::warn!("telegram set_webhook failed: {}", e);
                } else {
                    log::info!("telegram channel registered (webhook mode): {}", url);
                }
                channel_registry.register(telegram.clone()).await;
                Some(telegram)
            } else {
                let handle = telegram.clone().start_inbound(state.inbound_tx.clone());
                state.channel_tasks.write().await.push(handle);
                channel_registry.register(telegram).await;
                log::info!("telegram channel registered and getUpdates loop started");
                None
            }
        } else {
            None
        };

    let bind_addr = format!("{}:{}", config.gateway.bind.trim(), config.gateway.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    let shutdown = shutdown_signal(
        channel_registry,
        state.channel_tasks.clone(),
        telegram_webhook_for_shutdown,
    );
    serve(listener, state, inbound_rx, shutdown).await?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Stops channel connectors, removes the Telegram webhook if used, then awaits in-process channel tasks.
async fn shutdown_signal(
    channel_registry: Arc<ChannelRegistry>,
    channel_tasks: Arc<RwLock<Vec<JoinHandle<()>>>>,
    telegram_webhook: Option<Arc<TelegramChannel>>,
) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");

    for id in channel_registry.ids().await {
        if let Some(handle) = channel_registry.get(&id).await {
            handle.stop();
        }
    }

    if let Some(t) = telegram_webhook {
        if let Err(e) = t.delete_webhook().await {
            log::debug!("telegram delete_webhook on shutdown: {}", e);
        }
    }

    let handles = {
        let mut g = channel_tasks.write().await;
        std::mem::take(&mut *g)
    };
    for h in handles {
        let _ = h.await;
    }
    log::info!("channel tasks finished");
}

/// Push events onto the processor queue; 503 if the processor is gone.
async fn enqueue(state: &GatewayState, events: Vec<InboundEvent>) -> Result<(), StatusCode> {
    for event in events {
        if state.inbound_tx.send(event).await.is_err() {
            log::warn!("inbound queue closed, dropping event");
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
    }
    Ok(())
}

/// POST /callback: LINE webhook. Verifies X-Line-Signature (400 on failure), queues events, answers `OK`.
async fn line_callback(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let signature = headers
        .get(line::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let verified = config::resolve_line_secret(&state.config)
        .map(|secret| line::verify_signature(&secret, &body, signature))
        .unwrap_or(false);
    if !verified {
        log::warn!("line callback: {}", NormalizeError::InvalidSignature);
        return (StatusCode::BAD_REQUEST, "invalid signature");
    }
    let events = match line::normalize(&body) {
        Ok(events) => events,
        Err(e) => {
            log::warn!("line callback: {}", e);
            return (StatusCode::BAD_REQUEST, "malformed payload");
        }
    };
    match enqueue(&state, events).await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(status) => (status, "unavailable"),
    }
}

/// POST /telegram/webhook: Telegram update JSON. 404 unless Telegram runs in webhook mode; the secret
/// header must match `webhookSecret` (400 otherwise).
async fn telegram_webhook(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let tg = &state.config.channels.telegram;
    let registered = state.channel_registry.get(telegram::CHANNEL_ID).await.is_some();
    if tg.webhook_url.is_none() || !registered {
        return (StatusCode::NOT_FOUND, "telegram webhook not enabled");
    }
    let provided = headers
        .get(telegram::SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let verified = tg
        .webhook_secret
        .as_deref()
        .map(str::trim)
        .is_some_and(|expected| !expected.is_empty() && provided == expected);
    if !verified {
        log::warn!("telegram webhook: {}", NormalizeError::InvalidSignature);
        return (StatusCode::BAD_REQUEST, "invalid signature");
    }
    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(_) => return (StatusCode::BAD_REQUEST, "malformed payload"),
    };
    let event = match telegram::normalize_update(update) {
        Ok(e) => e,
        Err(e) => {
            log::debug!("telegram webhook: {}", e);
            return (StatusCode::OK, "OK");
        }
    };
    match enqueue(&state, vec![event]).await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(status) => (status, "unavailable"),
    }
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let channels = state.channel_registry.ids().await;
    Json(json!({
        "runtime": "running",
        "port": state.config.gateway.port,
        "model": state.router.model(),
        "channels": channels,
        "conversations": state.router.conversations().len().await,
    }))
}
