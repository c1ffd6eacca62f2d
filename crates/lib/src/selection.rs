//! Startup model selection: probe the provider once, pick by preference order.

use std::fmt::Display;

use crate::llm::ModelBackend;

/// Last-resort model id; guarantees selection never yields an empty id.
pub const FALLBACK_MODEL: &str = "gemini-1.5-flash";

/// Strip the provider's `models/` prefix and surrounding whitespace.
pub fn normalize_model_id(id: &str) -> &str {
    let id = id.trim();
    id.strip_prefix("models/").unwrap_or(id)
}

fn fallback_or_default(fallback: Option<&str>) -> String {
    fallback
        .map(normalize_model_id)
        .filter(|s| !s.is_empty())
        .unwrap_or(FALLBACK_MODEL)
        .to_string()
}

/// Pick the first preferred id present in the probe result; otherwise the first available id;
/// otherwise (probe failed or empty) the configured fallback, then [`FALLBACK_MODEL`].
pub fn select_model<E: Display>(
    preference: &[String],
    probe: Result<Vec<String>, E>,
    fallback: Option<&str>,
) -> String {
    let available: Vec<&str> = match &probe {
        Ok(list) => list
            .iter()
            .map(|s| normalize_model_id(s))
            .filter(|s| !s.is_empty())
            .collect(),
        Err(e) => {
            log::warn!("model probe failed, using fallback: {}", e);
            Vec::new()
        }
    };
    if let Some(hit) = preference
        .iter()
        .map(|p| normalize_model_id(p))
        .find(|p| available.contains(p))
    {
        return hit.to_string();
    }
    match available.first() {
        Some(first) => first.to_string(),
        None => fallback_or_default(fallback),
    }
}

/// Probe the backend once and select the model id for the process lifetime.
pub async fn resolve_model(
    backend: &dyn ModelBackend,
    preference: &[String],
    fallback: Option<&str>,
) -> String {
    let probe = backend.list_models().await;
    if let Ok(ref list) = probe {
        log::debug!("provider lists {} generation model(s)", list.len());
    }
    let model = select_model(preference, probe, fallback);
    log::info!("selected model {}", model);
    model
}
