//! A thin `axum` transport that proves the selection core is wired correctly end to end.
//! No request/response schema translation happens here (§2 Non-goal) -- bodies are
//! forwarded upstream unchanged.

pub mod upstream;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::GatewayConfig;
use crate::credential::Credential;
use crate::selection::factory::StrategyManager;
use crate::selection::{SelectionContext, SelectionOutcome};
use crate::server::upstream::UpstreamClient;

/// Supplies each request's credential pool. The demo binary's default implementation reads
/// a static list out of `GatewayConfig`; a real deployment would back this with a database.
pub trait CredentialSource: Send + Sync {
    fn pool(&self, provider: &str) -> Vec<Credential>;
}

/// Reads the same `[[providers.*.credentials]]` entries the config was loaded with. Kept
/// tiny and swappable via [`CredentialSource`] because sourcing real credentials is out of
/// this crate's scope.
pub struct ConfigCredentialSource {
    cfg: Arc<RwLock<GatewayConfig>>,
}

impl ConfigCredentialSource {
    pub fn new(cfg: Arc<RwLock<GatewayConfig>>) -> Self {
        Self { cfg }
    }
}

impl CredentialSource for ConfigCredentialSource {
    fn pool(&self, provider: &str) -> Vec<Credential> {
        self.cfg
            .read()
            .providers
            .get(provider)
            .map(|entry| entry.credentials.clone())
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct GatewayState {
    pub cfg: Arc<RwLock<GatewayConfig>>,
    pub manager: Arc<StrategyManager>,
    pub credentials: Arc<dyn CredentialSource>,
    pub upstream: UpstreamClient,
    pub last_activity_unix_ms: Arc<AtomicU64>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route(
            "/v1/messages",
            post(
                |s: State<GatewayState>, q: Query<ProviderQuery>, b: Json<Value>| {
                    proxy(s, q, b, "/v1/messages")
                },
            ),
        )
        .route(
            "/v1/chat/completions",
            post(
                |s: State<GatewayState>, q: Query<ProviderQuery>, b: Json<Value>| {
                    proxy(s, q, b, "/v1/chat/completions")
                },
            ),
        )
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct ProviderQuery {
    provider: String,
    model: Option<String>,
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

async fn status(State(state): State<GatewayState>) -> Json<Value> {
    let cfg = state.cfg.read();
    let mut providers = serde_json::Map::new();
    for (name, entry) in cfg.providers.iter() {
        let strategy = match state.manager.get_strategy(name) {
            Ok(s) => s,
            Err(e) => {
                providers.insert(name.clone(), json!({ "error": e.to_string() }));
                continue;
            }
        };
        let pool = state.credentials.pool(name);
        let outcome = strategy
            .select(&pool, &SelectionContext::new(name.clone()))
            .unwrap_or_else(|_| SelectionOutcome::empty());
        providers.insert(
            name.clone(),
            json!({
                "displayName": entry.display_name,
                "disabled": entry.disabled,
                "poolSize": pool.len(),
                "wouldSelect": outcome.credential.map(|c| c.id),
                "fallbackLevel": outcome.fallback_level,
            }),
        );
    }
    Json(json!({ "providers": providers }))
}

async fn proxy(
    State(state): State<GatewayState>,
    Query(q): Query<ProviderQuery>,
    Json(body): Json<Value>,
    path: &'static str,
) -> Response {
    state
        .last_activity_unix_ms
        .store(crate::selection::now_unix_ms(), Ordering::Relaxed);

    let pool = state.credentials.pool(&q.provider);
    let strategy = match state.manager.get_strategy(&q.provider) {
        Ok(s) => s,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let mut ctx = SelectionContext::new(q.provider.clone());
    if let Some(model) = q.model.clone() {
        ctx = ctx.with_model(model);
    }
    if let Some(session) = q.session_id.or(q.conversation_id) {
        ctx = ctx.with_session(session);
    }

    let outcome = match strategy.select(&pool, &ctx) {
        Ok(o) => o,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let Some(credential) = outcome.credential else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no credential available for provider" })),
        )
            .into_response();
    };

    let (base_url, api_key) = match state.cfg.read().providers.get(&q.provider) {
        Some(entry) => (entry.base_url.clone(), entry.api_key.clone()),
        None => return (StatusCode::NOT_FOUND, "unknown provider").into_response(),
    };

    match state
        .upstream
        .post_json(&base_url, path, &body, api_key.as_deref(), 30)
        .await
    {
        Ok((status, upstream_body)) => {
            match status {
                200..=299 => strategy.on_success(credential.id),
                429 => {
                    let reset_ms = upstream_body
                        .get("resetMs")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    strategy.on_rate_limit(credential.id, reset_ms);
                }
                401 | 403 => strategy.on_failure(credential.id, "auth_error"),
                _ => strategy.on_failure(credential.id, "api_error"),
            }
            let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (code, Json(upstream_body)).into_response()
        }
        Err(e) => {
            strategy.on_failure(credential.id, "network_error");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}
