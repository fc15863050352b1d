use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Request, State},
    http::{HeaderValue, Method},
    middleware::Next,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use cache_core::{CacheStats, CacheStore};
use chrono::Utc;
use queue_core::{MessageQueue, QueuedMessage};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};
use tts_core::{PlaybackController, SynthesisOrchestrator};

use crate::config::RelayConfig;
use crate::error::ApiError;
use crate::metrics::{IngestMetrics, StatsResponse};
use crate::validation::validate_message_request;

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<MessageQueue>,
    pub cache: CacheStore,
    pub orchestrator: Arc<SynthesisOrchestrator>,
    pub playback: Arc<PlaybackController>,
    pub metrics: IngestMetrics,
    pub request_count: Arc<AtomicU64>,
    pub started: Instant,
    pub config: RelayConfig,
}

#[derive(Deserialize)]
pub struct MessageRequest {
    pub text: String,
    pub username: Option<String>,
}

#[derive(Serialize)]
pub struct MessageAccepted {
    pub sequence_number: u64,
}

#[derive(Serialize)]
pub struct ClearedResponse {
    pub cleared: usize,
}

#[derive(Serialize)]
pub struct SkipResponse {
    pub skipped: Option<u64>,
}

#[derive(Serialize)]
pub struct AbortResponse {
    pub aborted: bool,
}

fn cors_layer(config: &RelayConfig) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .flatten()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();

    let layer = CorsLayer::new()
        .allow_methods(methods)
        .allow_headers(Any)
        .allow_credentials(false);
    if origins.is_empty() {
        if config.cors_allowed_origins.is_some() {
            warn!("CORS_ALLOWED_ORIGINS has no valid origin, allowing all origins");
        }
        layer.allow_origin(Any)
    } else {
        info!("CORS configured for {} origin(s)", origins.len());
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let header = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = header.clone() {
        request.headers_mut().insert("x-request-id", value);
    }
    let mut response = next.run(request).await;
    if let Some(value) = header {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn count_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    next.run(request).await
}

/// Control and inspection API, with request ids, tracing, timeouts and CORS.
pub fn create_router(state: AppState) -> Router {
    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(state.config.request_timeout()))
        .layer(cors_layer(&state.config))
        .into_inner();

    Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(health_check))
        .route("/voices", get(list_voices))
        .route(
            "/messages",
            get(list_messages).post(submit_message).delete(clear_messages),
        )
        .route("/messages/{seq}", get(get_message))
        .route("/playback/skip", post(skip_playback))
        .route("/synthesis/abort", post(abort_synthesis))
        .route("/cache", get(cache_stats).delete(clear_cache))
        .route("/cache/flush", post(flush_cache))
        .route("/stats", get(stats))
        .layer(axum::middleware::from_fn_with_state(state.clone(), count_requests))
        .layer(axum::middleware::from_fn(add_request_id))
        .layer(middleware_stack)
        .with_state(state)
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn list_voices(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.queue.voices().names())
}

pub async fn list_messages(State(state): State<AppState>) -> Json<Vec<QueuedMessage>> {
    Json(state.queue.snapshot())
}

pub async fn get_message(
    State(state): State<AppState>,
    Path(seq): Path<u64>,
) -> Result<Json<QueuedMessage>, ApiError> {
    state
        .queue
        .get(seq)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No message with sequence number {seq}")))
}

/// Enqueue a message as if it came from chat. The reward filter does not
/// apply here.
pub async fn submit_message(
    State(state): State<AppState>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<MessageAccepted>, ApiError> {
    let username = req.username.unwrap_or_else(|| "api".to_string());
    validate_message_request(&req.text, &username)?;

    state.metrics.record_received();
    let outcome = state
        .queue
        .enqueue(&req.text, username.trim(), state.config.require_voice_prefix);
    state.metrics.record_outcome(&outcome);

    let sequence_number = outcome?;
    Ok(Json(MessageAccepted { sequence_number }))
}

pub async fn clear_messages(State(state): State<AppState>) -> Json<ClearedResponse> {
    let cleared = state.queue.clear();
    info!("Cleared {} queued message(s)", cleared);
    Json(ClearedResponse { cleared })
}

pub async fn skip_playback(State(state): State<AppState>) -> Json<SkipResponse> {
    Json(SkipResponse {
        skipped: state.playback.skip(),
    })
}

pub async fn abort_synthesis(State(state): State<AppState>) -> Json<AbortResponse> {
    Json(AbortResponse {
        aborted: state.orchestrator.abort_current().await,
    })
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

pub async fn clear_cache(State(state): State<AppState>) -> Json<ClearedResponse> {
    let cleared = state.cache.clear();
    info!("Cleared {} cached file(s)", cleared);
    Json(ClearedResponse { cleared })
}

/// Persist the cache index now instead of waiting for the debounce.
pub async fn flush_cache(State(state): State<AppState>) -> Result<Json<CacheStats>, ApiError> {
    state.cache.flush()?;
    Ok(Json(state.cache.stats()))
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        timestamp: Utc::now(),
        uptime_seconds: state.started.elapsed().as_secs(),
        request_count: state.request_count.load(Ordering::Relaxed),
        ingest: state.metrics.snapshot(),
        queue: state.queue.counts(),
        now_playing: state.playback.current(),
        synthesis: state.orchestrator.stats(),
        cache: state.cache.stats(),
    })
}
