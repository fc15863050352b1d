//! Common utilities for integration tests

#![allow(dead_code)]

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use cache_core::CacheStore;
use queue_core::MessageQueue;
use server::backend::SilentBackend;
use server::metrics::IngestMetrics;
use server::{create_router, AppState, RelayConfig};
use tempfile::TempDir;
use tower::ServiceExt;
use tts_core::{HeadlessPlayer, PlaybackController, SynthesisOrchestrator};

/// App state over a temporary cache. No pipeline loop runs, so queued
/// messages stay put until a test drives them.
pub struct TestApp {
    pub state: AppState,
    _dir: TempDir,
}

impl TestApp {
    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }
}

pub fn create_test_app() -> TestApp {
    let dir = TempDir::new().expect("temp dir");
    let config = RelayConfig {
        cache_dir: dir.path().to_path_buf(),
        voices: Some("alice, bob".to_string()),
        default_voice: "alice".to_string(),
        playback_delay_ms: 0,
        ..RelayConfig::default()
    };

    let cache = CacheStore::open(config.cache_config()).expect("open cache");
    let catalog = config.voice_catalog().expect("voices").expect("voices set");
    let queue = Arc::new(MessageQueue::new(config.queue_config(), catalog));
    let backend = Arc::new(SilentBackend::default());
    let orchestrator = Arc::new(SynthesisOrchestrator::new(
        Arc::clone(&queue),
        cache.clone(),
        backend,
        config.orchestrator_config(),
    ));
    let playback = Arc::new(PlaybackController::new(
        Arc::clone(&queue),
        cache.clone(),
        Arc::new(HeadlessPlayer::new()),
        config.playback_config(),
    ));

    TestApp {
        state: AppState {
            queue,
            cache,
            orchestrator,
            playback,
            metrics: IngestMetrics::new(),
            request_count: Arc::new(AtomicU64::new(0)),
            started: Instant::now(),
            config,
        },
        _dir: dir,
    }
}

/// Send one request and return status plus parsed JSON (Null for non-JSON bodies).
pub async fn send(
    app: Router,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}
