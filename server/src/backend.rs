//! Synthesis backends the relay can drive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use queue_core::SynthesisParams;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tts_core::wav::{encode_wav, silence};
use tts_core::{BatchRequest, SynthesisBackend};

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    texts: &'a [String],
    voice: &'a str,
    params: &'a SynthesisParams,
}

#[derive(Deserialize)]
struct SynthesizeResponse {
    results: Vec<SynthesizedAudio>,
}

#[derive(Deserialize)]
struct SynthesizedAudio {
    index: usize,
    audio_base64: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VoicesResponse {
    Wrapped { voices: Vec<String> },
    Plain(Vec<String>),
}

/// Remote TTS server speaking JSON over HTTP.
pub struct HttpSynthesisBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    available: AtomicBool,
}

impl HttpSynthesisBackend {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            available: AtomicBool::new(true),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn request_batch(&self, request: &BatchRequest) -> anyhow::Result<HashMap<usize, Vec<u8>>> {
        let body = SynthesizeRequest {
            texts: &request.texts,
            voice: &request.voice,
            params: &request.params,
        };
        let response = self
            .authorized(self.client.post(self.url("/v1/synthesize")))
            .json(&body)
            .send()
            .await?
            .error_for_status()? // convert non-200 into error
            .json::<SynthesizeResponse>()
            .await?;

        let engine = base64::engine::general_purpose::STANDARD;
        let mut audio = HashMap::with_capacity(response.results.len());
        for result in response.results {
            if result.index >= request.texts.len() {
                warn!(index = result.index, "Backend returned audio for unknown index");
                continue;
            }
            let bytes = engine
                .decode(result.audio_base64.as_bytes())
                .with_context(|| format!("invalid base64 audio at index {}", result.index))?;
            audio.insert(result.index, bytes);
        }
        Ok(audio)
    }

    /// Call `GET /health` and update the availability flag.
    pub async fn check_health(&self) -> bool {
        let healthy = match self.client.get(self.url("/health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "Backend health check failed");
                false
            }
        };
        let was = self.available.swap(healthy, Ordering::Relaxed);
        if was != healthy {
            if healthy {
                info!(url = %self.base_url, "Synthesis backend available");
            } else {
                warn!(url = %self.base_url, "Synthesis backend unavailable");
            }
        }
        healthy
    }

    /// Poll health every `interval` until `shutdown`.
    pub fn spawn_health_monitor(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.check_health().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }
}

#[async_trait]
impl SynthesisBackend for HttpSynthesisBackend {
    async fn synthesize_batch(&self, request: &BatchRequest) -> Option<HashMap<usize, Vec<u8>>> {
        match self.request_batch(request).await {
            Ok(audio) => Some(audio),
            Err(e) => {
                warn!(voice = %request.voice, error = %e, "Synthesis request failed");
                None
            }
        }
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn abort_current(&self) {
        let result = self
            .authorized(self.client.post(self.url("/v1/abort")))
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(e) = result {
            warn!(error = %e, "Failed to abort backend inference");
        }
    }

    async fn list_voices(&self) -> Option<Vec<String>> {
        let result = async {
            let response = self
                .authorized(self.client.get(self.url("/v1/voices")))
                .send()
                .await?
                .error_for_status()?
                .json::<VoicesResponse>()
                .await?;
            Ok::<_, reqwest::Error>(response)
        }
        .await;
        match result {
            Ok(VoicesResponse::Wrapped { voices } | VoicesResponse::Plain(voices)) => Some(voices),
            Err(e) => {
                warn!(error = %e, "Failed to fetch backend voices");
                None
            }
        }
    }
}

/// Renders silence sized to the text. Used when no backend is configured.
#[derive(Debug, Clone)]
pub struct SilentBackend {
    sample_rate: u32,
    per_char: Duration,
}

impl Default for SilentBackend {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            per_char: Duration::from_millis(60),
        }
    }
}

impl SilentBackend {
    pub fn with_per_char(mut self, per_char: Duration) -> Self {
        self.per_char = per_char;
        self
    }
}

#[async_trait]
impl SynthesisBackend for SilentBackend {
    async fn synthesize_batch(&self, request: &BatchRequest) -> Option<HashMap<usize, Vec<u8>>> {
        let mut audio = HashMap::with_capacity(request.texts.len());
        for (index, text) in request.texts.iter().enumerate() {
            let length = self.per_char * text.chars().count() as u32;
            match encode_wav(&silence(length, self.sample_rate), self.sample_rate) {
                Ok(bytes) => {
                    audio.insert(index, bytes);
                }
                Err(e) => warn!(index, error = %e, "Failed to render silence"),
            }
        }
        Some(audio)
    }
}
