//! Wires cache, queue, synthesis and playback together and owns their tasks.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use cache_core::CacheStore;
use queue_core::{EventBus, MessageQueue, PipelineEvent, VoiceCatalog};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tts_core::{AudioPlayer, PlaybackController, SynthesisBackend, SynthesisOrchestrator};

use crate::api::AppState;
use crate::config::RelayConfig;
use crate::metrics::IngestMetrics;
use crate::source::Ingest;

const EVENT_CAPACITY: usize = 256;
const CACHE_USAGE_WARN_PERCENT: f64 = 90.0;

pub struct Relay {
    config: RelayConfig,
    queue: Arc<MessageQueue>,
    cache: CacheStore,
    orchestrator: Arc<SynthesisOrchestrator>,
    playback: Arc<PlaybackController>,
    metrics: IngestMetrics,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    started: Instant,
}

impl Relay {
    /// Open the cache, build the pipeline and spawn its loops.
    pub async fn start(
        config: RelayConfig,
        backend: Arc<dyn SynthesisBackend>,
        player: Arc<dyn AudioPlayer>,
    ) -> anyhow::Result<Self> {
        let cache = CacheStore::open(config.cache_config())
            .with_context(|| format!("Failed to open cache at {}", config.cache_dir.display()))?;
        info!(
            "Audio cache at {} ({} entries, {:.1}% of {} MB)",
            config.cache_dir.display(),
            cache.len(),
            cache.usage_percent(),
            config.cache_max_mb
        );

        let voices = load_voices(&config, backend.as_ref()).await?;
        info!("Loaded {} voice(s): {}", voices.len(), voices.names().join(", "));

        let queue = Arc::new(MessageQueue::with_event_bus(
            config.queue_config(),
            voices,
            EventBus::new(EVENT_CAPACITY),
        ));
        let orchestrator = Arc::new(SynthesisOrchestrator::new(
            Arc::clone(&queue),
            cache.clone(),
            backend,
            config.orchestrator_config(),
        ));
        let playback = Arc::new(PlaybackController::new(
            Arc::clone(&queue),
            cache.clone(),
            player,
            config.playback_config(),
        ));

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(log_events(queue.subscribe(), shutdown.clone())));
        tasks.push(tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            let shutdown = shutdown.clone();
            async move { orchestrator.run(shutdown).await }
        }));
        tasks.push(tokio::spawn({
            let playback = Arc::clone(&playback);
            let shutdown = shutdown.clone();
            async move { playback.run(shutdown).await }
        }));

        Ok(Self {
            config,
            queue,
            cache,
            orchestrator,
            playback,
            metrics: IngestMetrics::new(),
            shutdown,
            tasks,
            started: Instant::now(),
        })
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Join `handle` during [`Relay::shutdown`].
    pub fn track(&mut self, handle: JoinHandle<()>) {
        self.tasks.push(handle);
    }

    /// Chat ingest sharing this relay's queue and counters.
    pub fn ingest(&self) -> Arc<Ingest> {
        Arc::new(Ingest::new(
            Arc::clone(&self.queue),
            self.config.reward_id.clone(),
            self.config.require_voice_prefix,
            self.metrics.clone(),
        ))
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            queue: Arc::clone(&self.queue),
            cache: self.cache.clone(),
            orchestrator: Arc::clone(&self.orchestrator),
            playback: Arc::clone(&self.playback),
            metrics: self.metrics.clone(),
            request_count: Arc::new(AtomicU64::new(0)),
            started: self.started,
            config: self.config.clone(),
        }
    }

    /// Stop every loop, waiting up to the configured timeout, then persist
    /// the cache index.
    pub async fn shutdown(self) {
        info!("Shutting down relay");
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout();
        self.shutdown.cancel();
        // cancelling already fails the local batch; this only tells the backend
        if tokio::time::timeout_at(deadline, self.orchestrator.abort_current())
            .await
            .is_err()
        {
            warn!("Backend did not acknowledge the abort in time");
        }

        for task in self.tasks {
            let abort = task.abort_handle();
            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => error!("Relay task failed: {}", e),
                Err(_) => {
                    warn!("Relay task did not stop in time; aborting");
                    abort.abort();
                }
            }
        }

        if let Err(e) = self.cache.flush() {
            error!("Failed to flush cache index: {}", e);
        }
        info!("Relay stopped");
    }
}

/// Configured voices win; otherwise ask the backend; otherwise only the
/// default voice is known.
async fn load_voices(
    config: &RelayConfig,
    backend: &dyn SynthesisBackend,
) -> anyhow::Result<VoiceCatalog> {
    if let Some(catalog) = config.voice_catalog()? {
        if !catalog.is_empty() {
            return Ok(catalog);
        }
        warn!("TTS_VOICES is set but names no voice");
    }
    if let Some(names) = backend.list_voices().await.filter(|n| !n.is_empty()) {
        return Ok(VoiceCatalog::new(names));
    }
    warn!(
        "No voice list available; only '{}' will be accepted",
        config.default_voice
    );
    Ok(VoiceCatalog::new([config.default_voice.as_str()]))
}

async fn log_events(
    mut events: tokio::sync::broadcast::Receiver<PipelineEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(PipelineEvent::MessageAdded { seq, voice, username, text }) => {
                info!(seq, %voice, %username, "Queued: {}", text);
            }
            Ok(PipelineEvent::InvalidVoice { voice, username }) => {
                warn!(%username, "Unknown voice '{}'", voice);
            }
            Ok(PipelineEvent::BatchCompleted { voice, succeeded, failed }) => {
                info!(%voice, succeeded, failed, "Batch completed");
            }
            Ok(PipelineEvent::PlaybackStarted { seq, voice }) => {
                info!(seq, %voice, "Playing");
            }
            Ok(PipelineEvent::CacheUsage { percent }) if percent >= CACHE_USAGE_WARN_PERCENT => {
                warn!("Audio cache at {:.1}% of its limit", percent);
            }
            Ok(event) => debug!(?event, "Pipeline event"),
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "Event logger lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tts_core::HeadlessPlayer;

    use super::*;
    use crate::backend::SilentBackend;

    fn config(dir: &TempDir) -> RelayConfig {
        RelayConfig {
            cache_dir: dir.path().to_path_buf(),
            voices: Some("alice, bob".to_string()),
            default_voice: "alice".to_string(),
            playback_delay_ms: 0,
            ..RelayConfig::default()
        }
    }

    fn silent() -> Arc<dyn SynthesisBackend> {
        Arc::new(SilentBackend::default().with_per_char(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_relay_speaks_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let relay = Relay::start(config(&dir), silent(), Arc::new(HeadlessPlayer::new()))
            .await
            .unwrap();
        let mut events = relay.queue().subscribe();

        let ingest = relay.ingest();
        let seq = ingest
            .ingest(&crate::source::ChatMessage::chat("viewer", "[bob] hello"))
            .unwrap()
            .unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(PipelineEvent::PlaybackFinished { seq: done }) = events.recv().await {
                    if done == seq {
                        break;
                    }
                }
            }
        })
        .await;
        assert!(finished.is_ok());
        assert!(relay.queue().is_empty());

        relay.shutdown().await;
        assert!(dir.path().join(cache_core::INDEX_FILE_NAME).exists());
    }

    /// Never answers a batch and takes minutes to acknowledge an abort.
    struct HungBackend;

    #[async_trait::async_trait]
    impl SynthesisBackend for HungBackend {
        async fn synthesize_batch(
            &self,
            _request: &tts_core::BatchRequest,
        ) -> Option<std::collections::HashMap<usize, Vec<u8>>> {
            std::future::pending().await
        }

        async fn abort_current(&self) {
            tokio::time::sleep(Duration::from_secs(120)).await;
        }
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded_with_batch_in_flight() {
        let dir = TempDir::new().unwrap();
        let config = RelayConfig {
            shutdown_timeout_secs: 1,
            ..config(&dir)
        };
        let relay = Relay::start(config, Arc::new(HungBackend), Arc::new(HeadlessPlayer::new()))
            .await
            .unwrap();
        let seq = relay
            .ingest()
            .ingest(&crate::source::ChatMessage::chat("viewer", "hello"))
            .unwrap()
            .unwrap();
        let key = relay.queue().get(seq).unwrap().cache_key;
        let orchestrator = Arc::clone(&relay.orchestrator);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !orchestrator.is_in_flight(&key) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let started = Instant::now();
        let stopped = tokio::time::timeout(Duration::from_secs(3), relay.shutdown()).await;
        assert!(stopped.is_ok());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!orchestrator.is_in_flight(&key));
    }

    #[tokio::test]
    async fn test_voice_fallback_to_default() {
        let dir = TempDir::new().unwrap();
        let config = RelayConfig {
            voices: None,
            ..config(&dir)
        };
        let voices = load_voices(&config, silent().as_ref()).await.unwrap();
        assert_eq!(voices.names(), vec!["alice".to_string()]);
    }
}
