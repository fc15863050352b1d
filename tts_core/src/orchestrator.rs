use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cache_core::CacheStore;
use futures::FutureExt;
use queue_core::{MessageQueue, MessageState, PipelineEvent, QueuedMessage};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{BatchRequest, SynthesisBackend};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_batch_size: usize,
    /// Budget in spoken-length units; see `queue_core::spoken_length`
    pub max_batch_text_length: usize,
    pub waiting_for_cache_timeout: Duration,
    pub active_poll_interval: Duration,
    pub idle_poll_interval: Duration,
    /// How long after the last enqueue the loop keeps polling fast
    pub activity_window: Duration,
    pub unavailable_retry_interval: Duration,
    /// Pause after a batch panicked
    pub failure_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 4,
            max_batch_text_length: 600,
            waiting_for_cache_timeout: Duration::from_secs(120),
            active_poll_interval: Duration::from_millis(100),
            idle_poll_interval: Duration::from_secs(1),
            activity_window: Duration::from_secs(10),
            unavailable_retry_interval: Duration::from_secs(2),
            failure_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default)]
pub struct OrchestratorStats {
    batches: AtomicU64,
    synthesized: AtomicU64,
    cache_hits: AtomicU64,
    deduplicated: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStatsSnapshot {
    pub batches: u64,
    pub synthesized: u64,
    pub cache_hits: u64,
    pub deduplicated: u64,
    pub failed: u64,
    pub timed_out: u64,
}

impl OrchestratorStats {
    pub fn snapshot(&self) -> OrchestratorStatsSnapshot {
        OrchestratorStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            synthesized: self.synthesized.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// What one pass of [`SynthesisOrchestrator::process_next_batch`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub voice: String,
    pub cache_hits: usize,
    pub deduplicated: usize,
    pub synthesized: usize,
    pub failed: usize,
}

enum BackendOutcome {
    Audio(std::collections::HashMap<usize, Vec<u8>>),
    Failed,
    Cancelled,
}

/// Releases in-flight keys when a batch ends, however it ends.
///
/// If the batch did not reach its normal commit point (panic or the future
/// was dropped) the batch's messages and their waiters are dropped too.
struct BatchGuard<'a> {
    owner: &'a SynthesisOrchestrator,
    keys: Vec<String>,
    seqs: Vec<u64>,
    committed: bool,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.owner.release_keys(&self.keys);
        *self.owner.current() = None;
        if self.committed {
            return;
        }
        warn!(count = self.seqs.len(), "Batch aborted; dropping its messages");
        for &seq in &self.seqs {
            self.owner.queue.remove_message(seq);
        }
        OrchestratorStats::add(&self.owner.stats.failed, self.seqs.len());
        let failed: HashSet<String> = self.keys.iter().cloned().collect();
        self.owner.resolve_waiting_with(&failed);
    }
}

/// Single worker turning queued messages into cached audio.
pub struct SynthesisOrchestrator {
    queue: Arc<MessageQueue>,
    cache: CacheStore,
    backend: Arc<dyn SynthesisBackend>,
    config: OrchestratorConfig,
    in_flight: Mutex<HashSet<String>>,
    current_batch: Mutex<Option<CancellationToken>>,
    stats: OrchestratorStats,
}

impl SynthesisOrchestrator {
    pub fn new(
        queue: Arc<MessageQueue>,
        cache: CacheStore,
        backend: Arc<dyn SynthesisBackend>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            queue,
            cache,
            backend,
            config,
            in_flight: Mutex::new(HashSet::new()),
            current_batch: Mutex::new(None),
            stats: OrchestratorStats::default(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn stats(&self) -> OrchestratorStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight().contains(key)
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Synthesis loop started");
        let activity = self.queue.activity_signal();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if !self.backend.is_available() {
                debug!("Synthesis backend unavailable; deferring");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.unavailable_retry_interval) => continue,
                }
            }

            let pass = AssertUnwindSafe(self.process_next_batch(&shutdown))
                .catch_unwind()
                .await;

            match pass {
                Ok(Some(_)) => tokio::task::yield_now().await,
                Ok(None) => {
                    self.resolve_waiting();
                    let delay = if self.queue.recently_active(self.config.activity_window) {
                        self.config.active_poll_interval
                    } else {
                        self.config.idle_poll_interval
                    };
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                        _ = activity.notified() => {}
                    }
                }
                Err(_) => {
                    error!("Synthesis batch panicked; backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.failure_backoff) => {}
                    }
                }
            }
        }
        info!("Synthesis loop stopped");
    }

    /// Take one batch from the queue and drive it to completion.
    ///
    /// Returns `None` when nothing was eligible.
    pub async fn process_next_batch(&self, shutdown: &CancellationToken) -> Option<BatchReport> {
        let batch = self
            .queue
            .next_batch(self.config.max_batch_size, self.config.max_batch_text_length);
        let first = batch.first()?;
        let mut report = BatchReport {
            voice: first.voice_name.clone(),
            ..BatchReport::default()
        };

        let mut to_synthesize: Vec<QueuedMessage> = Vec::with_capacity(batch.len());
        let mut claimed: Vec<String> = Vec::with_capacity(batch.len());
        for message in batch {
            let seq = message.sequence_number;
            if let Some(path) = self.cache.get(&message.cache_key) {
                debug!(seq, key = %message.cache_key, "Cache hit");
                self.queue.mark_ready(seq, Some(path), true);
                report.cache_hits += 1;
                continue;
            }
            if !self.in_flight().insert(message.cache_key.clone()) {
                debug!(seq, key = %message.cache_key, "Duplicate of in-flight synthesis");
                self.queue.update_state(seq, MessageState::WaitingForCache);
                report.deduplicated += 1;
                continue;
            }
            claimed.push(message.cache_key.clone());
            to_synthesize.push(message);
        }
        OrchestratorStats::add(&self.stats.cache_hits, report.cache_hits);
        OrchestratorStats::add(&self.stats.deduplicated, report.deduplicated);

        if to_synthesize.is_empty() {
            self.resolve_waiting();
            return Some(report);
        }

        let mut guard = BatchGuard {
            owner: self,
            keys: claimed,
            seqs: to_synthesize.iter().map(|m| m.sequence_number).collect(),
            committed: false,
        };

        for message in &to_synthesize {
            self.queue
                .update_state(message.sequence_number, MessageState::Synthesizing);
        }

        let request = self.build_request(&to_synthesize);
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.queue.events().emit(PipelineEvent::BatchStarted {
            voice: request.voice.clone(),
            count: request.texts.len(),
        });
        info!(voice = %request.voice, count = request.texts.len(), "Synthesizing batch");

        let outcome = self.call_backend(&request, shutdown).await;

        let mut failed_keys = HashSet::new();
        match outcome {
            BackendOutcome::Audio(mut audio) => {
                for (index, message) in to_synthesize.iter().enumerate() {
                    let seq = message.sequence_number;
                    let Some(bytes) = audio.remove(&index) else {
                        warn!(seq, "Backend returned no audio for message");
                        self.queue.remove_message(seq);
                        failed_keys.insert(message.cache_key.clone());
                        continue;
                    };
                    match self.cache.put(&message.cache_key, &bytes) {
                        Ok(path) => {
                            self.queue.mark_ready(seq, Some(path), false);
                            report.synthesized += 1;
                        }
                        Err(e) => {
                            error!(seq, error = %e, "Failed to store synthesized audio");
                            self.queue.remove_message(seq);
                            failed_keys.insert(message.cache_key.clone());
                        }
                    }
                }
            }
            BackendOutcome::Failed | BackendOutcome::Cancelled => {
                for message in &to_synthesize {
                    self.queue.remove_message(message.sequence_number);
                    failed_keys.insert(message.cache_key.clone());
                }
            }
        }
        report.failed = to_synthesize.len() - report.synthesized;
        OrchestratorStats::add(&self.stats.synthesized, report.synthesized);
        OrchestratorStats::add(&self.stats.failed, report.failed);

        guard.committed = true;
        drop(guard);

        self.resolve_waiting_with(&failed_keys);

        self.queue.events().emit(PipelineEvent::BatchCompleted {
            voice: report.voice.clone(),
            succeeded: report.synthesized,
            failed: report.failed,
        });
        self.queue.events().emit(PipelineEvent::CacheUsage {
            percent: self.cache.usage_percent(),
        });
        Some(report)
    }

    /// Settle `WaitingForCache` messages: resolve from cache, drop timed-out
    /// waiters, and requeue waiters whose leader is gone without a result.
    pub fn resolve_waiting(&self) {
        self.resolve_waiting_with(&HashSet::new());
    }

    /// Cancel the batch currently being synthesized, if any. The batch takes
    /// the normal failure path.
    pub async fn abort_current(&self) -> bool {
        let token = self.current().clone();
        match token {
            Some(token) => {
                info!("Aborting current synthesis batch");
                token.cancel();
                self.backend.abort_current().await;
                true
            }
            None => false,
        }
    }

    fn resolve_waiting_with(&self, failed_keys: &HashSet<String>) {
        let mut orphaned = Vec::new();
        for message in self.queue.waiting_messages() {
            let seq = message.sequence_number;
            let key = &message.cache_key;

            if failed_keys.contains(key) {
                debug!(seq, key = %key, "Dropping waiter of failed synthesis");
                self.queue.remove_message(seq);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if let Some(path) = self.cache.get(key) {
                self.queue.mark_ready(seq, Some(path), true);
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let waited = message
                .waiting_for_cache_since
                .map(|since| since.elapsed())
                .unwrap_or_default();
            if waited >= self.config.waiting_for_cache_timeout {
                warn!(seq, key = %key, waited_ms = waited.as_millis() as u64, "Waiter timed out");
                self.queue.remove_message(seq);
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if !self.is_in_flight(key) {
                orphaned.push(seq);
            }
        }
        if !orphaned.is_empty() {
            debug!(count = orphaned.len(), "Requeueing waiters without a leader");
            self.queue.requeue(&orphaned);
        }
    }

    fn build_request(&self, messages: &[QueuedMessage]) -> BatchRequest {
        let first = &messages[0];
        if messages.iter().any(|m| m.params != first.params) {
            debug!(
                voice = %first.voice_name,
                "Batch mixes synthesis parameters; using those of seq {}",
                first.sequence_number
            );
        }
        BatchRequest {
            voice: first.voice_name.clone(),
            texts: messages.iter().map(|m| m.cleaned_text.clone()).collect(),
            params: first.params.clone(),
        }
    }

    async fn call_backend(&self, request: &BatchRequest, shutdown: &CancellationToken) -> BackendOutcome {
        let token = shutdown.child_token();
        *self.current() = Some(token.clone());

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                warn!(voice = %request.voice, "Synthesis batch cancelled");
                BackendOutcome::Cancelled
            }
            result = self.backend.synthesize_batch(request) => match result {
                Some(audio) => BackendOutcome::Audio(audio),
                None => {
                    warn!(voice = %request.voice, "Synthesis batch failed");
                    BackendOutcome::Failed
                }
            },
        };

        *self.current() = None;
        outcome
    }

    fn release_keys(&self, keys: &[String]) {
        let mut in_flight = self.in_flight();
        for key in keys {
            in_flight.remove(key);
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.current_batch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
