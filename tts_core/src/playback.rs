use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use cache_core::CacheStore;
use queue_core::{MessageQueue, MessageState, PipelineEvent, QueuedMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::player::{AudioPlayer, CompletionCallback};

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub global_volume: f32,
    /// Lowercased voice name -> volume, multiplied with the global volume
    pub voice_volumes: HashMap<String, f32>,
    /// Minimum gap between the end of one message and the start of the next
    pub inter_message_delay: Duration,
    pub active_poll_interval: Duration,
    pub idle_poll_interval: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            global_volume: 1.0,
            voice_volumes: HashMap::new(),
            inter_message_delay: Duration::from_millis(500),
            active_poll_interval: Duration::from_millis(50),
            idle_poll_interval: Duration::from_millis(250),
        }
    }
}

impl PlaybackConfig {
    pub fn volume_for(&self, voice: &str) -> f32 {
        let voice_volume = self
            .voice_volumes
            .get(&voice.to_lowercase())
            .copied()
            .unwrap_or(1.0);
        (voice_volume * self.global_volume).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone)]
struct CurrentPlayback {
    seq: u64,
    cache_key: String,
    finished: Arc<AtomicBool>,
}

#[derive(Default)]
struct PlaybackState {
    current: Option<CurrentPlayback>,
    last_completed: Option<Instant>,
}

struct Shared {
    queue: Arc<MessageQueue>,
    cache: CacheStore,
    state: Mutex<PlaybackState>,
}

impl Shared {
    /// Release a playback exactly once. `played` playbacks restart the
    /// inter-message delay clock.
    fn finish(&self, current: &CurrentPlayback, played: bool) {
        if current.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cache.unpin(&current.cache_key);
        {
            let mut state = self.lock();
            if state.current.as_ref().map(|c| c.seq) == Some(current.seq) {
                state.current = None;
            }
            if played {
                state.last_completed = Some(Instant::now());
            }
        }
        self.queue.update_state(current.seq, MessageState::Done);
        self.queue
            .events()
            .emit(PipelineEvent::PlaybackFinished { seq: current.seq });
        debug!(seq = current.seq, "Playback finished");
    }

    fn lock(&self) -> MutexGuard<'_, PlaybackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Plays ready messages one at a time, in sequence order.
pub struct PlaybackController {
    shared: Arc<Shared>,
    player: Arc<dyn AudioPlayer>,
    config: PlaybackConfig,
}

impl PlaybackController {
    pub fn new(
        queue: Arc<MessageQueue>,
        cache: CacheStore,
        player: Arc<dyn AudioPlayer>,
        config: PlaybackConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue,
                cache,
                state: Mutex::new(PlaybackState::default()),
            }),
            player,
            config,
        }
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Sequence number of the message being played
    pub fn current(&self) -> Option<u64> {
        self.shared.lock().current.as_ref().map(|c| c.seq)
    }

    pub fn is_playing(&self) -> bool {
        self.current().is_some()
    }

    /// Start the next message if the player is free and the delay has
    /// elapsed. Returns the sequence number started.
    pub fn try_play_next(&self) -> Option<u64> {
        let stale = {
            let state = self.shared.lock();
            match &state.current {
                Some(current) if self.player.is_idle() => Some(current.clone()),
                Some(_) => return None,
                None => None,
            }
        };
        if let Some(current) = stale {
            warn!(seq = current.seq, "Player idle without completion; releasing message");
            self.shared.finish(&current, true);
        }

        if let Some(at) = self.shared.lock().last_completed {
            if at.elapsed() < self.config.inter_message_delay {
                return None;
            }
        }

        let message = self.shared.queue.next_ready_message()?;
        self.play_message(message)
    }

    /// Resolve audio, pin it, mark the message `Playing` and start the player.
    pub fn play_message(&self, message: QueuedMessage) -> Option<u64> {
        let seq = message.sequence_number;
        let key = message.cache_key.clone();

        // pin first so eviction cannot remove the file between lookup and start
        self.shared.cache.pin(&key);

        let Some(path) = self.resolve_audio(&message) else {
            warn!(seq, key = %key, "No audio for ready message; dropping");
            self.shared.cache.unpin(&key);
            self.shared.queue.remove_message(seq);
            return None;
        };

        if !self.shared.queue.update_state(seq, MessageState::Playing) {
            self.shared.cache.unpin(&key);
            return None;
        }

        let current = CurrentPlayback {
            seq,
            cache_key: key,
            finished: Arc::new(AtomicBool::new(false)),
        };
        self.shared.lock().current = Some(current.clone());

        let volume = self.config.volume_for(&message.voice_name);
        let on_complete: CompletionCallback = {
            let shared = Arc::clone(&self.shared);
            let current = current.clone();
            Arc::new(move || shared.finish(&current, true))
        };

        self.shared.queue.events().emit(PipelineEvent::PlaybackStarted {
            seq,
            voice: message.voice_name.clone(),
        });
        match self.player.start(&path, volume, on_complete) {
            Ok(()) => {
                info!(
                    seq,
                    voice = %message.voice_name,
                    cache_hit = message.was_cache_hit,
                    queued_ms = message.enqueued_at.elapsed().as_millis() as u64,
                    "Playing message"
                );
                Some(seq)
            }
            Err(e) => {
                warn!(seq, error = %e, "Failed to start playback");
                self.shared.finish(&current, false);
                None
            }
        }
    }

    /// Stop the current message and let the next one start immediately.
    pub fn skip(&self) -> Option<u64> {
        let current = self.shared.lock().current.clone();
        self.player.stop();
        if let Some(current) = &current {
            self.shared.finish(current, true);
        }
        self.shared.lock().last_completed = None;
        self.shared.queue.ready_signal().notify_one();
        current.map(|c| c.seq)
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Playback loop started");
        let ready = self.shared.queue.ready_signal();

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            self.try_play_next();

            let delay = if self.is_playing() || !self.shared.queue.is_empty() {
                self.config.active_poll_interval
            } else {
                self.config.idle_poll_interval
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = ready.notified() => {}
            }
        }

        let current = self.shared.lock().current.clone();
        if let Some(current) = current {
            self.player.stop();
            self.shared.finish(&current, false);
        }
        info!("Playback loop stopped");
    }

    /// Only audio the cache still indexes is played. The lookup also counts
    /// the play so the entry survives the compress phase.
    fn resolve_audio(&self, message: &QueuedMessage) -> Option<PathBuf> {
        let path = self.shared.cache.get(&message.cache_key)?;
        if message.audio_file_path.as_ref().is_some_and(|p| *p != path) {
            debug!(seq = message.sequence_number, "Ready path differs from cache; using cache");
        }
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    use cache_core::CacheConfig;
    use queue_core::{QueueConfig, VoiceCatalog};
    use tempfile::TempDir;

    use super::*;

    /// Records starts; the test decides when playback completes.
    #[derive(Default)]
    struct ManualPlayer {
        started: Mutex<Vec<(PathBuf, f32)>>,
        callback: Mutex<Option<CompletionCallback>>,
        idle: AtomicBool,
        fail: AtomicBool,
        stops: AtomicUsize,
    }

    impl ManualPlayer {
        fn complete(&self) {
            self.idle.store(true, Ordering::SeqCst);
            let cb = self.callback.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb();
            }
        }
    }

    impl AudioPlayer for ManualPlayer {
        fn start(&self, path: &Path, volume: f32, on_complete: CompletionCallback) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("no audio device");
            }
            self.started.lock().unwrap().push((path.to_path_buf(), volume));
            *self.callback.lock().unwrap() = Some(on_complete);
            self.idle.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.idle.store(true, Ordering::SeqCst);
        }

        fn is_idle(&self) -> bool {
            self.idle.load(Ordering::SeqCst)
        }
    }

    struct Fixture {
        queue: Arc<MessageQueue>,
        cache: CacheStore,
        player: Arc<ManualPlayer>,
        controller: PlaybackController,
        _dir: TempDir,
    }

    fn fixture(config: PlaybackConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let cache = CacheStore::open(CacheConfig::new(dir.path())).unwrap();
        let queue = Arc::new(MessageQueue::new(
            QueueConfig {
                default_voice: "alice".to_string(),
                ..QueueConfig::default()
            },
            VoiceCatalog::new(["alice", "bob"]),
        ));
        let player = Arc::new(ManualPlayer {
            idle: AtomicBool::new(true),
            ..ManualPlayer::default()
        });
        let controller =
            PlaybackController::new(Arc::clone(&queue), cache.clone(), player.clone(), config);
        Fixture {
            queue,
            cache,
            player,
            controller,
            _dir: dir,
        }
    }

    fn no_delay() -> PlaybackConfig {
        PlaybackConfig {
            inter_message_delay: Duration::ZERO,
            ..PlaybackConfig::default()
        }
    }

    /// Enqueue `text` and make it ready with cached audio.
    fn ready(f: &Fixture, text: &str) -> (u64, String) {
        let seq = f.queue.enqueue(text, "u", false).unwrap();
        let key = f.queue.get(seq).unwrap().cache_key;
        let path = f.cache.put(&key, b"audio").unwrap();
        f.queue.mark_ready(seq, Some(path), false);
        (seq, key)
    }

    #[test]
    fn test_volume_is_voice_times_global() {
        let config = PlaybackConfig {
            global_volume: 0.5,
            voice_volumes: HashMap::from([("bob".to_string(), 0.5), ("loud".to_string(), 4.0)]),
            ..PlaybackConfig::default()
        };
        assert_eq!(config.volume_for("alice"), 0.5);
        assert_eq!(config.volume_for("Bob"), 0.25);
        assert_eq!(config.volume_for("loud"), 1.0);
    }

    #[test]
    fn test_plays_and_pins_then_completes() {
        let f = fixture(no_delay());
        let (seq, key) = ready(&f, "hello");

        assert_eq!(f.controller.try_play_next(), Some(seq));
        assert!(f.cache.is_pinned(&key));
        assert_eq!(f.queue.get(seq).unwrap().state, MessageState::Playing);
        // a second call while busy is a no-op
        assert_eq!(f.controller.try_play_next(), None);

        f.player.complete();
        assert!(!f.cache.is_pinned(&key));
        assert!(f.queue.get(seq).is_none());
        assert!(!f.controller.is_playing());
    }

    #[test]
    fn test_completion_is_idempotent() {
        let f = fixture(no_delay());
        let (a, _) = ready(&f, "one");
        let (b, key_b) = ready(&f, "two");

        f.controller.try_play_next();
        f.player.complete();
        assert_eq!(f.controller.try_play_next(), Some(b));

        // late duplicate callback for `a` must not touch `b`
        let stale: CompletionCallback = {
            let shared = Arc::clone(&f.controller.shared);
            let current = CurrentPlayback {
                seq: a,
                cache_key: "unused".to_string(),
                finished: Arc::new(AtomicBool::new(true)),
            };
            Arc::new(move || shared.finish(&current, true))
        };
        stale();
        assert_eq!(f.controller.current(), Some(b));
        assert!(f.cache.is_pinned(&key_b));

        f.player.complete();
        f.player.complete();
        assert!(f.queue.is_empty());
        assert!(!f.cache.is_pinned(&key_b));
    }

    #[test]
    fn test_plays_in_sequence_order() {
        let f = fixture(no_delay());
        let first = f.queue.enqueue("[alice] first", "u", false).unwrap();
        let (second, _) = ready(&f, "[bob] second");

        // seq 1 still unresolved
        assert_eq!(f.controller.try_play_next(), None);

        let key = f.queue.get(first).unwrap().cache_key;
        let path = f.cache.put(&key, b"audio").unwrap();
        f.queue.mark_ready(first, Some(path), false);

        assert_eq!(f.controller.try_play_next(), Some(first));
        f.player.complete();
        assert_eq!(f.controller.try_play_next(), Some(second));
    }

    #[test]
    fn test_inter_message_delay() {
        let f = fixture(PlaybackConfig {
            inter_message_delay: Duration::from_secs(60),
            ..PlaybackConfig::default()
        });
        ready(&f, "one");
        let (b, _) = ready(&f, "two");

        f.controller.try_play_next();
        f.player.complete();
        assert_eq!(f.controller.try_play_next(), None);

        // skip zeroes the delay clock
        f.controller.skip();
        assert_eq!(f.controller.try_play_next(), Some(b));
    }

    #[test]
    fn test_missed_completion_self_heals() {
        let f = fixture(no_delay());
        let (a, key_a) = ready(&f, "one");
        let (b, _) = ready(&f, "two");

        f.controller.try_play_next();
        // player went idle but never called back
        f.player.idle.store(true, Ordering::SeqCst);

        assert_eq!(f.controller.try_play_next(), Some(b));
        assert!(f.queue.get(a).is_none());
        assert!(!f.cache.is_pinned(&key_a));
    }

    #[test]
    fn test_start_failure_drops_message() {
        let f = fixture(no_delay());
        let (seq, key) = ready(&f, "hello");
        f.player.fail.store(true, Ordering::SeqCst);

        assert_eq!(f.controller.try_play_next(), None);
        assert!(f.queue.get(seq).is_none());
        assert!(!f.cache.is_pinned(&key));
        assert!(!f.controller.is_playing());
    }

    #[test]
    fn test_falls_back_to_cache_lookup() {
        let f = fixture(no_delay());
        let seq = f.queue.enqueue("hello", "u", false).unwrap();
        let key = f.queue.get(seq).unwrap().cache_key;
        let path = f.cache.put(&key, b"audio").unwrap();
        f.queue
            .mark_ready(seq, Some(PathBuf::from("/nonexistent/audio.wav")), false);

        assert_eq!(f.controller.try_play_next(), Some(seq));
        assert_eq!(f.player.started.lock().unwrap()[0].0, path);
        assert_eq!(f.cache.entry(&key).unwrap().hit_count, 1);
    }

    #[test]
    fn test_unindexed_file_is_not_played() {
        let f = fixture(no_delay());
        let seq = f.queue.enqueue("hello", "u", false).unwrap();
        let key = f.queue.get(seq).unwrap().cache_key;
        // the file is still on disk but its index entry is gone
        let stray = f._dir.path().join("evicted.wav");
        std::fs::write(&stray, b"audio").unwrap();
        f.queue.mark_ready(seq, Some(stray), false);

        assert_eq!(f.controller.try_play_next(), None);
        assert!(f.player.started.lock().unwrap().is_empty());
        assert!(f.queue.get(seq).is_none());
        assert!(!f.cache.is_pinned(&key));
    }

    #[test]
    fn test_missing_audio_drops_message() {
        let f = fixture(no_delay());
        let seq = f.queue.enqueue("hello", "u", false).unwrap();
        let key = f.queue.get(seq).unwrap().cache_key;
        f.queue.mark_ready(seq, None, false);

        assert_eq!(f.controller.try_play_next(), None);
        assert!(f.queue.get(seq).is_none());
        assert!(!f.cache.is_pinned(&key));
    }

    #[test]
    fn test_skip_stops_player() {
        let f = fixture(no_delay());
        let (seq, key) = ready(&f, "hello");
        f.controller.try_play_next();

        assert_eq!(f.controller.skip(), Some(seq));
        assert_eq!(f.player.stops.load(Ordering::SeqCst), 1);
        assert!(!f.cache.is_pinned(&key));
        assert!(f.queue.is_empty());
    }
}
