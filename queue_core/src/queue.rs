use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info};

use crate::error::Rejection;
use crate::events::{EventBus, PipelineEvent};
use crate::message::{spoken_length, MessageState, QueuedMessage, SynthesisParams};
use crate::validation::{validate_text, MAX_TEXT_LENGTH};
use crate::voice::{extract_voice, VoiceCatalog, VoiceExtractionMode};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Voice used when a message carries no explicit tag
    pub default_voice: String,
    pub extraction_mode: VoiceExtractionMode,
    /// Parameters stamped onto every accepted message
    pub params: SynthesisParams,
    pub max_text_length: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_voice: "default".to_string(),
            extraction_mode: VoiceExtractionMode::Bracket,
            params: SynthesisParams::default(),
            max_text_length: MAX_TEXT_LENGTH,
        }
    }
}

/// Number of live messages per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub synthesizing: usize,
    pub waiting_for_cache: usize,
    pub ready: usize,
    pub playing: usize,
    /// How long the oldest live message has been in the queue
    pub oldest_age_ms: u64,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.queued + self.synthesizing + self.waiting_for_cache + self.ready + self.playing
    }
}

#[derive(Default)]
struct QueueState {
    /// Every live message, ordered by sequence number
    messages: BTreeMap<u64, QueuedMessage>,
    /// Lowercased voice -> sequence numbers still waiting to be batched
    voice_queues: HashMap<String, VecDeque<u64>>,
}

impl QueueState {
    fn push_voice(&mut self, voice: &str, seq: u64) {
        let fifo = self.voice_queues.entry(voice.to_lowercase()).or_default();
        if fifo.contains(&seq) {
            return;
        }
        // keep FIFO order equal to arrival order
        let pos = fifo.partition_point(|&s| s < seq);
        fifo.insert(pos, seq);
    }

    fn drop_from_voice(&mut self, voice: &str, seq: u64) {
        let key = voice.to_lowercase();
        if let Some(fifo) = self.voice_queues.get_mut(&key) {
            fifo.retain(|&s| s != seq);
            if fifo.is_empty() {
                self.voice_queues.remove(&key);
            }
        }
    }

    /// Pop FIFO heads that are no longer live and queued.
    fn prune_heads(&mut self) {
        let messages = &self.messages;
        self.voice_queues.retain(|_, fifo| {
            while let Some(&head) = fifo.front() {
                match messages.get(&head) {
                    Some(m) if m.state == MessageState::Queued => break,
                    _ => {
                        fifo.pop_front();
                    }
                }
            }
            !fifo.is_empty()
        });
    }
}

/// Per-voice FIFOs with a single global order.
///
/// Batches are taken from one voice at a time, always the voice whose head is
/// the oldest queued message. Playback order is the sequence order, enforced
/// by [`MessageQueue::next_ready_message`].
pub struct MessageQueue {
    config: QueueConfig,
    voices: RwLock<VoiceCatalog>,
    state: Mutex<QueueState>,
    next_sequence: AtomicU64,
    events: EventBus,
    activity: Arc<Notify>,
    ready: Arc<Notify>,
    last_activity: Mutex<Option<Instant>>,
}

impl MessageQueue {
    pub fn new(config: QueueConfig, voices: VoiceCatalog) -> Self {
        Self::with_event_bus(config, voices, EventBus::default())
    }

    pub fn with_event_bus(config: QueueConfig, voices: VoiceCatalog, events: EventBus) -> Self {
        Self {
            config,
            voices: RwLock::new(voices),
            state: Mutex::new(QueueState::default()),
            next_sequence: AtomicU64::new(1),
            events,
            activity: Arc::new(Notify::new()),
            ready: Arc::new(Notify::new()),
            last_activity: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Accept a chat line, returning its sequence number.
    ///
    /// Unknown voices emit [`PipelineEvent::InvalidVoice`]. A missing prefix
    /// when one is required is a silent drop.
    pub fn enqueue(
        &self,
        text: &str,
        username: &str,
        require_voice_prefix: bool,
    ) -> Result<u64, Rejection> {
        validate_text(text, self.config.max_text_length)?;

        let (requested, resolved, cleaned) = {
            let catalog = self.voices.read().unwrap_or_else(PoisonError::into_inner);
            let (tag, cleaned) = extract_voice(text, self.config.extraction_mode, &catalog);
            if tag.is_none() && require_voice_prefix {
                debug!(username, "Dropping message without voice prefix");
                return Err(Rejection::MissingVoicePrefix);
            }
            let requested = tag.unwrap_or(&self.config.default_voice).to_string();
            let resolved = catalog.resolve(&requested).map(str::to_string);
            (requested, resolved, cleaned.to_string())
        };

        let Some(voice) = resolved else {
            info!(voice = %requested, username, "Rejected message for unknown voice");
            self.events.emit(PipelineEvent::InvalidVoice {
                voice: requested.clone(),
                username: username.to_string(),
            });
            return Err(Rejection::InvalidVoice(requested));
        };

        if cleaned.is_empty() {
            return Err(Rejection::EmptyText);
        }

        let seq = {
            let mut state = self.lock();
            let seq = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            let message = QueuedMessage::new(
                seq,
                text,
                cleaned.clone(),
                voice.clone(),
                username,
                self.config.params.clone(),
            );
            state.push_voice(&voice, seq);
            state.messages.insert(seq, message);
            seq
        };

        debug!(seq, voice = %voice, "Enqueued message");
        self.events.emit(PipelineEvent::MessageAdded {
            seq,
            voice,
            username: username.to_string(),
            text: cleaned,
        });
        self.touch();
        self.activity.notify_one();
        Ok(seq)
    }

    /// Dequeue up to `max_count` messages from the voice whose head is the
    /// oldest queued message.
    ///
    /// Length is measured with [`spoken_length`]; the first message is always
    /// taken. Returned messages remain `Queued` until the caller moves them.
    pub fn next_batch(&self, max_count: usize, max_text_length: usize) -> Vec<QueuedMessage> {
        let mut state = self.lock();
        state.prune_heads();

        let Some(voice) = state
            .voice_queues
            .iter()
            .filter_map(|(voice, fifo)| fifo.front().map(|&head| (head, voice)))
            .min_by_key(|(head, _)| *head)
            .map(|(_, voice)| voice.clone())
        else {
            return Vec::new();
        };

        let mut batch = Vec::new();
        let mut total_length = 0usize;
        let state = &mut *state;
        if let Some(fifo) = state.voice_queues.get_mut(&voice) {
            while batch.len() < max_count.max(1) {
                let Some(&seq) = fifo.front() else { break };
                let Some(message) = state.messages.get(&seq) else {
                    fifo.pop_front();
                    continue;
                };
                if message.state != MessageState::Queued {
                    fifo.pop_front();
                    continue;
                }
                let length = spoken_length(&message.cleaned_text);
                if !batch.is_empty() && total_length + length > max_text_length {
                    break;
                }
                total_length += length;
                fifo.pop_front();
                batch.push(message.clone());
            }
            if fifo.is_empty() {
                state.voice_queues.remove(&voice);
            }
        }
        batch
    }

    /// Lowest-sequence `Ready` message, provided nothing older is still
    /// unresolved.
    pub fn next_ready_message(&self) -> Option<QueuedMessage> {
        let state = self.lock();
        for message in state.messages.values() {
            if message.state.is_unresolved() {
                return None;
            }
            if message.state == MessageState::Ready {
                return Some(message.clone());
            }
        }
        None
    }

    /// Move a message to `new_state`. `Done` drops it from the live set.
    /// Returns false if the message is gone.
    pub fn update_state(&self, seq: u64, new_state: MessageState) -> bool {
        if new_state == MessageState::Done {
            return self.remove_message(seq).is_some();
        }
        {
            let mut state = self.lock();
            let Some(message) = state.messages.get_mut(&seq) else {
                return false;
            };
            message.transition(new_state);
        }
        self.after_transition(seq, new_state);
        true
    }

    /// Attach the resolved audio and mark the message `Ready`.
    pub fn mark_ready(&self, seq: u64, audio_file_path: Option<PathBuf>, cache_hit: bool) -> bool {
        {
            let mut state = self.lock();
            let Some(message) = state.messages.get_mut(&seq) else {
                return false;
            };
            message.audio_file_path = audio_file_path;
            message.was_cache_hit = cache_hit;
            message.transition(MessageState::Ready);
        }
        self.after_transition(seq, MessageState::Ready);
        true
    }

    /// Force a message to `Done` and drop it.
    pub fn remove_message(&self, seq: u64) -> Option<QueuedMessage> {
        let removed = {
            let mut state = self.lock();
            let mut message = state.messages.remove(&seq)?;
            state.drop_from_voice(&message.voice_name, seq);
            message.transition(MessageState::Done);
            message
        };
        self.events.emit(PipelineEvent::StateChanged {
            seq,
            state: MessageState::Done,
        });
        // a removed blocker may unblock an already-ready successor
        self.ready.notify_one();
        Some(removed)
    }

    /// Return messages to `Queued` and back into their voice FIFO.
    pub fn requeue(&self, seqs: &[u64]) -> usize {
        let mut requeued = Vec::with_capacity(seqs.len());
        {
            let mut state = self.lock();
            for &seq in seqs {
                let Some(message) = state.messages.get_mut(&seq) else {
                    continue;
                };
                message.transition(MessageState::Queued);
                let voice = message.voice_name.clone();
                state.push_voice(&voice, seq);
                requeued.push(seq);
            }
        }
        for &seq in &requeued {
            self.events.emit(PipelineEvent::StateChanged {
                seq,
                state: MessageState::Queued,
            });
        }
        if !requeued.is_empty() {
            self.activity.notify_one();
        }
        requeued.len()
    }

    /// Messages currently parked on another message's synthesis
    pub fn waiting_messages(&self) -> Vec<QueuedMessage> {
        self.lock()
            .messages
            .values()
            .filter(|m| m.state == MessageState::WaitingForCache)
            .cloned()
            .collect()
    }

    pub fn get(&self, seq: u64) -> Option<QueuedMessage> {
        self.lock().messages.get(&seq).cloned()
    }

    /// All live messages in sequence order
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.lock().messages.values().cloned().collect()
    }

    pub fn counts(&self) -> QueueCounts {
        let state = self.lock();
        let mut counts = QueueCounts::default();
        for message in state.messages.values() {
            match message.state {
                MessageState::Queued => counts.queued += 1,
                MessageState::Synthesizing => counts.synthesizing += 1,
                MessageState::WaitingForCache => counts.waiting_for_cache += 1,
                MessageState::Ready => counts.ready += 1,
                MessageState::Playing => counts.playing += 1,
                MessageState::Done => {}
            }
        }
        counts.oldest_age_ms = state
            .messages
            .values()
            .map(|m| m.enqueued_at.elapsed().as_millis() as u64)
            .max()
            .unwrap_or(0);
        counts
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every live message, reporting each as `Done`.
    pub fn clear(&self) -> usize {
        let removed: Vec<u64> = {
            let mut state = self.lock();
            state.voice_queues.clear();
            let seqs = state.messages.keys().copied().collect();
            state.messages.clear();
            seqs
        };
        for &seq in &removed {
            self.events.emit(PipelineEvent::StateChanged {
                seq,
                state: MessageState::Done,
            });
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "Cleared message queue");
        }
        removed.len()
    }

    /// Replace the known-voice catalog.
    pub fn set_voices(&self, voices: VoiceCatalog) {
        info!(count = voices.len(), "Updated voice catalog");
        *self.voices.write().unwrap_or_else(PoisonError::into_inner) = voices;
    }

    pub fn voices(&self) -> VoiceCatalog {
        self.voices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Fired on enqueue and requeue
    pub fn activity_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.activity)
    }

    /// Fired whenever a message may have become playable
    pub fn ready_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.ready)
    }

    /// Whether a message arrived within `window`
    pub fn recently_active(&self, window: Duration) -> bool {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|at| at.elapsed() <= window)
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    fn after_transition(&self, seq: u64, state: MessageState) {
        self.events
            .emit(PipelineEvent::StateChanged { seq, state });
        if state == MessageState::Ready {
            self.ready.notify_one();
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
