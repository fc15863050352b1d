use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest
const CACHE_KEY_LEN: usize = 32;

/// Lifecycle of a queued utterance.
///
/// `Queued -> Synthesizing -> Ready -> Playing -> Done`, with the side branch
/// `Queued -> WaitingForCache -> Ready` for duplicates of an in-flight key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Queued,
    Synthesizing,
    WaitingForCache,
    Ready,
    Playing,
    Done,
}

impl MessageState {
    /// Still waiting on synthesis or on another message's synthesis
    pub fn is_unresolved(self) -> bool {
        matches!(
            self,
            MessageState::Queued | MessageState::Synthesizing | MessageState::WaitingForCache
        )
    }
}

/// Parameters that shape the synthesized audio. Every field feeds the
/// cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisParams {
    pub model: String,
    pub quantization: String,
    pub do_sample: bool,
    /// Empty means the backend's default
    pub language: String,
    pub speed: f32,
    pub temperature: f32,
    pub max_tokens: u32,
    pub repetition_penalty: f32,
}

impl Default for SynthesisParams {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            quantization: "none".to_string(),
            do_sample: true,
            language: String::new(),
            speed: 1.0,
            temperature: 0.7,
            max_tokens: 2048,
            repetition_penalty: 1.1,
        }
    }
}

/// Deterministic fingerprint of everything that affects the audio.
///
/// Two messages with the same key are acoustically identical. The voice is
/// compared case-insensitively.
pub fn cache_key(params: &SynthesisParams, voice: &str, cleaned_text: &str) -> String {
    // unit separator keeps fields from running into each other
    let canonical = format!(
        "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{:.4}\u{1f}{:.4}\u{1f}{}\u{1f}{:.4}\u{1f}{}",
        params.model,
        voice.to_lowercase(),
        params.quantization,
        params.do_sample,
        params.language,
        params.speed,
        params.temperature,
        params.max_tokens,
        params.repetition_penalty,
        cleaned_text,
    );
    let digest = Sha256::digest(canonical.as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(CACHE_KEY_LEN);
    key
}

/// Length metric used for batch budgets. Digits count as five characters,
/// approximating how numbers expand when spoken.
pub fn spoken_length(text: &str) -> usize {
    text.chars()
        .map(|c| if c.is_ascii_digit() { 5 } else { 1 })
        .sum()
}

/// One utterance awaiting synthesis and playback.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedMessage {
    pub sequence_number: u64,
    pub original_text: String,
    pub cleaned_text: String,
    pub voice_name: String,
    pub username: String,
    pub params: SynthesisParams,
    pub cache_key: String,
    pub state: MessageState,
    pub audio_file_path: Option<PathBuf>,
    pub was_cache_hit: bool,
    #[serde(skip)]
    pub waiting_for_cache_since: Option<Instant>,
    #[serde(skip)]
    pub enqueued_at: Instant,
}

impl QueuedMessage {
    pub fn new(
        sequence_number: u64,
        original_text: impl Into<String>,
        cleaned_text: impl Into<String>,
        voice_name: impl Into<String>,
        username: impl Into<String>,
        params: SynthesisParams,
    ) -> Self {
        let cleaned_text = cleaned_text.into();
        let voice_name = voice_name.into();
        let cache_key = cache_key(&params, &voice_name, &cleaned_text);
        Self {
            sequence_number,
            original_text: original_text.into(),
            cleaned_text,
            voice_name,
            username: username.into(),
            params,
            cache_key,
            state: MessageState::Queued,
            audio_file_path: None,
            was_cache_hit: false,
            waiting_for_cache_since: None,
            enqueued_at: Instant::now(),
        }
    }

    /// Apply a state transition, maintaining the wait-start timestamp.
    pub(crate) fn transition(&mut self, state: MessageState) {
        match (self.state, state) {
            (from, MessageState::WaitingForCache) if from != MessageState::WaitingForCache => {
                self.waiting_for_cache_since = Some(Instant::now());
            }
            (_, MessageState::WaitingForCache) => {}
            _ => self.waiting_for_cache_since = None,
        }
        self.state = state;
    }
}
