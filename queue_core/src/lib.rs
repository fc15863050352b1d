//! Message model and ordered, per-voice message queue.

mod error;
mod events;
mod message;
mod queue;
mod validation;
mod voice;

pub use error::Rejection;
pub use events::{EventBus, PipelineEvent};
pub use message::{cache_key, spoken_length, MessageState, QueuedMessage, SynthesisParams};
pub use queue::{MessageQueue, QueueConfig, QueueCounts};
pub use validation::{is_valid_language_code, validate_text, MAX_TEXT_LENGTH};
pub use voice::{extract_voice, VoiceCatalog, VoiceExtractionMode, VoiceInfo};
