//! Synthesis and playback stages of the speech pipeline.
//!
//! [`SynthesisOrchestrator`] pulls batches from the message queue, dedupes
//! them against the audio cache and against work already in flight, and
//! calls the [`SynthesisBackend`]. [`PlaybackController`] drains ready
//! messages in sequence order through an [`AudioPlayer`].

mod backend;
mod orchestrator;
mod playback;
mod player;
pub mod wav;

pub use backend::{BatchRequest, SynthesisBackend};
pub use orchestrator::{
    BatchReport, OrchestratorConfig, OrchestratorStatsSnapshot, SynthesisOrchestrator,
};
pub use playback::{PlaybackConfig, PlaybackController};
pub use player::{AudioPlayer, CommandPlayer, CompletionCallback, HeadlessPlayer};
