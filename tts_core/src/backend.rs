use std::collections::HashMap;

use async_trait::async_trait;
use queue_core::SynthesisParams;

/// One backend call: several texts rendered with a single voice.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub voice: String,
    pub texts: Vec<String>,
    pub params: SynthesisParams,
}

/// Remote text-to-speech engine.
///
/// `synthesize_batch` maps each input index to its audio bytes. `None`, or a
/// missing index, is a failure with no retry contract.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    async fn synthesize_batch(&self, request: &BatchRequest) -> Option<HashMap<usize, Vec<u8>>>;

    /// Health flag polled by the synthesis loop before dequeuing
    fn is_available(&self) -> bool {
        true
    }

    /// Ask the backend to stop whatever it is rendering.
    async fn abort_current(&self) {}

    /// Voice names the backend can render, if it can report them
    async fn list_voices(&self) -> Option<Vec<String>> {
        None
    }
}
