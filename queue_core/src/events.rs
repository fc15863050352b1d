//! Informational pipeline events.
//!
//! Components emit events only after releasing their internal locks, so a
//! subscriber may call straight back into the component that fired it.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::message::MessageState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    MessageAdded {
        seq: u64,
        voice: String,
        username: String,
        text: String,
    },
    StateChanged {
        seq: u64,
        state: MessageState,
    },
    InvalidVoice {
        voice: String,
        username: String,
    },
    BatchStarted {
        voice: String,
        count: usize,
    },
    BatchCompleted {
        voice: String,
        succeeded: usize,
        failed: usize,
    },
    PlaybackStarted {
        seq: u64,
        voice: String,
    },
    PlaybackFinished {
        seq: u64,
    },
    CacheUsage {
        percent: f64,
    },
}

/// Broadcast fan-out of [`PipelineEvent`]s. Sending never blocks and never
/// fails; events with no subscriber are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
