// Ingest counters and the combined stats payload

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cache_core::CacheStats;
use chrono::{DateTime, Utc};
use queue_core::{QueueCounts, Rejection};
use serde::Serialize;
use tts_core::OrchestratorStatsSnapshot;

/// What happened to chat lines offered to the queue
#[derive(Debug, Clone)]
pub struct IngestMetrics {
    pub received: Arc<AtomicU64>,
    pub accepted: Arc<AtomicU64>,
    pub filtered: Arc<AtomicU64>,
    pub invalid_voice: Arc<AtomicU64>,
    pub missing_prefix: Arc<AtomicU64>,
    pub invalid_text: Arc<AtomicU64>,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self {
            received: Arc::new(AtomicU64::new(0)),
            accepted: Arc::new(AtomicU64::new(0)),
            filtered: Arc::new(AtomicU64::new(0)),
            invalid_voice: Arc::new(AtomicU64::new(0)),
            missing_prefix: Arc::new(AtomicU64::new(0)),
            invalid_text: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: &Result<u64, Rejection>) {
        let counter = match outcome {
            Ok(_) => &self.accepted,
            Err(Rejection::InvalidVoice(_)) => &self.invalid_voice,
            Err(Rejection::MissingVoicePrefix) => &self.missing_prefix,
            Err(Rejection::EmptyText | Rejection::TextTooLong { .. }) => &self.invalid_text,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestStats {
        IngestStats {
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            invalid_voice: self.invalid_voice.load(Ordering::Relaxed),
            missing_prefix: self.missing_prefix.load(Ordering::Relaxed),
            invalid_text: self.invalid_text.load(Ordering::Relaxed),
        }
    }
}

impl Default for IngestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestStats {
    pub received: u64,
    pub accepted: u64,
    pub filtered: u64,
    pub invalid_voice: u64,
    pub missing_prefix: u64,
    pub invalid_text: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub request_count: u64,
    pub ingest: IngestStats,
    pub queue: QueueCounts,
    pub now_playing: Option<u64>,
    pub synthesis: OrchestratorStatsSnapshot,
    pub cache: CacheStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_outcome_buckets() {
        let metrics = IngestMetrics::new();
        metrics.record_received();
        metrics.record_outcome(&Ok(1));
        metrics.record_outcome(&Err(Rejection::InvalidVoice("x".into())));
        metrics.record_outcome(&Err(Rejection::MissingVoicePrefix));
        metrics.record_outcome(&Err(Rejection::TextTooLong { max: 500 }));
        metrics.record_filtered();

        let stats = metrics.snapshot();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.invalid_voice, 1);
        assert_eq!(stats.missing_prefix, 1);
        assert_eq!(stats.invalid_text, 1);
        assert_eq!(stats.filtered, 1);
    }
}
