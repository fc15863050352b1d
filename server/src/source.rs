//! Chat sources and the filter in front of the queue.

use std::io::BufRead;
use std::sync::Arc;

use async_trait::async_trait;
use queue_core::{MessageQueue, Rejection};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::IngestMetrics;

const LINE_BUFFER: usize = 64;

/// One chat line or reward redemption from any platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub username: String,
    pub text: String,
    #[serde(default)]
    pub is_reward: bool,
    #[serde(default)]
    pub reward_id: Option<String>,
}

impl ChatMessage {
    pub fn chat(username: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            text: text.into(),
            is_reward: false,
            reward_id: None,
        }
    }

    pub fn reward(
        username: impl Into<String>,
        text: impl Into<String>,
        reward_id: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            text: text.into(),
            is_reward: true,
            reward_id: Some(reward_id.into()),
        }
    }
}

#[async_trait]
pub trait ChatSource: Send {
    fn name(&self) -> &str;

    /// Next message, or `None` once the source has ended.
    async fn next_message(&mut self) -> anyhow::Result<Option<ChatMessage>>;
}

/// Applies the reward filter and forwards to the queue.
pub struct Ingest {
    queue: Arc<MessageQueue>,
    reward_id: Option<String>,
    require_voice_prefix: bool,
    metrics: IngestMetrics,
}

impl Ingest {
    pub fn new(
        queue: Arc<MessageQueue>,
        reward_id: Option<String>,
        require_voice_prefix: bool,
        metrics: IngestMetrics,
    ) -> Self {
        Self {
            queue,
            reward_id,
            require_voice_prefix,
            metrics,
        }
    }

    /// With a reward configured only its redemptions pass; otherwise
    /// everything does.
    pub fn accepts(&self, message: &ChatMessage) -> bool {
        match &self.reward_id {
            Some(wanted) => message.is_reward && message.reward_id.as_deref() == Some(wanted.as_str()),
            None => true,
        }
    }

    /// Offer a message to the queue. `None` means the filter dropped it.
    pub fn ingest(&self, message: &ChatMessage) -> Option<Result<u64, Rejection>> {
        self.metrics.record_received();
        if !self.accepts(message) {
            debug!(username = %message.username, "Message filtered by reward id");
            self.metrics.record_filtered();
            return None;
        }
        let outcome = self
            .queue
            .enqueue(&message.text, &message.username, self.require_voice_prefix);
        self.metrics.record_outcome(&outcome);
        if let Err(rejection) = &outcome {
            debug!(username = %message.username, %rejection, "Message rejected");
        }
        Some(outcome)
    }

    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }
}

/// Drain `source` into `ingest` until it ends or `shutdown` fires.
pub async fn run_source(mut source: Box<dyn ChatSource>, ingest: Arc<Ingest>, shutdown: CancellationToken) {
    let name = source.name().to_string();
    info!(source = %name, "Chat source started");
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = source.next_message() => next,
        };
        match next {
            Ok(Some(message)) => {
                ingest.ingest(&message);
            }
            Ok(None) => {
                info!(source = %name, "Chat source ended");
                break;
            }
            Err(e) => {
                warn!(source = %name, error = %e, "Chat source failed");
                break;
            }
        }
    }
}

/// Reads `username: text` lines. `username@reward: text` marks a redemption
/// of `reward`. Lines without a colon are attributed to `default_user`.
///
/// The reader runs on its own OS thread so a read that never returns cannot
/// hold up runtime shutdown; the thread ends at EOF or once the source is
/// dropped and the next line fails to send.
pub struct LineSource {
    name: String,
    default_user: String,
    lines: mpsc::Receiver<std::io::Result<String>>,
}

impl LineSource {
    pub fn stdin() -> std::io::Result<Self> {
        Self::spawn("stdin", || std::io::stdin().lock())
    }

    /// Start a reader thread over the reader built by `open`.
    pub fn spawn<R, F>(name: &str, open: F) -> std::io::Result<Self>
    where
        R: BufRead,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let source = name.to_string();
        std::thread::Builder::new()
            .name(format!("{name}-reader"))
            .spawn(move || {
                for line in open().lines() {
                    let failed = line.is_err();
                    if tx.blocking_send(line).is_err() || failed {
                        break;
                    }
                }
                debug!(source = %source, "Line reader stopped");
            })?;
        Ok(Self {
            name: name.to_string(),
            default_user: name.to_string(),
            lines: rx,
        })
    }

    pub fn parse_line(&self, line: &str) -> Option<ChatMessage> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some((who, text)) = line.split_once(':') else {
            return Some(ChatMessage::chat(self.default_user.clone(), line));
        };
        let who = who.trim();
        // only a bare word before the colon names a user
        if who.is_empty() || who.contains(char::is_whitespace) || who.starts_with('[') {
            return Some(ChatMessage::chat(self.default_user.clone(), line));
        }
        let message = match who.split_once('@') {
            Some((user, reward)) if !reward.is_empty() => ChatMessage::reward(user, text.trim(), reward),
            _ => ChatMessage::chat(who, text.trim()),
        };
        Some(message)
    }
}

#[async_trait]
impl ChatSource for LineSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_message(&mut self) -> anyhow::Result<Option<ChatMessage>> {
        while let Some(line) = self.lines.recv().await {
            if let Some(message) = self.parse_line(&line?) {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use queue_core::{QueueConfig, VoiceCatalog};

    use super::*;

    fn ingest(reward_id: Option<&str>) -> (Arc<MessageQueue>, Ingest) {
        let queue = Arc::new(MessageQueue::new(
            QueueConfig {
                default_voice: "alice".to_string(),
                ..QueueConfig::default()
            },
            VoiceCatalog::new(["alice"]),
        ));
        let ingest = Ingest::new(
            Arc::clone(&queue),
            reward_id.map(str::to_string),
            false,
            IngestMetrics::new(),
        );
        (queue, ingest)
    }

    #[test]
    fn test_without_reward_filter_everything_passes() {
        let (queue, ingest) = ingest(None);
        assert_eq!(ingest.ingest(&ChatMessage::chat("u", "hi")), Some(Ok(1)));
        assert_eq!(ingest.ingest(&ChatMessage::reward("u", "hey", "r1")), Some(Ok(2)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_reward_filter() {
        let (queue, ingest) = ingest(Some("tts"));
        assert_eq!(ingest.ingest(&ChatMessage::chat("u", "hi")), None);
        assert_eq!(ingest.ingest(&ChatMessage::reward("u", "hi", "other")), None);
        assert_eq!(ingest.ingest(&ChatMessage::reward("u", "hi", "tts")), Some(Ok(1)));
        assert_eq!(queue.len(), 1);

        let stats = ingest.metrics().snapshot();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.filtered, 2);
        assert_eq!(stats.accepted, 1);
    }

    #[test]
    fn test_rejections_are_reported() {
        let (_, ingest) = ingest(None);
        assert_eq!(
            ingest.ingest(&ChatMessage::chat("u", "[bob] hi")),
            Some(Err(Rejection::InvalidVoice("bob".to_string())))
        );
        assert_eq!(ingest.metrics().snapshot().invalid_voice, 1);
    }

    #[tokio::test]
    async fn test_line_source_parses_lines() {
        let input = "viewer: hello\n\n[alice] tagged: text\nfan@tts: redeemed\nno colon here\n";
        let mut source = LineSource::spawn("test", move || input.as_bytes()).unwrap();

        assert_eq!(source.next_message().await.unwrap(), Some(ChatMessage::chat("viewer", "hello")));
        assert_eq!(
            source.next_message().await.unwrap(),
            Some(ChatMessage::chat("test", "[alice] tagged: text"))
        );
        assert_eq!(
            source.next_message().await.unwrap(),
            Some(ChatMessage::reward("fan", "redeemed", "tts"))
        );
        assert_eq!(
            source.next_message().await.unwrap(),
            Some(ChatMessage::chat("test", "no colon here"))
        );
        assert_eq!(source.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_source_feeds_queue() {
        let (queue, ingest) = ingest(None);
        let source = LineSource::spawn("test", || "a: one\nb: two\n".as_bytes()).unwrap();
        run_source(Box::new(source), Arc::new(ingest), CancellationToken::new()).await;
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get(2).unwrap().username, "b");
    }

    /// Blocks in `read` until the sender side is dropped.
    struct Stalled(std::sync::mpsc::Receiver<()>);

    impl std::io::Read for Stalled {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    #[test]
    fn test_blocked_reader_does_not_hold_runtime_shutdown() {
        let (release, stalled) = std::sync::mpsc::channel::<()>();
        let (_, ingest) = ingest(None);
        let runtime = tokio::runtime::Runtime::new().unwrap();

        let started = std::time::Instant::now();
        runtime.block_on(async {
            let source = LineSource::spawn("stalled", move || std::io::BufReader::new(Stalled(stalled))).unwrap();
            let shutdown = CancellationToken::new();
            let task = tokio::spawn(run_source(Box::new(source), Arc::new(ingest), shutdown.clone()));
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            shutdown.cancel();
            task.await.unwrap();
        });
        drop(runtime);
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        drop(release);
    }
}
