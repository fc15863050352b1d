use thiserror::Error;

/// Why an incoming message never entered the queue.
///
/// Rejections are ordinary outcomes of `enqueue`, not failures of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Text cannot be empty")]
    EmptyText,

    #[error("Text too long (max {max} characters)")]
    TextTooLong { max: usize },

    #[error("Unknown voice '{0}'")]
    InvalidVoice(String),

    #[error("Message has no voice prefix")]
    MissingVoicePrefix,
}
