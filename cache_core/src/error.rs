use thiserror::Error;

/// Result type alias using the cache error.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Cache store error types
#[derive(Debug, Error)]
pub enum CacheError {
    /// Reading or writing a cache file failed
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The on-disk index could not be encoded or decoded
    #[error("Cache index error: {0}")]
    Index(#[from] serde_json::Error),

    /// Keys end up in file names, so they are restricted to a safe alphabet
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),
}
