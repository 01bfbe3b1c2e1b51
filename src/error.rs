use thiserror::Error;

/// Errors raised by the cache engine.
///
/// `Configuration`, `Storage`, and `Lock` are hard failures that the
/// integration layer is expected to surface to the site operator; a silently
/// broken cache produces confusing stale or missing content. Freshness misses
/// and token-resolution failures are ordinary control flow and never reach
/// this type.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error("no usable locking mechanism: {0}")]
    Lock(String),
}

impl CacheError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn lock(message: impl Into<String>) -> Self {
        Self::Lock(message.into())
    }
}
