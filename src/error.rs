use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FilterError>;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Digest cannot be routed to a shard: {0}")]
    InvalidDigest(String),

    #[error("Storage operation failed: {0}")]
    StorageError(String),

    #[error("Index out of bounds: {index} >= {capacity}")]
    IndexOutOfBounds { index: u64, capacity: u64 },

    #[error("Storage request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed storage response: {0}")]
    MalformedResponse(String),

    #[error("Filter is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "Failed to parse environment variable {var_name}: value '{value}' - {error}"
    )]
    EnvParseError {
        var_name: String,
        value: String,
        error: String,
    },

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[cfg(feature = "redb")]
    #[error("ReDB error: {0}")]
    RedbError(#[from] redb::Error),
}

impl FilterError {
    /// Errors a fail-safe wrapper may replace with its default outcome.
    ///
    /// `Closed` is a lifecycle violation by the caller, not a backend outage,
    /// so it is never masked.
    pub fn is_substitutable(&self) -> bool {
        !matches!(self, FilterError::Closed)
    }
}
