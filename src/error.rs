use thiserror::Error;

/// Crate-wide error type. Internal code matches on `kind()`-style variants
/// instead of string contents; the WebSocket/HTTP edges translate these into
/// the wire-level shapes described in spec §7.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("invalid stream key")]
    InvalidStreamKey,

    #[error("max concurrent transcodes reached ({0})")]
    CapacityExceeded(usize),

    #[error("kv store error: {0}")]
    Kv(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to spawn encoder: {0}")]
    SpawnFailed(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl From<redis::RedisError> for OrchestratorError {
    fn from(e: redis::RedisError) -> Self {
        OrchestratorError::Kv(e.to_string())
    }
}
