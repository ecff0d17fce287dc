use thiserror::Error;

use crate::types::ReadingKind;

/// A well-formed configuration that violates a field constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("required field `{0}` is empty")]
    MissingField(&'static str),
    #[error("broker_port must be between 1 and 65535, got {0}")]
    PortOutOfRange(i64),
    #[error("publish_interval_ms must be positive, got {0}")]
    IntervalOutOfRange(i64),
}

#[derive(Debug, Error)]
pub enum StorageError {
    /// Mounting failed earlier in this session; the store no longer retries.
    #[error("storage medium unavailable")]
    Unavailable,
    #[error("failed to mount storage: {0}")]
    Mount(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no persisted configuration")]
    NotFound,
    #[error("persisted configuration is malformed: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("persisted configuration is invalid: {0}")]
    Invalid(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("empty intake line")]
    Empty,
    #[error("unrecognized command")]
    Unrecognized,
    #[error("failed to parse configuration: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("configuration rejected: {0}")]
    Invalid(#[from] ConfigError),
    #[error("failed to persist configuration: {0}")]
    Store(#[source] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("publish failed for {failed:?}")]
    Partial { failed: Vec<ReadingKind> },
}
