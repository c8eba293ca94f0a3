use thiserror::Error;

/// Errors surfaced by the embedded [`crate::store::KeyValueStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket name must not be empty")]
    InvalidArgument,
    #[error("bucket '{0}' does not exist")]
    BucketMissing(String),
    #[error("timed out acquiring the store lock")]
    Acquire,
    #[error("store io error: {0}")]
    Io(#[from] sled::Error),
    #[error("store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors that terminate a single worker's connection.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("authentication failed")]
    Auth,
    #[error("room rejected: {0}")]
    RoomDenied(String),
    #[error("send queue overflowed")]
    Backpressure,
    #[error("connection closed")]
    Closed,
}

/// Errors raised while the [`crate::overseer::Overseer`] manages rooms.
#[derive(Debug, Error)]
pub enum OverseerError {
    #[error("authentication failed")]
    Auth,
    #[error("room name rejected: {0}")]
    RoomDenied(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
