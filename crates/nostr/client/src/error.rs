//! Client error types.

use nostr::VerifyFailure;
use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid WebSocket URL: {0}")]
    InvalidUrl(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("relay({0}) is NOT writable")]
    NotWritable(String),

    #[error("relay({0}) is NOT readable")]
    NotReadable(String),

    #[error("relay({0}) is NOT healthy")]
    NotConnected(String),

    #[error("unknown relay: {0}")]
    UnknownRelay(String),

    #[error("subscription ID(\"{0}\") has been used")]
    DuplicateSubscription(String),

    #[error("no relays for publishing")]
    NoPublishTargets,

    #[error("failed to publish event: {0}")]
    InvalidEvent(#[from] VerifyFailure),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("relay pool has shut down")]
    PoolClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;
