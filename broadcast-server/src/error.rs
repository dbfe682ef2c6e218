use std::time::Duration;

use thiserror::Error;

/// Failure to hand a message to a session's outbound queue.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("session is closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub is no longer running")]
    Stopped,
}

/// Errors surfaced by a connection adapter. All of them end the session.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("no activity within {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Why a session pump stopped.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Hub(#[from] HubError),
}
