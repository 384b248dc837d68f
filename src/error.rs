use thiserror::Error;

/// Crate-wide error type. Domain failures carry a message; infrastructure
/// errors are wrapped transparently.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("negotiation error: {0}")]
    Negotiation(String),
    #[error("recording error: {0}")]
    Recording(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("queue error: {0}")]
    Queue(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
