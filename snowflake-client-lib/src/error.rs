use thiserror::Error;

/// Errors that can occur in the client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Broker(String),

    #[error("Rendezvous error: {0}")]
    Rendezvous(String),

    #[error("SQS error: {0}")]
    Sqs(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("peer pool is at capacity")]
    PoolCapacity,
}

pub type Result<T> = std::result::Result<T, ClientError>;
