//! Bot-wide error types

use thiserror::Error;

/// Errors raised by the exchange layer and the grid strategy
#[derive(Error, Debug)]
pub enum BotError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("No current price observed yet")]
    NoPrice,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connect timed out after {0}ms")]
    ConnectTimeout(u64),

    #[error("Channel not ready: {0}")]
    NotReady(&'static str),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

/// Result type for bot operations
pub type BotResult<T> = std::result::Result<T, BotError>;
