//! Error types for Peertun.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Peer not connected")]
    NotConnected,

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Peer error: {0}")]
    Peer(#[from] webrtc::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] rumqttc::ClientError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid body encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
