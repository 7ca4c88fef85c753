//! Error types for the relay worker

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Insufficient capacity: all {0} port slots are in use")]
    Capacity(usize),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Bind failed: {0}")]
    Bind(String),

    #[error("RTP error: {0}")]
    Rtp(String),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Unknown producer: {0}")]
    UnknownProducer(String),

    #[error("Unknown input kind ({0} bytes)")]
    UnknownInput(usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Endpoint stopped: {0}")]
    EndpointStopped(String),

    #[error("Room is full: {0}")]
    RoomFull(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Channel closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Proto(#[from] mediarelay_proto::ProtoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<webrtc::rtp::Error> for Error {
    fn from(err: webrtc::rtp::Error) -> Self {
        Self::Rtp(err.to_string())
    }
}

impl From<webrtc::util::Error> for Error {
    fn from(err: webrtc::util::Error) -> Self {
        Self::Rtp(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
