use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Transport unavailable: device is not connected")]
    TransportUnavailable,

    #[error("Payload too large: {len} bytes (max 255)")]
    PayloadTooLarge { len: usize },

    #[error("Invalid ANC level: {0}")]
    InvalidAncLevel(u8),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Malformed header: {len} bytes available, 4 required")]
    MalformedHeader { len: usize },

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection attempt timed out")]
    ConnectTimeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
