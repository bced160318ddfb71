//! Error types for the notr protocol

use thiserror::Error;

/// Result type alias for notr protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during protocol operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("unknown command: {0}")]
    UnknownCommand(u8),

    #[error("unexpected {0} frame")]
    UnexpectedCommand(crate::Command),

    #[error("body of {0} bytes does not fit a 16-bit length field")]
    BodyTooLarge(usize),

    #[error("UDP payload of {0} bytes does not fit an IPv4 datagram")]
    PayloadTooLarge(usize),

    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("address pool exhausted")]
    PoolExhausted,

    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Resource exhaustion is reported to one client, never the process
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Error::PoolExhausted)
    }
}
