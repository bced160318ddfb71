//! Error types for the broker engine

use std::net::Ipv4Addr;

use thiserror::Error;

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the broker
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] notr_protocol::Error),

    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Authentication error
    #[error("authentication error: {0}")]
    Auth(String),

    /// Timeout error
    #[error("timeout: {0}")]
    Timeout(String),

    /// Multiplexed session error
    #[error("session error: {0}")]
    Session(String),

    /// No session owns the destination VIP
    #[error("no route to host: {0}")]
    NoRoute(Ipv4Addr),

    /// Address allocation failed
    #[error("address allocation failed: {0}")]
    AddressAllocation(String),

    /// Forward provisioning error
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Domain resolver error
    #[error("resolver error: {0}")]
    Resolver(String),

    /// Socket option could not be applied
    #[error("failed to set {option}: {source}")]
    Socket {
        option: &'static str,
        source: std::io::Error,
    },
}

impl Error {
    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Connection(_)
                | Error::Session(_)
                | Error::NoRoute(_)
                | Error::AddressAllocation(_)
        )
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout("operation deadline exceeded".into())
    }
}
