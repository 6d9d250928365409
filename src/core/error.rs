use std::io;
use thiserror::Error;

/// Errors raised by the SCOM link
#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed frame: got {len} bytes, a frame needs 4")]
    MalformedFrame { len: usize },

    #[error("Incompatible protocol version: local {local}, peer {peer}")]
    IncompatibleProtocolVersion { local: u16, peer: u16 },

    #[error("Connection timed out")]
    ConnectionTimeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Message {0} is a reserved control code")]
    ReservedMessage(u16),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new channel error
    pub fn channel(msg: impl Into<String>) -> Self {
        Error::Channel(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }
}
