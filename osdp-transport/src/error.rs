//! Transport errors

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Connection closed by remote")]
    ConnectionClosed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[cfg(feature = "serial")]
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

impl Error {
    /// Check if reopening the transport may recover from this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::ConnectionTimeout | Self::ConnectionClosed | Self::Io(_)
        )
    }
}
