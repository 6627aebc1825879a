//! High-level error types

use osdp_core::ErrorCode;
use osdp_types::FileTransferStatusCode;

use crate::events::ConnectionId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Core protocol error: {0}")]
    Core(#[from] osdp_core::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] osdp_transport::Error),

    #[error("Payload error: {0}")]
    Types(#[from] osdp_types::Error),

    #[error("Connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    #[error("Device {address} not registered on connection {connection}")]
    DeviceNotFound { connection: ConnectionId, address: u8 },

    #[error("Device {address} already registered on connection {connection}")]
    DeviceExists { connection: ConnectionId, address: u8 },

    #[error("Connection {0} has shut down")]
    ConnectionClosed(ConnectionId),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("File transfer failed with status {0:?}")]
    FileTransfer(FileTransferStatusCode),
}

impl Error {
    /// NAK code, if the device rejected the command
    pub fn nak_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Core(osdp_core::Error::NakReceived(code)) => Some(*code),
            _ => None,
        }
    }

    /// Check if the device simply did not answer in time
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Core(osdp_core::Error::Timeout))
    }

    /// Check if retrying the operation later can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Core(osdp_core::Error::Timeout) => true,
            Self::Transport(e) => e.is_recoverable(),
            _ => false,
        }
    }
}
