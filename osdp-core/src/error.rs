//! Error types for osdp-core

use crate::reply::ErrorCode;

/// Result type alias for osdp-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Structural problems with a received frame
///
/// A frame that fails with one of these is discarded. The codec never retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Frame is too short to be valid
    #[error("Frame too short: expected at least {expected} bytes, got {actual} bytes")]
    TooShort {
        expected: usize,
        actual: usize,
    },

    /// First byte is not the start-of-message marker
    #[error("Invalid start marker: 0x{0:02X}")]
    InvalidStartMarker(u8),

    /// Length field disagrees with the number of bytes on the wire
    #[error("Length mismatch: header says {declared} bytes, frame has {actual} bytes")]
    LengthMismatch {
        declared: usize,
        actual: usize,
    },

    /// CRC-16 or checksum trailer verification failed
    #[error("Invalid checksum: expected 0x{expected:04X}, received 0x{received:04X}")]
    InvalidChecksum {
        expected: u16,
        received: u16,
    },

    /// Security block length is inconsistent with the frame
    #[error("Malformed security block")]
    InvalidSecurityBlock,

    /// Security block carries a type this implementation does not know
    #[error("Unknown security block type: 0x{0:02X}")]
    UnknownSecurityBlock(u8),

    /// Decrypted payload does not end with 0x80 followed by zeros
    #[error("Invalid payload padding")]
    InvalidPadding,
}

/// Core protocol errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed frame
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Message authentication code did not match
    #[error("Invalid message authentication code")]
    InvalidMac,

    /// Crypto operation attempted before the secure channel was established
    #[error("Secure channel required - handshake has not completed")]
    SecureChannelRequired,

    /// Peer rejected a command
    #[error("NAK received: {0}")]
    NakReceived(ErrorCode),

    /// No valid reply within the reply window
    #[error("Timeout waiting for reply")]
    Timeout,

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    OperationCancelled,

    /// Unknown command or reply code
    #[error("Unknown code: 0x{0:02X}")]
    UnknownCode(u8),

    /// Frame addressed to or from another device
    #[error("Unexpected address: expected 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedAddress {
        expected: u8,
        actual: u8,
    },

    /// Command frame where a reply was expected, or the reverse
    #[error("Unexpected message direction")]
    UnexpectedDirection,

    /// Reply does not echo the sequence number of the command
    #[error("Unexpected sequence number: expected {expected}, got {actual}")]
    UnexpectedSequence {
        expected: u8,
        actual: u8,
    },

    /// Reply arrived with no command outstanding
    #[error("Reply received with no command in flight")]
    UnsolicitedReply,

    /// Payload does not fit in a single frame
    #[error("Payload too large: {size} bytes (max: {max} bytes)")]
    PayloadTooLarge {
        size: usize,
        max: usize,
    },

    /// Fragment does not continue the transfer in progress
    #[error("Unexpected fragment: expected offset {expected}, got {actual}")]
    UnexpectedFragment {
        expected: usize,
        actual: usize,
    },

    /// Fragment header or length is inconsistent
    #[error("Invalid fragment: {0}")]
    InvalidFragment(String),

    /// Payload is shorter than its layout requires
    #[error("Payload too short for {what}: expected {expected} bytes, got {actual} bytes")]
    PayloadTooShort {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl Error {
    /// Check if error is recoverable (retry might succeed)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Frame(_) | Self::InvalidMac | Self::NakReceived(_)
        )
    }

    /// Check if error means the secure channel must be renegotiated
    pub fn requires_handshake(&self) -> bool {
        matches!(
            self,
            Self::InvalidMac
                | Self::SecureChannelRequired
                | Self::NakReceived(ErrorCode::CommunicationSecurityNotMet)
                | Self::NakReceived(ErrorCode::DoesNotSupportSecurityBlock)
        )
    }
}
