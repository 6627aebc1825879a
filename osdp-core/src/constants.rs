//! Protocol constants

use std::time::Duration;

/// Start-of-message marker
pub const START_OF_MESSAGE: u8 = 0x53;

/// Idle-line marker written before every frame
pub const DRIVER_BYTE: u8 = 0xFF;

/// Broadcast address; every PD answers it
pub const BROADCAST_ADDRESS: u8 = 0x7F;

/// Direction bit of the address byte, set on replies
pub const REPLY_ADDRESS_FLAG: u8 = 0x80;

/// Header: SOM, address, length (2), control
pub const HEADER_SIZE: usize = 5;

/// Smallest legal frame: header, type code, checksum
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + 2;

/// Largest frame accepted from the wire
pub const MAX_FRAME_SIZE: usize = 1440;

/// Bytes of the MAC carried on the wire
pub const MAC_SIZE: usize = 4;

/// Failed attempts tolerated before a command is dropped
pub const RETRY_AMOUNT: u8 = 2;

/// Default reply window
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(200);

/// A device with no valid reply for this long is offline
pub const DEFAULT_OFFLINE_TIMEOUT: Duration = Duration::from_secs(8);

/// Back-off applied when a PD answers osdp_BUSY
pub const DEFAULT_BUSY_DELAY: Duration = Duration::from_millis(300);

/// Well-known installation key SCBK-D
pub const DEFAULT_SECURE_CHANNEL_KEY: [u8; 16] = [
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E,
    0x3F,
];
