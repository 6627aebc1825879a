//! # osdp-core
//!
//! Protocol engine for OSDP (Open Supervised Device Protocol).
//!
//! This crate provides the sans-IO protocol primitives:
//! - Frame structure and encoding/decoding
//! - CRC-16 and checksum calculation
//! - Command and reply definitions
//! - Secure channel handshake, MAC and encryption
//! - ACU-side device sessions and the PD-side peripheral session
//! - Multi-part fragmentation and reassembly

pub mod checksum;
pub mod command;
pub mod constants;
pub mod error;
pub mod message;
pub mod multipart;
pub mod peripheral;
pub mod reader;
pub mod reply;
pub mod secure_channel;
pub mod session;

pub use command::{Command, CommandCode, KeySlot};
pub use error::{Error, FrameError, Result};
pub use message::{Message, SecurityBlock, SecurityBlockType, verify_frame};
pub use multipart::{Fragment, Fragmenter, Reassembler};
pub use peripheral::{IncomingCommand, PeripheralAction, PeripheralOptions, PeripheralSession};
pub use reader::FrameReader;
pub use reply::{ErrorCode, Reply, ReplyCode};
pub use secure_channel::{Direction, Key, SecureChannel};
pub use session::{DeviceOptions, DeviceSession, SessionEvent, Ticket};

/// Protocol version information
pub const PROTOCOL_VERSION: &str = "2.2";
