//! OSDP frame structure and encoding/decoding

use std::fmt;

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    checksum,
    constants::{HEADER_SIZE, MAC_SIZE, MAX_FRAME_SIZE, MIN_FRAME_SIZE, REPLY_ADDRESS_FLAG, START_OF_MESSAGE},
    error::{Error, FrameError, Result},
    secure_channel::{Direction, SecureChannel},
};

bitflags! {
    /// Flag bits of the control byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ControlFlags: u8 {
        /// Trailer is a CRC-16 rather than a checksum
        const USE_CRC = 0x04;
        /// A security block follows the header
        const SECURITY_BLOCK = 0x08;
    }
}

/// Control byte: sequence number in bits 0-1, flags above
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    pub sequence: u8,
    pub flags: ControlFlags,
}

impl Control {
    const SEQUENCE_MASK: u8 = 0x03;

    pub fn new(sequence: u8, use_crc: bool, has_security_block: bool) -> Self {
        let mut flags = ControlFlags::empty();
        flags.set(ControlFlags::USE_CRC, use_crc);
        flags.set(ControlFlags::SECURITY_BLOCK, has_security_block);
        Self {
            sequence: sequence & Self::SEQUENCE_MASK,
            flags,
        }
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            sequence: byte & Self::SEQUENCE_MASK,
            flags: ControlFlags::from_bits_truncate(byte),
        }
    }

    pub fn to_byte(self) -> u8 {
        self.sequence | self.flags.bits()
    }

    pub fn use_crc(self) -> bool {
        self.flags.contains(ControlFlags::USE_CRC)
    }

    pub fn has_security_block(self) -> bool {
        self.flags.contains(ControlFlags::SECURITY_BLOCK)
    }
}

/// Security block types
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SecurityBlockType {
    /// SCS_11: osdp_CHLNG
    BeginSession = 0x11,
    /// SCS_12: osdp_CCRYPT
    ClientCryptogram = 0x12,
    /// SCS_13: osdp_SCRYPT
    ServerCryptogram = 0x13,
    /// SCS_14: osdp_RMAC_I
    InitialRmac = 0x14,
    /// SCS_15: command with MAC, payload in clear
    CommandMac = 0x15,
    /// SCS_16: reply with MAC, payload in clear
    ReplyMac = 0x16,
    /// SCS_17: command with MAC and encrypted payload
    CommandMacEncrypted = 0x17,
    /// SCS_18: reply with MAC and encrypted payload
    ReplyMacEncrypted = 0x18,
}

impl SecurityBlockType {
    /// Check if frames with this block carry a MAC
    pub fn has_mac(self) -> bool {
        matches!(
            self,
            Self::CommandMac | Self::ReplyMac | Self::CommandMacEncrypted | Self::ReplyMacEncrypted
        )
    }

    /// Check if the payload of frames with this block is encrypted
    pub fn is_encrypted(self) -> bool {
        matches!(self, Self::CommandMacEncrypted | Self::ReplyMacEncrypted)
    }

    /// Steady-state block for a secured frame
    pub fn secured(direction: Direction, has_payload: bool) -> Self {
        match (direction, has_payload) {
            (Direction::Command, true) => Self::CommandMacEncrypted,
            (Direction::Command, false) => Self::CommandMac,
            (Direction::Reply, true) => Self::ReplyMacEncrypted,
            (Direction::Reply, false) => Self::ReplyMac,
        }
    }
}

impl TryFrom<u8> for SecurityBlockType {
    type Error = FrameError;

    fn try_from(value: u8) -> std::result::Result<Self, FrameError> {
        match value {
            0x11 => Ok(Self::BeginSession),
            0x12 => Ok(Self::ClientCryptogram),
            0x13 => Ok(Self::ServerCryptogram),
            0x14 => Ok(Self::InitialRmac),
            0x15 => Ok(Self::CommandMac),
            0x16 => Ok(Self::ReplyMac),
            0x17 => Ok(Self::CommandMacEncrypted),
            0x18 => Ok(Self::ReplyMacEncrypted),
            _ => Err(FrameError::UnknownSecurityBlock(value)),
        }
    }
}

/// Security block: `{length, type, data...}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityBlock {
    pub kind: SecurityBlockType,
    pub data: Bytes,
}

impl SecurityBlock {
    pub fn new(kind: SecurityBlockType, data: impl AsRef<[u8]>) -> Self {
        Self {
            kind,
            data: Bytes::copy_from_slice(data.as_ref()),
        }
    }

    /// Steady-state block with no data
    pub fn secured(direction: Direction, has_payload: bool) -> Self {
        Self {
            kind: SecurityBlockType::secured(direction, has_payload),
            data: Bytes::new(),
        }
    }

    /// Bytes on the wire, including the length and type bytes
    pub fn encoded_len(&self) -> usize {
        2 + self.data.len()
    }
}

/// OSDP frame
///
/// # Frame Structure
///
/// ```text
/// ┌─────┬──────┬────────┬──────┬──────────┬──────┬─────────┬─────┬─────────┐
/// │ SOM │ ADDR │ LENGTH │ CTRL │ SEC BLK  │ CODE │ PAYLOAD │ MAC │ TRAILER │
/// │ 1   │ 1    │ 2 (LE) │ 1    │ optional │ 1    │ N       │ 0/4 │ 2 or 1  │
/// └─────┴──────┴────────┴──────┴──────────┴──────┴─────────┴─────┴─────────┘
/// ```
///
/// LENGTH counts every byte of the frame. The top bit of ADDR is set on
/// replies. The trailer covers all preceding bytes; the MAC covers everything
/// before it, including LENGTH.
///
/// # Examples
///
/// ```
/// use osdp_core::Message;
///
/// let poll = Message::command(0x01, 0, true, 0x60, Vec::new());
/// let encoded = poll.encode(None).unwrap();
///
/// let decoded = Message::decode(&encoded, None).unwrap();
/// assert_eq!(decoded.type_code, 0x60);
/// assert_eq!(decoded.address, 0x01);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    /// Device address without the direction bit
    pub address: u8,

    /// Command (ACU to PD) or reply (PD to ACU)
    pub direction: Direction,

    /// Sequence number 0-3
    pub sequence: u8,

    /// CRC-16 trailer when set, checksum otherwise
    pub use_crc: bool,

    /// Optional security block
    pub security_block: Option<SecurityBlock>,

    /// Command or reply code
    pub type_code: u8,

    /// Plaintext payload
    pub payload: Bytes,
}

impl Message {
    /// Create a command frame without a security block
    pub fn command(address: u8, sequence: u8, use_crc: bool, type_code: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            address: address & !REPLY_ADDRESS_FLAG,
            direction: Direction::Command,
            sequence,
            use_crc,
            security_block: None,
            type_code,
            payload: payload.into(),
        }
    }

    /// Create a reply frame without a security block
    pub fn reply(address: u8, sequence: u8, use_crc: bool, type_code: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            direction: Direction::Reply,
            ..Self::command(address, sequence, use_crc, type_code, payload)
        }
    }

    /// Attach a security block
    pub fn with_security_block(mut self, block: SecurityBlock) -> Self {
        self.security_block = Some(block);
        self
    }

    /// Check if this frame carries a MAC
    pub fn is_secured(&self) -> bool {
        self.security_block.as_ref().is_some_and(|b| b.kind.has_mac())
    }

    /// Encode the frame
    ///
    /// Secured frames need an established channel: the payload is encrypted
    /// (when the block says so and the payload is not empty) and the MAC is
    /// appended. The length field is written before the MAC is computed since
    /// the MAC covers it; the trailer comes last.
    ///
    /// # Errors
    ///
    /// - [`Error::SecureChannelRequired`] when a secured frame is encoded
    ///   without an established channel
    /// - [`Error::PayloadTooLarge`] when the frame exceeds the maximum size
    pub fn encode(&self, channel: Option<&mut SecureChannel>) -> Result<BytesMut> {
        let mut channel = match (self.is_secured(), channel) {
            (false, _) => None,
            (true, Some(channel)) if channel.is_established() => Some(channel),
            (true, _) => return Err(Error::SecureChannelRequired),
        };

        let encrypt = self
            .security_block
            .as_ref()
            .is_some_and(|b| b.kind.is_encrypted())
            && !self.payload.is_empty();

        let payload = match channel.as_deref() {
            Some(channel) if encrypt => Bytes::from(channel.encrypt(&self.payload, self.direction)?),
            _ => self.payload.clone(),
        };

        let block_len = self.security_block.as_ref().map_or(0, SecurityBlock::encoded_len);
        let mac_len = if channel.is_some() { MAC_SIZE } else { 0 };
        let trailer_len = if self.use_crc { 2 } else { 1 };
        let total = HEADER_SIZE + block_len + 1 + payload.len() + mac_len + trailer_len;

        if total > MAX_FRAME_SIZE {
            return Err(Error::PayloadTooLarge {
                size: total,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(total);

        // Header (length is final before the MAC sees it)
        buf.put_u8(START_OF_MESSAGE);
        buf.put_u8(self.address_byte());
        buf.put_u16_le(total as u16);
        buf.put_u8(Control::new(self.sequence, self.use_crc, self.security_block.is_some()).to_byte());

        if let Some(block) = &self.security_block {
            buf.put_u8(block.encoded_len() as u8);
            buf.put_u8(block.kind as u8);
            buf.put_slice(&block.data);
        }

        buf.put_u8(self.type_code);
        buf.put_slice(&payload);

        if let Some(channel) = channel.as_deref_mut() {
            let mac = channel.generate_mac(&buf, self.direction)?;
            buf.put_slice(&mac[..MAC_SIZE]);
        }

        if self.use_crc {
            buf.put_u16_le(checksum::crc16(&buf));
        } else {
            buf.put_u8(checksum::checksum(&buf));
        }

        debug_assert_eq!(buf.len(), total);
        Ok(buf)
    }

    /// Decode a complete frame
    ///
    /// Secured frames are MAC-verified and decrypted with `channel`.
    ///
    /// # Errors
    ///
    /// - [`Error::Frame`] for malformed length, trailer or security block
    /// - [`Error::InvalidMac`] when the MAC does not match
    /// - [`Error::SecureChannelRequired`] for a secured frame without an
    ///   established channel
    pub fn decode(buf: &[u8], channel: Option<&mut SecureChannel>) -> Result<Self> {
        let body_end = verify_frame(buf)?;
        let control = Control::from_byte(buf[4]);

        let address = buf[1] & !REPLY_ADDRESS_FLAG;
        let direction = if buf[1] & REPLY_ADDRESS_FLAG != 0 {
            Direction::Reply
        } else {
            Direction::Command
        };

        // Security block
        let mut pos = HEADER_SIZE;
        let security_block = if control.has_security_block() {
            let block_len = buf[pos] as usize;
            if block_len < 2 || pos + block_len >= body_end {
                return Err(FrameError::InvalidSecurityBlock.into());
            }
            let kind = SecurityBlockType::try_from(buf[pos + 1])?;
            let data = Bytes::copy_from_slice(&buf[pos + 2..pos + block_len]);
            pos += block_len;
            Some(SecurityBlock { kind, data })
        } else {
            None
        };

        let type_code = buf[pos];
        pos += 1;

        let secured = security_block.as_ref().is_some_and(|b| b.kind.has_mac());
        let mac_len = if secured { MAC_SIZE } else { 0 };
        if pos + mac_len > body_end {
            return Err(FrameError::TooShort {
                expected: buf.len() + (pos + mac_len - body_end),
                actual: buf.len(),
            }
            .into());
        }
        let data_end = body_end - mac_len;
        let raw_payload = &buf[pos..data_end];

        let payload = if secured {
            let channel = match channel {
                Some(channel) if channel.is_established() => channel,
                _ => return Err(Error::SecureChannelRequired),
            };

            channel.verify_mac(&buf[..data_end], &buf[data_end..body_end], direction)?;

            let encrypted = security_block.as_ref().is_some_and(|b| b.kind.is_encrypted());
            if encrypted && !raw_payload.is_empty() {
                Bytes::from(channel.decrypt(raw_payload, direction)?)
            } else {
                Bytes::copy_from_slice(raw_payload)
            }
        } else {
            Bytes::copy_from_slice(raw_payload)
        };

        Ok(Self {
            address,
            direction,
            sequence: control.sequence,
            use_crc: control.use_crc(),
            security_block,
            type_code,
            payload,
        })
    }

    fn address_byte(&self) -> u8 {
        match self.direction {
            Direction::Command => self.address,
            Direction::Reply => self.address | REPLY_ADDRESS_FLAG,
        }
    }
}

/// Check start marker, length field and trailer of a complete frame
///
/// Returns the offset where the trailer starts. Nothing past the header is
/// interpreted, so this is safe to run before any state is touched.
///
/// # Errors
///
/// [`Error::Frame`] when the frame is truncated, misframed or corrupted.
pub fn verify_frame(buf: &[u8]) -> Result<usize> {
    if buf.len() < MIN_FRAME_SIZE {
        return Err(FrameError::TooShort {
            expected: MIN_FRAME_SIZE,
            actual: buf.len(),
        }
        .into());
    }

    if buf[0] != START_OF_MESSAGE {
        return Err(FrameError::InvalidStartMarker(buf[0]).into());
    }

    let declared = LittleEndian::read_u16(&buf[2..4]) as usize;
    if declared != buf.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: buf.len(),
        }
        .into());
    }

    verify_trailer(buf, Control::from_byte(buf[4]).use_crc())
}

fn verify_trailer(buf: &[u8], use_crc: bool) -> Result<usize> {
    if use_crc {
        let body_end = buf.len() - 2;
        let received = LittleEndian::read_u16(&buf[body_end..]);
        if !checksum::verify_crc16(&buf[..body_end], received) {
            return Err(FrameError::InvalidChecksum {
                expected: checksum::crc16(&buf[..body_end]),
                received,
            }
            .into());
        }
        Ok(body_end)
    } else {
        let body_end = buf.len() - 1;
        let received = buf[body_end];
        if !checksum::verify_checksum(&buf[..body_end], received) {
            return Err(FrameError::InvalidChecksum {
                expected: checksum::checksum(&buf[..body_end]) as u16,
                received: received as u16,
            }
            .into());
        }
        Ok(body_end)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("address", &format!("0x{:02X}", self.address))
            .field("direction", &self.direction)
            .field("sequence", &self.sequence)
            .field("use_crc", &self.use_crc)
            .field("security_block", &self.security_block.as_ref().map(|b| b.kind))
            .field("type_code", &format!("0x{:02X}", self.type_code))
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message[0x{:02X}](addr={}, seq={}, len={})",
            self.type_code,
            self.address,
            self.sequence,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_SECURE_CHANNEL_KEY;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn established_pair() -> (SecureChannel, SecureChannel) {
        let mut acu = SecureChannel::new();
        let mut pd = SecureChannel::new();
        let scbk = DEFAULT_SECURE_CHANNEL_KEY;

        acu.begin([1; 8]);
        let cryptogram = pd.respond_to_challenge(&scbk, [1; 8], [2; 8]);
        assert!(acu.accept_client_cryptogram(&scbk, [2; 8], &cryptogram));
        let rmac = pd.verify_server_cryptogram(&acu.server_cryptogram()).unwrap();
        assert!(acu.establish(&rmac));

        (acu, pd)
    }

    #[test]
    fn test_poll_wire_format() {
        let poll = Message::command(0x00, 0, true, 0x60, Vec::new());
        let encoded = poll.encode(None).unwrap();

        assert_eq!(encoded.as_ref(), &[0x53, 0x00, 0x08, 0x00, 0x04, 0x60, 0xEB, 0xAA]);
    }

    #[test]
    fn test_checksum_wire_format() {
        let poll = Message::command(0x00, 0, false, 0x60, Vec::new());
        let encoded = poll.encode(None).unwrap();

        assert_eq!(encoded.as_ref(), &[0x53, 0x00, 0x07, 0x00, 0x00, 0x60, 0x46]);
    }

    #[test]
    fn test_reply_direction_bit() {
        let ack = Message::reply(0x05, 2, true, 0x40, Vec::new());
        let encoded = ack.encode(None).unwrap();
        assert_eq!(encoded[1], 0x85);

        let decoded = Message::decode(&encoded, None).unwrap();
        assert_eq!(decoded.address, 0x05);
        assert_eq!(decoded.direction, Direction::Reply);
        assert_eq!(decoded.sequence, 2);
    }

    #[test]
    fn test_length_field_counts_whole_frame() {
        let message = Message::command(0x01, 1, true, 0x6A, vec![0u8; 5]);
        let encoded = message.encode(None).unwrap();

        let declared = u16::from_le_bytes([encoded[2], encoded[3]]) as usize;
        assert_eq!(declared, encoded.len());
    }

    #[test]
    fn test_corrupt_trailer() {
        let message = Message::command(0x01, 1, true, 0x61, vec![0x00]);
        let mut encoded = message.encode(None).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let result = Message::decode(&encoded, None);
        assert!(matches!(result, Err(Error::Frame(FrameError::InvalidChecksum { .. }))));
    }

    #[test]
    fn test_verify_frame_checks_both_trailers() {
        for use_crc in [true, false] {
            let mut encoded = Message::command(0x01, 2, use_crc, 0x60, Vec::new()).encode(None).unwrap();
            let trailer = if use_crc { encoded.len() - 2 } else { encoded.len() - 1 };
            assert_eq!(verify_frame(&encoded).unwrap(), trailer);

            encoded[trailer] ^= 0x01;
            assert!(matches!(
                verify_frame(&encoded),
                Err(Error::Frame(FrameError::InvalidChecksum { .. }))
            ));
        }
    }

    #[test]
    fn test_length_mismatch() {
        let message = Message::command(0x01, 1, false, 0x61, vec![0x00]);
        let mut encoded = message.encode(None).unwrap();
        encoded.extend_from_slice(&[0x00]);

        let result = Message::decode(&encoded, None);
        assert!(matches!(result, Err(Error::Frame(FrameError::LengthMismatch { .. }))));
    }

    #[test]
    fn test_too_short() {
        let result = Message::decode(&[0x53, 0x00, 0x03], None);
        assert!(matches!(result, Err(Error::Frame(FrameError::TooShort { .. }))));
    }

    #[test]
    fn test_bad_start_marker() {
        let mut encoded = Message::command(0x01, 1, false, 0x60, Vec::new()).encode(None).unwrap();
        encoded[0] = 0x00;

        let result = Message::decode(&encoded, None);
        assert!(matches!(result, Err(Error::Frame(FrameError::InvalidStartMarker(0x00)))));
    }

    #[test]
    fn test_handshake_block_in_clear() {
        let message = Message::command(0x01, 1, true, 0x76, vec![7u8; 8])
            .with_security_block(SecurityBlock::new(SecurityBlockType::BeginSession, [0x00]));
        let encoded = message.encode(None).unwrap();

        // SOM ADDR LEN LEN CTRL | 03 11 00 | 76 ...
        assert_eq!(encoded[4], 0x0D);
        assert_eq!(&encoded[5..8], &[0x03, 0x11, 0x00]);

        let decoded = Message::decode(&encoded, None).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_secured_requires_channel() {
        let message = Message::command(0x01, 1, true, 0x61, vec![0x00])
            .with_security_block(SecurityBlock::secured(Direction::Command, true));

        assert!(matches!(message.encode(None), Err(Error::SecureChannelRequired)));

        let mut unestablished = SecureChannel::new();
        assert!(matches!(
            message.encode(Some(&mut unestablished)),
            Err(Error::SecureChannelRequired)
        ));
    }

    #[test]
    fn test_secured_roundtrip() {
        let (mut acu, mut pd) = established_pair();

        let message = Message::command(0x01, 2, true, 0x6B, b"hello, reader".to_vec())
            .with_security_block(SecurityBlock::secured(Direction::Command, true));
        let encoded = message.encode(Some(&mut acu)).unwrap();

        // Payload is not visible on the wire
        assert!(!encoded.windows(5).any(|w| w == b"hello"));

        let decoded = Message::decode(&encoded, Some(&mut pd)).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(acu.cmac(), pd.cmac());
    }

    #[test]
    fn test_secured_empty_payload_is_mac_only() {
        let (mut acu, mut pd) = established_pair();

        let message = Message::command(0x01, 1, false, 0x60, Vec::new())
            .with_security_block(SecurityBlock::secured(Direction::Command, false));
        let encoded = message.encode(Some(&mut acu)).unwrap();

        // header 5 + block 2 + code 1 + mac 4 + checksum 1
        assert_eq!(encoded.len(), 13);

        let decoded = Message::decode(&encoded, Some(&mut pd)).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_tampered_secured_frame() {
        let (mut acu, mut pd) = established_pair();

        let message = Message::command(0x01, 1, false, 0x68, vec![1, 2, 3])
            .with_security_block(SecurityBlock::secured(Direction::Command, true));
        let mut encoded = message.encode(Some(&mut acu)).unwrap();

        // Flip a ciphertext bit and fix the checksum so only the MAC catches it
        encoded[8] ^= 0x01;
        let last = encoded.len() - 1;
        encoded[last] = checksum::checksum(&encoded[..last]);

        assert!(matches!(Message::decode(&encoded, Some(&mut pd)), Err(Error::InvalidMac)));
    }

    #[test]
    fn test_secured_frame_without_channel() {
        let (mut acu, _) = established_pair();

        let message = Message::command(0x01, 1, true, 0x60, Vec::new())
            .with_security_block(SecurityBlock::secured(Direction::Command, false));
        let encoded = message.encode(Some(&mut acu)).unwrap();

        assert!(matches!(
            Message::decode(&encoded, None),
            Err(Error::SecureChannelRequired)
        ));
    }

    #[test]
    fn test_oversized_payload() {
        let message = Message::command(0x01, 1, true, 0x7C, vec![0u8; MAX_FRAME_SIZE]);
        assert!(matches!(message.encode(None), Err(Error::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_control_byte() {
        let control = Control::new(3, true, true);
        assert_eq!(control.to_byte(), 0x0F);

        let parsed = Control::from_byte(0x05);
        assert_eq!(parsed.sequence, 1);
        assert!(parsed.use_crc());
        assert!(!parsed.has_security_block());
    }

    proptest! {
        #[test]
        fn prop_plain_roundtrip(
            address in 0u8..0x7F,
            sequence in 0u8..4,
            use_crc in any::<bool>(),
            reply in any::<bool>(),
            type_code in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let message = if reply {
                Message::reply(address, sequence, use_crc, type_code, payload)
            } else {
                Message::command(address, sequence, use_crc, type_code, payload)
            };
            let encoded = message.encode(None).unwrap();
            let decoded = Message::decode(&encoded, None).unwrap();
            prop_assert_eq!(decoded, message);
        }

        #[test]
        fn prop_secured_roundtrip(
            use_crc in any::<bool>(),
            payload in proptest::collection::vec(any::<u8>(), 0..200),
        ) {
            let (mut acu, mut pd) = established_pair();

            let command = Message::command(0x02, 1, use_crc, 0x80, payload.clone())
                .with_security_block(SecurityBlock::secured(Direction::Command, !payload.is_empty()));
            let encoded = command.encode(Some(&mut acu)).unwrap();
            prop_assert_eq!(Message::decode(&encoded, Some(&mut pd)).unwrap(), command);

            let reply = Message::reply(0x02, 1, use_crc, 0x90, payload.clone())
                .with_security_block(SecurityBlock::secured(Direction::Reply, !payload.is_empty()));
            let encoded = reply.encode(Some(&mut pd)).unwrap();
            prop_assert_eq!(Message::decode(&encoded, Some(&mut acu)).unwrap(), reply);
        }
    }
}
