//! Protocol state on the PD side
//!
//! [`PeripheralSession`] answers what the protocol itself owns (the secure
//! channel handshake, security policy, NAKs for malformed commands and
//! retransmission of the last reply) and hands every other command to the
//! application.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::{
    command::{Command, CommandCode, KeySlot},
    constants::{BROADCAST_ADDRESS, DEFAULT_SECURE_CHANNEL_KEY, HEADER_SIZE, REPLY_ADDRESS_FLAG},
    error::{Error, FrameError, Result},
    message::{Message, SecurityBlock, verify_frame},
    reply::{ErrorCode, Reply},
    secure_channel::{Direction, Key, SecureChannel},
};

/// Settings for the PD side of a link
#[derive(Debug, Clone)]
pub struct PeripheralOptions {
    /// Address this PD answers to, besides broadcast
    pub address: u8,

    /// Refuse most commands until a secure channel is established
    pub require_security: bool,

    /// Accept a handshake keyed with the installation key
    pub default_key_allowed: bool,

    /// Provisioned key (SCBK)
    pub secure_channel_key: Key,

    /// Installation key (SCBK-D)
    pub default_key: Key,

    /// Identifier returned in osdp_CCRYPT
    pub client_uid: [u8; 8],
}

impl Default for PeripheralOptions {
    fn default() -> Self {
        Self {
            address: 0,
            require_security: false,
            default_key_allowed: true,
            secure_channel_key: DEFAULT_SECURE_CHANNEL_KEY,
            default_key: DEFAULT_SECURE_CHANNEL_KEY,
            client_uid: [0u8; 8],
        }
    }
}

impl PeripheralOptions {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn with_require_security(mut self, require: bool) -> Self {
        self.require_security = require;
        self
    }

    pub fn with_default_key_allowed(mut self, allowed: bool) -> Self {
        self.default_key_allowed = allowed;
        self
    }

    pub fn with_secure_channel_key(mut self, key: Key) -> Self {
        self.secure_channel_key = key;
        self
    }

    pub fn with_default_key(mut self, key: Key) -> Self {
        self.default_key = key;
        self
    }

    pub fn with_client_uid(mut self, uid: [u8; 8]) -> Self {
        self.client_uid = uid;
        self
    }
}

/// A decoded command the application must answer
#[derive(Debug, Clone)]
pub struct IncomingCommand {
    /// Address the command was sent to (may be broadcast)
    pub address: u8,
    pub sequence: u8,
    pub use_crc: bool,
    /// Command arrived over the secure channel
    pub secured: bool,
    pub command: Command,
}

impl IncomingCommand {
    pub fn is_broadcast(&self) -> bool {
        self.address == BROADCAST_ADDRESS
    }
}

/// What to do with a received frame
#[derive(Debug)]
pub enum PeripheralAction {
    /// Write this reply; the session produced it
    Reply(Bytes),

    /// Let the application answer, then encode with [`PeripheralSession::encode_reply`]
    Dispatch(IncomingCommand),

    /// Not for this PD, or too broken to answer
    Ignore,
}

#[derive(Debug, Clone, Copy)]
struct Header {
    address: u8,
    sequence: u8,
    use_crc: bool,
    secured: bool,
}

/// Last answered command, kept for retransmission
#[derive(Debug, Clone)]
struct Exchange {
    sequence: u8,
    command: Bytes,
    reply: Bytes,
}

/// PD-side protocol state for one link
#[derive(Debug)]
pub struct PeripheralSession {
    options: PeripheralOptions,
    channel: SecureChannel,
    key_slot: KeySlot,
    last_exchange: Option<Exchange>,
    /// Frame being answered; paired with its reply once encoded
    current_command: Option<Bytes>,
}

impl PeripheralSession {
    pub fn new(options: PeripheralOptions) -> Self {
        Self {
            options,
            channel: SecureChannel::new(),
            key_slot: KeySlot::Provisioned,
            last_exchange: None,
            current_command: None,
        }
    }

    pub fn options(&self) -> &PeripheralOptions {
        &self.options
    }

    /// Swap in new settings; the secure channel is torn down
    pub fn set_options(&mut self, options: PeripheralOptions) {
        self.options = options;
        self.reset();
    }

    pub fn secure_channel(&self) -> &SecureChannel {
        &self.channel
    }

    pub fn is_secure(&self) -> bool {
        self.channel.is_established()
    }

    /// Forget the secure channel and the retransmission buffer
    pub fn reset(&mut self) {
        self.channel.reset();
        self.last_exchange = None;
        self.current_command = None;
    }

    /// Process one complete frame read from the bus
    ///
    /// # Errors
    ///
    /// Returns the frame error for frames too damaged to answer; these should
    /// be dropped without a reply and leave the session untouched.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Result<PeripheralAction> {
        if frame.len() < HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: HEADER_SIZE,
                actual: frame.len(),
            }
            .into());
        }

        if frame[1] & REPLY_ADDRESS_FLAG != 0 {
            return Ok(PeripheralAction::Ignore);
        }

        let address = frame[1];
        if address != self.options.address && address != BROADCAST_ADDRESS {
            return Ok(PeripheralAction::Ignore);
        }

        verify_frame(frame)?;

        let sequence = frame[4] & 0x03;
        if sequence == 0 {
            if self.channel.is_initialized() {
                debug!("Sequence 0 received, resetting secure channel");
            }
            self.reset();
        } else if let Some(last) = &self.last_exchange {
            // Same sequence with different content is a new command
            if last.sequence == sequence && last.command.as_ref() == frame {
                trace!("Repeated sequence {}, resending last reply", sequence);
                return Ok(PeripheralAction::Reply(last.reply.clone()));
            }
        }
        self.current_command = (sequence != 0).then(|| Bytes::copy_from_slice(frame));

        let mut header = Header {
            address,
            sequence,
            use_crc: frame[4] & 0x04 != 0,
            secured: false,
        };

        let message = match Message::decode(frame, Some(&mut self.channel)) {
            Ok(message) => message,
            Err(Error::Frame(FrameError::UnknownSecurityBlock(kind))) => {
                debug!("Unknown security block 0x{:02X}", kind);
                return self.nak(header, ErrorCode::DoesNotSupportSecurityBlock);
            }
            Err(Error::Frame(e)) => return Err(e.into()),
            Err(Error::InvalidMac) => {
                warn!("Command failed MAC verification, resetting secure channel");
                self.channel.reset();
                return self.nak(header, ErrorCode::CommunicationSecurityNotMet);
            }
            Err(Error::SecureChannelRequired) => {
                return self.nak(header, ErrorCode::CommunicationSecurityNotMet);
            }
            Err(e) => return Err(e),
        };

        header.secured = message.is_secured();

        let Ok(code) = CommandCode::try_from(message.type_code) else {
            return self.nak(header, ErrorCode::UnknownCommandCode);
        };

        if let Some(reason) = self.security_violation(code, header.secured) {
            debug!("Refusing unsecured {}", code);
            return self.nak(header, reason);
        }

        let command = match Command::from_parts(code, message.security_block.as_ref(), message.payload) {
            Ok(command) => command,
            Err(_) => return self.nak(header, ErrorCode::InvalidCommandLength),
        };

        match command {
            Command::SessionChallenge {
                server_random,
                key_slot,
            } => self.handle_challenge(header, server_random, key_slot),
            Command::ServerCryptogram { cryptogram, .. } => self.handle_server_cryptogram(header, cryptogram),
            command => Ok(PeripheralAction::Dispatch(IncomingCommand {
                address,
                sequence,
                use_crc: header.use_crc,
                secured: header.secured,
                command,
            })),
        }
    }

    /// Encode the application's reply to `incoming`
    ///
    /// The reply is secured when the command was, and kept for retransmission.
    pub fn encode_reply(&mut self, incoming: &IncomingCommand, reply: &Reply) -> Result<Bytes> {
        let header = Header {
            address: incoming.address,
            sequence: incoming.sequence,
            use_crc: incoming.use_crc,
            secured: incoming.secured,
        };
        self.encode(header, reply)
    }

    /// NAK reason for a command the security policy refuses
    fn security_violation(&self, code: CommandCode, secured: bool) -> Option<ErrorCode> {
        if secured || code == CommandCode::SessionChallenge {
            return None;
        }

        if self.channel.is_established() {
            return Some(ErrorCode::CommunicationSecurityNotMet);
        }

        if self.options.require_security && !code.allowed_without_security() && !code.is_handshake() {
            return Some(ErrorCode::CommunicationSecurityNotMet);
        }

        None
    }

    fn handle_challenge(&mut self, header: Header, server_random: [u8; 8], key_slot: KeySlot) -> Result<PeripheralAction> {
        let key = match key_slot {
            KeySlot::Default if !self.options.default_key_allowed => {
                debug!("Handshake with the default key refused");
                return self.nak(header, ErrorCode::DoesNotSupportSecurityBlock);
            }
            KeySlot::Default => self.options.default_key,
            KeySlot::Provisioned => self.options.secure_channel_key,
        };

        let client_random: [u8; 8] = rand::random();
        let cryptogram = self.channel.respond_to_challenge(&key, server_random, client_random);
        self.key_slot = key_slot;

        let reply = Reply::ClientCryptogram {
            client_uid: self.options.client_uid,
            client_random,
            cryptogram,
        };
        self.encode(header, &reply).map(PeripheralAction::Reply)
    }

    fn handle_server_cryptogram(&mut self, header: Header, cryptogram: [u8; 16]) -> Result<PeripheralAction> {
        match self.channel.verify_server_cryptogram(&cryptogram) {
            Some(rmac) => {
                debug!("Secure channel established");
                let reply = Reply::InitialRmac { rmac, accepted: true };
                self.encode(header, &reply).map(PeripheralAction::Reply)
            }
            None => self.nak(header, ErrorCode::CommunicationSecurityNotMet),
        }
    }

    fn nak(&mut self, header: Header, code: ErrorCode) -> Result<PeripheralAction> {
        let header = Header {
            secured: header.secured && self.channel.is_established(),
            ..header
        };
        self.encode(header, &Reply::Nak(code)).map(PeripheralAction::Reply)
    }

    fn encode(&mut self, header: Header, reply: &Reply) -> Result<Bytes> {
        let data = reply.data();
        let message = Message::reply(self.options.address, header.sequence, header.use_crc, reply.code(), data.clone());

        let encoded = if let Some(block) = reply.handshake_block(self.key_slot.to_byte()) {
            message.with_security_block(block).encode(None)?
        } else if header.secured && self.channel.is_established() {
            message
                .with_security_block(SecurityBlock::secured(Direction::Reply, !data.is_empty()))
                .encode(Some(&mut self.channel))?
        } else {
            message.encode(None)?
        };
        let frame = encoded.freeze();

        // A command answered with BUSY is processed again when repeated
        self.last_exchange = match self.current_command.take() {
            Some(command) if *reply != Reply::Busy => Some(Exchange {
                sequence: header.sequence,
                command,
                reply: frame.clone(),
            }),
            _ => None,
        };
        trace!("Replying {} to 0x{:02X}", reply, header.address);

        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::ReplyCode;
    use pretty_assertions::assert_eq;

    const KEY: Key = [0x42; 16];

    fn command(address: u8, sequence: u8, code: CommandCode, data: &[u8]) -> Vec<u8> {
        Message::command(address, sequence, true, code.into(), data.to_vec())
            .encode(None)
            .unwrap()
            .to_vec()
    }

    fn reply_of(action: PeripheralAction) -> Message {
        match action {
            PeripheralAction::Reply(bytes) => Message::decode(&bytes, None).unwrap(),
            other => panic!("expected a reply, got {:?}", other),
        }
    }

    fn secure_pd() -> PeripheralSession {
        PeripheralSession::new(
            PeripheralOptions::new(1)
                .with_secure_channel_key(KEY)
                .with_require_security(true),
        )
    }

    #[test]
    fn test_dispatches_poll() {
        let mut pd = PeripheralSession::new(PeripheralOptions::new(1));
        let action = pd.handle_frame(&command(1, 0, CommandCode::Poll, &[])).unwrap();

        let PeripheralAction::Dispatch(incoming) = action else {
            panic!("expected dispatch");
        };
        assert_eq!(incoming.command, Command::Poll);
        assert!(!incoming.secured);

        let reply = pd.encode_reply(&incoming, &Reply::Ack).unwrap();
        let reply = Message::decode(&reply, None).unwrap();
        assert_eq!(reply.address, 1);
        assert_eq!(reply.direction, Direction::Reply);
        assert_eq!(reply.type_code, 0x40);
    }

    #[test]
    fn test_ignores_other_addresses_and_replies() {
        let mut pd = PeripheralSession::new(PeripheralOptions::new(1));

        let other = pd.handle_frame(&command(2, 0, CommandCode::Poll, &[])).unwrap();
        assert!(matches!(other, PeripheralAction::Ignore));

        let echo = Message::reply(1, 0, true, 0x40, Vec::new()).encode(None).unwrap();
        assert!(matches!(pd.handle_frame(&echo).unwrap(), PeripheralAction::Ignore));
    }

    #[test]
    fn test_accepts_broadcast() {
        let mut pd = PeripheralSession::new(PeripheralOptions::new(1));
        let action = pd
            .handle_frame(&command(BROADCAST_ADDRESS, 1, CommandCode::IdReport, &[0x00]))
            .unwrap();

        let PeripheralAction::Dispatch(incoming) = action else {
            panic!("expected dispatch");
        };
        assert!(incoming.is_broadcast());
    }

    #[test]
    fn test_unknown_command_nak() {
        let mut pd = PeripheralSession::new(PeripheralOptions::new(1));
        let frame = Message::command(1, 1, true, 0x01, Vec::new()).encode(None).unwrap();

        let reply = reply_of(pd.handle_frame(&frame).unwrap());
        assert_eq!(reply.type_code, 0x41);
        assert_eq!(reply.payload.as_ref(), &[0x03]);
    }

    #[test]
    fn test_require_security_exemptions() {
        let mut pd = secure_pd();

        for (sequence, code) in [
            (1, CommandCode::Poll),
            (2, CommandCode::IdReport),
            (3, CommandCode::DeviceCapabilities),
            (1, CommandCode::CommunicationSet),
        ] {
            let action = pd.handle_frame(&command(1, sequence, code, &[0x00])).unwrap();
            assert!(matches!(action, PeripheralAction::Dispatch(_)), "{} refused", code);
        }

        for (sequence, code) in [
            (2, CommandCode::LedControl),
            (3, CommandCode::OutputControl),
            (1, CommandCode::FileTransfer),
        ] {
            let reply = reply_of(pd.handle_frame(&command(1, sequence, code, &[0x00])).unwrap());
            assert_eq!(reply.type_code, 0x41, "{} accepted", code);
            assert_eq!(reply.payload.as_ref(), &[u8::from(ErrorCode::CommunicationSecurityNotMet)]);
        }
    }

    #[test]
    fn test_default_key_refused() {
        let mut pd = PeripheralSession::new(
            PeripheralOptions::new(1)
                .with_secure_channel_key(KEY)
                .with_default_key_allowed(false),
        );

        let challenge = Message::command(1, 1, true, 0x76, vec![0xB0; 8])
            .with_security_block(SecurityBlock::new(crate::message::SecurityBlockType::BeginSession, [0x00]))
            .encode(None)
            .unwrap();

        let reply = reply_of(pd.handle_frame(&challenge).unwrap());
        assert_eq!(reply.type_code, 0x41);
        assert_eq!(reply.payload.as_ref(), &[0x05]);
    }

    #[test]
    fn test_challenge_reply_verifies() {
        let mut pd = secure_pd();

        let server_random = [0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7];
        let challenge = Command::SessionChallenge {
            server_random,
            key_slot: KeySlot::Provisioned,
        };
        let frame = Message::command(1, 1, true, 0x76, challenge.data())
            .with_security_block(challenge.handshake_block().unwrap())
            .encode(None)
            .unwrap();

        let reply = reply_of(pd.handle_frame(&frame).unwrap());
        let Reply::ClientCryptogram {
            client_random,
            cryptogram,
            ..
        } = Reply::from_parts(reply.type_code, reply.security_block.as_ref(), reply.payload)
        else {
            panic!("expected osdp_CCRYPT");
        };

        let mut acu = SecureChannel::new();
        acu.begin(server_random);
        assert!(acu.accept_client_cryptogram(&KEY, client_random, &cryptogram));
    }

    #[test]
    fn test_bad_server_cryptogram_nak() {
        let mut pd = secure_pd();

        let scrypt = Command::ServerCryptogram {
            cryptogram: [0u8; 16],
            key_slot: KeySlot::Provisioned,
        };
        let frame = Message::command(1, 1, true, 0x77, scrypt.data())
            .with_security_block(scrypt.handshake_block().unwrap())
            .encode(None)
            .unwrap();

        let reply = reply_of(pd.handle_frame(&frame).unwrap());
        assert_eq!(reply.type_code, 0x41);
        assert_eq!(reply.payload.as_ref(), &[0x06]);
        assert!(!pd.is_secure());
    }

    #[test]
    fn test_repeated_sequence_resends_last_reply() {
        let mut pd = PeripheralSession::new(PeripheralOptions::new(1));
        let frame = command(1, 2, CommandCode::IdReport, &[0x00]);

        let PeripheralAction::Dispatch(incoming) = pd.handle_frame(&frame).unwrap() else {
            panic!("expected dispatch");
        };
        let first = pd
            .encode_reply(&incoming, &Reply::new(ReplyCode::IdReport, vec![1u8; 12]))
            .unwrap();

        let PeripheralAction::Reply(second) = pd.handle_frame(&frame).unwrap() else {
            panic!("expected retransmission");
        };
        assert_eq!(first, second);
    }

    #[test]
    fn test_same_sequence_new_command_is_dispatched() {
        let mut pd = PeripheralSession::new(PeripheralOptions::new(1));

        let PeripheralAction::Dispatch(incoming) = pd.handle_frame(&command(1, 2, CommandCode::Poll, &[])).unwrap()
        else {
            panic!("expected dispatch");
        };
        pd.encode_reply(&incoming, &Reply::Ack).unwrap();

        let action = pd
            .handle_frame(&command(1, 2, CommandCode::IdReport, &[0x00]))
            .unwrap();
        let PeripheralAction::Dispatch(incoming) = action else {
            panic!("stored reply resent for a different command");
        };
        assert_eq!(incoming.command.code(), CommandCode::IdReport);
    }

    #[test]
    fn test_busy_reply_is_not_resent() {
        let mut pd = PeripheralSession::new(PeripheralOptions::new(1));
        let frame = command(1, 1, CommandCode::LedControl, &[0x00]);

        let PeripheralAction::Dispatch(incoming) = pd.handle_frame(&frame).unwrap() else {
            panic!("expected dispatch");
        };
        pd.encode_reply(&incoming, &Reply::Busy).unwrap();

        assert!(matches!(pd.handle_frame(&frame).unwrap(), PeripheralAction::Dispatch(_)));
    }

    #[test]
    fn test_corrupt_repeat_is_error() {
        let mut pd = PeripheralSession::new(PeripheralOptions::new(1));
        let frame = command(1, 3, CommandCode::Poll, &[]);

        let PeripheralAction::Dispatch(incoming) = pd.handle_frame(&frame).unwrap() else {
            panic!("expected dispatch");
        };
        pd.encode_reply(&incoming, &Reply::Ack).unwrap();

        let mut damaged = frame.clone();
        let last = damaged.len() - 1;
        damaged[last] ^= 0x5A;
        assert!(pd.handle_frame(&damaged).is_err());
    }

    #[test]
    fn test_short_frame_is_error() {
        let mut pd = PeripheralSession::new(PeripheralOptions::new(1));
        assert!(pd.handle_frame(&[0x53, 0x01]).is_err());
    }
}
