//! Per-device protocol state on the ACU side
//!
//! A [`DeviceSession`] tracks everything the ACU knows about one PD address:
//! - Sequence number (advanced only by a validated reply)
//! - Retry budget and the command waiting to be retried
//! - Outbound command queue
//! - Secure channel handshake and rolling MAC state
//! - Liveness and the connection status reported upwards
//!
//! It performs no I/O. The bus asks it for the next frame, writes it, and feeds
//! back whatever reply (or timeout) follows.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::{
    command::{Command, CommandCode, KeySlot},
    constants::{
        BROADCAST_ADDRESS, DEFAULT_BUSY_DELAY, DEFAULT_OFFLINE_TIMEOUT, DEFAULT_SECURE_CHANNEL_KEY,
        HEADER_SIZE, REPLY_ADDRESS_FLAG, RETRY_AMOUNT,
    },
    error::{Error, Result},
    message::{Message, SecurityBlock},
    reply::{ErrorCode, Reply},
    secure_channel::{Direction, Key, SecureChannel},
};

/// Identifies a queued command so its outcome can be routed back to the caller
pub type Ticket = u64;

/// Settings for one device on a bus
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Device address (0-126)
    pub address: u8,

    /// Use CRC-16 trailers instead of checksums
    pub use_crc: bool,

    /// Establish a secure channel before sending application commands
    pub use_secure_channel: bool,

    /// Key the handshake is keyed with
    pub secure_channel_key: Key,

    /// Well-known installation key; a handshake with this key uses key slot 0
    pub default_key: Key,

    /// No valid reply for this long takes the device offline
    pub offline_timeout: Duration,

    /// Back-off after an osdp_BUSY reply
    pub busy_delay: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            address: 0,
            use_crc: true,
            use_secure_channel: false,
            secure_channel_key: DEFAULT_SECURE_CHANNEL_KEY,
            default_key: DEFAULT_SECURE_CHANNEL_KEY,
            offline_timeout: DEFAULT_OFFLINE_TIMEOUT,
            busy_delay: DEFAULT_BUSY_DELAY,
        }
    }
}

impl DeviceOptions {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn with_crc(mut self, use_crc: bool) -> Self {
        self.use_crc = use_crc;
        self
    }

    /// Require a secure channel keyed with `key`
    pub fn with_secure_channel(mut self, key: Key) -> Self {
        self.use_secure_channel = true;
        self.secure_channel_key = key;
        self
    }

    pub fn with_default_key(mut self, key: Key) -> Self {
        self.default_key = key;
        self
    }

    pub fn with_offline_timeout(mut self, timeout: Duration) -> Self {
        self.offline_timeout = timeout;
        self
    }

    pub fn with_busy_delay(mut self, delay: Duration) -> Self {
        self.busy_delay = delay;
        self
    }

    /// Check if the configured key is the installation key
    pub fn is_default_key(&self) -> bool {
        self.secure_channel_key == self.default_key
    }
}

/// Something the session wants reported to the application
#[derive(Debug)]
pub enum SessionEvent {
    /// Online or secure state changed
    ConnectionStatus { online: bool, secure: bool },

    /// A reply to an application command or poll
    Reply { command: CommandCode, reply: Reply },

    /// Final outcome of a ticketed command
    Completed { ticket: Ticket, result: Result<Reply> },
}

#[derive(Debug, Clone)]
struct Pending {
    ticket: Option<Ticket>,
    command: Command,
}

impl Pending {
    fn untracked(command: Command) -> Self {
        Self { ticket: None, command }
    }

    /// Session-generated poll or handshake step with nobody waiting on it
    fn is_protocol(&self) -> bool {
        self.ticket.is_none() && (self.command.is_poll() || self.command.is_handshake())
    }
}

/// ACU-side state for one device address
#[derive(Debug)]
pub struct DeviceSession {
    options: DeviceOptions,
    sequence: u8,
    retry_budget: u8,
    retry: Option<Pending>,
    in_flight: Option<Pending>,
    queue: VecDeque<Pending>,
    multipart_queue: VecDeque<Pending>,
    channel: SecureChannel,
    last_valid_reply: Option<Instant>,
    responsive: bool,
    reported: (bool, bool),
    sending_multipart: bool,
    receiving_multipart: bool,
    no_secure_channel_override: bool,
    request_delay_until: Option<Instant>,
    events: VecDeque<SessionEvent>,
}

impl DeviceSession {
    /// Create a session for a newly registered device
    pub fn new(options: DeviceOptions) -> Self {
        Self {
            options,
            sequence: 0,
            retry_budget: RETRY_AMOUNT,
            retry: None,
            in_flight: None,
            queue: VecDeque::new(),
            multipart_queue: VecDeque::new(),
            channel: SecureChannel::new(),
            last_valid_reply: None,
            responsive: false,
            reported: (false, false),
            sending_multipart: false,
            receiving_multipart: false,
            no_secure_channel_override: false,
            request_delay_until: None,
            events: VecDeque::new(),
        }
    }

    pub fn address(&self) -> u8 {
        self.options.address
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    /// Sequence number the next command will carry
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Failures left before the pending command is dropped
    pub fn retry_budget(&self) -> u8 {
        self.retry_budget
    }

    /// Check if a command is waiting to be retried
    pub fn has_retry(&self) -> bool {
        self.retry.is_some()
    }

    /// Number of queued application commands
    pub fn queued(&self) -> usize {
        self.queue.len() + self.multipart_queue.len()
    }

    pub fn secure_channel(&self) -> &SecureChannel {
        &self.channel
    }

    /// Check if the handshake has completed
    pub fn is_secure(&self) -> bool {
        self.channel.is_established()
    }

    /// Check if the device is answering and, when required, secured
    pub fn is_online(&self) -> bool {
        self.responsive && (!self.options.use_secure_channel || self.channel.is_established())
    }

    pub fn last_valid_reply(&self) -> Option<Instant> {
        self.last_valid_reply
    }

    pub fn is_sending_multipart(&self) -> bool {
        self.sending_multipart
    }

    pub fn is_receiving_multipart(&self) -> bool {
        self.receiving_multipart
    }

    pub fn set_sending_multipart(&mut self, value: bool) {
        self.sending_multipart = value;
    }

    pub fn set_receiving_multipart(&mut self, value: bool) {
        self.receiving_multipart = value;
    }

    /// Let application commands through before the handshake completes
    pub fn set_no_secure_channel_override(&mut self, value: bool) {
        self.no_secure_channel_override = value;
    }

    pub fn no_secure_channel_override(&self) -> bool {
        self.no_secure_channel_override
    }

    /// Suppress this device's turn until `until`
    pub fn request_delay(&mut self, until: Instant) {
        self.request_delay_until = Some(until);
    }

    /// Queue an application command
    pub fn enqueue(&mut self, command: Command, ticket: Option<Ticket>) {
        self.queue.push_back(Pending { ticket, command });
    }

    /// Queue one piece of a multi-part exchange
    ///
    /// These bypass the hold placed on ordinary commands while a multi-part
    /// exchange is in progress.
    pub fn enqueue_multipart(&mut self, command: Command, ticket: Option<Ticket>) {
        self.multipart_queue.push_back(Pending { ticket, command });
    }

    /// Force a new handshake
    pub fn reset_secure_channel(&mut self) {
        debug!("Device {}: secure channel reset", self.address());
        self.reset_channel();
        self.refresh_status();
    }

    /// Drain pending status and reply events
    pub fn drain_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.events.drain(..)
    }

    /// Fail every command that still has a caller waiting
    ///
    /// Used when the device is removed or the bus shuts down.
    pub fn abandon(&mut self) {
        let pending: Vec<_> = self
            .in_flight
            .take()
            .into_iter()
            .chain(self.retry.take())
            .chain(self.multipart_queue.drain(..))
            .chain(self.queue.drain(..))
            .collect();

        for pending in pending {
            self.complete(pending.ticket, Err(Error::OperationCancelled));
        }
    }

    /// Check if the device may be addressed at `now`
    pub fn is_ready(&self, now: Instant) -> bool {
        self.request_delay_until.is_none_or(|until| now >= until)
    }

    /// Pick and encode the next command for this device
    ///
    /// Returns `None` when the device asked for a delay, or when a multi-part
    /// send is in progress and no fragment is queued.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<BytesMut> {
        loop {
            let pending = self.next_command(now)?;

            match self.build_command(&pending.command) {
                Ok(frame) => {
                    trace!("Device {}: sending {} seq={}", self.address(), pending.command, self.sequence);
                    self.in_flight = Some(pending);
                    return Some(frame);
                }
                Err(e) => {
                    warn!("Device {}: cannot encode {}: {}", self.address(), pending.command, e);
                    self.complete(pending.ticket, Err(e));
                }
            }
        }
    }

    /// Choose the command for this tick
    ///
    /// Priority: the first poll at sequence 0, then the retry command, then the
    /// next handshake step, then queued commands, then a bare poll.
    fn next_command(&mut self, now: Instant) -> Option<Pending> {
        if !self.is_ready(now) {
            return None;
        }
        self.request_delay_until = None;

        if self.sequence == 0 {
            return Some(Pending::untracked(Command::Poll));
        }

        if let Some(retry) = self.retry.take() {
            return Some(retry);
        }

        if self.options.use_secure_channel && !self.no_secure_channel_override && !self.channel.is_established() {
            return Some(Pending::untracked(self.handshake_step()));
        }

        if let Some(pending) = self.multipart_queue.pop_front() {
            return Some(pending);
        }

        if !self.sending_multipart && !self.receiving_multipart {
            if let Some(pending) = self.queue.pop_front() {
                return Some(pending);
            }
        }

        if self.sending_multipart {
            return None;
        }

        Some(Pending::untracked(Command::Poll))
    }

    fn key_slot(&self) -> KeySlot {
        if self.options.is_default_key() {
            KeySlot::Default
        } else {
            KeySlot::Provisioned
        }
    }

    fn handshake_step(&mut self) -> Command {
        if self.channel.is_initialized() {
            Command::ServerCryptogram {
                cryptogram: self.channel.server_cryptogram(),
                key_slot: self.key_slot(),
            }
        } else {
            let server_random: [u8; 8] = rand::random();
            self.channel.begin(server_random);
            Command::SessionChallenge {
                server_random,
                key_slot: self.key_slot(),
            }
        }
    }

    /// Encode a command with the current sequence number
    ///
    /// Handshake commands carry their own block in clear; everything else is
    /// secured once the channel is established.
    pub fn build_command(&mut self, command: &Command) -> Result<BytesMut> {
        let data = command.data();
        let mut message = Message::command(
            self.options.address,
            self.sequence,
            self.options.use_crc,
            command.code().into(),
            data.clone(),
        );

        if let Some(block) = command.handshake_block() {
            message = message.with_security_block(block);
            return message.encode(None);
        }

        if self.channel.is_established() {
            message = message.with_security_block(SecurityBlock::secured(Direction::Command, !data.is_empty()));
            return message.encode(Some(&mut self.channel));
        }

        message.encode(None)
    }

    /// Feed back a frame read while waiting for a reply
    ///
    /// # Errors
    ///
    /// The frame is discarded and the command stays in flight when it is
    /// malformed, fails MAC verification, comes from another address or does
    /// not echo the sequence number. A failed MAC also resets the secure
    /// channel.
    pub fn handle_reply(&mut self, frame: &[u8], now: Instant) -> Result<()> {
        if self.in_flight.is_none() {
            return Err(Error::UnsolicitedReply);
        }
        self.check_header(frame)?;

        let message = match Message::decode(frame, Some(&mut self.channel)) {
            Ok(message) => message,
            Err(Error::InvalidMac) => {
                warn!("Device {}: reply failed MAC verification", self.address());
                self.reset_secure_channel();
                return Err(Error::InvalidMac);
            }
            Err(e) => return Err(e),
        };

        let Some(pending) = self.in_flight.take() else {
            return Err(Error::UnsolicitedReply);
        };

        let reply = Reply::from_parts(message.type_code, message.security_block.as_ref(), message.payload);
        trace!("Device {}: received {} seq={}", self.address(), reply, message.sequence);

        self.last_valid_reply = Some(now);
        self.responsive = true;

        match reply {
            Reply::Busy => {
                debug!("Device {}: busy", self.address());
                self.request_delay_until = Some(now + self.options.busy_delay);
                self.retry = Some(pending);
            }
            Reply::Nak(ErrorCode::UnexpectedSequenceNumber) => {
                debug!("Device {}: sequence rejected, starting over", self.address());
                self.restart();
                self.emit_reply(&pending.command, Reply::Nak(ErrorCode::UnexpectedSequenceNumber));
                self.fail(pending, Ok(Reply::Nak(ErrorCode::UnexpectedSequenceNumber)));
            }
            reply => {
                self.advance_sequence();
                if pending.command.is_handshake() {
                    self.handle_handshake_reply(&pending.command, reply);
                } else {
                    self.handle_command_reply(pending, reply);
                }
            }
        }

        self.refresh_status();
        Ok(())
    }

    /// Note that no valid reply arrived within the reply window
    ///
    /// An unanswered poll or handshake step is repeated unchanged on the same
    /// sequence, since the PD may have answered it and will only resend that
    /// answer for the identical frame. It costs no retry budget.
    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(pending) = self.in_flight.take() {
            debug!("Device {}: no reply to {}", self.address(), pending.command);
            if self.sequence != 0 && pending.is_protocol() {
                self.retry = Some(pending);
            } else {
                self.fail(pending, Err(Error::Timeout));
            }
        }
        self.check_liveness(now);
    }

    /// Take the device offline once it has been silent too long
    pub fn check_liveness(&mut self, now: Instant) {
        let alive = self
            .last_valid_reply
            .is_some_and(|at| now.saturating_duration_since(at) < self.options.offline_timeout);

        if self.responsive && !alive {
            debug!("Device {}: offline", self.address());
            self.responsive = false;
            self.restart();
        }

        self.refresh_status();
    }

    fn check_header(&self, frame: &[u8]) -> Result<()> {
        if frame.len() < HEADER_SIZE {
            return Ok(());
        }

        if frame[1] & REPLY_ADDRESS_FLAG == 0 {
            return Err(Error::UnexpectedDirection);
        }

        let address = frame[1] & !REPLY_ADDRESS_FLAG;
        if address != self.options.address && self.options.address != BROADCAST_ADDRESS {
            return Err(Error::UnexpectedAddress {
                expected: self.options.address,
                actual: address,
            });
        }

        let sequence = frame[4] & 0x03;
        if sequence != self.sequence {
            return Err(Error::UnexpectedSequence {
                expected: self.sequence,
                actual: sequence,
            });
        }

        Ok(())
    }

    fn handle_handshake_reply(&mut self, command: &Command, reply: Reply) {
        let key = self.handshake_key();

        match (command, reply) {
            (
                Command::SessionChallenge { .. },
                Reply::ClientCryptogram {
                    client_random,
                    cryptogram,
                    ..
                },
            ) => {
                if self.channel.accept_client_cryptogram(&key, client_random, &cryptogram) {
                    debug!("Device {}: client cryptogram accepted", self.address());
                }
            }
            (Command::ServerCryptogram { .. }, Reply::InitialRmac { rmac, accepted }) => {
                if accepted && self.channel.establish(&rmac) {
                    debug!("Device {}: secure channel established", self.address());
                } else {
                    self.reset_channel();
                }
            }
            (_, reply) => {
                debug!("Device {}: handshake answered with {}", self.address(), reply);
                self.reset_channel();
            }
        }
    }

    fn handshake_key(&self) -> Key {
        match self.key_slot() {
            KeySlot::Default => self.options.default_key,
            KeySlot::Provisioned => self.options.secure_channel_key,
        }
    }

    fn handle_command_reply(&mut self, pending: Pending, reply: Reply) {
        if let Reply::Nak(code) = reply {
            warn!("Device {}: {} rejected with {}", self.address(), pending.command, code);

            let security_rejected = matches!(
                code,
                ErrorCode::CommunicationSecurityNotMet | ErrorCode::DoesNotSupportSecurityBlock
            );
            if security_rejected && self.channel.is_established() {
                self.reset_channel();
            }

            self.emit_reply(&pending.command, reply.clone());
            self.fail(pending, Ok(reply));
            return;
        }

        self.retry_budget = RETRY_AMOUNT;

        if !(pending.command.is_poll() && reply == Reply::Ack) {
            self.emit_reply(&pending.command, reply.clone());
        }
        self.complete(pending.ticket, Ok(reply));
    }

    /// Apply the retry policy to a failed command
    fn fail(&mut self, pending: Pending, outcome: Result<Reply>) {
        if pending.command.is_handshake() {
            self.reset_channel();
            return;
        }

        if pending.is_protocol() {
            return;
        }

        if self.retry_budget > 0 {
            self.retry_budget -= 1;
            trace!("Device {}: retrying {} ({} left)", self.address(), pending.command, self.retry_budget);
            self.retry = Some(pending);
        } else {
            debug!("Device {}: dropping {}", self.address(), pending.command);
            self.retry_budget = RETRY_AMOUNT;
            self.complete(pending.ticket, outcome);
        }
    }

    fn advance_sequence(&mut self) {
        self.sequence = self.sequence % 3 + 1;
    }

    /// Drop the channel along with any handshake step waiting to be repeated
    fn reset_channel(&mut self) {
        self.channel.reset();
        if self.retry.as_ref().is_some_and(|r| r.command.is_handshake()) {
            self.retry = None;
        }
    }

    /// Start over from the sequence 0 poll
    fn restart(&mut self) {
        self.sequence = 0;
        self.reset_channel();
        if self.retry.as_ref().is_some_and(Pending::is_protocol) {
            self.retry = None;
        }
    }

    fn emit_reply(&mut self, command: &Command, reply: Reply) {
        self.events.push_back(SessionEvent::Reply {
            command: command.code(),
            reply,
        });
    }

    fn complete(&mut self, ticket: Option<Ticket>, result: Result<Reply>) {
        if let Some(ticket) = ticket {
            self.events.push_back(SessionEvent::Completed { ticket, result });
        }
    }

    fn refresh_status(&mut self) {
        let status = (self.is_online(), self.is_secure());
        if status != self.reported {
            self.reported = status;
            self.events.push_back(SessionEvent::ConnectionStatus {
                online: status.0,
                secure: status.1,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::{PeripheralAction, PeripheralOptions, PeripheralSession};
    use crate::reply::ReplyCode;
    use pretty_assertions::assert_eq;

    const PROVISIONED_KEY: Key = [0xA5; 16];

    fn ack(address: u8, sequence: u8) -> Vec<u8> {
        Message::reply(address, sequence, true, 0x40, Vec::new())
            .encode(None)
            .unwrap()
            .to_vec()
    }

    fn nak(address: u8, sequence: u8, code: ErrorCode) -> Vec<u8> {
        Message::reply(address, sequence, true, 0x41, vec![u8::from(code)])
            .encode(None)
            .unwrap()
            .to_vec()
    }

    fn events(session: &mut DeviceSession) -> Vec<SessionEvent> {
        session.drain_events().collect()
    }

    /// Type code and secured flag of an encoded command, read off the wire bytes
    fn peek(frame: &[u8]) -> (u8, bool) {
        if frame[4] & 0x08 == 0 {
            return (frame[5], false);
        }
        let block_len = frame[5] as usize;
        (frame[5 + block_len], (0x15..=0x18).contains(&frame[6]))
    }

    /// Run one exchange between the two sessions
    fn exchange(acu: &mut DeviceSession, pd: &mut PeripheralSession, now: Instant) -> Option<(u8, bool)> {
        let frame = acu.poll_transmit(now)?;
        let sent = peek(&frame);

        let reply = match pd.handle_frame(&frame).unwrap() {
            PeripheralAction::Reply(bytes) => bytes,
            PeripheralAction::Dispatch(incoming) => {
                let reply = match incoming.command.code() {
                    CommandCode::IdReport => Reply::new(ReplyCode::IdReport, vec![0u8; 12]),
                    _ => Reply::Ack,
                };
                pd.encode_reply(&incoming, &reply).unwrap()
            }
            PeripheralAction::Ignore => {
                acu.handle_timeout(now);
                return Some(sent);
            }
        };

        acu.handle_reply(&reply, now).unwrap();
        Some(sent)
    }

    #[test]
    fn test_first_command_is_poll_at_sequence_zero() {
        let mut session = DeviceSession::new(DeviceOptions::new(1).with_secure_channel(PROVISIONED_KEY));
        let now = Instant::now();

        let frame = session.poll_transmit(now).unwrap();
        let message = Message::decode(&frame, None).unwrap();

        assert_eq!(message.sequence, 0);
        assert_eq!(message.type_code, 0x60);
        assert!(message.security_block.is_none());
    }

    #[test]
    fn test_sequence_cycles_after_first_poll() {
        let mut session = DeviceSession::new(DeviceOptions::new(1));
        let now = Instant::now();

        for n in 1..=10u8 {
            let sequence = session.sequence();
            session.poll_transmit(now).unwrap();
            session.handle_reply(&ack(1, sequence), now).unwrap();
            assert_eq!(session.sequence(), 1 + (n - 1) % 3);
        }
    }

    #[test]
    fn test_sequence_holds_on_timeout() {
        let mut session = DeviceSession::new(DeviceOptions::new(1));
        let now = Instant::now();

        session.poll_transmit(now).unwrap();
        session.handle_reply(&ack(1, 0), now).unwrap();
        assert_eq!(session.sequence(), 1);

        session.poll_transmit(now).unwrap();
        session.handle_timeout(now);
        assert_eq!(session.sequence(), 1);
    }

    #[test]
    fn test_reply_from_other_address_ignored() {
        let mut session = DeviceSession::new(DeviceOptions::new(1));
        let now = Instant::now();

        session.poll_transmit(now).unwrap();
        let result = session.handle_reply(&ack(2, 0), now);

        assert!(matches!(result, Err(Error::UnexpectedAddress { expected: 1, actual: 2 })));
        assert_eq!(session.sequence(), 0);

        // Still waiting for the right device
        session.handle_reply(&ack(1, 0), now).unwrap();
        assert_eq!(session.sequence(), 1);
    }

    #[test]
    fn test_online_edge_raised_once() {
        let mut session = DeviceSession::new(DeviceOptions::new(1));
        let now = Instant::now();

        session.poll_transmit(now).unwrap();
        session.handle_reply(&ack(1, 0), now).unwrap();
        session.poll_transmit(now).unwrap();
        session.handle_reply(&ack(1, 1), now).unwrap();

        let status: Vec<_> = events(&mut session)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::ConnectionStatus { .. }))
            .collect();
        assert_eq!(status.len(), 1);
        assert!(matches!(
            status[0],
            SessionEvent::ConnectionStatus {
                online: true,
                secure: false
            }
        ));
    }

    #[test]
    fn test_goes_offline_after_silence() {
        let options = DeviceOptions::new(1).with_offline_timeout(Duration::from_secs(8));
        let mut session = DeviceSession::new(options);
        let start = Instant::now();

        session.poll_transmit(start).unwrap();
        session.handle_reply(&ack(1, 0), start).unwrap();
        assert!(session.is_online());
        events(&mut session);

        let later = start + Duration::from_secs(9);
        session.poll_transmit(later).unwrap();
        session.handle_timeout(later);

        assert!(!session.is_online());
        assert_eq!(session.sequence(), 0);
        assert!(matches!(
            events(&mut session).as_slice(),
            [SessionEvent::ConnectionStatus { online: false, .. }]
        ));
    }

    #[test]
    fn test_retry_budget() {
        let mut session = DeviceSession::new(DeviceOptions::new(1));
        let now = Instant::now();

        session.poll_transmit(now).unwrap();
        session.handle_reply(&ack(1, 0), now).unwrap();
        events(&mut session);

        session.enqueue(Command::new(CommandCode::LedControl, vec![0u8; 14]), Some(7));

        // First and second failures keep the command for a retry
        for remaining in [1, 0] {
            let frame = session.poll_transmit(now).unwrap();
            assert_eq!(frame[5], 0x69);
            session.handle_timeout(now);
            assert_eq!(session.retry_budget(), remaining);
            assert!(session.has_retry());
        }

        // The third failure drops it and restores the budget
        session.poll_transmit(now).unwrap();
        session.handle_timeout(now);
        assert!(!session.has_retry());
        assert_eq!(session.retry_budget(), RETRY_AMOUNT);

        let completed: Vec<_> = events(&mut session)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Completed { ticket, result } => Some((ticket, result)),
                _ => None,
            })
            .collect();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].0, 7);
        assert!(matches!(completed[0].1, Err(Error::Timeout)));

        // Back to polling
        let frame = session.poll_transmit(now).unwrap();
        assert_eq!(frame[5], 0x60);
    }

    #[test]
    fn test_nak_consumes_budget_and_success_restores_it() {
        let mut session = DeviceSession::new(DeviceOptions::new(1));
        let now = Instant::now();

        session.poll_transmit(now).unwrap();
        session.handle_reply(&ack(1, 0), now).unwrap();

        session.enqueue(Command::new(CommandCode::OutputControl, vec![0u8; 4]), Some(1));
        session.poll_transmit(now).unwrap();
        session
            .handle_reply(&nak(1, 1, ErrorCode::UnableToProcessCommand), now)
            .unwrap();
        assert_eq!(session.retry_budget(), 1);

        // The retry goes out with the advanced sequence and succeeds
        let frame = session.poll_transmit(now).unwrap();
        assert_eq!(frame[5], 0x68);
        assert_eq!(frame[4] & 0x03, 2);
        session.handle_reply(&ack(1, 2), now).unwrap();

        assert_eq!(session.retry_budget(), RETRY_AMOUNT);
        assert!(events(&mut session).iter().any(|e| matches!(
            e,
            SessionEvent::Completed {
                ticket: 1,
                result: Ok(Reply::Ack)
            }
        )));
    }

    #[test]
    fn test_busy_delays_without_consuming_budget() {
        let options = DeviceOptions::new(1).with_busy_delay(Duration::from_millis(300));
        let mut session = DeviceSession::new(options);
        let now = Instant::now();

        session.poll_transmit(now).unwrap();
        session.handle_reply(&ack(1, 0), now).unwrap();

        session.enqueue(Command::new(CommandCode::BuzzerControl, vec![0u8; 5]), None);
        session.poll_transmit(now).unwrap();

        let busy = Message::reply(1, 1, true, 0x79, Vec::new()).encode(None).unwrap();
        session.handle_reply(&busy, now).unwrap();

        assert_eq!(session.retry_budget(), RETRY_AMOUNT);
        assert_eq!(session.sequence(), 1);
        assert!(session.poll_transmit(now + Duration::from_millis(100)).is_none());

        let frame = session.poll_transmit(now + Duration::from_millis(300)).unwrap();
        assert_eq!(frame[5], 0x6A);
    }

    #[test]
    fn test_unexpected_sequence_nak_restarts() {
        let mut session = DeviceSession::new(DeviceOptions::new(1));
        let now = Instant::now();

        session.poll_transmit(now).unwrap();
        session.handle_reply(&ack(1, 0), now).unwrap();
        session.poll_transmit(now).unwrap();
        session
            .handle_reply(&nak(1, 1, ErrorCode::UnexpectedSequenceNumber), now)
            .unwrap();

        assert_eq!(session.sequence(), 0);
    }

    #[test]
    fn test_multipart_holds_ordinary_commands() {
        let mut session = DeviceSession::new(DeviceOptions::new(1));
        let now = Instant::now();

        session.poll_transmit(now).unwrap();
        session.handle_reply(&ack(1, 0), now).unwrap();

        session.enqueue(Command::new(CommandCode::LedControl, vec![0u8; 14]), None);
        session.set_sending_multipart(true);

        // Nothing to send: ordinary command held, polls suppressed
        assert!(session.poll_transmit(now).is_none());

        session.enqueue_multipart(Command::new(CommandCode::FileTransfer, vec![0u8; 11]), None);
        let frame = session.poll_transmit(now).unwrap();
        assert_eq!(frame[5], 0x7C);
        session.handle_reply(&ack(1, 1), now).unwrap();

        session.set_sending_multipart(false);
        let frame = session.poll_transmit(now).unwrap();
        assert_eq!(frame[5], 0x69);
    }

    #[test]
    fn test_receiving_multipart_keeps_polling() {
        let mut session = DeviceSession::new(DeviceOptions::new(1));
        let now = Instant::now();

        session.poll_transmit(now).unwrap();
        session.handle_reply(&ack(1, 0), now).unwrap();

        session.enqueue(Command::new(CommandCode::LedControl, vec![0u8; 14]), None);
        session.set_receiving_multipart(true);

        let frame = session.poll_transmit(now).unwrap();
        assert_eq!(frame[5], 0x60);
    }

    #[test]
    fn test_handshake_establishes_channel() {
        let options = DeviceOptions::new(1).with_secure_channel(PROVISIONED_KEY);
        let mut acu = DeviceSession::new(options);
        let mut pd = PeripheralSession::new(
            PeripheralOptions::new(1)
                .with_secure_channel_key(PROVISIONED_KEY)
                .with_require_security(true),
        );
        let now = Instant::now();

        let codes: Vec<u8> = (0..4)
            .filter_map(|_| exchange(&mut acu, &mut pd, now))
            .map(|(code, _)| code)
            .collect();
        assert_eq!(codes, vec![0x60, 0x76, 0x77, 0x60]);

        assert!(acu.is_secure());
        assert!(pd.is_secure());
        assert!(acu.is_online());
        assert_eq!(acu.secure_channel().rmac(), pd.secure_channel().rmac());
        assert!(events(&mut acu).iter().any(|e| matches!(
            e,
            SessionEvent::ConnectionStatus {
                online: true,
                secure: true
            }
        )));
    }

    #[test]
    fn test_wrong_key_never_comes_online() {
        let options = DeviceOptions::new(1).with_secure_channel([0x11; 16]);
        let mut acu = DeviceSession::new(options);
        let mut pd = PeripheralSession::new(PeripheralOptions::new(1).with_secure_channel_key(PROVISIONED_KEY));
        let now = Instant::now();

        for _ in 0..8 {
            exchange(&mut acu, &mut pd, now);
        }

        assert!(!acu.is_secure());
        assert!(!acu.is_online());
    }

    #[test]
    fn test_secured_traffic_after_handshake() {
        let options = DeviceOptions::new(1).with_secure_channel(PROVISIONED_KEY);
        let mut acu = DeviceSession::new(options);
        let mut pd = PeripheralSession::new(PeripheralOptions::new(1).with_secure_channel_key(PROVISIONED_KEY));
        let now = Instant::now();

        for _ in 0..3 {
            exchange(&mut acu, &mut pd, now);
        }
        assert!(acu.is_secure());
        events(&mut acu);

        acu.enqueue(Command::new(CommandCode::IdReport, vec![0x00]), Some(3));
        let (code, secured) = exchange(&mut acu, &mut pd, now).unwrap();
        assert_eq!(code, 0x61);
        assert!(secured);

        let completed = events(&mut acu).into_iter().find_map(|e| match e {
            SessionEvent::Completed { ticket: 3, result } => Some(result),
            _ => None,
        });
        let reply = completed.unwrap().unwrap();
        assert_eq!(reply.code(), 0x45);
        assert_eq!(reply.data().len(), 12);
    }

    #[test]
    fn test_reset_channel_then_unsecured_command_is_rejected() {
        let options = DeviceOptions::new(1).with_secure_channel(PROVISIONED_KEY);
        let mut acu = DeviceSession::new(options);
        let mut pd = PeripheralSession::new(PeripheralOptions::new(1).with_secure_channel_key(PROVISIONED_KEY));
        let now = Instant::now();

        for _ in 0..3 {
            exchange(&mut acu, &mut pd, now);
        }
        assert!(pd.is_secure());

        // The ACU forgets its keys; the PD still holds an established channel
        acu.reset_secure_channel();
        let frame = acu
            .build_command(&Command::new(CommandCode::IdReport, vec![0x00]))
            .unwrap();

        let PeripheralAction::Reply(reply) = pd.handle_frame(&frame).unwrap() else {
            panic!("expected an immediate reply");
        };
        let reply = Message::decode(&reply, None).unwrap();
        assert_eq!(reply.type_code, 0x41);
        assert_eq!(reply.payload.as_ref(), &[0x06]);
    }

    #[test]
    fn test_lost_poll_reply_does_not_answer_next_command() {
        let mut acu = DeviceSession::new(DeviceOptions::new(1));
        let mut pd = PeripheralSession::new(PeripheralOptions::new(1));
        let now = Instant::now();

        exchange(&mut acu, &mut pd, now).unwrap();

        // The PD answers the next poll but the reply never arrives
        let frame = acu.poll_transmit(now).unwrap();
        let PeripheralAction::Dispatch(incoming) = pd.handle_frame(&frame).unwrap() else {
            panic!("expected dispatch");
        };
        pd.encode_reply(&incoming, &Reply::Ack).unwrap();
        acu.handle_timeout(now);
        assert!(acu.has_retry());
        assert_eq!(acu.retry_budget(), RETRY_AMOUNT);
        events(&mut acu);

        acu.enqueue(Command::new(CommandCode::IdReport, vec![0x00]), Some(9));

        // The poll is repeated unchanged and collects the stored answer
        let repeat = acu.poll_transmit(now).unwrap();
        assert_eq!(repeat, frame);
        let PeripheralAction::Reply(reply) = pd.handle_frame(&repeat).unwrap() else {
            panic!("expected the stored reply");
        };
        acu.handle_reply(&reply, now).unwrap();
        assert!(events(&mut acu).is_empty());

        // Only then does the IdReport go out, and the PD really handles it
        let (code, _) = exchange(&mut acu, &mut pd, now).unwrap();
        assert_eq!(code, 0x61);

        let completed = events(&mut acu).into_iter().find_map(|e| match e {
            SessionEvent::Completed { ticket: 9, result } => Some(result),
            _ => None,
        });
        assert_eq!(completed.unwrap().unwrap().code(), 0x45);
    }

    #[test]
    fn test_lost_handshake_reply_is_recovered() {
        let options = DeviceOptions::new(1).with_secure_channel(PROVISIONED_KEY);
        let mut acu = DeviceSession::new(options);
        let mut pd = PeripheralSession::new(PeripheralOptions::new(1).with_secure_channel_key(PROVISIONED_KEY));
        let now = Instant::now();

        for _ in 0..2 {
            exchange(&mut acu, &mut pd, now);
        }

        // osdp_RMAC_I is lost on the way back
        let frame = acu.poll_transmit(now).unwrap();
        assert_eq!(peek(&frame).0, 0x77);
        assert!(matches!(pd.handle_frame(&frame).unwrap(), PeripheralAction::Reply(_)));
        acu.handle_timeout(now);
        assert!(pd.is_secure());
        assert!(!acu.is_secure());

        let repeat = acu.poll_transmit(now).unwrap();
        assert_eq!(repeat, frame);
        let PeripheralAction::Reply(reply) = pd.handle_frame(&repeat).unwrap() else {
            panic!("expected the stored reply");
        };
        acu.handle_reply(&reply, now).unwrap();

        assert!(acu.is_secure());
        assert_eq!(acu.secure_channel().rmac(), pd.secure_channel().rmac());
    }

    #[test]
    fn test_going_offline_drops_repeated_poll() {
        let options = DeviceOptions::new(1).with_offline_timeout(Duration::from_secs(8));
        let mut session = DeviceSession::new(options);
        let start = Instant::now();

        session.poll_transmit(start).unwrap();
        session.handle_reply(&ack(1, 0), start).unwrap();

        session.poll_transmit(start).unwrap();
        session.handle_timeout(start);
        assert!(session.has_retry());

        session.check_liveness(start + Duration::from_secs(9));
        assert_eq!(session.sequence(), 0);
        assert!(!session.has_retry());
    }

    #[test]
    fn test_corrupted_frames_leave_peripheral_untouched() {
        let options = DeviceOptions::new(1).with_secure_channel(PROVISIONED_KEY);
        let mut acu = DeviceSession::new(options);
        let mut pd = PeripheralSession::new(PeripheralOptions::new(1).with_secure_channel_key(PROVISIONED_KEY));
        let now = Instant::now();

        for _ in 0..3 {
            exchange(&mut acu, &mut pd, now);
        }
        assert!(pd.is_secure());

        let frame = acu.poll_transmit(now).unwrap();
        let last = frame.len() - 1;
        let mut damaged = frame.to_vec();
        damaged[last] ^= 0xFF;
        assert!(pd.handle_frame(&damaged).is_err());

        let PeripheralAction::Dispatch(incoming) = pd.handle_frame(&frame).unwrap() else {
            panic!("expected dispatch");
        };
        let reply = pd.encode_reply(&incoming, &Reply::Ack).unwrap();
        acu.handle_reply(&reply, now).unwrap();

        // Same sequence as the stored reply, but the trailer is broken
        assert!(pd.handle_frame(&damaged).is_err());

        // A damaged sequence 0 frame must not tear the channel down
        let mut reset = Message::command(1, 0, true, 0x60, Vec::new()).encode(None).unwrap();
        let last = reset.len() - 1;
        reset[last] ^= 0xFF;
        assert!(pd.handle_frame(&reset).is_err());
        assert!(pd.is_secure());
    }
}
