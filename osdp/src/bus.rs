//! One physical connection and the devices polled over it
//!
//! A bus runs as its own task. It owns the transport and every
//! [`DeviceSession`] registered on it, services the sessions one after the
//! other, and takes instructions from the control panel over a channel so
//! no session state is ever shared.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use osdp_core::constants::DRIVER_BYTE;
use osdp_core::{Command, DeviceOptions, DeviceSession, FrameReader, Reply, SessionEvent, Ticket};
use osdp_transport::Transport;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::BusOptions;
use crate::error::{Error, Result};
use crate::events::{BusEvent, ConnectionId};

const READ_BUFFER_SIZE: usize = 1024;

/// Shortest pause when no device had anything to send
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Snapshot of one device's link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub online: bool,
    pub secure: bool,
    pub sequence: u8,
    pub sending_multipart: bool,
    pub receiving_multipart: bool,
    pub no_secure_channel_override: bool,
    /// Skipped by the poll loop until a requested delay runs out
    pub delayed: bool,
}

impl DeviceStatus {
    fn of(session: &DeviceSession) -> Self {
        Self {
            online: session.is_online(),
            secure: session.is_secure(),
            sequence: session.sequence(),
            sending_multipart: session.is_sending_multipart(),
            receiving_multipart: session.is_receiving_multipart(),
            no_secure_channel_override: session.no_secure_channel_override(),
            delayed: !session.is_ready(now()),
        }
    }
}

/// Session flags an extended exchange toggles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionFlag {
    SendingMultipart,
    ReceivingMultipart,
    NoSecureChannelOverride,
}

/// Instructions from the control panel
#[derive(Debug)]
pub(crate) enum BusCommand {
    AddDevice {
        options: DeviceOptions,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveDevice {
        address: u8,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        address: u8,
        command: Command,
        multipart: bool,
        reply: oneshot::Sender<Result<Reply>>,
    },
    SetFlag {
        address: u8,
        flag: SessionFlag,
        value: bool,
    },
    RequestDelay {
        address: u8,
        delay: Duration,
    },
    ResetSecureChannel {
        address: u8,
    },
    Status {
        address: u8,
        reply: oneshot::Sender<Option<DeviceStatus>>,
    },
}

/// Control panel side of a running bus
#[derive(Debug)]
pub(crate) struct BusHandle {
    commands: mpsc::UnboundedSender<BusCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BusHandle {
    /// Start a bus task on `transport`
    pub fn spawn<T>(
        id: ConnectionId,
        transport: T,
        options: BusOptions,
        events: mpsc::UnboundedSender<BusEvent>,
    ) -> Self
    where
        T: Transport + 'static,
    {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let bus = Bus {
            id,
            transport,
            options,
            sessions: BTreeMap::new(),
            pending: HashMap::new(),
            next_ticket: 1,
            commands: commands_rx,
            events,
            reader: FrameReader::new(),
            buffer: vec![0u8; READ_BUFFER_SIZE],
            cancel: cancel.clone(),
        };

        Self {
            commands,
            cancel,
            task: tokio::spawn(bus.run()),
        }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<BusCommand> {
        self.commands.clone()
    }

    /// Ask the task to stop without waiting for it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the task and wait until the transport is closed
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Bus task ended abnormally: {}", e);
        }
    }
}

struct Bus<T> {
    id: ConnectionId,
    transport: T,
    options: BusOptions,
    /// Serviced in address order
    sessions: BTreeMap<u8, DeviceSession>,
    pending: HashMap<Ticket, oneshot::Sender<Result<Reply>>>,
    next_ticket: Ticket,
    commands: mpsc::UnboundedReceiver<BusCommand>,
    events: mpsc::UnboundedSender<BusEvent>,
    reader: FrameReader,
    buffer: Vec<u8>,
    cancel: CancellationToken,
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

impl<T: Transport> Bus<T> {
    async fn run(mut self) {
        info!("Connection {}: starting on {}", self.id, self.transport.description());

        while !self.cancel.is_cancelled() {
            if !self.drain_commands() {
                break;
            }

            if self.sessions.is_empty() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    command = self.commands.recv() => match command {
                        Some(command) => self.apply(command),
                        None => break,
                    },
                }
                continue;
            }

            if !self.ensure_open().await {
                continue;
            }

            let mut transmitted = false;
            let addresses: Vec<u8> = self.sessions.keys().copied().collect();
            for address in addresses {
                if self.cancel.is_cancelled() || !self.drain_commands() {
                    break;
                }
                transmitted |= self.service(address).await;
            }

            let pause = if transmitted {
                self.options.poll_interval
            } else {
                self.options.poll_interval.max(IDLE_WAIT)
            };
            if !pause.is_zero() {
                self.idle(pause).await;
            }
        }

        self.shutdown().await;
    }

    /// Wait for `pause`, applying control commands as they arrive
    async fn idle(&mut self, pause: Duration) {
        let deadline = Instant::now() + pause;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep_until(deadline) => return,
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => {
                        self.cancel.cancel();
                        return;
                    }
                },
            }
        }
    }

    async fn ensure_open(&mut self) -> bool {
        if self.transport.is_open() {
            return true;
        }

        match self.transport.open().await {
            Ok(()) => {
                info!("Connection {}: opened {}", self.id, self.transport.description());
                true
            }
            Err(e) => {
                warn!("Connection {}: cannot open {}: {}", self.id, self.transport.description(), e);
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = sleep(self.options.reconnect_delay) => {}
                }
                false
            }
        }
    }

    /// Give one device its turn; returns whether a frame went out
    async fn service(&mut self, address: u8) -> bool {
        let at = now();
        let Some(session) = self.sessions.get_mut(&address) else {
            return false;
        };

        session.check_liveness(at);
        let frame = session.poll_transmit(at);
        self.flush_events(address);

        let Some(frame) = frame else {
            return false;
        };

        let mut data = BytesMut::with_capacity(frame.len() + 1);
        data.put_u8(DRIVER_BYTE);
        data.extend_from_slice(&frame);

        self.reader.clear();
        if let Err(e) = self.transport.write(&data).await {
            // Counted as a lost command once the reply window closes
            debug!("Connection {}: write to device {} failed: {}", self.id, address, e);
        }

        if !self.await_reply(address).await {
            if let Some(session) = self.sessions.get_mut(&address) {
                session.handle_timeout(now());
            }
        }

        self.flush_events(address);
        true
    }

    /// Read until `address` accepts a reply or the reply window closes
    async fn await_reply(&mut self, address: u8) -> bool {
        let deadline = Instant::now() + self.options.reply_timeout;

        loop {
            while let Some(frame) = self.reader.next_frame() {
                let Some(session) = self.sessions.get_mut(&address) else {
                    return false;
                };

                match session.handle_reply(&frame, now()) {
                    Ok(()) => return true,
                    Err(e) => debug!("Connection {}: discarded frame for device {}: {}", self.id, address, e),
                }
            }

            let read = timeout_at(deadline, self.transport.read(&mut self.buffer, &self.cancel)).await;
            match read {
                Err(_) => {
                    trace!("Connection {}: device {} did not answer", self.id, address);
                    return false;
                }
                Ok(Ok(n)) => self.reader.extend(&self.buffer[..n]),
                Ok(Err(osdp_transport::Error::Cancelled)) => return false,
                Ok(Err(e)) => {
                    warn!("Connection {}: read failed: {}", self.id, e);
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = sleep_until(deadline) => {}
                    }
                    return false;
                }
            }
        }
    }

    /// Apply every command already queued; false once the control panel is gone
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.apply(command),
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn apply(&mut self, command: BusCommand) {
        match command {
            BusCommand::AddDevice { options, reply } => {
                let address = options.address;
                let result = if self.sessions.contains_key(&address) {
                    Err(Error::DeviceExists {
                        connection: self.id,
                        address,
                    })
                } else {
                    info!("Connection {}: added device {}", self.id, address);
                    self.sessions.insert(address, DeviceSession::new(options));
                    Ok(())
                };
                let _ = reply.send(result);
            }
            BusCommand::RemoveDevice { address, reply } => {
                let result = match self.sessions.remove(&address) {
                    Some(mut session) => {
                        info!("Connection {}: removed device {}", self.id, address);
                        session.abandon();
                        let events: Vec<_> = session.drain_events().collect();
                        self.route_events(address, events);
                        Ok(())
                    }
                    None => Err(self.not_found(address)),
                };
                let _ = reply.send(result);
            }
            BusCommand::Send {
                address,
                command,
                multipart,
                reply,
            } => {
                let Some(session) = self.sessions.get_mut(&address) else {
                    let _ = reply.send(Err(self.not_found(address)));
                    return;
                };

                let ticket = self.next_ticket;
                self.next_ticket += 1;

                trace!("Connection {}: queued {} for device {} as #{}", self.id, command, address, ticket);
                if multipart {
                    session.enqueue_multipart(command, Some(ticket));
                } else {
                    session.enqueue(command, Some(ticket));
                }
                self.pending.insert(ticket, reply);
            }
            BusCommand::SetFlag { address, flag, value } => {
                if let Some(session) = self.sessions.get_mut(&address) {
                    match flag {
                        SessionFlag::SendingMultipart => session.set_sending_multipart(value),
                        SessionFlag::ReceivingMultipart => session.set_receiving_multipart(value),
                        SessionFlag::NoSecureChannelOverride => session.set_no_secure_channel_override(value),
                    }
                }
            }
            BusCommand::RequestDelay { address, delay } => {
                if let Some(session) = self.sessions.get_mut(&address) {
                    session.request_delay(now() + delay);
                }
            }
            BusCommand::ResetSecureChannel { address } => {
                if let Some(session) = self.sessions.get_mut(&address) {
                    session.reset_secure_channel();
                }
                self.flush_events(address);
            }
            BusCommand::Status { address, reply } => {
                let _ = reply.send(self.sessions.get(&address).map(DeviceStatus::of));
            }
        }
    }

    fn not_found(&self, address: u8) -> Error {
        Error::DeviceNotFound {
            connection: self.id,
            address,
        }
    }

    fn flush_events(&mut self, address: u8) {
        let events: Vec<_> = match self.sessions.get_mut(&address) {
            Some(session) => session.drain_events().collect(),
            None => return,
        };
        self.route_events(address, events);
    }

    /// Completions go to their waiting caller, the rest to the dispatcher
    fn route_events(&mut self, address: u8, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::Completed { ticket, result } => {
                    if let Some(waiter) = self.pending.remove(&ticket) {
                        let _ = waiter.send(result.map_err(Error::from));
                    }
                }
                event => {
                    let _ = self.events.send(BusEvent {
                        connection: self.id,
                        address,
                        event,
                    });
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        debug!("Connection {}: shutting down", self.id);

        let addresses: Vec<u8> = self.sessions.keys().copied().collect();
        for address in addresses {
            if let Some(session) = self.sessions.get_mut(&address) {
                session.abandon();
            }
            self.flush_events(address);
        }
        self.sessions.clear();
        // Callers still waiting see the connection close
        self.pending.clear();

        if let Err(e) = self.transport.close().await {
            warn!("Connection {}: close failed: {}", self.id, e);
        }
        info!("Connection {}: stopped", self.id);
    }
}
