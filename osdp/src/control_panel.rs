//! ACU-side API
//!
//! A [`ControlPanel`] runs any number of buses, each on its own transport,
//! and offers request/response calls plus an event stream on top of them.
//!
//! # Examples
//!
//! ```no_run
//! use osdp::{ControlPanel, DeviceOptions, TcpClientTransport};
//!
//! #[tokio::main]
//! async fn main() -> osdp::Result<()> {
//!     let panel = ControlPanel::new();
//!     let connection = panel.start_connection(TcpClientTransport::new("192.168.1.50", 4000));
//!     panel.add_device(connection, DeviceOptions::new(0)).await?;
//!
//!     let id = panel.id_report(connection, 0).await?;
//!     println!("Device: {}", id);
//!
//!     panel.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use osdp_core::{Command, DeviceOptions, Fragment, Fragmenter, Reassembler, Reply};
use osdp_transport::Transport;
use osdp_types::{
    CapabilitiesRequest, CommandPayload, CommunicationConfiguration, DeviceCapabilities, DeviceIdentification,
    FileTransferActions, FileTransferFragment, FileTransferStatus, FileTransferStatusCode, GetPivData,
    IdReportRequest, ReplyData, ReplyPayload,
};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{OwnedMutexGuard, broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bus::{BusCommand, BusHandle, DeviceStatus, SessionFlag};
use crate::config::BusOptions;
use crate::error::{Error, Result};
use crate::events::{BusEvent, ConnectionId, Event, spawn_dispatcher};

/// Events buffered per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 256;

/// Clears a session flag when dropped
struct FlagGuard {
    bus: mpsc::UnboundedSender<BusCommand>,
    address: u8,
    flag: SessionFlag,
}

impl FlagGuard {
    fn set(bus: mpsc::UnboundedSender<BusCommand>, address: u8, flag: SessionFlag) -> Self {
        let _ = bus.send(BusCommand::SetFlag {
            address,
            flag,
            value: true,
        });
        Self { bus, address, flag }
    }
}

impl Drop for FlagGuard {
    fn drop(&mut self) {
        let _ = self.bus.send(BusCommand::SetFlag {
            address: self.address,
            flag: self.flag,
            value: false,
        });
    }
}

fn reject_nak(reply: Reply) -> Result<Reply> {
    match reply {
        Reply::Nak(code) => Err(osdp_core::Error::NakReceived(code).into()),
        reply => Ok(reply),
    }
}

/// Access Control Unit
pub struct ControlPanel {
    options: BusOptions,
    buses: Mutex<HashMap<ConnectionId, BusHandle>>,
    next_connection: AtomicU64,
    dispatch: mpsc::UnboundedSender<BusEvent>,
    publisher: broadcast::Sender<Event>,
    exclusive: Mutex<HashMap<(ConnectionId, u8), Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for ControlPanel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPanel {
    /// Create a control panel; must be called inside a tokio runtime
    pub fn new() -> Self {
        Self::with_options(BusOptions::default())
    }

    /// Create a control panel whose buses use `options` unless told otherwise
    pub fn with_options(options: BusOptions) -> Self {
        let (dispatch, queue) = mpsc::unbounded_channel();
        let (publisher, _) = broadcast::channel(EVENT_CAPACITY);
        spawn_dispatcher(queue, publisher.clone());

        Self {
            options,
            buses: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            dispatch,
            publisher,
            exclusive: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling over `transport`
    pub fn start_connection<T>(&self, transport: T) -> ConnectionId
    where
        T: Transport + 'static,
    {
        self.start_connection_with(transport, self.options.clone())
    }

    /// Start polling over `transport` with bus-specific options
    pub fn start_connection_with<T>(&self, transport: T, options: BusOptions) -> ConnectionId
    where
        T: Transport + 'static,
    {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let handle = BusHandle::spawn(id, transport, options, self.dispatch.clone());
        self.buses.lock().insert(id, handle);
        info!("Started connection {}", id);
        id
    }

    /// Stop a bus and close its transport
    ///
    /// Commands still waiting fail with [`Error::ConnectionClosed`] or
    /// [`osdp_core::Error::OperationCancelled`].
    pub async fn stop_connection(&self, connection: ConnectionId) -> Result<()> {
        let handle = self
            .buses
            .lock()
            .remove(&connection)
            .ok_or(Error::ConnectionNotFound(connection))?;
        handle.shutdown().await;
        self.exclusive.lock().retain(|(c, _), _| *c != connection);
        Ok(())
    }

    /// Stop every bus
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.buses.lock().drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            handle.shutdown().await;
        }
        self.exclusive.lock().clear();
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.publisher.subscribe()
    }

    /// Register a device on a bus; polling starts on the next cycle
    pub async fn add_device(&self, connection: ConnectionId, options: DeviceOptions) -> Result<()> {
        self.request(connection, |reply| BusCommand::AddDevice { options, reply })
            .await?
    }

    /// Unregister a device; commands it had queued are cancelled
    pub async fn remove_device(&self, connection: ConnectionId, address: u8) -> Result<()> {
        self.request(connection, |reply| BusCommand::RemoveDevice { address, reply })
            .await??;
        self.exclusive.lock().remove(&(connection, address));
        Ok(())
    }

    pub async fn device_status(&self, connection: ConnectionId, address: u8) -> Result<DeviceStatus> {
        self.request(connection, |reply| BusCommand::Status { address, reply })
            .await?
            .ok_or(Error::DeviceNotFound { connection, address })
    }

    /// Check if the device answers, over a secure channel when it requires one
    pub async fn is_online(&self, connection: ConnectionId, address: u8) -> Result<bool> {
        Ok(self.device_status(connection, address).await?.online)
    }

    /// Drop the secure channel; the handshake restarts on the device's next turn
    pub fn reset_secure_channel(&self, connection: ConnectionId, address: u8) -> Result<()> {
        self.bus(connection)?
            .send(BusCommand::ResetSecureChannel { address })
            .map_err(|_| Error::ConnectionClosed(connection))
    }

    /// Send a command and wait for its reply
    ///
    /// # Errors
    ///
    /// A NAK fails with [`osdp_core::Error::NakReceived`]; use
    /// [`send_command_allow_nak`](Self::send_command_allow_nak) to receive it
    /// as a reply instead.
    pub async fn send_command(&self, connection: ConnectionId, address: u8, command: Command) -> Result<Reply> {
        self.transmit(connection, address, command, false)
            .await
            .and_then(reject_nak)
    }

    /// Send a command and wait for its reply, NAKs included
    pub async fn send_command_allow_nak(
        &self,
        connection: ConnectionId,
        address: u8,
        command: Command,
    ) -> Result<Reply> {
        self.transmit(connection, address, command, false).await
    }

    /// Read the device identification (osdp_ID)
    pub async fn id_report(&self, connection: ConnectionId, address: u8) -> Result<DeviceIdentification> {
        let reply = self
            .send_command(connection, address, IdReportRequest.into_command())
            .await?;
        Ok(DeviceIdentification::from_reply(&reply)?)
    }

    /// Read the capability list (osdp_CAP)
    pub async fn device_capabilities(&self, connection: ConnectionId, address: u8) -> Result<DeviceCapabilities> {
        let reply = self
            .send_command(connection, address, CapabilitiesRequest.into_command())
            .await?;
        Ok(DeviceCapabilities::from_reply(&reply)?)
    }

    /// Change the device's address and baud rate (osdp_COMSET)
    ///
    /// Returns the settings the device reports. The device answers at the new
    /// address from then on; re-register it to keep polling.
    pub async fn communication_set(
        &self,
        connection: ConnectionId,
        address: u8,
        configuration: CommunicationConfiguration,
    ) -> Result<CommunicationConfiguration> {
        let reply = self
            .send_command(connection, address, configuration.into_command())
            .await?;
        Ok(CommunicationConfiguration::from_reply(&reply)?)
    }

    /// Push a file to the device in fragments of at most `max_fragment` bytes
    ///
    /// The device can pace the transfer, shrink or grow the fragment size, and
    /// ask to continue outside the secure channel through its osdp_FTSTAT
    /// replies. Returns the final status once the device reports the file
    /// processed.
    pub async fn file_transfer(
        &self,
        connection: ConnectionId,
        address: u8,
        file_type: u8,
        data: impl Into<Bytes>,
        max_fragment: usize,
    ) -> Result<FileTransferStatus> {
        let _exclusive = self.lock_device(connection, address).await;
        let bus = self.bus(connection)?;
        let _sending = FlagGuard::set(bus.clone(), address, SessionFlag::SendingMultipart);
        let mut leave_secure: Option<FlagGuard> = None;

        let mut fragmenter = Fragmenter::new(data, max_fragment);
        let whole_length = fragmenter.whole_length();
        info!(
            "Connection {} device {}: sending {} byte file of type {}",
            connection, address, whole_length, file_type
        );

        let mut status = FileTransferStatus::new(FileTransferStatusCode::Ok);
        while let Some(fragment) = fragmenter.next_fragment() {
            let payload = FileTransferFragment::from_fragment(file_type, &fragment)?;
            status = self.transfer_step(connection, address, &payload).await?;
            self.apply_transfer_status(&bus, address, &status, &mut fragmenter, &mut leave_secure);
        }

        // Everything sent; keep asking while the device finishes up
        while status.status == FileTransferStatusCode::Finishing {
            let idle = Fragment {
                whole_length,
                offset: whole_length,
                data: Bytes::new(),
            };
            let payload = FileTransferFragment::from_fragment(file_type, &idle)?;
            status = self.transfer_step(connection, address, &payload).await?;
            self.apply_transfer_status(&bus, address, &status, &mut fragmenter, &mut leave_secure);
        }

        info!(
            "Connection {} device {}: file transfer ended with {:?}",
            connection, address, status.status
        );
        Ok(status)
    }

    async fn transfer_step(
        &self,
        connection: ConnectionId,
        address: u8,
        payload: &FileTransferFragment,
    ) -> Result<FileTransferStatus> {
        let reply = self
            .transmit(connection, address, payload.into_command(), true)
            .await
            .and_then(reject_nak)?;

        let status = match reply {
            Reply::Ack => FileTransferStatus::new(FileTransferStatusCode::Ok),
            reply => FileTransferStatus::from_reply(&reply)?,
        };

        if status.status.is_error() {
            warn!(
                "Connection {} device {}: file transfer refused with {:?}",
                connection, address, status.status
            );
            return Err(Error::FileTransfer(status.status));
        }

        Ok(status)
    }

    fn apply_transfer_status(
        &self,
        bus: &mpsc::UnboundedSender<BusCommand>,
        address: u8,
        status: &FileTransferStatus,
        fragmenter: &mut Fragmenter,
        leave_secure: &mut Option<FlagGuard>,
    ) {
        if status.delay_ms > 0 {
            let _ = bus.send(BusCommand::RequestDelay {
                address,
                delay: Duration::from_millis(status.delay_ms.into()),
            });
        }

        fragmenter.set_max_fragment(status.update_message_max.into());

        if status.actions.contains(FileTransferActions::LEAVE_SECURE_CHANNEL) && leave_secure.is_none() {
            debug!("Device {}: continuing the transfer outside the secure channel", address);
            *leave_secure = Some(FlagGuard::set(bus.clone(), address, SessionFlag::NoSecureChannelOverride));
        }
    }

    /// Read a PIV data object from the card presented to the device
    ///
    /// The device answers in osdp_PIVDATAR fragments, which are reassembled
    /// until complete or `timeout` runs out.
    pub async fn get_piv_data(
        &self,
        connection: ConnectionId,
        address: u8,
        request: GetPivData,
        timeout: Duration,
    ) -> Result<Bytes> {
        let _exclusive = self.lock_device(connection, address).await;
        let bus = self.bus(connection)?;
        let _receiving = FlagGuard::set(bus, address, SessionFlag::ReceivingMultipart);

        // Fragments can ride on the very first reply
        let mut events = self.subscribe();
        self.transmit(connection, address, request.into_command(), true)
            .await
            .and_then(reject_nak)?;

        tokio::time::timeout(timeout, Self::collect_piv(&mut events, connection, address))
            .await
            .map_err(|_| Error::Core(osdp_core::Error::Timeout))?
    }

    async fn collect_piv(
        events: &mut broadcast::Receiver<Event>,
        connection: ConnectionId,
        address: u8,
    ) -> Result<Bytes> {
        let mut reassembler = Reassembler::new();

        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    warn!("PIV data reader missed {} events", missed);
                    continue;
                }
                Err(RecvError::Closed) => return Err(Error::ConnectionClosed(connection)),
            };

            if !event.is_from(connection, address) {
                continue;
            }

            if let Event::ReplyReceived {
                reply: ReplyData::PivData(fragment),
                ..
            } = event
            {
                let whole = reassembler.push(
                    fragment.whole_length.into(),
                    fragment.offset.into(),
                    &fragment.data,
                )?;
                if let Some(whole) = whole {
                    return Ok(whole);
                }
            }
        }
    }

    async fn transmit(&self, connection: ConnectionId, address: u8, command: Command, multipart: bool) -> Result<Reply> {
        self.request(connection, |reply| BusCommand::Send {
            address,
            command,
            multipart,
            reply,
        })
        .await?
    }

    async fn request<R>(
        &self,
        connection: ConnectionId,
        make: impl FnOnce(oneshot::Sender<R>) -> BusCommand,
    ) -> Result<R> {
        let bus = self.bus(connection)?;
        let (reply, response) = oneshot::channel();
        bus.send(make(reply)).map_err(|_| Error::ConnectionClosed(connection))?;
        response.await.map_err(|_| Error::ConnectionClosed(connection))
    }

    fn bus(&self, connection: ConnectionId) -> Result<mpsc::UnboundedSender<BusCommand>> {
        self.buses
            .lock()
            .get(&connection)
            .map(BusHandle::sender)
            .ok_or(Error::ConnectionNotFound(connection))
    }

    /// Serialize extended exchanges with one device
    async fn lock_device(&self, connection: ConnectionId, address: u8) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.exclusive.lock().entry((connection, address)).or_default());
        lock.lock_owned().await
    }
}

impl Drop for ControlPanel {
    fn drop(&mut self) {
        for handle in self.buses.get_mut().values() {
            handle.cancel();
        }
    }
}
