//! PD-side serving loop
//!
//! A [`Device`] answers an ACU over one transport. The protocol work (secure
//! channel, security policy, retransmission) happens in the
//! [`PeripheralSession`]; identification, capabilities and communication
//! settings are answered from the configuration store; everything else goes
//! to the application's [`CommandHandler`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use osdp_core::constants::DRIVER_BYTE;
use osdp_core::{ErrorCode, FrameReader, IncomingCommand, PeripheralAction, PeripheralSession, Reply};
use osdp_transport::Transport;
use osdp_types::{CommandData, ReplyPayload, parse_command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{ConfigurationStore, DeviceConfiguration};
use crate::error::Result;

const READ_BUFFER_SIZE: usize = 1024;

/// Application side of a PD
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Answer an osdp_POLL; return a pending report (card read, keypad...) or ACK
    async fn poll(&self, _configuration: &DeviceConfiguration) -> Reply {
        Reply::Ack
    }

    /// Answer any command the device does not handle itself
    async fn handle(&self, _command: &IncomingCommand, _configuration: &DeviceConfiguration) -> Reply {
        Reply::Nak(ErrorCode::UnknownCommandCode)
    }
}

/// Handler that only acknowledges polls
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl CommandHandler for DefaultHandler {}

/// Peripheral Device answering on one transport
pub struct Device<T, H> {
    transport: T,
    handler: H,
    store: Arc<ConfigurationStore>,
    configuration: Arc<DeviceConfiguration>,
    version: u64,
    session: PeripheralSession,
    reader: FrameReader,
    buffer: Vec<u8>,
}

impl<T, H> Device<T, H>
where
    T: Transport,
    H: CommandHandler,
{
    pub fn new(transport: T, store: Arc<ConfigurationStore>, handler: H) -> Self {
        let (version, configuration) = store.snapshot();
        let session = PeripheralSession::new(configuration.peripheral_options());

        Self {
            transport,
            handler,
            store,
            configuration,
            version,
            session,
            reader: FrameReader::new(),
            buffer: vec![0u8; READ_BUFFER_SIZE],
        }
    }

    pub fn store(&self) -> &Arc<ConfigurationStore> {
        &self.store
    }

    /// Check if a secure channel is established with the ACU
    pub fn is_secure(&self) -> bool {
        self.session.is_secure()
    }

    /// Serve commands until `cancel` fires
    ///
    /// # Errors
    ///
    /// Fails when the transport cannot be opened, read or written.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        if !self.transport.is_open() {
            self.transport.open().await?;
        }
        info!(
            "Serving address {} on {}",
            self.configuration.address,
            self.transport.description()
        );

        let result = self.serve(&cancel).await;

        if let Err(e) = self.transport.close().await {
            warn!("Close failed: {}", e);
        }
        info!("Stopped serving");
        result
    }

    async fn serve(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let n = match self.transport.read(&mut self.buffer, cancel).await {
                Ok(n) => n,
                Err(osdp_transport::Error::Cancelled) => return Ok(()),
                // A listening transport waits for the next ACU
                Err(osdp_transport::Error::ConnectionClosed) if self.transport.is_open() => {
                    info!("ACU disconnected from {}", self.transport.description());
                    self.session.reset();
                    self.reader.clear();
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.reader.extend(&self.buffer[..n]);

            while let Some(frame) = self.reader.next_frame() {
                self.process(&frame).await?;
            }
        }
    }

    async fn process(&mut self, frame: &[u8]) -> Result<()> {
        self.refresh_configuration();

        let action = match self.session.handle_frame(frame) {
            Ok(action) => action,
            Err(e) => {
                debug!("Dropped frame: {}", e);
                return Ok(());
            }
        };

        let reply = match action {
            PeripheralAction::Ignore => return Ok(()),
            PeripheralAction::Reply(reply) => reply,
            PeripheralAction::Dispatch(incoming) => {
                let reply = self.respond(&incoming).await;
                match self.session.encode_reply(&incoming, &reply) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!("Cannot encode {}: {}", reply, e);
                        return Ok(());
                    }
                }
            }
        };

        let mut data = BytesMut::with_capacity(reply.len() + 1);
        data.put_u8(DRIVER_BYTE);
        data.extend_from_slice(&reply);
        self.transport.write(&data).await?;

        Ok(())
    }

    async fn respond(&self, incoming: &IncomingCommand) -> Reply {
        trace!("Received {}", incoming.command);
        let configuration = Arc::clone(&self.configuration);

        match parse_command(&incoming.command) {
            Ok(CommandData::Poll) => self.handler.poll(&configuration).await,
            Ok(CommandData::IdReport) => configuration.identification.into_reply(),
            Ok(CommandData::Capabilities) => configuration.capabilities.into_reply(),
            Ok(CommandData::CommunicationSet(settings)) => {
                info!("Communication settings changed to {:?}", settings);
                self.store.update(|c| {
                    c.address = settings.address;
                    c.baud_rate = settings.baud_rate;
                });
                settings.into_reply()
            }
            Ok(_) => self.handler.handle(incoming, &configuration).await,
            Err(e) => {
                debug!("Malformed {}: {}", incoming.command, e);
                Reply::Nak(ErrorCode::InvalidCommandLength)
            }
        }
    }

    /// Pick up a newer configuration; the secure channel survives unless the
    /// protocol settings changed
    fn refresh_configuration(&mut self) {
        if self.store.version() == self.version {
            return;
        }

        let (version, configuration) = self.store.snapshot();
        if protocol_changed(&self.configuration, &configuration) {
            debug!("Protocol settings changed, resetting session");
            self.session.set_options(configuration.peripheral_options());
        }

        self.version = version;
        self.configuration = configuration;
    }
}

fn protocol_changed(old: &DeviceConfiguration, new: &DeviceConfiguration) -> bool {
    old.address != new.address
        || old.require_security != new.require_security
        || old.default_key_allowed != new.default_key_allowed
        || old.secure_channel_key != new.secure_channel_key
        || old.default_key != new.default_key
        || old.client_uid != new.client_uid
}
