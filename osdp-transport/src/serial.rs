//! Serial port transport

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{Transport, error::*, read_cancellable};

/// Serial port settings
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: tokio_serial::DataBits,
    pub stop_bits: tokio_serial::StopBits,
    pub parity: tokio_serial::Parity,
    pub flow_control: tokio_serial::FlowControl,
    pub timeout: Duration,
}

impl SerialSettings {
    /// 8N1 without flow control, the line format OSDP mandates
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            data_bits: tokio_serial::DataBits::Eight,
            stop_bits: tokio_serial::StopBits::One,
            parity: tokio_serial::Parity::None,
            flow_control: tokio_serial::FlowControl::None,
            timeout: Duration::from_millis(200),
        }
    }
}

/// `SerialStream` has no `Debug` impl
struct PortStream(SerialStream);

impl fmt::Debug for PortStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialStream").finish()
    }
}

/// RS-485 transport over a local serial port
#[derive(Debug)]
pub struct SerialTransport {
    settings: SerialSettings,
    stream: Option<PortStream>,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings, stream: None }
    }

    /// Create serial transport with port name and baud rate
    pub fn new_simple(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self::new(SerialSettings::new(port_name, baud_rate))
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(Error::AlreadyConnected);
        }

        let stream = tokio_serial::new(&self.settings.port_name, self.settings.baud_rate)
            .data_bits(self.settings.data_bits)
            .stop_bits(self.settings.stop_bits)
            .parity(self.settings.parity)
            .flow_control(self.settings.flow_control)
            .timeout(self.settings.timeout)
            .open_native_async()?;

        info!("Opened {} at {} baud", self.settings.port_name, self.settings.baud_rate);

        self.stream = Some(PortStream(stream));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            debug!("Closing {}", self.settings.port_name);
            let _ = stream.0.flush().await;
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        trace!("Sending {} bytes: {}", data.len(), hex::encode(data));

        stream.0.write_all(data).await?;
        stream.0.flush().await?;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        let n = read_cancellable(&mut stream.0, buf, cancel).await?;
        if n == 0 {
            self.stream = None;
            return Err(Error::ConnectionClosed);
        }

        trace!("Received {} bytes: {}", n, hex::encode(&buf[..n]));
        Ok(n)
    }

    fn description(&self) -> String {
        format!("{}@{}", self.settings.port_name, self.settings.baud_rate)
    }
}
