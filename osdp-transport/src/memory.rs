//! In-memory transport
//!
//! Two connected endpoints over [`tokio::io::duplex`], used for tests and
//! loopback tooling where an ACU and a PD share one process.

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{Transport, error::*, read_cancellable};

/// Default buffer size of each direction
const DEFAULT_CAPACITY: usize = 4096;

/// One end of an in-memory byte pipe
#[derive(Debug)]
pub struct MemoryTransport {
    name: String,
    stream: DuplexStream,
    open: bool,
}

impl MemoryTransport {
    /// Create a connected pair
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a connected pair buffering up to `capacity` bytes per direction
    pub fn pair_with_capacity(capacity: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(capacity);
        (
            Self {
                name: "memory:a".to_string(),
                stream: a,
                open: false,
            },
            Self {
                name: "memory:b".to_string(),
                stream: b,
                open: false,
            },
        )
    }

    /// Rename this endpoint in logs
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> Result<()> {
        if self.open {
            return Err(Error::AlreadyConnected);
        }
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::NotConnected);
        }

        trace!("{}: sending {} bytes", self.name, data.len());
        self.stream.write_all(data).await?;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize> {
        if !self.open {
            return Err(Error::NotConnected);
        }

        let n = read_cancellable(&mut self.stream, buf, cancel).await?;
        if n == 0 {
            self.open = false;
            return Err(Error::ConnectionClosed);
        }

        trace!("{}: received {} bytes", self.name, n);
        Ok(n)
    }

    fn description(&self) -> String {
        self.name.clone()
    }
}
