//! Transport layer for OSDP
//!
//! Byte pipes the bus runs over: TCP client and server sockets, serial ports,
//! in-memory pairs for tests, and a decorator that captures traffic.

pub mod error;
pub mod memory;
#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp;
pub mod trace;

pub use error::{Error, Result};
pub use memory::MemoryTransport;
#[cfg(feature = "serial")]
pub use serial::SerialTransport;
pub use tcp::{TcpClientTransport, TcpServerTransport};
pub use trace::{TraceDirection, TraceEntry, TracingTransport, spawn_trace_writer};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Transport trait for different communication methods
///
/// A transport is a half-duplex byte pipe. Framing belongs to the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Check if the transport is ready for I/O
    fn is_open(&self) -> bool;

    /// Open the underlying connection
    async fn open(&mut self) -> Result<()>;

    /// Close the underlying connection
    async fn close(&mut self) -> Result<()>;

    /// Write raw bytes
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever is available into `buf`
    ///
    /// Returns the number of bytes read. Fails with [`Error::Cancelled`] once
    /// `cancel` fires.
    async fn read(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize>;

    /// Human-readable endpoint, for logs
    fn description(&self) -> String;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn open(&mut self) -> Result<()> {
        (**self).open().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data).await
    }

    async fn read(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize> {
        (**self).read(buf, cancel).await
    }

    fn description(&self) -> String {
        (**self).description()
    }
}

/// Read from `reader` until data arrives or `cancel` fires
pub(crate) async fn read_cancellable<R>(reader: &mut R, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize>
where
    R: tokio::io::AsyncRead + Unpin + ?Sized,
{
    use tokio::io::AsyncReadExt;

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        read = reader.read(buf) => Ok(read?),
    }
}
