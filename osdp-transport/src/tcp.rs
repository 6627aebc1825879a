//! TCP transports

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{Transport, error::*, read_cancellable};

/// Resolve `host:port` to the first socket address
async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addr_str = format!("{}:{}", host, port);

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&addr_str)
        .await
        .map_err(|e| Error::InvalidAddress(format!("{}: {}", addr_str, e)))?
        .collect();

    addrs
        .first()
        .copied()
        .ok_or_else(|| Error::InvalidAddress(format!("No addresses found for {}", addr_str)))
}

/// TCP client connecting out to a PD or an RS-485 bridge
pub struct TcpClientTransport {
    host: String,
    port: u16,
    socket_addr: Option<SocketAddr>,
    stream: Option<TcpStream>,
    connect_timeout: Duration,
}

impl TcpClientTransport {
    /// Create new TCP client transport
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            socket_addr: None,
            stream: None,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn resolve_addr(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.socket_addr {
            return Ok(addr);
        }

        let addr = resolve(&self.host, self.port).await?;
        self.socket_addr = Some(addr);
        Ok(addr)
    }
}

#[async_trait]
impl Transport for TcpClientTransport {
    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(Error::AlreadyConnected);
        }

        let addr = self.resolve_addr().await?;

        debug!("Connecting to {}...", addr);

        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectionTimeout)?
            .map_err(Error::Io)?;

        // Frames are small and latency bound
        stream.set_nodelay(true)?;

        info!("Connected to {}", addr);

        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            debug!("Disconnecting from {}...", self.description());
            let _ = stream.shutdown().await;
        }

        self.socket_addr = None;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        trace!("Sending {} bytes: {}", data.len(), hex::encode(data));

        stream.write_all(data).await?;
        stream.flush().await?;

        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        let n = read_cancellable(stream, buf, cancel).await?;
        if n == 0 {
            self.stream = None;
            return Err(Error::ConnectionClosed);
        }

        trace!("Received {} bytes: {}", n, hex::encode(&buf[..n]));
        Ok(n)
    }

    fn description(&self) -> String {
        self.socket_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }
}

impl Drop for TcpClientTransport {
    fn drop(&mut self) {
        if self.is_open() {
            warn!("TCP transport dropped while still connected");
        }
    }
}

/// TCP server accepting one peer at a time
///
/// The listener is bound by [`open`](Transport::open); a peer is accepted by
/// the first read. When the peer disconnects the next read waits for a new one.
pub struct TcpServerTransport {
    bind_addr: String,
    port: u16,
    listener: Option<TcpListener>,
    stream: Option<(TcpStream, SocketAddr)>,
}

impl TcpServerTransport {
    /// Create new TCP server transport
    pub fn new(bind_addr: impl Into<String>, port: u16) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            port,
            listener: None,
            stream: None,
        }
    }

    /// Address the listener is bound to, once open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Check if a peer is connected
    pub fn has_peer(&self) -> bool {
        self.stream.is_some()
    }
}

#[async_trait]
impl Transport for TcpServerTransport {
    fn is_open(&self) -> bool {
        self.listener.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(Error::AlreadyConnected);
        }

        let addr = resolve(&self.bind_addr, self.port).await?;
        let listener = TcpListener::bind(addr).await?;

        info!("Listening on {}", listener.local_addr()?);

        self.listener = Some(listener);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some((mut stream, peer)) = self.stream.take() {
            debug!("Disconnecting {}...", peer);
            let _ = stream.shutdown().await;
        }

        self.listener = None;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let (stream, _) = self.stream.as_mut().ok_or(Error::NotConnected)?;

        trace!("Sending {} bytes: {}", data.len(), hex::encode(data));

        stream.write_all(data).await?;
        stream.flush().await?;

        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize> {
        if self.stream.is_none() {
            let listener = self.listener.as_ref().ok_or(Error::NotConnected)?;

            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                accepted = listener.accept() => accepted?,
            };

            stream.set_nodelay(true)?;
            info!("Accepted connection from {}", peer);
            self.stream = Some((stream, peer));
        }

        let Some((stream, peer)) = self.stream.as_mut() else {
            return Err(Error::NotConnected);
        };

        let n = read_cancellable(stream, buf, cancel).await?;
        if n == 0 {
            info!("Connection from {} closed", peer);
            self.stream = None;
            return Err(Error::ConnectionClosed);
        }

        trace!("Received {} bytes: {}", n, hex::encode(&buf[..n]));
        Ok(n)
    }

    fn description(&self) -> String {
        match &self.stream {
            Some((_, peer)) => format!("{}:{} <- {}", self.bind_addr, self.port, peer),
            None => format!("{}:{}", self.bind_addr, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_transport_create() {
        let transport = TcpClientTransport::new("192.168.1.201", 4000);
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_tcp_transport_invalid_address() {
        let mut transport =
            TcpClientTransport::new("invalid..address", 4000).with_connect_timeout(Duration::from_millis(100));

        let result = transport.open().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let mut transport = TcpClientTransport::new("127.0.0.1", 4000);
        assert!(matches!(transport.write(&[0xFF]).await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_client_server_exchange() {
        let mut server = TcpServerTransport::new("127.0.0.1", 0);
        server.open().await.unwrap();
        let port = server.local_addr().unwrap().port();

        let mut client = TcpClientTransport::new("127.0.0.1", port);
        client.open().await.unwrap();
        client.write(&[0xFF, 0x53]).await.unwrap();

        let cancel = CancellationToken::new();
        let mut buf = [0u8; 16];
        let mut received = Vec::new();
        while received.len() < 2 {
            let n = server.read(&mut buf, &cancel).await.unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, vec![0xFF, 0x53]);
        assert!(server.has_peer());

        server.write(&[0x01]).await.unwrap();
        let n = client.read(&mut buf, &cancel).await.unwrap();
        assert_eq!(&buf[..n], &[0x01]);

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_cancelled() {
        let mut server = TcpServerTransport::new("127.0.0.1", 0);
        server.open().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut buf = [0u8; 4];
        assert!(matches!(server.read(&mut buf, &cancel).await, Err(Error::Cancelled)));
    }
}
