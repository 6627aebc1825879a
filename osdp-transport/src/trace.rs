//! Traffic capture
//!
//! [`TracingTransport`] wraps another transport and records every write and
//! read as a [`TraceEntry`]. Entries go through an unbounded channel to a
//! background writer, so capturing never delays the bus.
//!
//! Capture files hold one entry per line:
//!
//! ```text
//! 2024-05-01T12:00:00.123456Z OUT ff530008000460ebaa
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Transport, error::*};

/// Which way the bytes travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceDirection {
    /// Written by this endpoint
    Output,
    /// Read by this endpoint
    Input,
}

impl TraceDirection {
    fn as_str(self) -> &'static str {
        match self {
            Self::Output => "OUT",
            Self::Input => "IN",
        }
    }
}

/// One captured write or read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    pub direction: TraceDirection,
    pub data: Bytes,
}

impl TraceEntry {
    pub fn new(direction: TraceDirection, data: &[u8]) -> Self {
        Self {
            timestamp: Utc::now(),
            direction,
            data: Bytes::copy_from_slice(data),
        }
    }
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            self.direction.as_str(),
            hex::encode(&self.data)
        )
    }
}

impl FromStr for TraceEntry {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, String> {
        let mut parts = line.split_whitespace();
        let (Some(timestamp), Some(direction), Some(data)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("incomplete trace line: {:?}", line));
        };
        if parts.next().is_some() {
            return Err(format!("trailing fields in trace line: {:?}", line));
        }

        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|e| format!("bad timestamp {:?}: {}", timestamp, e))?
            .with_timezone(&Utc);

        let direction = match direction {
            "OUT" => TraceDirection::Output,
            "IN" => TraceDirection::Input,
            other => return Err(format!("bad direction {:?}", other)),
        };

        let data = hex::decode(data).map_err(|e| format!("bad hex: {}", e))?;

        Ok(Self {
            timestamp,
            direction,
            data: Bytes::from(data),
        })
    }
}

/// Transport decorator that captures traffic
pub struct TracingTransport<T> {
    inner: T,
    sink: mpsc::UnboundedSender<TraceEntry>,
}

impl<T: Transport> TracingTransport<T> {
    pub fn new(inner: T, sink: mpsc::UnboundedSender<TraceEntry>) -> Self {
        Self { inner, sink }
    }

    /// Unwrap the decorated transport
    pub fn into_inner(self) -> T {
        self.inner
    }

    fn record(&self, direction: TraceDirection, data: &[u8]) {
        // A closed sink only means nobody is capturing any more
        let _ = self.sink.send(TraceEntry::new(direction, data));
    }
}

#[async_trait]
impl<T: Transport> Transport for TracingTransport<T> {
    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    async fn open(&mut self) -> Result<()> {
        self.inner.open().await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write(data).await?;
        self.record(TraceDirection::Output, data);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize> {
        let n = self.inner.read(buf, cancel).await?;
        self.record(TraceDirection::Input, &buf[..n]);
        Ok(n)
    }

    fn description(&self) -> String {
        format!("{} (traced)", self.inner.description())
    }
}

/// Spawn a task appending entries to `path`, one per line
///
/// The task ends once every sender is dropped.
pub async fn spawn_trace_writer(
    path: impl AsRef<Path>,
) -> Result<(mpsc::UnboundedSender<TraceEntry>, JoinHandle<Result<()>>)> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())
        .await?;
    debug!("Capturing traffic to {}", path.as_ref().display());

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(write_entries(BufWriter::new(file), rx));
    Ok((tx, handle))
}

async fn write_entries(mut file: BufWriter<File>, mut rx: mpsc::UnboundedReceiver<TraceEntry>) -> Result<()> {
    while let Some(entry) = rx.recv().await {
        let line = format!("{}\n", entry);
        if let Err(e) = file.write_all(line.as_bytes()).await {
            warn!("Trace capture stopped: {}", e);
            return Err(e.into());
        }
        if rx.is_empty() {
            file.flush().await?;
        }
    }

    file.flush().await?;
    Ok(())
}
