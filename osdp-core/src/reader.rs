//! Frame extraction from a raw byte stream
//!
//! The bus carries driver bytes, line noise and partial frames. [`FrameReader`]
//! buffers whatever the transport delivers and hands out complete frames.

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::constants::{MAX_FRAME_SIZE, MIN_FRAME_SIZE, START_OF_MESSAGE};

/// Incremental frame splitter
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_SIZE),
        }
    }

    /// Append bytes read from the transport
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes waiting for a complete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discard everything buffered
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Take the next complete frame, if one is buffered
    ///
    /// Bytes before a start marker are dropped. A start marker followed by an
    /// impossible length is dropped too and the scan resumes after it.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            match self.buffer.iter().position(|&b| b == START_OF_MESSAGE) {
                Some(0) => {}
                Some(skip) => {
                    trace!("Skipping {} bytes before start marker", skip);
                    self.buffer.advance(skip);
                }
                None => {
                    self.buffer.clear();
                    return None;
                }
            }

            if self.buffer.len() < 4 {
                return None;
            }

            let length = u16::from_le_bytes([self.buffer[2], self.buffer[3]]) as usize;
            if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&length) {
                trace!("Discarding start marker with length {}", length);
                self.buffer.advance(1);
                continue;
            }

            if self.buffer.len() < length {
                return None;
            }

            return Some(self.buffer.split_to(length).freeze());
        }
    }
}
