//! Multi-part message fragmentation and reassembly
//!
//! Payloads larger than a single frame travel as a series of
//! `{whole_length, offset, fragment}` pieces, sent strictly in increasing
//! offset order.

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::error::{Error, Result};

/// Upper bound on the buffer reserved up front for an announced length
const MAX_PREALLOCATION: usize = 64 * 1024;

/// One piece of a multi-part payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Size of the complete payload
    pub whole_length: usize,
    /// Position of this piece in the complete payload
    pub offset: usize,
    /// Fragment bytes
    pub data: Bytes,
}

impl Fragment {
    /// Check if this fragment completes the payload
    pub fn is_last(&self) -> bool {
        self.offset + self.data.len() >= self.whole_length
    }
}

/// Splits a payload into fragments
///
/// The fragment size can be revised between fragments when the receiver
/// signals a new message maximum.
#[derive(Debug, Clone)]
pub struct Fragmenter {
    data: Bytes,
    offset: usize,
    max_fragment: usize,
}

impl Fragmenter {
    pub fn new(data: impl Into<Bytes>, max_fragment: usize) -> Self {
        Self {
            data: data.into(),
            offset: 0,
            max_fragment: max_fragment.max(1),
        }
    }

    /// Total payload size
    pub fn whole_length(&self) -> usize {
        self.data.len()
    }

    /// Bytes already handed out
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Current fragment size limit
    pub fn max_fragment(&self) -> usize {
        self.max_fragment
    }

    /// Apply an "update message maximum" from the receiver; zero keeps the current size
    pub fn set_max_fragment(&mut self, max_fragment: usize) {
        if max_fragment > 0 && max_fragment != self.max_fragment {
            trace!("Fragment size {} -> {}", self.max_fragment, max_fragment);
            self.max_fragment = max_fragment;
        }
    }

    /// Check if every byte has been handed out
    pub fn is_complete(&self) -> bool {
        self.offset >= self.data.len()
    }

    /// Take the next fragment
    pub fn next_fragment(&mut self) -> Option<Fragment> {
        if self.is_complete() {
            return None;
        }

        let end = (self.offset + self.max_fragment).min(self.data.len());
        let fragment = Fragment {
            whole_length: self.data.len(),
            offset: self.offset,
            data: self.data.slice(self.offset..end),
        };
        self.offset = end;

        Some(fragment)
    }
}

/// Accumulates fragments into the complete payload
#[derive(Debug, Default)]
pub struct Reassembler {
    whole_length: Option<usize>,
    buffer: BytesMut,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a transfer is in progress
    pub fn is_active(&self) -> bool {
        self.whole_length.is_some()
    }

    /// Bytes accumulated so far
    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    /// Drop a transfer in progress
    pub fn reset(&mut self) {
        self.whole_length = None;
        self.buffer.clear();
    }

    /// Add a fragment
    ///
    /// Returns the complete payload once `offset + fragment_length` reaches
    /// `whole_length`, after which the reassembler is ready for a new transfer.
    ///
    /// # Errors
    ///
    /// - [`Error::UnexpectedFragment`] if `offset` does not continue the data
    ///   accumulated so far
    /// - [`Error::InvalidFragment`] if `whole_length` changes mid transfer or
    ///   the fragment runs past it
    pub fn push(&mut self, whole_length: usize, offset: usize, data: &[u8]) -> Result<Option<Bytes>> {
        match self.whole_length {
            Some(expected) if expected != whole_length => {
                return Err(Error::InvalidFragment(format!(
                    "whole length changed from {} to {}",
                    expected, whole_length
                )));
            }
            Some(_) => {}
            None => {
                self.buffer = BytesMut::with_capacity(whole_length.min(MAX_PREALLOCATION));
            }
        }

        if offset != self.buffer.len() {
            return Err(Error::UnexpectedFragment {
                expected: self.buffer.len(),
                actual: offset,
            });
        }

        if offset + data.len() > whole_length {
            return Err(Error::InvalidFragment(format!(
                "fragment [{}, {}) exceeds whole length {}",
                offset,
                offset + data.len(),
                whole_length
            )));
        }

        self.whole_length = Some(whole_length);
        self.buffer.extend_from_slice(data);
        trace!("Reassembled {}/{} bytes", self.buffer.len(), whole_length);

        if offset + data.len() >= whole_length {
            self.whole_length = None;
            return Ok(Some(self.buffer.split().freeze()));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_two_fragment_reassembly() {
        let mut reassembler = Reassembler::new();

        assert_eq!(reassembler.push(10, 0, b"AAAAAA").unwrap(), None);
        assert!(reassembler.is_active());
        assert_eq!(reassembler.received(), 6);

        let whole = reassembler.push(10, 6, b"BBBB").unwrap().unwrap();
        assert_eq!(whole.as_ref(), b"AAAAAABBBB");
        assert!(!reassembler.is_active());
    }

    #[test]
    fn test_offset_gap_rejected() {
        let mut reassembler = Reassembler::new();
        reassembler.push(10, 0, b"AAAAAA").unwrap();

        let result = reassembler.push(10, 7, b"BBB");
        assert!(matches!(
            result,
            Err(Error::UnexpectedFragment {
                expected: 6,
                actual: 7
            })
        ));
        // The accumulated data survives a rejected fragment
        assert_eq!(reassembler.received(), 6);
    }

    #[test]
    fn test_first_fragment_must_start_at_zero() {
        let mut reassembler = Reassembler::new();
        assert!(matches!(
            reassembler.push(10, 4, b"AAAA"),
            Err(Error::UnexpectedFragment { .. })
        ));
        assert!(!reassembler.is_active());
    }

    #[test]
    fn test_whole_length_change_rejected() {
        let mut reassembler = Reassembler::new();
        reassembler.push(10, 0, b"AAAA").unwrap();

        assert!(matches!(
            reassembler.push(12, 4, b"BBBB"),
            Err(Error::InvalidFragment(_))
        ));
    }

    #[test]
    fn test_overrun_rejected() {
        let mut reassembler = Reassembler::new();
        assert!(matches!(
            reassembler.push(4, 0, b"AAAAAA"),
            Err(Error::InvalidFragment(_))
        ));
    }

    #[test]
    fn test_single_fragment_transfer() {
        let mut reassembler = Reassembler::new();
        let whole = reassembler.push(3, 0, b"abc").unwrap();
        assert_eq!(whole.as_deref(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_fragmenter_sizes() {
        let mut fragmenter = Fragmenter::new(vec![0u8; 10], 4);

        let sizes: Vec<_> = std::iter::from_fn(|| fragmenter.next_fragment())
            .map(|f| (f.offset, f.data.len(), f.is_last()))
            .collect();

        assert_eq!(sizes, vec![(0, 4, false), (4, 4, false), (8, 2, true)]);
        assert!(fragmenter.is_complete());
    }

    #[test]
    fn test_fragmenter_update_maximum() {
        let mut fragmenter = Fragmenter::new(vec![0u8; 10], 4);

        let first = fragmenter.next_fragment().unwrap();
        assert_eq!(first.data.len(), 4);

        fragmenter.set_max_fragment(6);
        let second = fragmenter.next_fragment().unwrap();
        assert_eq!((second.offset, second.data.len()), (4, 6));
        assert!(second.is_last());

        // Zero means "no change"
        fragmenter.set_max_fragment(0);
        assert_eq!(fragmenter.max_fragment(), 6);
    }

    #[test]
    fn test_fragmenter_feeds_reassembler() {
        let payload: Vec<u8> = (0..=255).collect();
        let mut fragmenter = Fragmenter::new(payload.clone(), 37);
        let mut reassembler = Reassembler::new();

        let mut result = None;
        while let Some(fragment) = fragmenter.next_fragment() {
            result = reassembler
                .push(fragment.whole_length, fragment.offset, &fragment.data)
                .unwrap();
        }

        assert_eq!(result.unwrap().as_ref(), payload.as_slice());
    }
}
