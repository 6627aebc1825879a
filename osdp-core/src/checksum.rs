//! OSDP frame trailers
//!
//! A frame ends with either a 16-bit CRC or an 8-bit checksum, selected by the
//! CRC flag of the control byte:
//! 1. CRC-16/AUG-CCITT: polynomial 0x1021, initial value 0x1D0F, no reflection,
//!    transmitted little-endian
//! 2. Checksum: two's complement of the 8-bit sum of every preceding byte

use crc::{CRC_16_SPI_FUJITSU, Crc};
use tracing::trace;

/// CRC-16/AUG-CCITT, catalogued by the `crc` crate under its SPI-FUJITSU alias
const OSDP_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_SPI_FUJITSU);

/// Calculate the CRC-16 trailer over `data`
///
/// # Examples
///
/// ```
/// use osdp_core::checksum;
///
/// assert_eq!(checksum::crc16(b"123456789"), 0xE5CC);
/// ```
pub fn crc16(data: &[u8]) -> u16 {
    let crc = OSDP_CRC.checksum(data);

    trace!(
        len = data.len(),
        crc = format!("0x{:04X}", crc),
        "Calculated CRC-16"
    );

    crc
}

/// Calculate the 8-bit checksum trailer over `data`
///
/// # Algorithm
///
/// ```text
/// 1. Sum all bytes, discarding overflow past 8 bits
/// 2. Return the two's complement of the sum
/// ```
///
/// Adding the checksum to the sum of the data therefore yields zero.
pub fn checksum(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    sum.wrapping_neg()
}

/// Verify a CRC-16 trailer
pub fn verify_crc16(data: &[u8], expected: u16) -> bool {
    crc16(data) == expected
}

/// Verify a checksum trailer
pub fn verify_checksum(data: &[u8], expected: u8) -> bool {
    checksum(data) == expected
}
