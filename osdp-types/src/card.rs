//! Card and keypad reports

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use osdp_core::ReplyCode;

use crate::{ReplyPayload, error::*};

/// Raw card bits (osdp_RAW)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCardData {
    pub reader_number: u8,
    /// 0 = unspecified raw bits, 1 = Wiegand
    pub format: u8,
    pub bit_count: u16,
    pub data: Bytes,
}

impl RawCardData {
    pub const HEADER_SIZE: usize = 4;
}

impl ReplyPayload for RawCardData {
    const CODE: ReplyCode = ReplyCode::RawReaderData;

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(Error::too_short("osdp_RAW", Self::HEADER_SIZE, data.len()));
        }

        let mut cursor = Cursor::new(data);
        let reader_number = cursor.read_u8()?;
        let format = cursor.read_u8()?;
        let bit_count = cursor.read_u16::<LittleEndian>()?;

        let byte_count = (bit_count as usize).div_ceil(8);
        let body = &data[Self::HEADER_SIZE..];
        if body.len() < byte_count {
            return Err(Error::too_short("osdp_RAW data", byte_count, body.len()));
        }

        Ok(Self {
            reader_number,
            format,
            bit_count,
            data: Bytes::copy_from_slice(&body[..byte_count]),
        })
    }

    fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE + self.data.len());
        buf.push(self.reader_number);
        buf.push(self.format);
        let _ = buf.write_u16::<LittleEndian>(self.bit_count);
        buf.extend_from_slice(&self.data);
        Bytes::from(buf)
    }
}

/// Keys pressed on a reader's keypad (osdp_KEYPAD)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeypadData {
    pub reader_number: u8,
    pub digits: Bytes,
}

impl ReplyPayload for KeypadData {
    const CODE: ReplyCode = ReplyCode::KeypadData;

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::too_short("osdp_KEYPAD", 2, data.len()));
        }

        let count = data[1] as usize;
        let digits = &data[2..];
        if digits.len() < count {
            return Err(Error::too_short("osdp_KEYPAD digits", count, digits.len()));
        }

        Ok(Self {
            reader_number: data[0],
            digits: Bytes::copy_from_slice(&digits[..count]),
        })
    }

    fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(2 + self.digits.len());
        buf.push(self.reader_number);
        buf.push(self.digits.len() as u8);
        buf.extend_from_slice(&self.digits);
        Bytes::from(buf)
    }
}
