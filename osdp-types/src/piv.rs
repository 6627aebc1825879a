//! PIV data read (osdp_PIVDATA / osdp_PIVDATAR)

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use osdp_core::{CommandCode, ReplyCode};

use crate::{CommandPayload, ReplyPayload, error::*};

/// Ask the PD for a PIV data object from the presented card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetPivData {
    pub object_id: [u8; 3],
    pub element_id: u8,
    pub data_offset: u16,
}

impl GetPivData {
    pub const SIZE: usize = 6;

    pub fn new(object_id: [u8; 3], element_id: u8) -> Self {
        Self {
            object_id,
            element_id,
            data_offset: 0,
        }
    }

    /// Parse the payload of an osdp_PIVDATA command
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::too_short("osdp_PIVDATA", Self::SIZE, data.len()));
        }

        let mut cursor = Cursor::new(&data[4..]);
        Ok(Self {
            object_id: [data[0], data[1], data[2]],
            element_id: data[3],
            data_offset: cursor.read_u16::<LittleEndian>()?,
        })
    }
}

impl CommandPayload for GetPivData {
    const CODE: CommandCode = CommandCode::PivData;

    fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.object_id);
        buf.push(self.element_id);
        let _ = buf.write_u16::<LittleEndian>(self.data_offset);
        Bytes::from(buf)
    }
}

/// One fragment of a PIV data object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivDataFragment {
    pub whole_length: u16,
    pub offset: u16,
    pub data: Bytes,
}

impl PivDataFragment {
    pub const HEADER_SIZE: usize = 6;
}

impl ReplyPayload for PivDataFragment {
    const CODE: ReplyCode = ReplyCode::PivData;

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(Error::too_short("osdp_PIVDATAR", Self::HEADER_SIZE, data.len()));
        }

        let mut cursor = Cursor::new(data);
        let whole_length = cursor.read_u16::<LittleEndian>()?;
        let offset = cursor.read_u16::<LittleEndian>()?;
        let length = cursor.read_u16::<LittleEndian>()? as usize;

        let body = &data[Self::HEADER_SIZE..];
        if body.len() < length {
            return Err(Error::too_short("osdp_PIVDATAR data", length, body.len()));
        }

        Ok(Self {
            whole_length,
            offset,
            data: Bytes::copy_from_slice(&body[..length]),
        })
    }

    fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE + self.data.len());
        let _ = buf.write_u16::<LittleEndian>(self.whole_length);
        let _ = buf.write_u16::<LittleEndian>(self.offset);
        let _ = buf.write_u16::<LittleEndian>(self.data.len() as u16);
        buf.extend_from_slice(&self.data);
        Bytes::from(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osdp_core::Reassembler;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_layout() {
        let request = GetPivData::new([0x5F, 0xC1, 0x02], 0x70);
        let data = request.encode();

        assert_eq!(data.as_ref(), &[0x5F, 0xC1, 0x02, 0x70, 0x00, 0x00]);
        assert_eq!(GetPivData::decode(&data).unwrap(), request);
    }

    #[test]
    fn test_fragments_reassemble() {
        let first = PivDataFragment {
            whole_length: 10,
            offset: 0,
            data: Bytes::from_static(b"AAAAAA"),
        };
        let second = PivDataFragment {
            whole_length: 10,
            offset: 6,
            data: Bytes::from_static(b"BBBB"),
        };

        let mut reassembler = Reassembler::new();
        let mut result = None;
        for fragment in [first, second] {
            let decoded = PivDataFragment::decode(&fragment.encode()).unwrap();
            result = reassembler
                .push(
                    decoded.whole_length as usize,
                    decoded.offset as usize,
                    &decoded.data,
                )
                .unwrap();
        }

        assert_eq!(result.unwrap().as_ref(), b"AAAAAABBBB");
    }

    #[test]
    fn test_truncated_fragment() {
        let data = [0x0A, 0x00, 0x00, 0x00, 0x04, 0x00, 0x01];
        assert!(PivDataFragment::decode(&data).is_err());
    }
}
