//! Communication settings (osdp_COMSET / osdp_COM)

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use osdp_core::{CommandCode, ReplyCode};

use crate::{CommandPayload, ReplyPayload, error::*};

/// Address and baud rate a PD should switch to, or reports it uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommunicationConfiguration {
    pub address: u8,
    pub baud_rate: u32,
}

impl CommunicationConfiguration {
    pub const SIZE: usize = 5;

    pub fn new(address: u8, baud_rate: u32) -> Result<Self> {
        if address > 0x7E {
            return Err(Error::Validation(format!("address {} out of range 0-126", address)));
        }
        Ok(Self { address, baud_rate })
    }

    fn write(&self) -> Bytes {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(self.address);
        let _ = buf.write_u32::<LittleEndian>(self.baud_rate);
        Bytes::from(buf)
    }

    fn read(what: &'static str, data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::too_short(what, Self::SIZE, data.len()));
        }

        let mut cursor = Cursor::new(data);
        Ok(Self {
            address: cursor.read_u8()?,
            baud_rate: cursor.read_u32::<LittleEndian>()?,
        })
    }

    /// Parse the payload of an osdp_COMSET command
    pub fn decode_command(data: &[u8]) -> Result<Self> {
        Self::read("osdp_COMSET", data)
    }
}

impl CommandPayload for CommunicationConfiguration {
    const CODE: CommandCode = CommandCode::CommunicationSet;

    fn encode(&self) -> Bytes {
        self.write()
    }
}

impl ReplyPayload for CommunicationConfiguration {
    const CODE: ReplyCode = ReplyCode::CommunicationSettings;

    fn decode(data: &[u8]) -> Result<Self> {
        Self::read("osdp_COM", data)
    }

    fn encode(&self) -> Bytes {
        self.write()
    }
}
