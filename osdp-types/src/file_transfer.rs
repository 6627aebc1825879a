//! File transfer (osdp_FILETRANSFER / osdp_FTSTAT)

use std::io::Cursor;

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use osdp_core::{CommandCode, Fragment, ReplyCode};

use crate::{CommandPayload, ReplyPayload, error::*};

/// One fragment of a file pushed to the PD
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferFragment {
    /// Manufacturer-defined file type
    pub file_type: u8,
    /// Size of the whole file
    pub total_size: u32,
    /// Position of this fragment
    pub offset: u32,
    pub data: Bytes,
}

impl FileTransferFragment {
    pub const HEADER_SIZE: usize = 11;

    pub fn from_fragment(file_type: u8, fragment: &Fragment) -> Result<Self> {
        let total_size = u32::try_from(fragment.whole_length)
            .map_err(|_| Error::Validation(format!("file of {} bytes too large", fragment.whole_length)))?;

        Ok(Self {
            file_type,
            total_size,
            offset: fragment.offset as u32,
            data: fragment.data.clone(),
        })
    }

    /// Parse the payload of an osdp_FILETRANSFER command
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(Error::too_short("osdp_FILETRANSFER", Self::HEADER_SIZE, data.len()));
        }

        let mut cursor = Cursor::new(data);
        let file_type = cursor.read_u8()?;
        let total_size = cursor.read_u32::<LittleEndian>()?;
        let offset = cursor.read_u32::<LittleEndian>()?;
        let fragment_size = cursor.read_u16::<LittleEndian>()? as usize;

        let body = &data[Self::HEADER_SIZE..];
        if body.len() != fragment_size {
            return Err(Error::Parse(format!(
                "fragment size {} does not match {} data bytes",
                fragment_size,
                body.len()
            )));
        }

        Ok(Self {
            file_type,
            total_size,
            offset,
            data: Bytes::copy_from_slice(body),
        })
    }

    /// Check if this fragment completes the file
    pub fn is_last(&self) -> bool {
        self.offset as u64 + self.data.len() as u64 >= self.total_size as u64
    }
}

impl CommandPayload for FileTransferFragment {
    const CODE: CommandCode = CommandCode::FileTransfer;

    fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE + self.data.len());
        buf.push(self.file_type);
        let _ = buf.write_u32::<LittleEndian>(self.total_size);
        let _ = buf.write_u32::<LittleEndian>(self.offset);
        let _ = buf.write_u16::<LittleEndian>(self.data.len() as u16);
        buf.extend_from_slice(&self.data);
        Bytes::from(buf)
    }
}

bitflags! {
    /// Requests the PD makes of the ACU in osdp_FTSTAT
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileTransferActions: u8 {
        /// Interleave ordinary commands between fragments
        const INTERLEAVE = 0x01;
        /// Continue the transfer outside the secure channel
        const LEAVE_SECURE_CHANNEL = 0x02;
        /// Poll for the result after the last fragment
        const POLL_RESPONSE_AVAILABLE = 0x04;
    }
}

/// Progress reported by the PD
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileTransferStatusCode {
    /// Keep sending
    Ok,
    /// File fully received and processed
    Processed,
    /// Processed; the PD is rebooting
    Rebooting,
    /// Processed; keep polling for the final status
    Finishing,
    /// Transfer aborted
    Abort,
    /// File type not recognized
    UnrecognizedFileContents,
    /// Data failed validation
    MalformedFileContents,
    Other(i16),
}

impl From<i16> for FileTransferStatusCode {
    fn from(value: i16) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Processed,
            2 => Self::Rebooting,
            3 => Self::Finishing,
            -1 => Self::Abort,
            -2 => Self::UnrecognizedFileContents,
            -3 => Self::MalformedFileContents,
            other => Self::Other(other),
        }
    }
}

impl From<FileTransferStatusCode> for i16 {
    fn from(code: FileTransferStatusCode) -> i16 {
        match code {
            FileTransferStatusCode::Ok => 0,
            FileTransferStatusCode::Processed => 1,
            FileTransferStatusCode::Rebooting => 2,
            FileTransferStatusCode::Finishing => 3,
            FileTransferStatusCode::Abort => -1,
            FileTransferStatusCode::UnrecognizedFileContents => -2,
            FileTransferStatusCode::MalformedFileContents => -3,
            FileTransferStatusCode::Other(other) => other,
        }
    }
}

impl FileTransferStatusCode {
    /// Check if the transfer ended in failure
    pub fn is_error(self) -> bool {
        i16::from(self) < 0
    }

    /// Check if the PD has the whole file
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Processed | Self::Rebooting)
    }
}

/// File transfer status (osdp_FTSTAT)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTransferStatus {
    pub actions: FileTransferActions,
    /// Milliseconds to wait before the next fragment
    pub delay_ms: u16,
    pub status: FileTransferStatusCode,
    /// New fragment size limit; zero keeps the current one
    pub update_message_max: u16,
}

impl FileTransferStatus {
    pub const SIZE: usize = 7;

    pub fn new(status: FileTransferStatusCode) -> Self {
        Self {
            actions: FileTransferActions::empty(),
            delay_ms: 0,
            status,
            update_message_max: 0,
        }
    }
}

impl ReplyPayload for FileTransferStatus {
    const CODE: ReplyCode = ReplyCode::FileTransferStatus;

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::too_short("osdp_FTSTAT", Self::SIZE, data.len()));
        }

        let mut cursor = Cursor::new(data);
        Ok(Self {
            actions: FileTransferActions::from_bits_truncate(cursor.read_u8()?),
            delay_ms: cursor.read_u16::<LittleEndian>()?,
            status: FileTransferStatusCode::from(cursor.read_i16::<LittleEndian>()?),
            update_message_max: cursor.read_u16::<LittleEndian>()?,
        })
    }

    fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(self.actions.bits());
        let _ = buf.write_u16::<LittleEndian>(self.delay_ms);
        let _ = buf.write_i16::<LittleEndian>(self.status.into());
        let _ = buf.write_u16::<LittleEndian>(self.update_message_max);
        Bytes::from(buf)
    }
}
