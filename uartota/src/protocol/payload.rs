//! Typed command payloads.
//!
//! | Payload  | Size | Layout (little-endian)                                   |
//! |----------|------|----------------------------------------------------------|
//! | START    | 76   | size u32, crc32 u32, version[32], project[32], block u32  |
//! | ACK/NACK | 7    | error u8, expected_seq u16, received u32                 |
//! | PROGRESS | 9    | received u32, total u32, percent u8                      |
//! | STATUS   | 42   | state u8, error u8, received u32, total u32, version[32] |
//!
//! Strings travel as NUL-padded fixed fields.

use {
    crate::{
        error::{Error, Result},
        protocol::command::{ErrorCode, State},
    },
    byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt},
    std::io::{Cursor, Read},
};

/// Width of the fixed string fields.
pub const NAME_FIELD_SIZE: usize = 32;

/// Read a NUL-terminated string out of a fixed-width field.
pub(crate) fn read_fixed_str<R: Read>(reader: &mut R, width: usize) -> Result<String> {
    let mut bytes = vec![0u8; width];
    reader.read_exact(&mut bytes)?;
    Ok(fixed_str(&bytes))
}

/// Decode a NUL-terminated byte field.
pub(crate) fn fixed_str(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// Write `value` into a fixed-width field, leaving room for a terminating NUL.
fn write_fixed_str(buf: &mut Vec<u8>, value: &str, width: usize) {
    let mut end = value
        .len()
        .min(width - 1);
    // Never split a UTF-8 sequence
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    buf.extend_from_slice(&value.as_bytes()[..end]);
    buf.resize(buf.len() + (width - end), 0);
}

fn ensure_len(payload: &[u8], needed: usize, what: &str) -> Result<()> {
    if payload.len() < needed {
        return Err(Error::Protocol(format!(
            "{what} payload too short: {} bytes, need {needed}",
            payload.len()
        )));
    }
    Ok(())
}

/// START payload: announces the image about to be transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPayload {
    /// Total image size in bytes.
    pub firmware_size: u32,
    /// CRC32 of the whole image.
    pub firmware_crc32: u32,
    /// Version string of the new image.
    pub version: String,
    /// Project name of the new image.
    pub project_name: String,
    /// Block size the host intends to use.
    pub block_size: u32,
}

impl StartPayload {
    /// Encoded size.
    pub const SIZE: usize = 4 + 4 + NAME_FIELD_SIZE + NAME_FIELD_SIZE + 4;

    /// Serialize to wire bytes.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(self.firmware_size)
            .unwrap();
        buf.write_u32::<LittleEndian>(self.firmware_crc32)
            .unwrap();
        write_fixed_str(&mut buf, &self.version, NAME_FIELD_SIZE);
        write_fixed_str(&mut buf, &self.project_name, NAME_FIELD_SIZE);
        buf.write_u32::<LittleEndian>(self.block_size)
            .unwrap();
        buf
    }

    /// Parse from wire bytes.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        ensure_len(payload, Self::SIZE, "START")?;
        let mut cursor = Cursor::new(payload);
        let firmware_size = cursor.read_u32::<LittleEndian>()?;
        let firmware_crc32 = cursor.read_u32::<LittleEndian>()?;
        let version = read_fixed_str(&mut cursor, NAME_FIELD_SIZE)?;
        let project_name = read_fixed_str(&mut cursor, NAME_FIELD_SIZE)?;
        let block_size = cursor.read_u32::<LittleEndian>()?;
        Ok(Self {
            firmware_size,
            firmware_crc32,
            version,
            project_name,
            block_size,
        })
    }
}

/// ACK and NACK payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPayload {
    /// `Success` for ACK, the failure reason for NACK.
    pub error_code: ErrorCode,
    /// Next sequence number the device expects.
    pub expected_seq: u16,
    /// Bytes accepted so far.
    pub received_bytes: u32,
}

impl AckPayload {
    /// Encoded size.
    pub const SIZE: usize = 1 + 2 + 4;

    /// Serialize to wire bytes.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(
            self.error_code
                .as_u8(),
        );
        buf.write_u16::<LittleEndian>(self.expected_seq)
            .unwrap();
        buf.write_u32::<LittleEndian>(self.received_bytes)
            .unwrap();
        buf
    }

    /// Parse from wire bytes.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        ensure_len(payload, Self::SIZE, "ACK")?;
        let mut cursor = Cursor::new(payload);
        let error_code = ErrorCode::from(cursor.read_u8()?);
        let expected_seq = cursor.read_u16::<LittleEndian>()?;
        let received_bytes = cursor.read_u32::<LittleEndian>()?;
        Ok(Self {
            error_code,
            expected_seq,
            received_bytes,
        })
    }
}

/// PROGRESS payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressPayload {
    /// Bytes accepted so far.
    pub received_bytes: u32,
    /// Announced image size.
    pub total_bytes: u32,
    /// Completion percentage, 0 to 100.
    pub percentage: u8,
}

impl ProgressPayload {
    /// Encoded size.
    pub const SIZE: usize = 4 + 4 + 1;

    /// Serialize to wire bytes.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(self.received_bytes)
            .unwrap();
        buf.write_u32::<LittleEndian>(self.total_bytes)
            .unwrap();
        buf.push(self.percentage);
        buf
    }

    /// Parse from wire bytes.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        ensure_len(payload, Self::SIZE, "PROGRESS")?;
        let mut cursor = Cursor::new(payload);
        Ok(Self {
            received_bytes: cursor.read_u32::<LittleEndian>()?,
            total_bytes: cursor.read_u32::<LittleEndian>()?,
            percentage: cursor.read_u8()?,
        })
    }
}

/// STATUS_RESP payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StatusPayload {
    /// Current transfer state.
    pub state: State,
    /// Last error recorded by the device.
    pub last_error: ErrorCode,
    /// Bytes accepted in the current transfer.
    pub received_bytes: u32,
    /// Announced size of the current transfer.
    pub total_bytes: u32,
    /// Version of the running application.
    pub current_version: String,
}

impl StatusPayload {
    /// Encoded size.
    pub const SIZE: usize = 1 + 1 + 4 + 4 + NAME_FIELD_SIZE;

    /// Serialize to wire bytes.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(
            self.state
                .as_u8(),
        );
        buf.push(
            self.last_error
                .as_u8(),
        );
        buf.write_u32::<LittleEndian>(self.received_bytes)
            .unwrap();
        buf.write_u32::<LittleEndian>(self.total_bytes)
            .unwrap();
        write_fixed_str(&mut buf, &self.current_version, NAME_FIELD_SIZE);
        buf
    }

    /// Parse from wire bytes.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        ensure_len(payload, Self::SIZE, "STATUS")?;
        let mut cursor = Cursor::new(payload);
        let state = State::parse(cursor.read_u8()?)?;
        let last_error = ErrorCode::from(cursor.read_u8()?);
        let received_bytes = cursor.read_u32::<LittleEndian>()?;
        let total_bytes = cursor.read_u32::<LittleEndian>()?;
        let current_version = read_fixed_str(&mut cursor, NAME_FIELD_SIZE)?;
        Ok(Self {
            state,
            last_error,
            received_bytes,
            total_bytes,
            current_version,
        })
    }
}
