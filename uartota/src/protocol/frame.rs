//! Wire frame encoding and decoding.
//!
//! ## Frame Format
//!
//! ```text
//! +------+------+-----+-----+-----+--------+-------+-----------+-------+------+------+
//! | 0xAA | 0x55 | VER | CMD | SEQ | OFFSET |  LEN  |  PAYLOAD  | CRC16 | 0x55 | 0xAA |
//! +------+------+-----+-----+-----+--------+-------+-----------+-------+------+------+
//! |  1   |  1   |  1  |  1  |  2  |   4    |   2   |  0..1024  |   2   |  1   |  1   |
//! +------+------+-----+-----+-----+--------+-------+-----------+-------+------+------+
//! ```
//!
//! Multi-byte fields are little-endian. The CRC16 covers everything from the
//! first marker up to the end of the payload.

use {
    crate::protocol::{command::Command, crc::crc16_ccitt},
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
    thiserror::Error,
};

/// Opening marker bytes.
pub const START_MARKER: [u8; 2] = [0xAA, 0x55];

/// Closing marker bytes.
pub const END_MARKER: [u8; 2] = [0x55, 0xAA];

/// Protocol version carried in every frame.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Fixed header size (markers through length field).
pub const HEADER_SIZE: usize = 12;

/// Footer size (CRC16 plus closing markers).
pub const FOOTER_SIZE: usize = 4;

/// Maximum payload bytes in one frame.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Upper bound for a buffered frame.
///
/// Kept at the historic 14-byte header allowance so receivers sized for it
/// keep working; every well-formed frame is two bytes shorter than this.
pub const MAX_FRAME_SIZE: usize = 14 + MAX_PAYLOAD_SIZE + FOOTER_SIZE;

/// Offset of the length field inside the header.
pub(crate) const LENGTH_OFFSET: usize = 10;

/// Errors raised while encoding or decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Input shorter than header plus footer.
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    /// Opening or closing markers are wrong.
    #[error("frame markers invalid")]
    MarkersInvalid,

    /// Declared payload length disagrees with the bytes present.
    #[error("length mismatch: header declares {declared} payload bytes, frame holds {actual}")]
    LengthMismatch {
        /// Length from the header.
        declared: usize,
        /// Payload bytes actually present.
        actual: usize,
    },

    /// CRC16 does not match the frame content.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// CRC carried in the frame.
        expected: u16,
        /// CRC computed over the frame.
        actual: u16,
    },

    /// Frame uses a protocol version this crate does not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command id.
    pub command: Command,
    /// Sequence number.
    pub sequence: u16,
    /// Byte offset (DATA) or zero.
    pub offset: u32,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame with an empty payload.
    pub fn new(command: Command, sequence: u16) -> Self {
        Self {
            command,
            sequence,
            offset: 0,
            payload: Vec::new(),
        }
    }

    /// Create a frame with the given payload and offset 0.
    pub fn with_payload(command: Command, sequence: u16, payload: Vec<u8>) -> Self {
        Self {
            command,
            sequence,
            offset: 0,
            payload,
        }
    }

    /// Create a DATA frame.
    pub fn data(sequence: u16, offset: u32, block: &[u8]) -> Self {
        Self {
            command: Command::Data,
            sequence,
            offset,
            payload: block.to_vec(),
        }
    }

    /// Serialize this frame.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode(self.command, self.sequence, self.offset, &self.payload)
    }

    /// Parse a complete frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        decode(bytes)
    }
}

/// Build a frame from its fields.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn encode(
    command: Command,
    sequence: u16,
    offset: u32,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + FOOTER_SIZE);
    frame.extend_from_slice(&START_MARKER);
    frame.push(PROTOCOL_VERSION);
    frame.push(command.as_u8());
    frame
        .write_u16::<LittleEndian>(sequence)
        .unwrap();
    frame
        .write_u32::<LittleEndian>(offset)
        .unwrap();
    // Bounded by MAX_PAYLOAD_SIZE above
    #[allow(clippy::cast_possible_truncation)]
    frame
        .write_u16::<LittleEndian>(payload.len() as u16)
        .unwrap();
    frame.extend_from_slice(payload);

    let crc = crc16_ccitt(&frame);
    frame
        .write_u16::<LittleEndian>(crc)
        .unwrap();
    frame.extend_from_slice(&END_MARKER);

    Ok(frame)
}

/// Parse and validate a complete frame.
///
/// Checks are applied in wire order: size, markers, declared length, CRC,
/// then version. A version mismatch is only reported for frames that are
/// otherwise intact.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(FrameError::TooShort(bytes.len()));
    }
    if bytes[..2] != START_MARKER || bytes[bytes.len() - 2..] != END_MARKER {
        return Err(FrameError::MarkersInvalid);
    }

    let declared = LittleEndian::read_u16(&bytes[LENGTH_OFFSET..HEADER_SIZE]) as usize;
    let actual = bytes.len() - HEADER_SIZE - FOOTER_SIZE;
    if declared != actual {
        return Err(FrameError::LengthMismatch { declared, actual });
    }
    if declared > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(declared));
    }

    let crc_at = HEADER_SIZE + declared;
    let expected = LittleEndian::read_u16(&bytes[crc_at..crc_at + 2]);
    let computed = crc16_ccitt(&bytes[..crc_at]);
    if expected != computed {
        return Err(FrameError::CrcMismatch {
            expected,
            actual: computed,
        });
    }

    if bytes[2] != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(bytes[2]));
    }

    Ok(Frame {
        command: Command::from(bytes[3]),
        sequence: LittleEndian::read_u16(&bytes[4..6]),
        offset: LittleEndian::read_u32(&bytes[6..10]),
        payload: bytes[HEADER_SIZE..crc_at].to_vec(),
    })
}

/// Total frame size for a payload of `payload_len` bytes.
pub fn frame_size(payload_len: usize) -> usize {
    HEADER_SIZE + payload_len + FOOTER_SIZE
}
