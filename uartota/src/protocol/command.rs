//! Wire-visible enumerations: command ids, error codes and transfer states.
//!
//! All three are fixed-width bytes on the wire. Changing a discriminant is a
//! protocol break.

use {
    crate::error::{Error, Result},
    std::fmt,
};

/// Frame command id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Host: begin a transfer (carries a START payload).
    Start,
    /// Host: one block of image data.
    Data,
    /// Host: all data sent, finalize the image.
    End,
    /// Host: cancel the current transfer.
    Abort,
    /// Host: ask for the device status.
    QueryStatus,
    /// Host: ask the device to roll back to the previous image.
    RollbackReq,
    /// Device: command accepted.
    Ack,
    /// Device: command rejected.
    Nack,
    /// Device: ready to receive data after START.
    Ready,
    /// Device: transfer progress report.
    Progress,
    /// Device: image verified and boot partition switched.
    Complete,
    /// Device: unsolicited error report.
    Error,
    /// Device: reply to QUERY_STATUS.
    StatusResp,
    /// Any id not defined by the protocol.
    Unknown(u8),
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Start,
            0x02 => Self::Data,
            0x03 => Self::End,
            0x04 => Self::Abort,
            0x05 => Self::QueryStatus,
            0x06 => Self::RollbackReq,
            0x80 => Self::Ack,
            0x81 => Self::Nack,
            0x82 => Self::Ready,
            0x83 => Self::Progress,
            0x84 => Self::Complete,
            0x85 => Self::Error,
            0x86 => Self::StatusResp,
            v => Self::Unknown(v),
        }
    }
}

impl Command {
    /// Returns the wire byte for this command.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Start => 0x01,
            Self::Data => 0x02,
            Self::End => 0x03,
            Self::Abort => 0x04,
            Self::QueryStatus => 0x05,
            Self::RollbackReq => 0x06,
            Self::Ack => 0x80,
            Self::Nack => 0x81,
            Self::Ready => 0x82,
            Self::Progress => 0x83,
            Self::Complete => 0x84,
            Self::Error => 0x85,
            Self::StatusResp => 0x86,
            Self::Unknown(v) => v,
        }
    }

    /// Whether this command travels from host to device.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::Start
                | Self::Data
                | Self::End
                | Self::Abort
                | Self::QueryStatus
                | Self::RollbackReq
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "START",
            Self::Data => "DATA",
            Self::End => "END",
            Self::Abort => "ABORT",
            Self::QueryStatus => "QUERY_STATUS",
            Self::RollbackReq => "ROLLBACK_REQ",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Ready => "READY",
            Self::Progress => "PROGRESS",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
            Self::StatusResp => "STATUS_RESP",
            Self::Unknown(v) => return write!(f, "UNKNOWN(0x{v:02X})"),
        };
        f.write_str(name)
    }
}

/// Error code carried by ACK/NACK and STATUS_RESP payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum ErrorCode {
    /// No error.
    #[default]
    Success = 0x00,
    /// Frame CRC check failed.
    Crc = 0x01,
    /// Unexpected sequence number.
    Seq = 0x02,
    /// Unexpected byte offset.
    Offset = 0x03,
    /// Flash write failed.
    FlashWrite = 0x04,
    /// Flash erase (begin) failed.
    FlashErase = 0x05,
    /// No usable update partition.
    Partition = 0x06,
    /// Image header or final validation rejected the image.
    ImageInvalid = 0x07,
    /// Version check failed.
    Version = 0x08,
    /// Image does not fit the update partition.
    NoMemory = 0x09,
    /// Transfer timed out.
    Timeout = 0x0A,
    /// Device busy.
    Busy = 0x0B,
    /// Command not valid in the current state.
    InvalidState = 0x0C,
    /// Frame or payload malformed.
    FrameInvalid = 0x0D,
    /// Rollback not possible.
    RollbackFailed = 0x0E,
    /// Unspecified failure.
    Unknown = 0xFF,
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Success,
            0x01 => Self::Crc,
            0x02 => Self::Seq,
            0x03 => Self::Offset,
            0x04 => Self::FlashWrite,
            0x05 => Self::FlashErase,
            0x06 => Self::Partition,
            0x07 => Self::ImageInvalid,
            0x08 => Self::Version,
            0x09 => Self::NoMemory,
            0x0A => Self::Timeout,
            0x0B => Self::Busy,
            0x0C => Self::InvalidState,
            0x0D => Self::FrameInvalid,
            0x0E => Self::RollbackFailed,
            _ => Self::Unknown,
        }
    }
}

impl ErrorCode {
    /// Returns the wire byte for this code.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Codes that describe a protocol mistake rather than a resource failure.
    pub fn is_protocol_error(self) -> bool {
        matches!(
            self,
            Self::InvalidState | Self::Seq | Self::Offset | Self::FrameInvalid
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::Crc => "CRC",
            Self::Seq => "SEQ",
            Self::Offset => "OFFSET",
            Self::FlashWrite => "FLASH_WRITE",
            Self::FlashErase => "FLASH_ERASE",
            Self::Partition => "PARTITION",
            Self::ImageInvalid => "IMAGE_INVALID",
            Self::Version => "VERSION",
            Self::NoMemory => "NO_MEMORY",
            Self::Timeout => "TIMEOUT",
            Self::Busy => "BUSY",
            Self::InvalidState => "INVALID_STATE",
            Self::FrameInvalid => "FRAME_INVALID",
            Self::RollbackFailed => "ROLLBACK_FAILED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Observable transfer state.
///
/// `WaitingStart`, `Applying` and `Rollback` are defined on the wire but the
/// receiver never rests in them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum State {
    /// No transfer in progress.
    #[default]
    Idle = 0,
    /// Waiting for START.
    WaitingStart = 1,
    /// Accepting DATA frames.
    Receiving = 2,
    /// Image is being finalized.
    Verifying = 3,
    /// Boot partition is being switched.
    Applying = 4,
    /// Update finished, restart pending.
    Completed = 5,
    /// Last command failed.
    Error = 6,
    /// Rollback in progress.
    Rollback = 7,
}

impl State {
    /// Maps a wire byte to a state.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Idle,
            1 => Self::WaitingStart,
            2 => Self::Receiving,
            3 => Self::Verifying,
            4 => Self::Applying,
            5 => Self::Completed,
            6 => Self::Error,
            7 => Self::Rollback,
            _ => return None,
        })
    }

    /// Like [`State::from_u8`], reporting unknown values as protocol errors.
    pub fn parse(value: u8) -> Result<Self> {
        Self::from_u8(value).ok_or_else(|| Error::Protocol(format!("unknown state value {value}")))
    }

    /// Returns the wire byte for this state.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether a transfer holds (or has just consumed) a flash handle.
    pub fn is_transfer_active(self) -> bool {
        matches!(self, Self::Receiving | Self::Verifying)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::WaitingStart => "WAITING_START",
            Self::Receiving => "RECEIVING",
            Self::Verifying => "VERIFYING",
            Self::Applying => "APPLYING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::Rollback => "ROLLBACK",
        };
        f.write_str(name)
    }
}
