//! Wire protocol: frames, payloads, checksums and stream framing.

pub mod command;
pub mod crc;
pub mod frame;
pub mod framer;
pub mod payload;

pub use {
    command::{Command, ErrorCode, State},
    frame::{Frame, FrameError},
    framer::StreamFramer,
    payload::{AckPayload, ProgressPayload, StartPayload, StatusPayload},
};
