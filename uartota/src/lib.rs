//! # uartota
//!
//! Firmware updates over a UART link.
//!
//! This crate implements both ends of a small framed protocol for pushing an
//! application image to a device with dual-bank (A/B) flash:
//!
//! - Frame codec with CRC16 integrity and typed command payloads
//! - Stream framer that recovers frames from noisy, chunked byte streams
//! - Device-side transfer state machine driven by a single poll loop
//! - Host-side sender with retransmission and sequence resynchronisation
//! - Partition backend trait, plus an in-memory backend for tests and emulation
//!
//! ## Features
//!
//! - `native` (default): serial port support via the `serialport` crate
//! - `serde`: serialization support for status and image descriptors
//!
//! ## Example
//!
//! ```rust,no_run
//! use uartota::{FirmwareInfo, OtaSender};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = std::fs::read("app.bin")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let port = uartota::NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!         let mut sender = OtaSender::new(port);
//!         sender.send_firmware(&image, &FirmwareInfo::new("1.2.0", "gateway"), |sent, total| {
//!             println!("{sent}/{total}");
//!         })?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod driver;
pub mod error;
pub mod flash;
pub mod image;
pub mod port;
pub mod protocol;
pub mod receiver;
pub mod sender;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    driver::{DriverConfig, PollOutcome, SessionDriver},
    error::{Error, Result},
    flash::{
        FlashError, ImageState, Partition, PartitionManager, UpdateHandle,
        diagnostics::{BootVerdict, confirm_boot},
        memory::MemoryPartitions,
    },
    image::{AppDescription, AppImageBuilder, ImageInfo},
    port::{Port, PortEnumerator, PortInfo, SerialConfig, Transport},
    protocol::{Command, ErrorCode, Frame, FrameError, State, StreamFramer},
    receiver::{DeviceAction, OtaReceiver, ReceiverConfig, Response, TransferObserver},
    sender::{FirmwareInfo, OtaSender, SenderConfig, StatusReport},
};
