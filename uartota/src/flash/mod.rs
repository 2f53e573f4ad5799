//! Partition backend abstraction.
//!
//! The protocol engine never touches flash directly. It drives a
//! [`PartitionManager`], which owns partition selection, erase/write, final
//! image validation and boot-slot bookkeeping. On hardware the implementation
//! wraps the vendor OTA API. [`memory::MemoryPartitions`] keeps everything in
//! RAM for tests and emulation.
//!
//! ```text
//!   next_update_partition ─► begin ─► write* ─► end ─► set_boot_partition
//!                              │
//!                              └──────► abort
//! ```

pub mod diagnostics;
pub mod memory;

use {
    crate::{image::AppDescription, protocol::ErrorCode},
    std::fmt,
    thiserror::Error,
};

/// A flash region that can hold one application image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Partition label (e.g. "ota_0").
    pub label: String,
    /// Start address in flash.
    pub address: u32,
    /// Capacity in bytes.
    pub size: u32,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ 0x{:08X} ({} bytes)",
            self.label, self.address, self.size
        )
    }
}

/// Token for an open update operation.
///
/// Returned by [`PartitionManager::begin`] and consumed by
/// [`PartitionManager::end`] or [`PartitionManager::abort`]. It is neither
/// `Clone` nor `Copy`, so every handle is released exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct UpdateHandle {
    id: u32,
    partition: Partition,
}

impl UpdateHandle {
    /// Create a handle. Intended for backend implementations.
    pub fn new(id: u32, partition: Partition) -> Self {
        Self { id, partition }
    }

    /// Backend-assigned identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Partition this operation writes to.
    pub fn partition(&self) -> &Partition {
        &self.partition
    }
}

/// Lifecycle state of the image in a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageState {
    /// Written and selected for boot, not yet started.
    New,
    /// Booted once, waiting for the self-test verdict.
    PendingVerify,
    /// Confirmed good.
    Valid,
    /// Failed self-test or explicitly invalidated.
    Invalid,
    /// Update was aborted before completion.
    Aborted,
    /// No tracking information.
    #[default]
    Undefined,
}

/// Errors reported by a partition backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashError {
    /// No spare partition is available for the update.
    #[error("no update partition available")]
    NoPartition,

    /// Image larger than the target partition.
    #[error("image of {size} bytes does not fit partition of {capacity} bytes")]
    ImageTooLarge {
        /// Announced image size.
        size: u32,
        /// Partition capacity.
        capacity: u32,
    },

    /// Preparing (erasing) the partition failed.
    #[error("erase failed: {0}")]
    Erase(String),

    /// Writing a block failed.
    #[error("write failed at offset {offset}: {reason}")]
    Write {
        /// Image offset of the failed block.
        offset: u32,
        /// Backend detail.
        reason: String,
    },

    /// Final image validation rejected the written data.
    #[error("image validation failed: {0}")]
    Validation(String),

    /// Handle does not belong to an open operation.
    #[error("invalid update handle {0}")]
    InvalidHandle(u32),

    /// Boot partition could not be changed.
    #[error("cannot select boot partition: {0}")]
    BootSelect(String),

    /// No previous image to roll back to.
    #[error("rollback unavailable: {0}")]
    RollbackUnavailable(String),
}

impl FlashError {
    /// Wire error code describing this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NoPartition | Self::BootSelect(_) => ErrorCode::Partition,
            Self::ImageTooLarge { .. } => ErrorCode::NoMemory,
            Self::Erase(_) => ErrorCode::FlashErase,
            Self::Write { .. } => ErrorCode::FlashWrite,
            Self::Validation(_) => ErrorCode::ImageInvalid,
            Self::InvalidHandle(_) => ErrorCode::Unknown,
            Self::RollbackUnavailable(_) => ErrorCode::RollbackFailed,
        }
    }
}

/// Backend the transfer state machine drives.
///
/// Query methods take `&self` and may be called at any time. Mutating methods
/// are only called by the single task that owns the transfer session.
pub trait PartitionManager {
    /// Partition the next update should be written to, if any.
    fn next_update_partition(&self) -> Option<Partition>;

    /// Prepare `partition` for an image of `image_size` bytes.
    fn begin(&mut self, partition: &Partition, image_size: u32)
    -> Result<UpdateHandle, FlashError>;

    /// Write `data` at image `offset`. Offsets arrive strictly contiguous.
    fn write(&mut self, handle: &UpdateHandle, offset: u32, data: &[u8])
    -> Result<(), FlashError>;

    /// Finish the operation and validate the written image.
    ///
    /// The handle is released whether or not validation passes.
    fn end(&mut self, handle: UpdateHandle) -> Result<Partition, FlashError>;

    /// Cancel the operation and release the handle.
    fn abort(&mut self, handle: UpdateHandle);

    /// Boot from `partition` on the next restart.
    fn set_boot_partition(&mut self, partition: &Partition) -> Result<(), FlashError>;

    /// Partition the current application runs from.
    fn running_partition(&self) -> Option<Partition>;

    /// Partition selected for the next boot.
    fn boot_partition(&self) -> Option<Partition>;

    /// Partition whose image was most recently marked invalid.
    fn last_invalid_partition(&self) -> Option<Partition>;

    /// Descriptor of the image stored in `partition`.
    fn partition_description(&self, partition: &Partition) -> Option<AppDescription>;

    /// Lifecycle state of the running image.
    fn running_image_state(&self) -> ImageState;

    /// Confirm the running image so it is not rolled back.
    fn mark_running_valid(&mut self) -> Result<(), FlashError>;

    /// Invalidate the running image and reboot into the previous one.
    ///
    /// Does not return on hardware.
    fn mark_invalid_and_rollback(&mut self) -> Result<(), FlashError>;

    /// Reboot the device. Does not return on hardware.
    fn restart(&mut self);

    /// Version string of the running application.
    fn running_version(&self) -> Option<String> {
        self.running_partition()
            .and_then(|p| self.partition_description(&p))
            .map(|d| d.version)
    }
}
