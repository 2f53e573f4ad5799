//! First-boot confirmation of a freshly installed image.

use {
    super::{ImageState, PartitionManager},
    crate::error::Result,
    log::{info, warn},
};

/// Outcome of [`confirm_boot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootVerdict {
    /// Self-test passed, image marked valid.
    Confirmed,
    /// Self-test failed, the previous image was restored.
    RolledBack,
    /// Running image was not waiting for verification.
    AlreadyConfirmed,
}

/// Run `self_test` if the running image is pending verification.
///
/// On hardware a failed self-test never returns because the backend reboots.
pub fn confirm_boot<B, F>(backend: &mut B, self_test: F) -> Result<BootVerdict>
where
    B: PartitionManager + ?Sized,
    F: FnOnce() -> bool,
{
    if backend.running_image_state() != ImageState::PendingVerify {
        return Ok(BootVerdict::AlreadyConfirmed);
    }

    info!("First boot of new image, running diagnostics");
    if self_test() {
        backend.mark_running_valid()?;
        info!("Diagnostics passed, rollback cancelled");
        Ok(BootVerdict::Confirmed)
    } else {
        warn!("Diagnostics failed, rolling back");
        backend.mark_invalid_and_rollback()?;
        Ok(BootVerdict::RolledBack)
    }
}
