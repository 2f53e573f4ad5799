//! In-memory partition backend.
//!
//! Models a factory slot plus a ring of OTA slots, with the same lifecycle a
//! real dual-bank device follows: write into the spare slot, validate, switch
//! boot, restart into `PendingVerify`, then confirm or roll back. Failures can
//! be injected to exercise every error path of the receiver.

use {
    super::{FlashError, ImageState, Partition, PartitionManager, UpdateHandle},
    crate::image::{APP_DESC_MAGIC, AppDescription, IMAGE_MAGIC, MIN_HEADER_BLOCK},
    log::{debug, info, warn},
    std::collections::BTreeMap,
};

/// Default capacity of each slot.
pub const DEFAULT_SLOT_SIZE: u32 = 1024 * 1024;

const FLASH_BASE: u32 = 0x0001_0000;

/// Failures to inject into the next operations.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// `begin` fails with an erase error.
    pub fail_begin: bool,
    /// `write` fails for the block covering this image offset.
    pub fail_write_at: Option<u32>,
    /// `end` rejects the image.
    pub fail_validation: bool,
    /// `set_boot_partition` fails.
    pub fail_set_boot: bool,
}

#[derive(Debug)]
struct Slot {
    partition: Partition,
    image: Vec<u8>,
    state: ImageState,
}

#[derive(Debug)]
struct OpenUpdate {
    slot: usize,
    staged: Vec<u8>,
}

/// RAM-backed [`PartitionManager`].
#[derive(Debug)]
pub struct MemoryPartitions {
    slots: Vec<Slot>,
    running: usize,
    boot: usize,
    previous: Option<usize>,
    last_invalid: Option<usize>,
    open: BTreeMap<u32, OpenUpdate>,
    next_handle: u32,
    restarts: u32,
    faults: Faults,
}

impl Default for MemoryPartitions {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_SIZE)
    }
}

impl MemoryPartitions {
    /// Factory slot plus two OTA slots of `slot_size` bytes each.
    pub fn new(slot_size: u32) -> Self {
        Self::with_layout(2, slot_size)
    }

    /// Factory slot plus `ota_slots` OTA slots.
    pub fn with_layout(ota_slots: usize, slot_size: u32) -> Self {
        let mut slots = Vec::with_capacity(ota_slots + 1);
        for index in 0..=ota_slots {
            let label = if index == 0 {
                "factory".to_string()
            } else {
                format!("ota_{}", index - 1)
            };
            let address = u32::try_from(index)
                .unwrap_or(u32::MAX)
                .saturating_mul(slot_size)
                .saturating_add(FLASH_BASE);
            slots.push(Slot {
                partition: Partition {
                    label,
                    address,
                    size: slot_size,
                },
                image: Vec::new(),
                state: ImageState::Undefined,
            });
        }

        Self {
            slots,
            running: 0,
            boot: 0,
            previous: None,
            last_invalid: None,
            open: BTreeMap::new(),
            next_handle: 1,
            restarts: 0,
            faults: Faults::default(),
        }
    }

    /// Store `image` in the slot called `label` and mark it valid.
    ///
    /// Returns `false` if no such slot exists.
    pub fn install(&mut self, label: &str, image: Vec<u8>) -> bool {
        match self.slot_index(label) {
            Some(index) => {
                self.slots[index].image = image;
                self.slots[index].state = ImageState::Valid;
                true
            },
            None => false,
        }
    }

    /// Slot called `label`.
    pub fn partition(&self, label: &str) -> Option<Partition> {
        self.slot_index(label)
            .map(|i| {
                self.slots[i]
                    .partition
                    .clone()
            })
    }

    /// Image stored in the slot called `label`.
    pub fn image(&self, label: &str) -> Option<&[u8]> {
        self.slot_index(label)
            .map(|i| {
                self.slots[i]
                    .image
                    .as_slice()
            })
    }

    /// Image of the running slot.
    pub fn running_image(&self) -> &[u8] {
        &self.slots[self.running].image
    }

    /// Lifecycle state of the slot called `label`.
    pub fn image_state(&self, label: &str) -> Option<ImageState> {
        self.slot_index(label)
            .map(|i| self.slots[i].state)
    }

    /// Number of update operations not yet ended or aborted.
    pub fn open_handles(&self) -> usize {
        self.open
            .len()
    }

    /// Number of simulated restarts.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Faults to inject.
    pub fn faults_mut(&mut self) -> &mut Faults {
        &mut self.faults
    }

    fn slot_index(&self, label: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.partition.label == label)
    }

    fn validate(image: &[u8]) -> Result<(), FlashError> {
        if image.len() < MIN_HEADER_BLOCK {
            return Err(FlashError::Validation(format!(
                "image too short: {} bytes",
                image.len()
            )));
        }
        if image[0] != IMAGE_MAGIC {
            return Err(FlashError::Validation(format!(
                "bad image magic 0x{:02X}",
                image[0]
            )));
        }
        let desc =
            AppDescription::parse(image).map_err(|e| FlashError::Validation(e.to_string()))?;
        if desc.magic != APP_DESC_MAGIC {
            return Err(FlashError::Validation(format!(
                "bad descriptor magic 0x{:08X}",
                desc.magic
            )));
        }
        Ok(())
    }

    fn rollback_target(&self) -> Option<usize> {
        let usable = |i: usize| {
            i != self.running
                && !self.slots[i]
                    .image
                    .is_empty()
                && !matches!(
                    self.slots[i].state,
                    ImageState::Invalid | ImageState::Aborted
                )
        };
        self.previous
            .filter(|&i| usable(i))
            .or_else(|| (0..self.slots.len()).find(|&i| usable(i)))
    }
}

impl PartitionManager for MemoryPartitions {
    fn next_update_partition(&self) -> Option<Partition> {
        let ota: Vec<usize> = (1..self.slots.len()).collect();
        if ota.is_empty() {
            return None;
        }
        // OTA slots in round-robin order after the running one
        let first = ota
            .iter()
            .position(|&i| i == self.running)
            .map_or(0, |pos| pos + 1);
        let candidates: Vec<usize> = (0..ota.len())
            .map(|k| ota[(first + k) % ota.len()])
            .filter(|&i| i != self.running)
            .collect();
        // Keep the last invalid image around while another slot is free
        let next = candidates
            .iter()
            .copied()
            .find(|&i| Some(i) != self.last_invalid)
            .or_else(|| {
                candidates
                    .first()
                    .copied()
            })?;
        Some(
            self.slots[next]
                .partition
                .clone(),
        )
    }

    fn begin(
        &mut self,
        partition: &Partition,
        image_size: u32,
    ) -> Result<UpdateHandle, FlashError> {
        if self.faults.fail_begin {
            return Err(FlashError::Erase("injected erase failure".into()));
        }
        let slot = self
            .slot_index(&partition.label)
            .ok_or(FlashError::NoPartition)?;
        if slot == self.running {
            return Err(FlashError::Erase(format!(
                "{} is the running partition",
                partition.label
            )));
        }
        let capacity = self.slots[slot]
            .partition
            .size;
        if image_size > capacity {
            return Err(FlashError::ImageTooLarge {
                size: image_size,
                capacity,
            });
        }

        self.slots[slot]
            .image
            .clear();
        self.slots[slot].state = ImageState::Undefined;

        let id = self.next_handle;
        self.next_handle = self
            .next_handle
            .wrapping_add(1);
        self.open.insert(
            id,
            OpenUpdate {
                slot,
                staged: Vec::with_capacity(image_size as usize),
            },
        );
        debug!("Opened update {id} on {}", self.slots[slot].partition);
        Ok(UpdateHandle::new(
            id,
            self.slots[slot]
                .partition
                .clone(),
        ))
    }

    fn write(&mut self, handle: &UpdateHandle, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let fail_at = self.faults.fail_write_at;
        let open = self
            .open
            .get_mut(&handle.id())
            .ok_or(FlashError::InvalidHandle(handle.id()))?;

        let written = open.staged.len() as u64;
        if u64::from(offset) != written {
            return Err(FlashError::Write {
                offset,
                reason: format!("non-contiguous write, {written} bytes already written"),
            });
        }
        let end = u64::from(offset) + data.len() as u64;
        if let Some(at) = fail_at {
            if u64::from(at) >= u64::from(offset) && u64::from(at) < end {
                return Err(FlashError::Write {
                    offset,
                    reason: "injected write failure".into(),
                });
            }
        }
        let capacity = self.slots[open.slot]
            .partition
            .size;
        if end > u64::from(capacity) {
            return Err(FlashError::Write {
                offset,
                reason: "write past end of partition".into(),
            });
        }

        open.staged
            .extend_from_slice(data);
        Ok(())
    }

    fn end(&mut self, handle: UpdateHandle) -> Result<Partition, FlashError> {
        let open = self
            .open
            .remove(&handle.id())
            .ok_or(FlashError::InvalidHandle(handle.id()))?;
        let slot = &mut self.slots[open.slot];

        let verdict = if self.faults.fail_validation {
            Err(FlashError::Validation("injected validation failure".into()))
        } else {
            Self::validate(&open.staged)
        };
        if let Err(e) = verdict {
            warn!("Image in {} rejected: {e}", slot.partition.label);
            slot.state = ImageState::Invalid;
            return Err(e);
        }

        slot.image = open.staged;
        slot.state = ImageState::Undefined;
        info!(
            "Image of {} bytes committed to {}",
            slot.image.len(),
            slot.partition.label
        );
        Ok(slot
            .partition
            .clone())
    }

    fn abort(&mut self, handle: UpdateHandle) {
        if let Some(open) = self
            .open
            .remove(&handle.id())
        {
            let slot = &mut self.slots[open.slot];
            slot.image
                .clear();
            slot.state = ImageState::Aborted;
            debug!("Aborted update {} on {}", handle.id(), slot.partition.label);
        }
    }

    fn set_boot_partition(&mut self, partition: &Partition) -> Result<(), FlashError> {
        if self.faults.fail_set_boot {
            return Err(FlashError::BootSelect("injected failure".into()));
        }
        let slot = self
            .slot_index(&partition.label)
            .ok_or_else(|| FlashError::BootSelect(format!("unknown partition {}", partition.label)))?;
        if self.slots[slot]
            .image
            .is_empty()
        {
            return Err(FlashError::BootSelect(format!(
                "{} holds no image",
                partition.label
            )));
        }
        if slot != self.running {
            self.slots[slot].state = ImageState::New;
        }
        self.boot = slot;
        info!("Boot partition set to {}", self.slots[slot].partition);
        Ok(())
    }

    fn running_partition(&self) -> Option<Partition> {
        Some(
            self.slots[self.running]
                .partition
                .clone(),
        )
    }

    fn boot_partition(&self) -> Option<Partition> {
        Some(
            self.slots[self.boot]
                .partition
                .clone(),
        )
    }

    fn last_invalid_partition(&self) -> Option<Partition> {
        self.last_invalid
            .map(|i| {
                self.slots[i]
                    .partition
                    .clone()
            })
    }

    fn partition_description(&self, partition: &Partition) -> Option<AppDescription> {
        let slot = self.slot_index(&partition.label)?;
        AppDescription::parse(&self.slots[slot].image).ok()
    }

    fn running_image_state(&self) -> ImageState {
        self.slots[self.running].state
    }

    fn mark_running_valid(&mut self) -> Result<(), FlashError> {
        self.slots[self.running].state = ImageState::Valid;
        info!("{} marked valid", self.slots[self.running].partition.label);
        Ok(())
    }

    fn mark_invalid_and_rollback(&mut self) -> Result<(), FlashError> {
        let Some(target) = self.rollback_target() else {
            return Err(FlashError::RollbackUnavailable(
                "no other valid image".into(),
            ));
        };
        warn!(
            "{} marked invalid, rolling back to {}",
            self.slots[self.running].partition.label, self.slots[target].partition.label
        );
        self.slots[self.running].state = ImageState::Invalid;
        self.last_invalid = Some(self.running);
        self.boot = target;
        self.restart();
        Ok(())
    }

    fn restart(&mut self) {
        if self.boot != self.running {
            self.previous = Some(self.running);
        }
        self.running = self.boot;
        if self.slots[self.running].state == ImageState::New {
            self.slots[self.running].state = ImageState::PendingVerify;
        }
        self.restarts += 1;
        info!(
            "Restarted into {} (restart #{})",
            self.slots[self.running].partition.label, self.restarts
        );
    }
}
