//! Device-side transfer state machine.
//!
//! [`OtaReceiver`] turns decoded host commands into reply frames and flash
//! operations. It owns the [`TransferSession`] and the partition backend, and
//! is driven by exactly one caller (usually [`SessionDriver`]), so commands are
//! processed strictly one after another.
//!
//! ```text
//!            START ok               END ok
//!   IDLE ──────────────► RECEIVING ───────► VERIFYING ───► COMPLETED
//!    ▲  ▲                  │  ▲ DATA            │
//!    │  └── ABORT / flash  │  └──┘              │ end() rejects
//!    │      failure ◄──────┘                    ▼
//!    │                                     (stays VERIFYING)
//!    └── ERROR ◄── protocol NACK while idle
//! ```
//!
//! [`SessionDriver`]: crate::driver::SessionDriver

use {
    crate::{
        flash::{PartitionManager, UpdateHandle},
        image::AppDescription,
        protocol::{
            AckPayload, Command, ErrorCode, Frame, ProgressPayload, StartPayload, State,
            StatusPayload, crc::ImageDigest,
        },
    },
    log::{debug, error, info, warn},
    std::{fmt, time::Duration},
};

/// Receiver tunables.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Delay between COMPLETE and the restart.
    pub restart_delay: Duration,
    /// Delay between the rollback ACK and the rollback.
    pub rollback_delay: Duration,
    /// Compare the announced CRC32 with the received bytes before `end()`.
    pub verify_image_crc: bool,
    /// Minimum percentage increase between two PROGRESS frames.
    pub progress_step: u8,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(2),
            rollback_delay: Duration::from_millis(500),
            verify_image_crc: true,
            progress_step: 10,
        }
    }
}

/// Transfer notifications, delivered synchronously on the receiver's thread.
pub trait TransferObserver {
    /// A DATA block was accepted.
    fn on_progress(&mut self, _received: u32, _total: u32, _percent: u8) {}

    /// A transfer finished, successfully or not.
    fn on_complete(&mut self, _success: bool, _code: ErrorCode) {}

    /// The observable state changed.
    fn on_state_change(&mut self, _old: State, _new: State) {}
}

struct NoopObserver;

impl TransferObserver for NoopObserver {}

/// What the device must do after the replies are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    /// Reboot into the new image.
    Restart {
        /// Grace delay before rebooting.
        after: Duration,
    },
    /// Invalidate the running image and reboot into the previous one.
    Rollback {
        /// Grace delay before rolling back.
        after: Duration,
    },
}

/// Outcome of one command.
#[derive(Debug, Default)]
pub struct Response {
    /// Frames to send, in order.
    pub frames: Vec<Frame>,
    /// Action to perform once the frames are out.
    pub action: Option<DeviceAction>,
}

impl Response {
    fn reply(frame: Frame) -> Self {
        Self {
            frames: vec![frame],
            action: None,
        }
    }
}

/// State of the transfer in progress.
#[derive(Debug, Default)]
pub struct TransferSession {
    state: State,
    last_error: ErrorCode,
    total_bytes: u32,
    received_bytes: u32,
    expected_sequence: u16,
    firmware_crc32: u32,
    digest: ImageDigest,
    last_percent: u8,
    version: String,
    project_name: String,
    handle: Option<UpdateHandle>,
}

impl TransferSession {
    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Error code of the last NACK.
    pub fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    /// Announced image size.
    pub fn total_bytes(&self) -> u32 {
        self.total_bytes
    }

    /// Bytes accepted so far.
    pub fn received_bytes(&self) -> u32 {
        self.received_bytes
    }

    /// Sequence number the next DATA frame must carry.
    pub fn expected_sequence(&self) -> u16 {
        self.expected_sequence
    }

    /// Version announced in START.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Project announced in START.
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// Whether a flash update operation is open.
    pub fn has_open_handle(&self) -> bool {
        self.handle
            .is_some()
    }

    fn reset_counters(&mut self) {
        self.total_bytes = 0;
        self.received_bytes = 0;
        self.expected_sequence = 0;
        self.firmware_crc32 = 0;
        self.digest = ImageDigest::new();
        self.last_percent = 0;
    }

    fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let percent = u64::from(self.received_bytes) * 100 / u64::from(self.total_bytes);
        u8::try_from(percent).unwrap_or(100)
    }
}

/// Device-side protocol engine.
pub struct OtaReceiver<B: PartitionManager> {
    backend: B,
    config: ReceiverConfig,
    session: TransferSession,
    observer: Box<dyn TransferObserver + Send>,
}

impl<B: PartitionManager + fmt::Debug> fmt::Debug for OtaReceiver<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtaReceiver")
            .field("backend", &self.backend)
            .field("config", &self.config)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl<B: PartitionManager> OtaReceiver<B> {
    /// Create a receiver with default settings.
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, ReceiverConfig::default())
    }

    /// Create a receiver with custom settings.
    pub fn with_config(backend: B, config: ReceiverConfig) -> Self {
        Self {
            backend,
            config,
            session: TransferSession::default(),
            observer: Box::new(NoopObserver),
        }
    }

    /// Attach an observer.
    #[must_use]
    pub fn with_observer(mut self, observer: impl TransferObserver + Send + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    /// Current transfer session.
    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.session.state
    }

    /// Receiver settings.
    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Partition backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Partition backend, mutably.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Consume the receiver and return the backend.
    ///
    /// An open update operation is aborted first.
    pub fn into_backend(mut self) -> B {
        if let Some(handle) = self
            .session
            .handle
            .take()
        {
            self.backend.abort(handle);
        }
        self.backend
    }

    /// Snapshot reported by QUERY_STATUS.
    pub fn status(&self) -> StatusPayload {
        StatusPayload {
            state: self.session.state,
            last_error: self.session.last_error,
            received_bytes: self.session.received_bytes,
            total_bytes: self.session.total_bytes,
            current_version: self
                .backend
                .running_version()
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    /// Process one decoded frame.
    pub fn handle_frame(&mut self, frame: &Frame) -> Response {
        debug!(
            "Handling {} seq={} offset={} len={} in {}",
            frame.command,
            frame.sequence,
            frame.offset,
            frame.payload.len(),
            self.session.state
        );
        match frame.command {
            Command::Start => self.handle_start(frame),
            Command::Data => self.handle_data(frame),
            Command::End => self.handle_end(frame),
            Command::Abort => self.handle_abort(frame),
            Command::QueryStatus => self.handle_query_status(frame),
            Command::RollbackReq => self.handle_rollback(frame),
            other => {
                warn!("Unexpected command {other}");
                self.nack(frame.sequence, ErrorCode::FrameInvalid)
            },
        }
    }

    /// Abandon an in-flight transfer after host inactivity.
    ///
    /// Returns `true` if a transfer was cancelled.
    pub fn expire(&mut self) -> bool {
        if !self
            .session
            .state
            .is_transfer_active()
        {
            return false;
        }
        warn!(
            "Transfer timed out at {}/{} bytes",
            self.session.received_bytes, self.session.total_bytes
        );
        self.release_handle();
        self.session.last_error = ErrorCode::Timeout;
        self.set_state(State::Error);
        self.observer
            .on_complete(false, ErrorCode::Timeout);
        true
    }

    fn handle_start(&mut self, frame: &Frame) -> Response {
        if !matches!(self.session.state, State::Idle | State::Error) {
            warn!("START rejected in {}", self.session.state);
            return self.nack(frame.sequence, ErrorCode::InvalidState);
        }

        let start = match StartPayload::decode(&frame.payload) {
            Ok(start) if start.firmware_size > 0 => start,
            Ok(_) => {
                warn!("START announces an empty image");
                return self.nack(frame.sequence, ErrorCode::FrameInvalid);
            },
            Err(e) => {
                warn!("Malformed START: {e}");
                return self.nack(frame.sequence, ErrorCode::FrameInvalid);
            },
        };

        info!(
            "OTA start: {} v{} ({} bytes, crc32 0x{:08X}, block {})",
            start.project_name,
            start.version,
            start.firmware_size,
            start.firmware_crc32,
            start.block_size
        );

        // A leftover handle can only exist after an interrupted session
        self.release_handle();
        self.session
            .reset_counters();

        let Some(partition) = self
            .backend
            .next_update_partition()
        else {
            error!("No update partition available");
            return self.nack(frame.sequence, ErrorCode::Partition);
        };
        if start.firmware_size > partition.size {
            error!(
                "Image of {} bytes does not fit {}",
                start.firmware_size, partition
            );
            return self.nack(frame.sequence, ErrorCode::NoMemory);
        }

        let handle = match self
            .backend
            .begin(&partition, start.firmware_size)
        {
            Ok(handle) => handle,
            Err(e) => {
                error!("Cannot prepare {}: {e}", partition.label);
                return self.nack(frame.sequence, ErrorCode::FlashErase);
            },
        };

        info!("Writing to {partition}");
        self.session.handle = Some(handle);
        self.session.total_bytes = start.firmware_size;
        self.session.firmware_crc32 = start.firmware_crc32;
        self.session.version = start.version;
        self.session.project_name = start.project_name;
        self.session.last_error = ErrorCode::Success;
        self.set_state(State::Receiving);

        Response::reply(Frame::new(Command::Ready, frame.sequence))
    }

    fn handle_data(&mut self, frame: &Frame) -> Response {
        if self.session.state != State::Receiving {
            return self.nack(frame.sequence, ErrorCode::InvalidState);
        }
        if frame.sequence != self.session.expected_sequence {
            warn!(
                "Sequence mismatch: expected {}, got {}",
                self.session.expected_sequence, frame.sequence
            );
            return self.nack(frame.sequence, ErrorCode::Seq);
        }
        if frame.offset != self.session.received_bytes {
            warn!(
                "Offset mismatch: expected {}, got {}",
                self.session.received_bytes, frame.offset
            );
            return self.nack(frame.sequence, ErrorCode::Offset);
        }
        if frame.payload.is_empty() {
            return self.nack(frame.sequence, ErrorCode::FrameInvalid);
        }
        // Bounded by MAX_PAYLOAD_SIZE when the frame was decoded
        #[allow(clippy::cast_possible_truncation)]
        let len = frame.payload.len() as u32;
        if u64::from(self.session.received_bytes) + u64::from(len)
            > u64::from(self.session.total_bytes)
        {
            warn!(
                "Block of {len} bytes at {} overruns image of {} bytes",
                frame.offset, self.session.total_bytes
            );
            return self.nack(frame.sequence, ErrorCode::Offset);
        }

        if self.session.received_bytes == 0 {
            if let Err(code) = self.check_image_header(&frame.payload) {
                return self.nack_and_abort(frame.sequence, code);
            }
        }

        let write = match self
            .session
            .handle
            .as_ref()
        {
            Some(handle) => self
                .backend
                .write(handle, frame.offset, &frame.payload),
            None => {
                error!("DATA accepted without an open update");
                return self.nack_and_abort(frame.sequence, ErrorCode::Unknown);
            },
        };
        if let Err(e) = write {
            error!("Flash write failed: {e}");
            return self.nack_and_abort(frame.sequence, ErrorCode::FlashWrite);
        }

        self.session.received_bytes += len;
        self.session
            .digest
            .update(&frame.payload);
        self.session.expected_sequence = self
            .session
            .expected_sequence
            .wrapping_add(1);

        let received = self.session.received_bytes;
        let total = self.session.total_bytes;
        let percent = self.session.percent();
        debug!("Received {received}/{total} bytes ({percent}%)");
        self.observer
            .on_progress(received, total, percent);

        let mut response = Response::reply(self.ack(frame.sequence));
        let step = self.config.progress_step;
        if percent >= self.session.last_percent.saturating_add(step) || percent == 100 {
            self.session.last_percent = percent;
            response.frames.push(Frame::with_payload(
                Command::Progress,
                frame.sequence,
                ProgressPayload {
                    received_bytes: received,
                    total_bytes: total,
                    percentage: percent,
                }
                .encode(),
            ));
        }
        response
    }

    fn handle_end(&mut self, frame: &Frame) -> Response {
        if self.session.state != State::Receiving {
            return self.nack(frame.sequence, ErrorCode::InvalidState);
        }
        if self.session.received_bytes != self.session.total_bytes {
            warn!(
                "END after {}/{} bytes",
                self.session.received_bytes, self.session.total_bytes
            );
            return self.nack_and_abort(frame.sequence, ErrorCode::Offset);
        }

        self.set_state(State::Verifying);

        if self.config.verify_image_crc {
            let actual = self
                .session
                .digest
                .value();
            if actual != self.session.firmware_crc32 {
                error!(
                    "Image CRC32 mismatch: announced 0x{:08X}, received 0x{actual:08X}",
                    self.session.firmware_crc32
                );
                return self.nack_and_abort(frame.sequence, ErrorCode::ImageInvalid);
            }
        }

        let Some(handle) = self
            .session
            .handle
            .take()
        else {
            error!("END without an open update");
            return self.nack(frame.sequence, ErrorCode::Unknown);
        };

        let partition = match self
            .backend
            .end(handle)
        {
            Ok(partition) => partition,
            Err(e) => {
                error!("Image finalization failed: {e}");
                return self.nack(frame.sequence, ErrorCode::ImageInvalid);
            },
        };

        if let Err(e) = self
            .backend
            .set_boot_partition(&partition)
        {
            error!("Cannot boot from {}: {e}", partition.label);
            self.session
                .reset_counters();
            self.set_state(State::Idle);
            return self.nack(frame.sequence, ErrorCode::Partition);
        }

        info!(
            "OTA complete: {} v{} installed in {}",
            self.session.project_name, self.session.version, partition.label
        );
        self.set_state(State::Completed);
        self.observer
            .on_complete(true, ErrorCode::Success);

        Response {
            frames: vec![Frame::new(Command::Complete, frame.sequence)],
            action: Some(DeviceAction::Restart {
                after: self.config.restart_delay,
            }),
        }
    }

    fn handle_abort(&mut self, frame: &Frame) -> Response {
        let was_active = self
            .session
            .state
            .is_transfer_active();
        info!("OTA aborted in {}", self.session.state);
        self.release_handle();
        self.session
            .reset_counters();
        self.set_state(State::Idle);
        if was_active {
            self.observer
                .on_complete(false, ErrorCode::Unknown);
        }
        Response::reply(Frame::with_payload(
            Command::Ack,
            frame.sequence,
            AckPayload {
                error_code: ErrorCode::Success,
                expected_seq: 0,
                received_bytes: 0,
            }
            .encode(),
        ))
    }

    fn handle_query_status(&mut self, frame: &Frame) -> Response {
        Response::reply(Frame::with_payload(
            Command::StatusResp,
            frame.sequence,
            self.status()
                .encode(),
        ))
    }

    fn handle_rollback(&mut self, frame: &Frame) -> Response {
        let running = self
            .backend
            .running_partition();
        let boot = self
            .backend
            .boot_partition();
        match (running, boot) {
            (Some(running), Some(boot)) if running != boot => {
                info!("Rollback requested, leaving {}", running.label);
                Response {
                    frames: vec![self.ack(frame.sequence)],
                    action: Some(DeviceAction::Rollback {
                        after: self.config.rollback_delay,
                    }),
                }
            },
            _ => {
                warn!("Rollback requested but no alternative image is configured");
                self.nack(frame.sequence, ErrorCode::RollbackFailed)
            },
        }
    }

    /// Inspect the first block before anything is written.
    fn check_image_header(&self, block: &[u8]) -> Result<(), ErrorCode> {
        let desc = AppDescription::parse(block).map_err(|e| {
            warn!("First block rejected: {e}");
            ErrorCode::ImageInvalid
        })?;
        if !desc.has_valid_magic() {
            warn!(
                "Unexpected app descriptor magic 0x{:08X}, leaving it to final validation",
                desc.magic
            );
        }
        info!(
            "New image: {} v{} built {} {}",
            desc.project_name, desc.version, desc.date, desc.time
        );

        let invalid = self
            .backend
            .last_invalid_partition()
            .and_then(|p| {
                self.backend
                    .partition_description(&p)
            });
        if let Some(invalid) = invalid {
            if invalid.version == desc.version {
                warn!(
                    "Version {} previously failed to boot, refusing it",
                    desc.version
                );
                return Err(ErrorCode::ImageInvalid);
            }
        }
        Ok(())
    }

    fn ack(&self, sequence: u16) -> Frame {
        Frame::with_payload(
            Command::Ack,
            sequence,
            AckPayload {
                error_code: ErrorCode::Success,
                expected_seq: self.session.expected_sequence,
                received_bytes: self.session.received_bytes,
            }
            .encode(),
        )
    }

    fn nack(&mut self, sequence: u16, code: ErrorCode) -> Response {
        self.session.last_error = code;
        if code.is_protocol_error()
            && !self
                .session
                .state
                .is_transfer_active()
        {
            self.set_state(State::Error);
        }
        debug!("NACK {code} for seq {sequence}");
        Response::reply(Frame::with_payload(
            Command::Nack,
            sequence,
            AckPayload {
                error_code: code,
                expected_seq: self.session.expected_sequence,
                received_bytes: self.session.received_bytes,
            }
            .encode(),
        ))
    }

    /// NACK with the counters at the point of failure, then return to IDLE.
    fn nack_and_abort(&mut self, sequence: u16, code: ErrorCode) -> Response {
        let response = self.nack(sequence, code);
        self.abort_transfer();
        response
    }

    /// Cancel the transfer and return to IDLE.
    fn abort_transfer(&mut self) {
        self.release_handle();
        self.session
            .reset_counters();
        self.set_state(State::Idle);
    }

    fn release_handle(&mut self) {
        if let Some(handle) = self
            .session
            .handle
            .take()
        {
            self.backend
                .abort(handle);
        }
    }

    fn set_state(&mut self, new: State) {
        let old = self.session.state;
        if old != new {
            debug!("State {old} -> {new}");
            self.session.state = new;
            self.observer
                .on_state_change(old, new);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flash::{FlashError, ImageState, Partition, memory::MemoryPartitions},
        image::AppImageBuilder,
        protocol::{crc::crc32, frame::MAX_PAYLOAD_SIZE},
    };
    use std::sync::{Arc, Mutex};

    fn backend() -> MemoryPartitions {
        let mut backend = MemoryPartitions::new(64 * 1024);
        backend.install("factory", AppImageBuilder::new("1.0.0", "demo").build());
        backend
    }

    fn image(size: usize) -> Vec<u8> {
        AppImageBuilder::new("2.0.0", "demo")
            .size(size)
            .fill(7)
            .build()
    }

    fn start_frame(seq: u16, image: &[u8]) -> Frame {
        Frame::with_payload(
            Command::Start,
            seq,
            StartPayload {
                firmware_size: image.len() as u32,
                firmware_crc32: crc32(image),
                version: "2.0.0".into(),
                project_name: "demo".into(),
                block_size: MAX_PAYLOAD_SIZE as u32,
            }
            .encode(),
        )
    }

    fn ack_of(frame: &Frame) -> AckPayload {
        AckPayload::decode(&frame.payload).unwrap()
    }

    fn started(image: &[u8]) -> OtaReceiver<MemoryPartitions> {
        let mut rx = OtaReceiver::new(backend());
        let resp = rx.handle_frame(&start_frame(0, image));
        assert_eq!(resp.frames[0].command, Command::Ready);
        rx
    }

    fn send_all(rx: &mut OtaReceiver<MemoryPartitions>, image: &[u8]) {
        for (i, block) in image
            .chunks(MAX_PAYLOAD_SIZE)
            .enumerate()
        {
            let resp = rx.handle_frame(&Frame::data(
                i as u16,
                (i * MAX_PAYLOAD_SIZE) as u32,
                block,
            ));
            assert_eq!(resp.frames[0].command, Command::Ack, "block {i}");
        }
    }

    #[derive(Default)]
    struct Events {
        progress: Vec<u8>,
        complete: Vec<(bool, ErrorCode)>,
        states: Vec<(State, State)>,
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Events>>);

    impl TransferObserver for Recorder {
        fn on_progress(&mut self, _received: u32, _total: u32, percent: u8) {
            self.0
                .lock()
                .unwrap()
                .progress
                .push(percent);
        }

        fn on_complete(&mut self, success: bool, code: ErrorCode) {
            self.0
                .lock()
                .unwrap()
                .complete
                .push((success, code));
        }

        fn on_state_change(&mut self, old: State, new: State) {
            self.0
                .lock()
                .unwrap()
                .states
                .push((old, new));
        }
    }

    #[test]
    fn test_two_block_transfer_completes() {
        let image = image(2048);
        let mut rx = started(&image);

        let resp = rx.handle_frame(&Frame::data(0, 0, &image[..1024]));
        let ack = ack_of(&resp.frames[0]);
        assert_eq!(ack.error_code, ErrorCode::Success);
        assert_eq!(ack.expected_seq, 1);
        assert_eq!(ack.received_bytes, 1024);

        let resp = rx.handle_frame(&Frame::data(1, 1024, &image[1024..]));
        assert_eq!(resp.frames.len(), 2);
        let ack = ack_of(&resp.frames[0]);
        assert_eq!((ack.expected_seq, ack.received_bytes), (2, 2048));
        assert_eq!(resp.frames[1].command, Command::Progress);
        let progress = ProgressPayload::decode(&resp.frames[1].payload).unwrap();
        assert_eq!(progress.percentage, 100);

        let resp = rx.handle_frame(&Frame::new(Command::End, 2));
        assert_eq!(resp.frames[0].command, Command::Complete);
        assert_eq!(resp.frames[0].sequence, 2);
        assert_eq!(
            resp.action,
            Some(DeviceAction::Restart {
                after: Duration::from_secs(2)
            })
        );
        assert_eq!(rx.state(), State::Completed);
        assert_eq!(
            rx.backend()
                .image("ota_0"),
            Some(image.as_slice())
        );
        assert_eq!(
            rx.backend()
                .boot_partition()
                .unwrap()
                .label,
            "ota_0"
        );
    }

    #[test]
    fn test_wrong_sequence_keeps_counters() {
        let image = image(2048);
        let mut rx = started(&image);

        let resp = rx.handle_frame(&Frame::data(5, 0, &image[..1024]));
        assert_eq!(resp.frames[0].command, Command::Nack);
        let nack = ack_of(&resp.frames[0]);
        assert_eq!(nack.error_code, ErrorCode::Seq);
        assert_eq!(nack.expected_seq, 0);
        assert_eq!(nack.received_bytes, 0);
        assert_eq!(rx.state(), State::Receiving);
        assert_eq!(
            rx.session()
                .last_error(),
            ErrorCode::Seq
        );

        let resp = rx.handle_frame(&Frame::data(0, 0, &image[..1024]));
        assert_eq!(resp.frames[0].command, Command::Ack);
        assert_eq!(
            rx.session()
                .received_bytes(),
            1024
        );
    }

    #[test]
    fn test_wrong_offset_keeps_counters() {
        let image = image(2048);
        let mut rx = started(&image);
        send_all(&mut rx, &image[..1024]);

        let resp = rx.handle_frame(&Frame::data(1, 512, &image[1024..]));
        let nack = ack_of(&resp.frames[0]);
        assert_eq!(nack.error_code, ErrorCode::Offset);
        assert_eq!((nack.expected_seq, nack.received_bytes), (1, 1024));
        assert_eq!(rx.state(), State::Receiving);
        assert_eq!(
            rx.session()
                .expected_sequence(),
            1
        );
    }

    #[test]
    fn test_block_past_end_rejected() {
        let image = image(1500);
        let mut rx = started(&image);
        let mut oversized = image.clone();
        oversized.resize(2000, 0);

        let resp = rx.handle_frame(&Frame::data(0, 0, &oversized[..1024]));
        assert_eq!(resp.frames[0].command, Command::Ack);
        let resp = rx.handle_frame(&Frame::data(1, 1024, &oversized[1024..]));
        assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::Offset);
        assert_eq!(
            rx.session()
                .received_bytes(),
            1024
        );
    }

    #[test]
    fn test_empty_data_rejected() {
        let image = image(1024);
        let mut rx = started(&image);
        let resp = rx.handle_frame(&Frame::data(0, 0, &[]));
        assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::FrameInvalid);
        assert_eq!(rx.state(), State::Receiving);
    }

    #[test]
    fn test_start_while_receiving_rejected() {
        let image = image(2048);
        let mut rx = started(&image);
        send_all(&mut rx, &image[..1024]);

        let resp = rx.handle_frame(&start_frame(9, &image));
        assert_eq!(resp.frames[0].sequence, 9);
        assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::InvalidState);
        assert_eq!(rx.state(), State::Receiving);
        assert_eq!(
            rx.session()
                .received_bytes(),
            1024
        );
    }

    #[test]
    fn test_start_from_error_resets_counters() {
        let image = image(2048);
        let mut rx = OtaReceiver::new(backend());

        // DATA while idle is a protocol error that parks the receiver in ERROR
        let resp = rx.handle_frame(&Frame::data(0, 0, &image[..1024]));
        assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::InvalidState);
        assert_eq!(rx.state(), State::Error);

        let resp = rx.handle_frame(&start_frame(1, &image));
        assert_eq!(resp.frames[0].command, Command::Ready);
        assert_eq!(rx.state(), State::Receiving);
        assert_eq!(
            rx.session()
                .received_bytes(),
            0
        );
        assert_eq!(
            rx.session()
                .expected_sequence(),
            0
        );
        assert_eq!(
            rx.session()
                .total_bytes(),
            2048
        );
    }

    #[test]
    fn test_start_validation() {
        let mut rx = OtaReceiver::new(backend());

        let short = Frame::with_payload(Command::Start, 0, vec![0; 10]);
        let resp = rx.handle_frame(&short);
        assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::FrameInvalid);

        let empty = start_frame(0, &[]);
        let resp = rx.handle_frame(&empty);
        assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::FrameInvalid);
        assert_eq!(
            rx.backend()
                .open_handles(),
            0
        );
    }

    #[test]
    fn test_start_image_too_large() {
        let mut rx = OtaReceiver::new(MemoryPartitions::new(1024));
        let resp = rx.handle_frame(&start_frame(0, &image(2048)));
        assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::NoMemory);
        assert_eq!(rx.state(), State::Idle);
        assert_eq!(
            rx.session()
                .last_error(),
            ErrorCode::NoMemory
        );
    }

    #[test]
    fn test_start_without_partition() {
        let mut rx = OtaReceiver::new(MemoryPartitions::with_layout(0, 4096));
        let resp = rx.handle_frame(&start_frame(0, &image(1024)));
        assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::Partition);
        assert_eq!(rx.state(), State::Idle);
    }

    #[test]
    fn test_start_erase_failure() {
        let mut backend = backend();
        backend
            .faults_mut()
            .fail_begin = true;
        let mut rx = OtaReceiver::new(backend);
        let resp = rx.handle_frame(&start_frame(0, &image(1024)));
        assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::FlashErase);
        assert_eq!(rx.state(), State::Idle);
    }

    #[test]
    fn test_partial_end_aborts() {
        let image = image(2048);
        let mut rx = started(&image);
        send_all(&mut rx, &image[..1024]);

        let resp = rx.handle_frame(&Frame::new(Command::End, 1));
        let nack = ack_of(&resp.frames[0]);
        assert_eq!(resp.frames[0].command, Command::Nack);
        assert_eq!(nack.error_code, ErrorCode::Offset);
        assert_eq!(nack.expected_seq, 1);
        assert_eq!(nack.received_bytes, 1024);
        assert_eq!(rx.state(), State::Idle);
        assert_eq!(
            rx.session()
                .received_bytes(),
            0
        );
        assert!(
            !rx.session()
                .has_open_handle()
        );
        assert_eq!(
            rx.backend()
                .open_handles(),
            0
        );
    }

    #[test]
    fn test_write_failure_aborts() {
        let image = image(2048);
        let mut backend = backend();
        backend
            .faults_mut()
            .fail_write_at = Some(1500);
        let mut rx = OtaReceiver::new(backend);
        rx.handle_frame(&start_frame(0, &image));
        send_all(&mut rx, &image[..1024]);

        let resp = rx.handle_frame(&Frame::data(1, 1024, &image[1024..]));
        let nack = ack_of(&resp.frames[0]);
        assert_eq!(nack.error_code, ErrorCode::FlashWrite);
        assert_eq!(nack.expected_seq, 1);
        assert_eq!(nack.received_bytes, 1024);
        assert_eq!(rx.state(), State::Idle);
        assert_eq!(
            rx.backend()
                .open_handles(),
            0
        );
    }

    #[test]
    fn test_short_first_block_rejected() {
        let image = image(2048);
        let mut rx = started(&image);
        let resp = rx.handle_frame(&Frame::data(0, 0, &image[..100]));
        let nack = ack_of(&resp.frames[0]);
        assert_eq!(nack.error_code, ErrorCode::ImageInvalid);
        assert_eq!(nack.expected_seq, 0);
        assert_eq!(nack.received_bytes, 0);
        assert_eq!(rx.state(), State::Idle);
        assert_eq!(
            rx.backend()
                .open_handles(),
            0
        );
    }

    #[test]
    fn test_previously_failed_version_refused() {
        let mut backend = backend();
        let failed = image(1024);
        let target = backend
            .next_update_partition()
            .unwrap();
        let handle = backend
            .begin(&target, failed.len() as u32)
            .unwrap();
        backend
            .write(&handle, 0, &failed)
            .unwrap();
        let done = backend
            .end(handle)
            .unwrap();
        backend
            .set_boot_partition(&done)
            .unwrap();
        backend.restart();
        backend
            .mark_invalid_and_rollback()
            .unwrap();

        let mut rx = OtaReceiver::new(backend);
        let resp = rx.handle_frame(&start_frame(0, &failed));
        assert_eq!(resp.frames[0].command, Command::Ready);
        let resp = rx.handle_frame(&Frame::data(0, 0, &failed));
        assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::ImageInvalid);
        assert_eq!(rx.state(), State::Idle);
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let image = image(1024);
        let mut rx = OtaReceiver::new(backend());
        let mut start = StartPayload::decode(&start_frame(0, &image).payload).unwrap();
        start.firmware_crc32 ^= 1;
        rx.handle_frame(&Frame::with_payload(Command::Start, 0, start.encode()));
        send_all(&mut rx, &image);

        let resp = rx.handle_frame(&Frame::new(Command::End, 1));
        let nack = ack_of(&resp.frames[0]);
        assert_eq!(nack.error_code, ErrorCode::ImageInvalid);
        assert_eq!(nack.expected_seq, 1);
        assert_eq!(nack.received_bytes, 1024);
        assert!(resp.action.is_none());
        assert_eq!(rx.state(), State::Idle);
        assert_eq!(
            rx.backend()
                .open_handles(),
            0
        );
    }

    #[test]
    fn test_crc_check_can_be_disabled() {
        let image = image(1024);
        let config = ReceiverConfig {
            verify_image_crc: false,
            ..ReceiverConfig::default()
        };
        let mut rx = OtaReceiver::with_config(backend(), config);
        let mut start = StartPayload::decode(&start_frame(0, &image).payload).unwrap();
        start.firmware_crc32 = 0;
        rx.handle_frame(&Frame::with_payload(Command::Start, 0, start.encode()));
        send_all(&mut rx, &image);

        let resp = rx.handle_frame(&Frame::new(Command::End, 1));
        assert_eq!(resp.frames[0].command, Command::Complete);
    }

    #[test]
    fn test_validation_failure_stays_verifying() {
        let image = image(1024);
        let mut backend = backend();
        backend
            .faults_mut()
            .fail_validation = true;
        let mut rx = OtaReceiver::new(backend);
        rx.handle_frame(&start_frame(0, &image));
        send_all(&mut rx, &image);

        let resp = rx.handle_frame(&Frame::new(Command::End, 1));
        assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::ImageInvalid);
        assert_eq!(rx.state(), State::Verifying);
        assert_eq!(
            rx.backend()
                .open_handles(),
            0
        );

        let resp = rx.handle_frame(&Frame::data(1, 1024, &[0; 4]));
        assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::InvalidState);
        assert_eq!(rx.state(), State::Verifying);

        rx.handle_frame(&Frame::new(Command::Abort, 2));
        assert_eq!(rx.state(), State::Idle);
    }

    /// Backend whose `end` loses the handle instead of validating.
    struct LosesHandles(MemoryPartitions);

    impl PartitionManager for LosesHandles {
        fn next_update_partition(&self) -> Option<Partition> {
            self.0
                .next_update_partition()
        }

        fn begin(
            &mut self,
            partition: &Partition,
            image_size: u32,
        ) -> Result<UpdateHandle, FlashError> {
            self.0
                .begin(partition, image_size)
        }

        fn write(
            &mut self,
            handle: &UpdateHandle,
            offset: u32,
            data: &[u8],
        ) -> Result<(), FlashError> {
            self.0
                .write(handle, offset, data)
        }

        fn end(&mut self, handle: UpdateHandle) -> Result<Partition, FlashError> {
            let id = handle.id();
            self.0
                .abort(handle);
            Err(FlashError::InvalidHandle(id))
        }

        fn abort(&mut self, handle: UpdateHandle) {
            self.0
                .abort(handle);
        }

        fn set_boot_partition(&mut self, partition: &Partition) -> Result<(), FlashError> {
            self.0
                .set_boot_partition(partition)
        }

        fn running_partition(&self) -> Option<Partition> {
            self.0
                .running_partition()
        }

        fn boot_partition(&self) -> Option<Partition> {
            self.0
                .boot_partition()
        }

        fn last_invalid_partition(&self) -> Option<Partition> {
            self.0
                .last_invalid_partition()
        }

        fn partition_description(&self, partition: &Partition) -> Option<AppDescription> {
            self.0
                .partition_description(partition)
        }

        fn running_image_state(&self) -> ImageState {
            self.0
                .running_image_state()
        }

        fn mark_running_valid(&mut self) -> Result<(), FlashError> {
            self.0
                .mark_running_valid()
        }

        fn mark_invalid_and_rollback(&mut self) -> Result<(), FlashError> {
            self.0
                .mark_invalid_and_rollback()
        }

        fn restart(&mut self) {
            self.0
                .restart();
        }
    }

    #[test]
    fn test_any_finalization_failure_is_image_invalid() {
        let image = image(1024);
        let mut rx = OtaReceiver::new(LosesHandles(backend()));
        rx.handle_frame(&start_frame(0, &image));
        for (i, block) in image
            .chunks(MAX_PAYLOAD_SIZE)
            .enumerate()
        {
            rx.handle_frame(&Frame::data(i as u16, (i * MAX_PAYLOAD_SIZE) as u32, block));
        }

        let resp = rx.handle_frame(&Frame::new(Command::End, 1));
        assert_eq!(resp.frames[0].command, Command::Nack);
        assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::ImageInvalid);
        assert!(resp.action.is_none());
        assert_eq!(
            rx.backend()
                .0
                .open_handles(),
            0
        );
    }

    #[test]
    fn test_boot_select_failure_returns_idle() {
        let image = image(1024);
        let mut backend = backend();
        backend
            .faults_mut()
            .fail_set_boot = true;
        let mut rx = OtaReceiver::new(backend);
        rx.handle_frame(&start_frame(0, &image));
        send_all(&mut rx, &image);

        let resp = rx.handle_frame(&Frame::new(Command::End, 1));
        assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::Partition);
        assert_eq!(rx.state(), State::Idle);
    }

    #[test]
    fn test_abort_cycles_release_handles() {
        let image = image(4096);
        let mut rx = OtaReceiver::new(backend());
        for cycle in 0..20u16 {
            let resp = rx.handle_frame(&start_frame(cycle, &image));
            assert_eq!(resp.frames[0].command, Command::Ready, "cycle {cycle}");
            if cycle % 2 == 1 {
                send_all(&mut rx, &image[..2048]);
            }
            assert_eq!(
                rx.backend()
                    .open_handles(),
                1
            );

            let resp = rx.handle_frame(&Frame::new(Command::Abort, cycle));
            let ack = ack_of(&resp.frames[0]);
            assert_eq!(resp.frames[0].command, Command::Ack);
            assert_eq!(
                (ack.error_code, ack.expected_seq, ack.received_bytes),
                (ErrorCode::Success, 0, 0)
            );
            assert_eq!(rx.state(), State::Idle);
            assert_eq!(
                rx.backend()
                    .open_handles(),
                0
            );
        }
    }

    #[test]
    fn test_query_status() {
        let image = image(2048);
        let mut rx = started(&image);
        send_all(&mut rx, &image[..1024]);

        let resp = rx.handle_frame(&Frame::new(Command::QueryStatus, 42));
        assert_eq!(resp.frames[0].command, Command::StatusResp);
        assert_eq!(resp.frames[0].sequence, 42);
        let status = StatusPayload::decode(&resp.frames[0].payload).unwrap();
        assert_eq!(status.state, State::Receiving);
        assert_eq!(status.received_bytes, 1024);
        assert_eq!(status.total_bytes, 2048);
        assert_eq!(status.current_version, "1.0.0");
    }

    #[test]
    fn test_query_status_unknown_version() {
        let mut rx = OtaReceiver::new(MemoryPartitions::default());
        assert_eq!(
            rx.status()
                .current_version,
            "unknown"
        );
        let resp = rx.handle_frame(&Frame::new(Command::QueryStatus, 0));
        assert_eq!(resp.frames.len(), 1);
    }

    #[test]
    fn test_rollback_request() {
        // Running factory, boot factory: nothing to roll back to
        let mut rx = OtaReceiver::new(backend());
        let resp = rx.handle_frame(&Frame::new(Command::RollbackReq, 3));
        assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::RollbackFailed);
        assert!(resp.action.is_none());

        // After a completed transfer boot points at the new slot
        let image = image(1024);
        rx.handle_frame(&start_frame(0, &image));
        send_all(&mut rx, &image);
        rx.handle_frame(&Frame::new(Command::End, 1));
        let resp = rx.handle_frame(&Frame::new(Command::RollbackReq, 4));
        assert_eq!(resp.frames[0].command, Command::Ack);
        assert_eq!(
            resp.action,
            Some(DeviceAction::Rollback {
                after: Duration::from_millis(500)
            })
        );
    }

    #[test]
    fn test_unknown_command_nacked() {
        let mut rx = OtaReceiver::new(backend());
        for cmd in [Command::Unknown(0x42), Command::Ack, Command::Progress] {
            let resp = rx.handle_frame(&Frame::new(cmd, 7));
            assert_eq!(resp.frames[0].command, Command::Nack);
            assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::FrameInvalid);
        }
        assert_eq!(rx.state(), State::Error);
    }

    #[test]
    fn test_protocol_nack_keeps_receiving() {
        let image = image(1024);
        let mut rx = started(&image);
        let resp = rx.handle_frame(&Frame::new(Command::Unknown(0x10), 1));
        assert_eq!(ack_of(&resp.frames[0]).error_code, ErrorCode::FrameInvalid);
        assert_eq!(rx.state(), State::Receiving);
    }

    #[test]
    fn test_progress_throttled() {
        let image = image(10 * 1024);
        let mut rx = started(&image);
        let mut reported = Vec::new();
        for (i, block) in image
            .chunks(512)
            .enumerate()
        {
            let resp = rx.handle_frame(&Frame::data(i as u16, (i * 512) as u32, block));
            for f in &resp.frames[1..] {
                reported.push(
                    ProgressPayload::decode(&f.payload)
                        .unwrap()
                        .percentage,
                );
            }
        }
        assert_eq!(reported, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
    }

    #[test]
    fn test_observer_events() {
        let recorder = Recorder::default();
        let events = Arc::clone(&recorder.0);
        let image = image(2048);
        let mut rx = OtaReceiver::new(backend()).with_observer(recorder);

        rx.handle_frame(&start_frame(0, &image));
        send_all(&mut rx, &image);
        rx.handle_frame(&Frame::new(Command::End, 2));

        let events = events
            .lock()
            .unwrap();
        assert_eq!(events.progress, vec![50, 100]);
        assert_eq!(events.complete, vec![(true, ErrorCode::Success)]);
        assert_eq!(
            events.states,
            vec![
                (State::Idle, State::Receiving),
                (State::Receiving, State::Verifying),
                (State::Verifying, State::Completed),
            ]
        );
    }

    #[test]
    fn test_abort_notifies_only_when_in_flight() {
        let recorder = Recorder::default();
        let events = Arc::clone(&recorder.0);
        let mut rx = OtaReceiver::new(backend()).with_observer(recorder);

        rx.handle_frame(&Frame::new(Command::Abort, 0));
        rx.handle_frame(&start_frame(1, &image(1024)));
        rx.handle_frame(&Frame::new(Command::Abort, 2));

        assert_eq!(
            events
                .lock()
                .unwrap()
                .complete,
            vec![(false, ErrorCode::Unknown)]
        );
    }

    #[test]
    fn test_expire() {
        let image = image(2048);
        let mut rx = started(&image);
        send_all(&mut rx, &image[..1024]);

        assert!(rx.expire());
        assert_eq!(rx.state(), State::Error);
        assert_eq!(
            rx.session()
                .last_error(),
            ErrorCode::Timeout
        );
        assert_eq!(
            rx.backend()
                .open_handles(),
            0
        );
        assert!(!rx.expire());

        let resp = rx.handle_frame(&start_frame(5, &image));
        assert_eq!(resp.frames[0].command, Command::Ready);
    }

    #[test]
    fn test_into_backend_releases_handle() {
        let rx = started(&image(1024));
        let backend = rx.into_backend();
        assert_eq!(backend.open_handles(), 0);
    }
}
