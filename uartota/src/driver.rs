//! Device-side poll loop.
//!
//! [`SessionDriver`] is the single owner of the transport, the framer and the
//! receiver. Each poll reads one chunk, extracts and decodes frames, dispatches
//! them in arrival order and sends every reply before looking at the next
//! frame.

use {
    crate::{
        error::Result,
        flash::PartitionManager,
        is_interrupted_requested,
        port::Transport,
        protocol::{StreamFramer, frame::decode},
        receiver::{DeviceAction, OtaReceiver},
    },
    log::{debug, error, info, warn},
    std::{
        thread,
        time::{Duration, Instant},
    },
};

/// Poll loop tunables.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Bytes requested from the transport per poll.
    pub chunk_size: usize,
    /// Transport read timeout per poll.
    pub read_timeout: Duration,
    /// Abandon an in-flight transfer after this much host silence.
    pub idle_timeout: Option<Duration>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256,
            read_timeout: Duration::from_millis(100),
            idle_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No complete frame arrived.
    Idle,
    /// This many frames were handled.
    Handled(usize),
    /// The device restarted into the new image.
    Restarted,
    /// The device rolled back to the previous image.
    RolledBack,
    /// The embedding application asked to stop.
    Interrupted,
}

impl PollOutcome {
    /// Whether the session is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Restarted | Self::RolledBack | Self::Interrupted)
    }
}

/// Owns one OTA session end to end.
#[derive(Debug)]
pub struct SessionDriver<T: Transport, B: PartitionManager> {
    transport: T,
    receiver: OtaReceiver<B>,
    framer: StreamFramer,
    config: DriverConfig,
    last_activity: Instant,
    chunk: Vec<u8>,
}

impl<T: Transport, B: PartitionManager> SessionDriver<T, B> {
    /// Create a driver with default settings.
    pub fn new(transport: T, receiver: OtaReceiver<B>) -> Self {
        Self::with_config(transport, receiver, DriverConfig::default())
    }

    /// Create a driver with custom settings.
    pub fn with_config(transport: T, receiver: OtaReceiver<B>, config: DriverConfig) -> Self {
        let chunk = vec![0u8; config.chunk_size.max(1)];
        Self {
            transport,
            receiver,
            framer: StreamFramer::new(),
            config,
            last_activity: Instant::now(),
            chunk,
        }
    }

    /// The receiver.
    pub fn receiver(&self) -> &OtaReceiver<B> {
        &self.receiver
    }

    /// The receiver, mutably.
    pub fn receiver_mut(&mut self) -> &mut OtaReceiver<B> {
        &mut self.receiver
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Split into transport and receiver.
    pub fn into_parts(self) -> (T, OtaReceiver<B>) {
        (self.transport, self.receiver)
    }

    /// Read one chunk and handle every frame it completes.
    pub fn poll_once(&mut self) -> Result<PollOutcome> {
        let n = self
            .transport
            .receive(&mut self.chunk, self.config.read_timeout)?;

        let mut handled = 0;
        if n > 0 {
            let raw_frames = self
                .framer
                .push(&self.chunk[..n]);
            for raw in raw_frames {
                let frame = match decode(&raw) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Dropping undecodable frame: {e}");
                        continue;
                    },
                };
                self.last_activity = Instant::now();
                handled += 1;

                let response = self
                    .receiver
                    .handle_frame(&frame);
                for reply in &response.frames {
                    self.transport
                        .send(&reply.encode()?)?;
                }
                if let Some(action) = response.action {
                    return self.perform(action);
                }
            }
        }

        if handled == 0 {
            self.check_idle();
            return Ok(PollOutcome::Idle);
        }
        Ok(PollOutcome::Handled(handled))
    }

    /// Poll until the session ends.
    pub fn run(&mut self) -> Result<PollOutcome> {
        info!("OTA receiver listening");
        loop {
            if is_interrupted_requested() {
                info!("OTA receiver interrupted");
                return Ok(PollOutcome::Interrupted);
            }
            let outcome = self.poll_once()?;
            if outcome.is_terminal() {
                return Ok(outcome);
            }
        }
    }

    fn check_idle(&mut self) {
        let Some(limit) = self.config.idle_timeout else {
            return;
        };
        if self
            .receiver
            .state()
            .is_transfer_active()
            && self
                .last_activity
                .elapsed()
                >= limit
        {
            warn!("No frame for {limit:?}, abandoning transfer");
            self.receiver
                .expire();
            self.framer
                .clear();
        }
    }

    fn perform(&mut self, action: DeviceAction) -> Result<PollOutcome> {
        match action {
            DeviceAction::Restart { after } => {
                debug!("Restarting in {after:?}");
                thread::sleep(after);
                self.receiver
                    .backend_mut()
                    .restart();
                Ok(PollOutcome::Restarted)
            },
            DeviceAction::Rollback { after } => {
                debug!("Rolling back in {after:?}");
                thread::sleep(after);
                self.receiver
                    .backend_mut()
                    .mark_invalid_and_rollback()
                    .inspect_err(|e| error!("Rollback failed: {e}"))?;
                Ok(PollOutcome::RolledBack)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flash::memory::MemoryPartitions,
        image::AppImageBuilder,
        protocol::{
            AckPayload, Command, ErrorCode, Frame, StartPayload, State, crc::crc32,
        },
        receiver::ReceiverConfig,
    };
    use std::collections::VecDeque;

    /// Delivers scripted chunks and records everything sent.
    #[derive(Default)]
    struct ScriptedLink {
        incoming: VecDeque<Vec<u8>>,
        sent: Vec<u8>,
    }

    impl ScriptedLink {
        fn with_chunks(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                incoming: chunks.into(),
                sent: Vec::new(),
            }
        }

        fn replies(&self) -> Vec<Frame> {
            StreamFramer::new()
                .push(&self.sent)
                .iter()
                .map(|raw| decode(raw).unwrap())
                .collect()
        }
    }

    impl Transport for ScriptedLink {
        fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            let Some(mut chunk) = self
                .incoming
                .pop_front()
            else {
                return Ok(0);
            };
            let n = chunk
                .len()
                .min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.incoming
                    .push_front(chunk.split_off(n));
            }
            Ok(n)
        }

        fn send(&mut self, bytes: &[u8]) -> Result<()> {
            self.sent
                .extend_from_slice(bytes);
            Ok(())
        }
    }

    fn receiver() -> OtaReceiver<MemoryPartitions> {
        let mut backend = MemoryPartitions::new(64 * 1024);
        backend.install("factory", AppImageBuilder::new("1.0.0", "demo").build());
        let config = ReceiverConfig {
            restart_delay: Duration::ZERO,
            rollback_delay: Duration::ZERO,
            ..ReceiverConfig::default()
        };
        OtaReceiver::with_config(backend, config)
    }

    fn start(image: &[u8]) -> Vec<u8> {
        Frame::with_payload(
            Command::Start,
            0,
            StartPayload {
                firmware_size: image.len() as u32,
                firmware_crc32: crc32(image),
                version: "2.0.0".into(),
                project_name: "demo".into(),
                block_size: 1024,
            }
            .encode(),
        )
        .encode()
        .unwrap()
    }

    fn transfer_stream(image: &[u8]) -> Vec<u8> {
        let mut stream = start(image);
        let mut seq = 0u16;
        for (i, block) in image
            .chunks(1024)
            .enumerate()
        {
            stream.extend(
                Frame::data(seq, (i * 1024) as u32, block)
                    .encode()
                    .unwrap(),
            );
            seq += 1;
        }
        stream.extend(
            Frame::new(Command::End, seq)
                .encode()
                .unwrap(),
        );
        stream
    }

    #[test]
    fn test_run_completes_transfer_from_small_chunks() {
        let image = AppImageBuilder::new("2.0.0", "demo")
            .size(3000)
            .build();
        let chunks: Vec<Vec<u8>> = transfer_stream(&image)
            .chunks(37)
            .map(<[u8]>::to_vec)
            .collect();
        let mut driver = SessionDriver::new(ScriptedLink::with_chunks(chunks), receiver());

        assert_eq!(driver.run().unwrap(), PollOutcome::Restarted);

        let replies = driver
            .transport()
            .replies();
        assert_eq!(replies[0].command, Command::Ready);
        assert_eq!(
            replies
                .last()
                .unwrap()
                .command,
            Command::Complete
        );
        let (_, receiver) = driver.into_parts();
        let backend = receiver.into_backend();
        assert_eq!(backend.restarts(), 1);
        assert_eq!(backend.running_image(), image.as_slice());
    }

    #[test]
    fn test_corrupt_frame_dropped_without_reply() {
        let image = AppImageBuilder::new("2.0.0", "demo").build();
        let mut bad = start(&image);
        let last_payload_byte = bad.len() - 5;
        bad[last_payload_byte] ^= 0xFF;

        let mut driver =
            SessionDriver::new(ScriptedLink::with_chunks(vec![bad]), receiver());
        assert_eq!(driver.poll_once().unwrap(), PollOutcome::Idle);
        assert!(
            driver
                .transport()
                .sent
                .is_empty()
        );
        assert_eq!(
            driver
                .receiver()
                .state(),
            State::Idle
        );
    }

    #[test]
    fn test_noise_between_frames() {
        let query = Frame::new(Command::QueryStatus, 1)
            .encode()
            .unwrap();
        let mut stream = vec![0x00, 0xAA, 0x13, 0x55];
        stream.extend_from_slice(&query);
        stream.extend_from_slice(&[0xFF, 0xFE]);
        stream.extend_from_slice(&query);

        let mut driver =
            SessionDriver::new(ScriptedLink::with_chunks(vec![stream]), receiver());
        assert_eq!(driver.poll_once().unwrap(), PollOutcome::Handled(2));
        let replies = driver
            .transport()
            .replies();
        assert_eq!(replies.len(), 2);
        assert!(
            replies
                .iter()
                .all(|f| f.command == Command::StatusResp)
        );
    }

    #[test]
    fn test_watchdog_expires_stalled_transfer() {
        let image = AppImageBuilder::new("2.0.0", "demo")
            .size(4096)
            .build();
        let config = DriverConfig {
            idle_timeout: Some(Duration::ZERO),
            ..DriverConfig::default()
        };
        let mut driver = SessionDriver::with_config(
            ScriptedLink::with_chunks(vec![start(&image)]),
            receiver(),
            config,
        );

        assert_eq!(driver.poll_once().unwrap(), PollOutcome::Handled(1));
        assert_eq!(
            driver
                .receiver()
                .state(),
            State::Receiving
        );

        assert_eq!(driver.poll_once().unwrap(), PollOutcome::Idle);
        assert_eq!(
            driver
                .receiver()
                .state(),
            State::Error
        );
        assert_eq!(
            driver
                .receiver()
                .session()
                .last_error(),
            ErrorCode::Timeout
        );
        assert_eq!(
            driver
                .receiver()
                .backend()
                .open_handles(),
            0
        );
    }

    #[test]
    fn test_watchdog_disabled() {
        let image = AppImageBuilder::new("2.0.0", "demo").build();
        let config = DriverConfig {
            idle_timeout: None,
            ..DriverConfig::default()
        };
        let mut driver = SessionDriver::with_config(
            ScriptedLink::with_chunks(vec![start(&image)]),
            receiver(),
            config,
        );
        driver
            .poll_once()
            .unwrap();
        for _ in 0..3 {
            driver
                .poll_once()
                .unwrap();
        }
        assert_eq!(
            driver
                .receiver()
                .state(),
            State::Receiving
        );
    }

    #[test]
    fn test_rollback_request_performs_rollback() {
        let image = AppImageBuilder::new("2.0.0", "demo").build();
        let mut driver = SessionDriver::new(
            ScriptedLink::with_chunks(vec![transfer_stream(&image)]),
            receiver(),
        );
        assert_eq!(driver.run().unwrap(), PollOutcome::Restarted);
        assert_eq!(
            driver
                .receiver()
                .backend()
                .running_version()
                .as_deref(),
            Some("2.0.0")
        );

        // Boot selection still points at the new image, so select the
        // factory image to make a rollback possible
        let rollback = Frame::new(Command::RollbackReq, 0)
            .encode()
            .unwrap();
        let (_, receiver) = driver.into_parts();
        let mut backend = receiver.into_backend();
        let factory = backend
            .partition("factory")
            .unwrap();
        backend
            .set_boot_partition(&factory)
            .unwrap();
        let mut driver = SessionDriver::new(
            ScriptedLink::with_chunks(vec![rollback]),
            OtaReceiver::with_config(
                backend,
                ReceiverConfig {
                    rollback_delay: Duration::ZERO,
                    ..ReceiverConfig::default()
                },
            ),
        );
        assert_eq!(driver.poll_once().unwrap(), PollOutcome::RolledBack);
        let ack = AckPayload::decode(
            &driver
                .transport()
                .replies()[0]
                .payload,
        )
        .unwrap();
        assert_eq!(ack.error_code, ErrorCode::Success);
        assert_eq!(
            driver
                .receiver()
                .backend()
                .running_version()
                .as_deref(),
            Some("1.0.0")
        );
    }

    #[test]
    fn test_outcome_terminal() {
        assert!(PollOutcome::Restarted.is_terminal());
        assert!(PollOutcome::RolledBack.is_terminal());
        assert!(PollOutcome::Interrupted.is_terminal());
        assert!(!PollOutcome::Idle.is_terminal());
        assert!(!PollOutcome::Handled(3).is_terminal());
    }
}
