//! Host-side firmware sender.
//!
//! [`OtaSender`] pushes an image to a device running [`SessionDriver`]:
//!
//! ```text
//! host                                   device
//!  │── START(size, crc32, version) ──────►│
//!  │◄──────────────────────────── READY ──│
//!  │── DATA(seq 0, offset 0) ────────────►│
//!  │◄──────────────── ACK(1, received) ───│
//!  │          ...                         │
//!  │── END ──────────────────────────────►│
//!  │◄───────────────────────── COMPLETE ──│ (device restarts)
//! ```
//!
//! Lost replies are handled by retransmitting. If the device already accepted
//! a retransmitted block it answers NACK(SEQ) with its real position, and the
//! sender continues from there.
//!
//! [`SessionDriver`]: crate::driver::SessionDriver

use {
    crate::{
        error::{Error, Result},
        port::Transport,
        protocol::{
            AckPayload, Command, ErrorCode, Frame, ProgressPayload, StartPayload, StatusPayload,
            StreamFramer,
            crc::crc32,
            frame::{MAX_PAYLOAD_SIZE, decode},
        },
        is_interrupted_requested,
    },
    log::{debug, info, trace, warn},
    std::{
        collections::VecDeque,
        time::{Duration, Instant},
    },
};

/// Device status as reported by QUERY_STATUS.
pub type StatusReport = StatusPayload;

/// Sender tunables.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// How long to wait for READY, ACK and STATUS_RESP.
    pub ack_timeout: Duration,
    /// How long to wait for COMPLETE after END.
    pub end_timeout: Duration,
    /// Retransmissions per request before giving up.
    pub max_retries: u32,
    /// DATA payload size, clamped to 1..=1024.
    pub block_size: usize,
    /// Transport read timeout per poll.
    pub read_timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(3),
            end_timeout: Duration::from_secs(10),
            max_retries: 3,
            block_size: MAX_PAYLOAD_SIZE,
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// Identity announced in START.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    /// Version string.
    pub version: String,
    /// Project name.
    pub project_name: String,
}

impl FirmwareInfo {
    /// Create from version and project name.
    pub fn new(version: impl Into<String>, project_name: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            project_name: project_name.into(),
        }
    }
}

/// Drives a firmware update from the host side.
#[derive(Debug)]
pub struct OtaSender<T: Transport> {
    transport: T,
    config: SenderConfig,
    framer: StreamFramer,
    pending: VecDeque<Frame>,
    sequence: u16,
    chunk: Vec<u8>,
}

impl<T: Transport> OtaSender<T> {
    /// Create a sender with default settings.
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, SenderConfig::default())
    }

    /// Create a sender with custom settings.
    pub fn with_config(transport: T, mut config: SenderConfig) -> Self {
        config.block_size = config
            .block_size
            .clamp(1, MAX_PAYLOAD_SIZE);
        Self {
            transport,
            config,
            framer: StreamFramer::new(),
            pending: VecDeque::new(),
            sequence: 0,
            chunk: vec![0u8; 256],
        }
    }

    /// Sender settings.
    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Give back the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Transfer `image` and wait until the device reports COMPLETE.
    ///
    /// `progress` is called with `(sent, total)` after every acknowledged block.
    pub fn send_firmware<F>(&mut self, image: &[u8], info: &FirmwareInfo, mut progress: F) -> Result<()>
    where
        F: FnMut(u32, u32),
    {
        if image.is_empty() {
            return Err(Error::InvalidImage("image is empty".into()));
        }
        let total = u32::try_from(image.len())
            .map_err(|_| Error::InvalidImage(format!("image too large: {} bytes", image.len())))?;
        let crc = crc32(image);
        info!(
            "Sending {} v{}: {total} bytes, crc32 0x{crc:08X}",
            info.project_name, info.version
        );

        self.framer
            .clear();
        self.pending
            .clear();

        // Clamped to MAX_PAYLOAD_SIZE
        #[allow(clippy::cast_possible_truncation)]
        let block_size = self.config.block_size as u32;

        // START
        let start = Frame::with_payload(
            Command::Start,
            0,
            StartPayload {
                firmware_size: total,
                firmware_crc32: crc,
                version: info
                    .version
                    .clone(),
                project_name: info
                    .project_name
                    .clone(),
                block_size,
            }
            .encode(),
        );
        let reply = self.request(&start, &[Command::Ready], self.config.ack_timeout, "START")?;
        if reply.command == Command::Nack {
            return Err(rejection(&reply, "START"));
        }
        debug!("Device ready");

        // DATA
        let mut offset = 0u32;
        let mut sequence = 0u16;
        let mut retries = 0u32;
        progress(0, total);
        while offset < total {
            if is_interrupted_requested() {
                self.abort_best_effort();
                return Err(Error::Interrupted);
            }
            let start_at = offset as usize;
            let end_at = (start_at + self.config.block_size).min(image.len());
            let frame = Frame::data(sequence, offset, &image[start_at..end_at]);
            self.send_frame(&frame)?;

            let reply = match self.wait_reply(sequence, &[Command::Ack], self.config.ack_timeout)? {
                Some(reply) => reply,
                None => {
                    retries += 1;
                    warn!(
                        "Block {sequence} timed out, retry {retries}/{}",
                        self.config.max_retries
                    );
                    if retries > self.config.max_retries {
                        self.abort_best_effort();
                        return Err(Error::Timeout(format!(
                            "no ACK for block {sequence} at offset {offset}"
                        )));
                    }
                    continue;
                },
            };

            let ack = AckPayload::decode(&reply.payload)?;
            match (reply.command, ack.error_code) {
                (Command::Ack, _) => {
                    if ack.received_bytes > total {
                        return Err(Error::Protocol(format!(
                            "device reports {} of {total} bytes",
                            ack.received_bytes
                        )));
                    }
                    offset = ack.received_bytes;
                    sequence = ack.expected_seq;
                    retries = 0;
                    progress(offset, total);
                },
                (_, ErrorCode::Seq | ErrorCode::Offset) => {
                    retries += 1;
                    warn!(
                        "Device expects seq {} at offset {}, resynchronising",
                        ack.expected_seq, ack.received_bytes
                    );
                    if retries > self.config.max_retries || ack.received_bytes > total {
                        self.abort_best_effort();
                        return Err(rejection(&reply, &format!("block at offset {offset}")));
                    }
                    offset = ack.received_bytes;
                    sequence = ack.expected_seq;
                },
                _ => {
                    self.abort_best_effort();
                    return Err(rejection(&reply, &format!("block at offset {offset}")));
                },
            }
        }

        // END
        let end = Frame::new(Command::End, sequence);
        let reply = self.request(&end, &[Command::Complete], self.config.end_timeout, "END")?;
        if reply.command == Command::Nack {
            return Err(rejection(&reply, "END"));
        }
        info!("Transfer complete, device is restarting");
        Ok(())
    }

    /// Ask the device for its transfer state.
    pub fn query_status(&mut self) -> Result<StatusReport> {
        let frame = Frame::new(Command::QueryStatus, self.next_sequence());
        let reply = self.request(
            &frame,
            &[Command::StatusResp],
            self.config.ack_timeout,
            "QUERY_STATUS",
        )?;
        if reply.command == Command::Nack {
            return Err(rejection(&reply, "QUERY_STATUS"));
        }
        StatusPayload::decode(&reply.payload)
    }

    /// Cancel whatever transfer the device has in flight.
    pub fn abort(&mut self) -> Result<()> {
        let frame = Frame::new(Command::Abort, self.next_sequence());
        let reply = self.request(&frame, &[Command::Ack], self.config.ack_timeout, "ABORT")?;
        if reply.command == Command::Nack {
            return Err(rejection(&reply, "ABORT"));
        }
        Ok(())
    }

    /// Ask the device to return to its previous image.
    pub fn request_rollback(&mut self) -> Result<()> {
        let frame = Frame::new(Command::RollbackReq, self.next_sequence());
        let reply = self.request(
            &frame,
            &[Command::Ack],
            self.config.ack_timeout,
            "ROLLBACK",
        )?;
        if reply.command == Command::Nack {
            return Err(rejection(&reply, "rollback"));
        }
        Ok(())
    }

    fn next_sequence(&mut self) -> u16 {
        self.sequence = self
            .sequence
            .wrapping_add(1);
        self.sequence
    }

    /// Send `frame` and wait for a reply, retransmitting on timeout.
    fn request(
        &mut self,
        frame: &Frame,
        expected: &[Command],
        timeout: Duration,
        what: &str,
    ) -> Result<Frame> {
        for attempt in 0..=self.config.max_retries {
            if is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            if attempt > 0 {
                warn!("{what} timed out, retry {attempt}/{}", self.config.max_retries);
            }
            self.send_frame(frame)?;
            if let Some(reply) = self.wait_reply(frame.sequence, expected, timeout)? {
                return Ok(reply);
            }
        }
        Err(Error::Timeout(format!(
            "no reply to {what} after {} attempts",
            self.config.max_retries + 1
        )))
    }

    fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        trace!(
            "TX {} seq={} offset={} len={}",
            frame.command,
            frame.sequence,
            frame.offset,
            frame.payload.len()
        );
        self.transport
            .send(&frame.encode()?)
    }

    /// Wait for a reply to `sequence` that is one of `expected` or a NACK.
    ///
    /// PROGRESS frames and stale replies are skipped.
    fn wait_reply(
        &mut self,
        sequence: u16,
        expected: &[Command],
        timeout: Duration,
    ) -> Result<Option<Frame>> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(frame) = self
                .pending
                .pop_front()
            {
                if frame.command == Command::Progress {
                    if let Ok(p) = ProgressPayload::decode(&frame.payload) {
                        debug!(
                            "Device progress: {}/{} ({}%)",
                            p.received_bytes, p.total_bytes, p.percentage
                        );
                    }
                    continue;
                }
                if frame.sequence == sequence
                    && (frame.command == Command::Nack || expected.contains(&frame.command))
                {
                    return Ok(Some(frame));
                }
                debug!(
                    "Ignoring stale {} for seq {}",
                    frame.command, frame.sequence
                );
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = self
                .config
                .read_timeout
                .min(deadline - now);
            let n = self
                .transport
                .receive(&mut self.chunk, wait)?;
            if n == 0 {
                continue;
            }
            for raw in self
                .framer
                .push(&self.chunk[..n])
            {
                match decode(&raw) {
                    Ok(frame) => self
                        .pending
                        .push_back(frame),
                    Err(e) => warn!("Dropping undecodable reply: {e}"),
                }
            }
        }
    }

    fn abort_best_effort(&mut self) {
        let frame = Frame::new(Command::Abort, self.next_sequence());
        if let Err(e) = self.send_frame(&frame) {
            debug!("Could not send ABORT: {e}");
        }
    }
}

fn rejection(reply: &Frame, context: &str) -> Error {
    let code = AckPayload::decode(&reply.payload)
        .map_or(ErrorCode::Unknown, |ack| ack.error_code);
    Error::Rejected {
        code,
        context: context.to_string(),
    }
}
