//! Frame extraction from a continuous byte stream.
//!
//! The transport delivers bytes in arbitrary chunks: a frame may arrive split
//! across many reads, several frames may share one read, and line noise may
//! sit between them. [`StreamFramer`] accumulates bytes and hands out one
//! marker-delimited candidate frame at a time. CRC and version checks are left
//! to [`decode`](crate::protocol::frame::decode).

use {
    crate::protocol::frame::{
        END_MARKER, FOOTER_SIZE, HEADER_SIZE, LENGTH_OFFSET, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE,
        START_MARKER,
    },
    log::{trace, warn},
};

/// Accumulates stream bytes and slices out complete frames.
#[derive(Debug)]
pub struct StreamFramer {
    buffer: Vec<u8>,
    capacity: usize,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    /// Create a framer bounded to [`MAX_FRAME_SIZE`].
    pub fn new() -> Self {
        Self::with_capacity(MAX_FRAME_SIZE)
    }

    /// Create a framer with a custom buffer bound.
    ///
    /// The bound is raised to [`MAX_FRAME_SIZE`] if smaller, otherwise a
    /// maximum-length frame could never be assembled.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MAX_FRAME_SIZE);
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer
            .len()
    }

    /// Buffer bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buffer
            .clear();
    }

    /// Append a chunk.
    ///
    /// If the buffer would exceed its bound, the oldest bytes are discarded.
    /// Callers that can receive more than one frame per chunk should prefer
    /// [`push`](Self::push), which extracts between slices.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer
            .extend_from_slice(chunk);
        if self.buffer.len() > self.capacity {
            let excess = self.buffer.len() - self.capacity;
            warn!("Framer buffer full, discarding {excess} oldest bytes");
            self.buffer
                .drain(..excess);
        }
    }

    /// Feed a chunk of any size and collect every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut rest = chunk;
        while !rest.is_empty() {
            let room = self
                .capacity
                .saturating_sub(self.buffer.len())
                .max(1);
            let take = room.min(rest.len());
            self.feed(&rest[..take]);
            rest = &rest[take..];
            while let Some(frame) = self.try_extract_frame() {
                frames.push(frame);
            }
        }
        frames
    }

    /// Take the next complete candidate frame, if one is buffered.
    ///
    /// A candidate starts with the opening marker, has a plausible declared
    /// length and ends with the closing marker. Bytes before the marker are
    /// dropped. A false marker (oversized length or wrong closing bytes) is
    /// skipped one byte at a time so a real marker inside it is still found.
    pub fn try_extract_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let Some(start) = find_marker(&self.buffer) else {
                self.discard_noise();
                return None;
            };
            if start > 0 {
                trace!("Dropping {start} orphan bytes before frame marker");
                self.buffer
                    .drain(..start);
            }

            if self.buffer.len() < HEADER_SIZE {
                return None;
            }

            let length = u16::from_le_bytes([
                self.buffer[LENGTH_OFFSET],
                self.buffer[LENGTH_OFFSET + 1],
            ]) as usize;
            if length > MAX_PAYLOAD_SIZE {
                trace!("Declared length {length} exceeds maximum, skipping false marker");
                self.buffer
                    .drain(..1);
                continue;
            }

            let total = HEADER_SIZE + length + FOOTER_SIZE;
            if self.buffer.len() < total {
                return None;
            }

            if self.buffer[total - 2..total] != END_MARKER {
                trace!("Closing marker missing at {total}, skipping false marker");
                self.buffer
                    .drain(..1);
                continue;
            }

            let frame: Vec<u8> = self
                .buffer
                .drain(..total)
                .collect();
            return Some(frame);
        }
    }

    /// No marker is buffered: keep only a trailing first marker byte.
    fn discard_noise(&mut self) {
        let keep_tail = self
            .buffer
            .last()
            .is_some_and(|&b| b == START_MARKER[0]);
        let drop = if keep_tail {
            self.buffer.len() - 1
        } else {
            self.buffer.len()
        };
        if drop > 0 {
            trace!("Dropping {drop} noise bytes");
            self.buffer
                .drain(..drop);
        }
    }
}

fn find_marker(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(START_MARKER.len())
        .position(|w| w == START_MARKER)
}
