//! CRC calculations.
//!
//! Frames carry a CRC16-CCITT (poly 0x1021, init 0xFFFF, no reflection, no
//! final XOR; catalogued as CRC-16/IBM-3740). Whole images are checked with the
//! standard CRC-32 (CRC-32/ISO-HDLC).

use crc::{CRC_16_IBM_3740, CRC_32_ISO_HDLC, Crc, Digest};

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Calculate the frame CRC16 over `data`.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Calculate the image CRC32 over `data`.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Incremental CRC32 over an image that arrives block by block.
#[derive(Clone)]
pub struct ImageDigest {
    digest: Digest<'static, u32>,
    len: u64,
}

impl ImageDigest {
    /// Start an empty digest.
    pub fn new() -> Self {
        Self {
            digest: CRC32.digest(),
            len: 0,
        }
    }

    /// Feed the next block.
    pub fn update(&mut self, block: &[u8]) {
        self.digest
            .update(block);
        self.len += block.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing has been fed yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// CRC32 of everything fed so far.
    pub fn value(&self) -> u32 {
        self.digest
            .clone()
            .finalize()
    }
}

impl Default for ImageDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ImageDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageDigest")
            .field("len", &self.len)
            .field("crc32", &format_args!("{:#010x}", self.value()))
            .finish()
    }
}
