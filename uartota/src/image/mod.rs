//! Application image inspection.
//!
//! Images start with a fixed header, the first segment header, and the
//! application descriptor that identifies the build:
//!
//! ```text
//! +--------------------+ 0
//! | Image header (24B) |  magic 0xE9, segment count, flash settings
//! +--------------------+ 24
//! | Segment hdr (8B)   |  load address, length
//! +--------------------+ 32
//! | App descriptor     |  magic 0xABCD5432, version, project, time, date,
//! | (256B)             |  toolchain version, ELF SHA-256
//! +--------------------+ 288
//! | Segment data ...   |
//! ```

use {
    crate::{
        error::{Error, Result},
        protocol::{crc::crc32, payload::read_fixed_str},
    },
    byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt},
    std::io::{Cursor, Read},
};

/// First byte of every image.
pub const IMAGE_MAGIC: u8 = 0xE9;

/// Magic word at the start of the application descriptor.
pub const APP_DESC_MAGIC: u32 = 0xABCD5432;

/// Size of the image header.
pub const IMAGE_HEADER_SIZE: usize = 24;

/// Size of one segment header.
pub const SEGMENT_HEADER_SIZE: usize = 8;

/// Size of the application descriptor.
pub const APP_DESC_SIZE: usize = 256;

/// Offset of the application descriptor inside the image.
pub const APP_DESC_OFFSET: usize = IMAGE_HEADER_SIZE + SEGMENT_HEADER_SIZE;

/// Smallest first block that carries a complete descriptor.
pub const MIN_HEADER_BLOCK: usize = APP_DESC_OFFSET + APP_DESC_SIZE;

/// Application descriptor embedded in an image.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AppDescription {
    /// Descriptor magic word.
    pub magic: u32,
    /// Anti-rollback security version.
    pub secure_version: u32,
    /// Application version string.
    pub version: String,
    /// Project name.
    pub project_name: String,
    /// Build time.
    pub time: String,
    /// Build date.
    pub date: String,
    /// Toolchain/SDK version.
    pub idf_version: String,
    /// SHA-256 of the application ELF.
    pub elf_sha256: [u8; 32],
}

impl AppDescription {
    /// Parse the descriptor from the start of an image.
    ///
    /// Only the length is enforced. A wrong magic is reported through
    /// [`has_valid_magic`](Self::has_valid_magic) so callers decide how strict
    /// to be.
    pub fn parse(image: &[u8]) -> Result<Self> {
        if image.len() < MIN_HEADER_BLOCK {
            return Err(Error::InvalidImage(format!(
                "header block too short: {} bytes, need {MIN_HEADER_BLOCK}",
                image.len()
            )));
        }
        Self::read_from(&mut Cursor::new(&image[APP_DESC_OFFSET..MIN_HEADER_BLOCK]))
    }

    /// Read a raw 256-byte descriptor.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        let secure_version = reader.read_u32::<LittleEndian>()?;
        let mut reserved = [0u8; 8];
        reader.read_exact(&mut reserved)?;
        let version = read_fixed_str(reader, 32)?;
        let project_name = read_fixed_str(reader, 32)?;
        let time = read_fixed_str(reader, 16)?;
        let date = read_fixed_str(reader, 16)?;
        let idf_version = read_fixed_str(reader, 32)?;
        let mut elf_sha256 = [0u8; 32];
        reader.read_exact(&mut elf_sha256)?;

        Ok(Self {
            magic,
            secure_version,
            version,
            project_name,
            time,
            date,
            idf_version,
            elf_sha256,
        })
    }

    /// Whether the descriptor magic word is correct.
    pub fn has_valid_magic(&self) -> bool {
        self.magic == APP_DESC_MAGIC
    }

    /// ELF hash as lowercase hex.
    pub fn elf_sha256_hex(&self) -> String {
        self.elf_sha256
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Summary of an image file.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ImageInfo {
    /// Image size in bytes.
    pub size: usize,
    /// CRC32 over the whole image.
    pub crc32: u32,
    /// Whether the first byte is [`IMAGE_MAGIC`].
    pub header_magic_ok: bool,
    /// Descriptor, if the image is long enough to carry one.
    pub description: Option<AppDescription>,
}

impl ImageInfo {
    /// Inspect raw image bytes.
    pub fn inspect(image: &[u8]) -> Self {
        Self {
            size: image.len(),
            crc32: crc32(image),
            header_magic_ok: image.first() == Some(&IMAGE_MAGIC),
            description: AppDescription::parse(image).ok(),
        }
    }

    /// Whether header and descriptor magics are both correct.
    pub fn looks_valid(&self) -> bool {
        self.header_magic_ok
            && self
                .description
                .as_ref()
                .is_some_and(AppDescription::has_valid_magic)
    }
}

/// Builds minimal well-formed images.
///
/// Useful for emulators and tests that need an image the header check and the
/// backend validation both accept.
#[derive(Debug, Clone)]
pub struct AppImageBuilder {
    version: String,
    project_name: String,
    time: String,
    date: String,
    idf_version: String,
    secure_version: u32,
    size: usize,
    fill: u8,
}

impl AppImageBuilder {
    /// Start a builder for the given version and project.
    pub fn new(version: impl Into<String>, project_name: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            project_name: project_name.into(),
            time: "12:00:00".into(),
            date: "Jan  1 2025".into(),
            idf_version: "v5.1".into(),
            secure_version: 0,
            size: MIN_HEADER_BLOCK,
            fill: 0x00,
        }
    }

    /// Set the total image size (at least [`MIN_HEADER_BLOCK`]).
    #[must_use]
    pub fn size(mut self, size: usize) -> Self {
        self.size = size.max(MIN_HEADER_BLOCK);
        self
    }

    /// Set the build date and time strings.
    #[must_use]
    pub fn built_at(mut self, date: impl Into<String>, time: impl Into<String>) -> Self {
        self.date = date.into();
        self.time = time.into();
        self
    }

    /// Set the secure version.
    #[must_use]
    pub fn secure_version(mut self, secure_version: u32) -> Self {
        self.secure_version = secure_version;
        self
    }

    /// Seed for the filler bytes after the descriptor.
    #[must_use]
    pub fn fill(mut self, fill: u8) -> Self {
        self.fill = fill;
        self
    }

    /// Produce the image bytes.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn build(&self) -> Vec<u8> {
        let mut image = Vec::with_capacity(self.size);

        // Image header
        image.push(IMAGE_MAGIC);
        image.push(1); // segment count
        image.extend_from_slice(&[0x02, 0x20]); // spi mode, speed/size
        image
            .write_u32::<LittleEndian>(0x4008_0000)
            .unwrap(); // entry address
        image.resize(IMAGE_HEADER_SIZE, 0);

        // First segment header
        let segment_len = u32::try_from(self.size - APP_DESC_OFFSET).unwrap_or(u32::MAX);
        image
            .write_u32::<LittleEndian>(0x3F40_0020)
            .unwrap();
        image
            .write_u32::<LittleEndian>(segment_len)
            .unwrap();

        // Application descriptor
        image
            .write_u32::<LittleEndian>(APP_DESC_MAGIC)
            .unwrap();
        image
            .write_u32::<LittleEndian>(self.secure_version)
            .unwrap();
        image.extend_from_slice(&[0u8; 8]);
        put_field(&mut image, &self.version, 32);
        put_field(&mut image, &self.project_name, 32);
        put_field(&mut image, &self.time, 16);
        put_field(&mut image, &self.date, 16);
        put_field(&mut image, &self.idf_version, 32);
        image.resize(MIN_HEADER_BLOCK, 0);

        let mut value = self.fill;
        while image.len() < self.size {
            image.push(value);
            value = value.wrapping_mul(31).wrapping_add(7);
        }
        image
    }
}

fn put_field(buf: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let len = bytes
        .len()
        .min(width - 1);
    buf.extend_from_slice(&bytes[..len]);
    buf.resize(buf.len() + (width - len), 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        assert_eq!(APP_DESC_OFFSET, 32);
        assert_eq!(MIN_HEADER_BLOCK, 288);
    }

    #[test]
    fn test_builder_output_parses() {
        let image = AppImageBuilder::new("1.4.0", "gateway")
            .built_at("Mar  3 2025", "08:15:00")
            .secure_version(2)
            .size(4096)
            .build();
        assert_eq!(image.len(), 4096);
        assert_eq!(image[0], IMAGE_MAGIC);

        let desc = AppDescription::parse(&image).unwrap();
        assert!(desc.has_valid_magic());
        assert_eq!(desc.version, "1.4.0");
        assert_eq!(desc.project_name, "gateway");
        assert_eq!(desc.date, "Mar  3 2025");
        assert_eq!(desc.time, "08:15:00");
        assert_eq!(desc.secure_version, 2);
        assert_eq!(desc.idf_version, "v5.1");
    }

    #[test]
    fn test_descriptor_field_offsets() {
        let image = AppImageBuilder::new("9.9.9", "proj").build();
        assert_eq!(&image[APP_DESC_OFFSET + 16..APP_DESC_OFFSET + 21], b"9.9.9");
        assert_eq!(&image[APP_DESC_OFFSET + 48..APP_DESC_OFFSET + 52], b"proj");
    }

    #[test]
    fn test_parse_rejects_short_block() {
        let err = AppDescription::parse(&[0xE9; 100]).unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
    }

    #[test]
    fn test_parse_reports_bad_magic() {
        let desc = AppDescription::parse(&[0u8; MIN_HEADER_BLOCK]).unwrap();
        assert!(!desc.has_valid_magic());
        assert_eq!(desc.version, "");
    }

    #[test]
    fn test_image_info() {
        let image = AppImageBuilder::new("0.1.0", "demo")
            .size(1000)
            .build();
        let info = ImageInfo::inspect(&image);
        assert_eq!(info.size, 1000);
        assert_eq!(info.crc32, crc32(&image));
        assert!(info.looks_valid());

        let info = ImageInfo::inspect(b"not an image");
        assert!(!info.looks_valid());
        assert!(info.description.is_none());
    }

    #[test]
    fn test_fill_changes_body_only() {
        let a = AppImageBuilder::new("1", "p")
            .size(600)
            .fill(1)
            .build();
        let b = AppImageBuilder::new("1", "p")
            .size(600)
            .fill(2)
            .build();
        assert_eq!(a[..MIN_HEADER_BLOCK], b[..MIN_HEADER_BLOCK]);
        assert_ne!(a[MIN_HEADER_BLOCK..], b[MIN_HEADER_BLOCK..]);
    }
}
