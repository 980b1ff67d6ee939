//! ESP firmware image format
//!
//! An image is a 24 byte header, a number of segments (8 byte header plus
//! payload), a one byte XOR checksum over the segment payloads placed at the
//! next offset with `offset % 16 == 15`, and an optional SHA-256 digest of
//! everything up to and including the checksum byte.
//!
//! ## Format documentation:
//! * [Header](https://docs.espressif.com/projects/esptool/en/latest/esp32c3/advanced-topics/firmware-image-format.html#file-header)

use std::mem::size_of;

use bytemuck::{Pod, Zeroable, pod_read_unaligned};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use strum::{Display, FromRepr};

use super::{decode_str, le_u32};
use crate::{
    error::{Error, FormatError},
    image::FlashImage,
    targets::Chip,
};

/// Value of the first byte of every image
pub const ESP_MAGIC: u8 = 0xE9;
/// Seed of the payload checksum
pub const ESP_CHECKSUM_MAGIC: u8 = 0xEF;

const HEADER_LEN: u32 = size_of::<ImageHeader>() as u32;
const SEG_HEADER_LEN: u32 = size_of::<SegmentHeader>() as u32;
const DIGEST_LEN: u32 = 32;
const MAX_SEGMENTS: u8 = 16;
/// Anything larger cannot fit in a partition and is most likely erased flash
const MAX_SEGMENT_LEN: u32 = 16 * 1024 * 1024;

/// Firmware header used by the ESP-IDF bootloader
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
#[doc(alias = "esp_image_header_t")]
pub struct ImageHeader {
    pub magic: u8,
    pub segment_count: u8,
    /// Flash read mode (esp_image_spi_mode_t)
    pub flash_mode: u8,
    /// ..4 bits are flash frequency, 4.. bits are flash chip size
    pub flash_config: u8,
    pub entry: u32,

    // extended header part
    pub wp_pin: u8,
    pub clk_q_drv: u8,
    pub d_cs_drv: u8,
    pub gd_wp_drv: u8,
    pub chip_id: u16,
    pub min_rev: u8,
    /// Minimum chip revision supported by image, in format: major * 100 + minor
    pub min_chip_rev_full: u16,
    /// Maximal chip revision supported by image, in format: major * 100 + minor
    pub max_chip_rev_full: u16,
    pub reserved: [u8; 4],
    pub append_digest: u8,
}

impl ImageHeader {
    pub fn flash_mode(&self) -> Option<FlashMode> {
        FlashMode::from_repr(self.flash_mode)
    }

    pub fn flash_size(&self) -> Option<FlashSize> {
        FlashSize::from_repr(self.flash_config >> 4)
    }

    /// Raw flash frequency code, its meaning depends on the chip
    pub fn flash_frequency_code(&self) -> u8 {
        self.flash_config & 0x0F
    }

    pub fn chip(&self) -> Option<Chip> {
        Chip::try_from(self.chip_id).ok()
    }

    pub fn hash_appended(&self) -> bool {
        self.append_digest == 1
    }
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
struct SegmentHeader {
    addr: u32,
    length: u32,
}

/// Flash read mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
#[strum(serialize_all = "lowercase")]
pub enum FlashMode {
    Qio = 0,
    Qout,
    Dio,
    Dout,
}

/// Flash chip size as encoded in the image header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum FlashSize {
    #[strum(serialize = "1MB")]
    _1Mb = 0,
    #[strum(serialize = "2MB")]
    _2Mb,
    #[strum(serialize = "4MB")]
    _4Mb,
    #[strum(serialize = "8MB")]
    _8Mb,
    #[strum(serialize = "16MB")]
    _16Mb,
    #[strum(serialize = "32MB")]
    _32Mb,
    #[strum(serialize = "64MB")]
    _64Mb,
    #[strum(serialize = "128MB")]
    _128Mb,
}

impl FlashSize {
    pub fn bytes(&self) -> u32 {
        0x10_0000 << (*self as u32)
    }
}

/// A code or data segment of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSegment {
    /// Address the segment is loaded to
    pub load_address: u32,
    /// Offset of the payload in the flash image
    pub offset: u32,
    pub length: u32,
}

/// The appended SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDigest {
    /// Offset of the digest in the flash image
    pub offset: u32,
    pub stored: [u8; 32],
    pub computed: [u8; 32],
}

impl ImageDigest {
    pub fn is_valid(&self) -> bool {
        self.stored == self.computed
    }
}

/// A parsed firmware image
#[derive(Debug, Clone)]
pub struct AppImage {
    /// Offset of the image in the flash image
    pub offset: u32,
    pub header: ImageHeader,
    pub segments: Vec<ImageSegment>,
    /// Offset of the checksum byte in the flash image
    pub checksum_offset: u32,
    pub stored_checksum: u8,
    pub computed_checksum: u8,
    pub digest: Option<ImageDigest>,
}

impl AppImage {
    /// Parse the image starting at `offset`
    pub async fn parse(image: &FlashImage, offset: u32) -> Result<Self, Error> {
        let header_bytes = image.read(offset, HEADER_LEN as usize).await?;
        let header: ImageHeader = pod_read_unaligned(&header_bytes);

        if header.magic != ESP_MAGIC {
            return Err(FormatError::BadMagic {
                offset,
                expected: ESP_MAGIC as u32,
                found: header.magic as u32,
            }
            .into());
        }
        if header.segment_count == 0 || header.segment_count > MAX_SEGMENTS {
            return Err(FormatError::Implausible {
                what: "segment count",
                offset: offset + 1,
                value: header.segment_count as u32,
            }
            .into());
        }

        let mut segments = Vec::with_capacity(header.segment_count as usize);
        let mut checksum = ESP_CHECKSUM_MAGIC;
        let mut pos = offset + HEADER_LEN;

        for _ in 0..header.segment_count {
            let bytes = image.read(pos, SEG_HEADER_LEN as usize).await?;
            let seg: SegmentHeader = pod_read_unaligned(&bytes);
            let length = seg.length;

            if length == u32::MAX || length > MAX_SEGMENT_LEN {
                return Err(FormatError::Implausible {
                    what: "segment length",
                    offset: pos + 4,
                    value: length,
                }
                .into());
            }

            let payload_offset = pos + SEG_HEADER_LEN;
            if payload_offset as u64 + length as u64 > image.size() as u64 {
                return Err(FormatError::OutOfBounds {
                    what: "segment",
                    offset: payload_offset,
                    length,
                    limit: image.size(),
                }
                .into());
            }

            let payload = image.read(payload_offset, length as usize).await?;
            checksum = payload.iter().fold(checksum, |acc, b| acc ^ b);

            segments.push(ImageSegment {
                load_address: seg.addr,
                offset: payload_offset,
                length,
            });
            pos = payload_offset + length;
        }

        let checksum_offset = offset + ((pos - offset) | 0xF);
        let stored_checksum = image.read_u8(checksum_offset).await?;

        let digest = if header.hash_appended() {
            let digest_offset = checksum_offset + 1;
            let stored = image.read(digest_offset, DIGEST_LEN as usize).await?;
            let computed = compute_digest(image, offset, checksum_offset).await?;

            Some(ImageDigest {
                offset: digest_offset,
                stored: stored.as_slice().try_into()?,
                computed,
            })
        } else {
            None
        };

        debug!(
            "Image at {:#x}: {} segment(s), checksum at {:#x}",
            offset,
            segments.len(),
            checksum_offset
        );

        Ok(AppImage {
            offset,
            header,
            segments,
            checksum_offset,
            stored_checksum,
            computed_checksum: checksum,
            digest,
        })
    }

    pub fn checksum_valid(&self) -> bool {
        self.stored_checksum == self.computed_checksum
    }

    /// `None` when the image carries no digest
    pub fn digest_valid(&self) -> Option<bool> {
        self.digest.as_ref().map(ImageDigest::is_valid)
    }

    pub fn is_valid(&self) -> bool {
        self.checksum_valid() && self.digest_valid().unwrap_or(true)
    }

    /// Total length of the image including checksum and digest
    pub fn total_len(&self) -> u32 {
        let end = self.checksum_offset + 1 - self.offset;
        match self.digest {
            Some(_) => end + DIGEST_LEN,
            None => end,
        }
    }

    /// Offset one past the last byte of the image
    pub fn end(&self) -> u32 {
        self.offset + self.total_len()
    }

    /// Report both integrity checks as errors
    pub fn verify(&self) -> Result<(), FormatError> {
        if !self.checksum_valid() {
            return Err(FormatError::ChecksumMismatch {
                offset: self.checksum_offset,
                stored: self.stored_checksum as u32,
                computed: self.computed_checksum as u32,
            });
        }
        if let Some(digest) = self.digest.as_ref().filter(|d| !d.is_valid()) {
            return Err(FormatError::DigestMismatch {
                offset: digest.offset,
                stored: digest.stored.to_vec(),
                computed: digest.computed.to_vec(),
            });
        }

        Ok(())
    }

    /// Rewrite the checksum byte and then the digest so the image validates
    ///
    /// Returns the re-parsed image.
    pub async fn fix_checksums(&self, image: &FlashImage) -> Result<AppImage, Error> {
        if !self.checksum_valid() {
            warn!(
                "Correcting checksum at {:#x}: {:#04x} -> {:#04x}",
                self.checksum_offset, self.stored_checksum, self.computed_checksum
            );
            image.write(self.checksum_offset, &[self.computed_checksum])?;
        }

        if self.digest.is_some() {
            let computed = compute_digest(image, self.offset, self.checksum_offset).await?;
            image.write(self.checksum_offset + 1, &computed)?;
        }

        AppImage::parse(image, self.offset).await
    }

    /// Application description stored at the start of the first segment
    pub async fn app_descriptor(&self, image: &FlashImage) -> Result<Option<AppDescriptor>, Error> {
        let Some(first) = self.segments.first() else {
            return Ok(None);
        };
        if (first.length as usize) < size_of::<RawAppDescriptor>() {
            return Ok(None);
        }

        let bytes = image
            .read(first.offset, size_of::<RawAppDescriptor>())
            .await?;
        Ok(AppDescriptor::decode(&bytes))
    }
}

async fn compute_digest(image: &FlashImage, start: u32, checksum_offset: u32) -> Result<[u8; 32], Error> {
    let data = image
        .read(start, (checksum_offset + 1 - start) as usize)
        .await?;

    Ok(Sha256::digest(&data).into())
}

/// Application descriptor used by the ESP-IDF bootloader
///
/// [Documentation](https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description)
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
#[doc(alias = "esp_app_desc_t")]
struct RawAppDescriptor {
    magic_word: u32,
    secure_version: u32,
    reserv1: [u32; 2],
    version: [u8; 32],
    project_name: [u8; 32],
    time: [u8; 16],
    date: [u8; 16],
    idf_ver: [u8; 32],
    app_elf_sha256: [u8; 32],
    min_efuse_blk_rev_full: u16,
    max_efuse_blk_rev_full: u16,
    mmu_page_size: u8,
    reserv3: [u8; 3],
    reserv2: [u32; 18],
}

/// Decoded application descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    pub secure_version: u32,
    pub version: String,
    pub project_name: String,
    pub time: String,
    pub date: String,
    pub idf_version: String,
    pub elf_sha256: [u8; 32],
}

impl AppDescriptor {
    pub const MAGIC_WORD: u32 = 0xABCD_5432;

    fn decode(bytes: &[u8]) -> Option<Self> {
        if le_u32(bytes, 0) != Self::MAGIC_WORD {
            return None;
        }
        let raw: RawAppDescriptor = pod_read_unaligned(&bytes[..size_of::<RawAppDescriptor>()]);

        Some(AppDescriptor {
            secure_version: raw.secure_version,
            version: decode_str(&raw.version),
            project_name: decode_str(&raw.project_name),
            time: decode_str(&raw.time),
            date: decode_str(&raw.date),
            idf_version: decode_str(&raw.idf_ver),
            elf_sha256: raw.app_elf_sha256,
        })
    }
}
