//! ESP-IDF binary partition tables
//!
//! A table is a run of 32 byte entries starting with the magic bytes
//! `AA 50`, optionally followed by an MD5 entry (`EB EB` and 14 bytes of
//! 0xFF, then the digest of all preceding entries). Parsing stops at the first
//! entry which is neither.
//!
//! For additional information see the ESP-IDF documentation:
//! <https://docs.espressif.com/projects/esp-idf/en/latest/esp32/api-guides/partition-tables.html>

use std::fmt::{self, Formatter};

use bitflags::bitflags;
use log::{debug, info};
use md5::{Digest, Md5};
use strum::{Display, FromRepr, IntoEnumIterator};

use super::{app_image::AppImage, decode_str, le_u32};
use crate::{
    error::{Error, FormatError},
    image::FlashImage,
    targets::Chip,
};

/// Offset of the partition table used by ESP-IDF unless configured otherwise
pub const DEFAULT_OFFSET: u32 = 0x8000;
/// Largest region reserved for the table
pub const MAX_TABLE_LEN: u32 = 0xC00;

const ENTRY_LEN: usize = 32;
const MAGIC_BYTES: [u8; 2] = [0xAA, 0x50];
const MD5_MAGIC_BYTES: [u8; 16] = [
    0xEB, 0xEB, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];
/// How far past the second stage bootloader to look for a table
const DISCOVERY_WINDOW: u32 = 0x2_0000;
const SECTOR: u32 = 0x1000;

/// Partition type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionType {
    App,
    Data,
    Custom(u8),
}

impl From<u8> for PartitionType {
    fn from(raw: u8) -> Self {
        match raw {
            0x00 => PartitionType::App,
            0x01 => PartitionType::Data,
            other => PartitionType::Custom(other),
        }
    }
}

impl From<PartitionType> for u8 {
    fn from(ty: PartitionType) -> Self {
        match ty {
            PartitionType::App => 0x00,
            PartitionType::Data => 0x01,
            PartitionType::Custom(raw) => raw,
        }
    }
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PartitionType::App => write!(f, "app"),
            PartitionType::Data => write!(f, "data"),
            PartitionType::Custom(raw) => write!(f, "{raw:#04x}"),
        }
    }
}

/// Well-known data partition subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
#[strum(serialize_all = "lowercase")]
pub enum DataType {
    Ota = 0x00,
    Phy = 0x01,
    Nvs = 0x02,
    Coredump = 0x03,
    #[strum(serialize = "nvs_keys")]
    NvsKeys = 0x04,
    Efuse = 0x05,
    Undefined = 0x06,
    Esphttpd = 0x80,
    Fat = 0x81,
    Spiffs = 0x82,
    #[strum(serialize = "littlefs")]
    LittleFs = 0x83,
}

/// Partition subtype, interpreted according to the partition type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubType {
    Factory,
    Ota(u8),
    Test,
    Data(DataType),
    Custom(u8),
}

impl SubType {
    pub fn decode(ty: PartitionType, raw: u8) -> Self {
        match (ty, raw) {
            (PartitionType::App, 0x00) => SubType::Factory,
            (PartitionType::App, 0x10..=0x1F) => SubType::Ota(raw - 0x10),
            (PartitionType::App, 0x20) => SubType::Test,
            (PartitionType::Data, _) => DataType::from_repr(raw)
                .map(SubType::Data)
                .unwrap_or(SubType::Custom(raw)),
            _ => SubType::Custom(raw),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            SubType::Factory => 0x00,
            SubType::Ota(n) => 0x10 + n,
            SubType::Test => 0x20,
            SubType::Data(ty) => *ty as u8,
            SubType::Custom(raw) => *raw,
        }
    }
}

impl fmt::Display for SubType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SubType::Factory => write!(f, "factory"),
            SubType::Ota(n) => write!(f, "ota_{n}"),
            SubType::Test => write!(f, "test"),
            SubType::Data(ty) => write!(f, "{ty}"),
            SubType::Custom(raw) => write!(f, "{raw:#04x}"),
        }
    }
}

bitflags! {
    /// Partition flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u32 {
        const ENCRYPTED = 1 << 0;
        const READONLY = 1 << 1;
    }
}

/// A single partition table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub ty: PartitionType,
    pub subtype: SubType,
    pub offset: u32,
    pub size: u32,
    pub label: String,
    pub flags: Flags,
}

impl Partition {
    /// Decode a 32 byte entry, returning `None` if the magic doesn't match
    pub fn decode(entry: &[u8]) -> Option<Self> {
        if entry.len() < ENTRY_LEN || entry[..2] != MAGIC_BYTES {
            return None;
        }

        let ty = PartitionType::from(entry[2]);
        Some(Partition {
            ty,
            subtype: SubType::decode(ty, entry[3]),
            offset: le_u32(entry, 4),
            size: le_u32(entry, 8),
            label: decode_str(&entry[12..28]),
            flags: Flags::from_bits_retain(le_u32(entry, 28)),
        })
    }

    pub fn encode(&self) -> [u8; ENTRY_LEN] {
        let mut out = [0u8; ENTRY_LEN];
        out[..2].copy_from_slice(&MAGIC_BYTES);
        out[2] = self.ty.into();
        out[3] = self.subtype.as_u8();
        out[4..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out[12..28].copy_from_slice(&super::encode_str::<16>(&self.label));
        out[28..32].copy_from_slice(&self.flags.bits().to_le_bytes());
        out
    }

    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }

    /// Whether the entry could describe a region of a flash of `flash_size`
    /// bytes
    fn is_plausible(&self, flash_size: u32) -> bool {
        self.size > 0
            && self.size != u32::MAX
            && self.offset != u32::MAX
            && self.end() <= flash_size as u64
    }
}

/// A decoded partition table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    /// Offset of the table in the flash image
    pub offset: u32,
    pub partitions: Vec<Partition>,
    /// Result of checking the MD5 entry, `None` if there is none
    pub md5_valid: Option<bool>,
}

impl PartitionTable {
    /// Parse the table located at `offset`
    pub async fn parse(image: &FlashImage, offset: u32) -> Result<Self, Error> {
        let len = MAX_TABLE_LEN.min(image.size().saturating_sub(offset));
        let data = image.read(offset, len as usize).await?;
        let table = Self::decode(&data, offset);

        if table.partitions.is_empty() {
            return Err(FormatError::BadMagic {
                offset,
                expected: u16::from_le_bytes(MAGIC_BYTES) as u32,
                found: data.get(..2).map_or(0, |m| u16::from_le_bytes([m[0], m[1]]) as u32),
            }
            .into());
        }

        if table.md5_valid == Some(false) {
            info!("Partition table at {:#x} has an invalid MD5 entry", offset);
        }

        Ok(table)
    }

    /// Decode a table from raw bytes, stopping at the first foreign entry
    pub fn decode(data: &[u8], offset: u32) -> Self {
        let mut partitions = vec![];
        let mut md5_valid = None;
        let mut hasher = Md5::new();

        for entry in data.chunks_exact(ENTRY_LEN) {
            if let Some(partition) = Partition::decode(entry) {
                hasher.update(entry);
                partitions.push(partition);
            } else {
                if entry[..16] == MD5_MAGIC_BYTES {
                    let computed = hasher.clone().finalize();
                    md5_valid = Some(computed.as_slice() == &entry[16..]);
                }
                break;
            }
        }

        PartitionTable {
            offset,
            partitions,
            md5_valid,
        }
    }

    /// Offset of the second stage bootloader
    ///
    /// An image is only accepted at the boot address of the chip named in
    /// its header.
    pub async fn find_bootloader(image: &FlashImage) -> Option<u32> {
        let mut offsets: Vec<u32> = Chip::iter().map(|chip| chip.boot_address()).collect();
        offsets.sort_unstable();
        offsets.dedup();

        for offset in offsets {
            let Ok(boot) = AppImage::parse(image, offset).await else {
                continue;
            };
            if boot
                .header
                .chip()
                .is_some_and(|chip| chip.boot_address() == offset)
            {
                debug!("Bootloader found at {:#x}", offset);
                return Some(offset);
            }
        }

        None
    }

    /// Locate the partition table by scanning past the second stage
    /// bootloader
    ///
    /// Every sector from the end of the bootloader image onwards is tried and
    /// the one holding the longest run of plausible entries wins; ties go to
    /// the lowest offset. Falls back to [DEFAULT_OFFSET].
    pub async fn discover_offset(image: &FlashImage, boot_offset: u32) -> Result<u32, Error> {
        let start = match AppImage::parse(image, boot_offset).await {
            Ok(boot) => boot.end().next_multiple_of(SECTOR),
            Err(err) => {
                debug!("No bootloader at {:#x}: {}", boot_offset, err);
                (boot_offset + SECTOR).next_multiple_of(SECTOR)
            }
        };

        let end = start
            .saturating_add(DISCOVERY_WINDOW)
            .min(image.size().saturating_sub(ENTRY_LEN as u32));

        let mut best: Option<(u32, usize)> = None;
        let mut candidate = start;
        while candidate <= end {
            let count = Self::count_plausible(image, candidate).await?;
            if count > 0 && best.is_none_or(|(_, n)| count > n) {
                best = Some((candidate, count));
            }
            candidate += SECTOR;
        }

        let offset = best.map_or(DEFAULT_OFFSET, |(offset, _)| offset);
        debug!("Partition table discovered at {:#x}", offset);

        Ok(offset)
    }

    async fn count_plausible(image: &FlashImage, offset: u32) -> Result<usize, Error> {
        // Cheap rejection before fetching the whole region
        if image.read(offset, 2).await? != MAGIC_BYTES {
            return Ok(0);
        }

        let len = MAX_TABLE_LEN.min(image.size() - offset);
        let data = image.read(offset, len as usize).await?;

        Ok(data
            .chunks_exact(ENTRY_LEN)
            .map_while(Partition::decode)
            .take_while(|p| p.is_plausible(image.size()))
            .count())
    }

    pub fn find_by_label(&self, label: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.label == label)
    }

    /// First partition with the given type and subtype
    pub fn find(&self, ty: PartitionType, subtype: SubType) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.ty == ty && p.subtype == subtype)
    }

    pub fn find_data(&self, ty: DataType) -> Option<&Partition> {
        self.find(PartitionType::Data, SubType::Data(ty))
    }

    /// OTA application partitions, ordered by slot number
    pub fn ota_apps(&self) -> Vec<&Partition> {
        let mut apps: Vec<_> = self
            .partitions
            .iter()
            .filter(|p| p.ty == PartitionType::App && matches!(p.subtype, SubType::Ota(_)))
            .collect();
        apps.sort_by_key(|p| p.subtype.as_u8());
        apps
    }

    /// Encode the table with a trailing MD5 entry
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.partitions.len() + 1) * ENTRY_LEN);
        for partition in &self.partitions {
            out.extend_from_slice(&partition.encode());
        }

        let digest = Md5::digest(&out);
        out.extend_from_slice(&MD5_MAGIC_BYTES);
        out.extend_from_slice(&digest);
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{format::app_image::tests::build_image, targets::Chip};

    fn partition(ty: PartitionType, subtype: SubType, offset: u32, size: u32, label: &str) -> Partition {
        Partition {
            ty,
            subtype,
            offset,
            size,
            label: label.into(),
            flags: Flags::empty(),
        }
    }

    /// The default ESP-IDF layout with two OTA slots
    pub(crate) fn ota_table() -> PartitionTable {
        PartitionTable {
            offset: DEFAULT_OFFSET,
            partitions: vec![
                partition(PartitionType::Data, SubType::Data(DataType::Nvs), 0x9000, 0x4000, "nvs"),
                partition(PartitionType::Data, SubType::Data(DataType::Ota), 0xd000, 0x2000, "otadata"),
                partition(PartitionType::Data, SubType::Data(DataType::Phy), 0xf000, 0x1000, "phy_init"),
                partition(PartitionType::App, SubType::Ota(0), 0x10000, 0x100000, "ota_0"),
                partition(PartitionType::App, SubType::Ota(1), 0x110000, 0x100000, "ota_1"),
            ],
            md5_valid: Some(true),
        }
    }

    #[tokio::test]
    async fn table_round_trips_with_md5() {
        let table = ota_table();
        let mut flash = vec![0xFF; 0x20_0000];
        let encoded = table.encode();
        flash[0x8000..][..encoded.len()].copy_from_slice(&encoded);

        let image = FlashImage::from_bytes(flash);
        let parsed = PartitionTable::parse(&image, 0x8000).await.unwrap();

        assert_eq!(parsed, table);
        assert_eq!(parsed.find_by_label("phy_init").unwrap().offset, 0xf000);
        assert_eq!(parsed.find_data(DataType::Ota).unwrap().label, "otadata");
        let slots: Vec<_> = parsed.ota_apps().iter().map(|p| p.label.as_str()).collect();
        assert_eq!(slots, ["ota_0", "ota_1"]);
    }

    #[test]
    fn corrupted_md5_is_reported() {
        let mut encoded = ota_table().encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let table = PartitionTable::decode(&encoded, 0);
        assert_eq!(table.partitions.len(), 5);
        assert_eq!(table.md5_valid, Some(false));
    }

    #[tokio::test]
    async fn missing_table_is_an_error() {
        let image = FlashImage::from_bytes(vec![0xFF; 0x10000]);
        assert!(matches!(
            PartitionTable::parse(&image, 0x8000).await,
            Err(Error::Format(FormatError::BadMagic { .. }))
        ));
    }

    #[test]
    fn subtypes_decode_by_type() {
        assert_eq!(SubType::decode(PartitionType::App, 0x12), SubType::Ota(2));
        assert_eq!(SubType::decode(PartitionType::Data, 0x82), SubType::Data(DataType::Spiffs));
        assert_eq!(SubType::decode(PartitionType::Custom(0x40), 0x82), SubType::Custom(0x82));
        assert_eq!(SubType::Data(DataType::NvsKeys).to_string(), "nvs_keys");
        assert_eq!(SubType::Ota(3).to_string(), "ota_3");
    }

    #[tokio::test]
    async fn offset_is_discovered_after_bootloader() {
        let bootloader = build_image(&[(0x3fff_0000, &[0x11; 0x2400])], true, Chip::Esp32c3);
        let encoded = ota_table().encode();

        let mut flash = vec![0xFF; 0x20_0000];
        flash[..bootloader.len()].copy_from_slice(&bootloader);
        flash[0xc000..][..encoded.len()].copy_from_slice(&encoded);
        // A lone stray entry closer to the bootloader loses against the full table
        flash[0x4000..][..32].copy_from_slice(&ota_table().partitions[0].encode());

        let image = FlashImage::from_bytes(flash);
        assert_eq!(PartitionTable::discover_offset(&image, 0).await.unwrap(), 0xc000);
    }

    #[tokio::test]
    async fn bootloader_is_found_at_its_chip_address() {
        let bootloader = build_image(&[(0x3fff_0000, &[0x11; 0x400])], true, Chip::Esp32s2);
        let mut flash = vec![0xFF; 0x20_0000];
        flash[0x1000..][..bootloader.len()].copy_from_slice(&bootloader);
        let image = FlashImage::from_bytes(flash.clone());
        assert_eq!(PartitionTable::find_bootloader(&image).await, Some(0x1000));

        // An ESP32-C3 bootloader does not belong at 0x1000
        let bootloader = build_image(&[(0x3fff_0000, &[0x11; 0x400])], true, Chip::Esp32c3);
        flash[0x1000..][..bootloader.len()].copy_from_slice(&bootloader);
        let image = FlashImage::from_bytes(flash);
        assert_eq!(PartitionTable::find_bootloader(&image).await, None);
    }

    #[tokio::test]
    async fn discovery_falls_back_to_default() {
        let image = FlashImage::from_bytes(vec![0xFF; 0x40000]);
        assert_eq!(
            PartitionTable::discover_offset(&image, 0x1000).await.unwrap(),
            DEFAULT_OFFSET
        );
    }
}
