//! Supported target devices
//!
//! Per-chip constants (magic register values, image chip ids, boot offsets)
//! are static configuration data indexed by [Chip].

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, VariantNames};

use crate::Error;

/// Address of the register holding the chip detection magic value
pub(crate) const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// All supported devices
#[derive(
    Debug,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
    Deserialize,
    Serialize,
)]
#[non_exhaustive]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Chip {
    /// ESP32
    Esp32,
    /// ESP32-C2, ESP8684
    Esp32c2,
    /// ESP32-C3, ESP8685
    Esp32c3,
    /// ESP32-C5
    Esp32c5,
    /// ESP32-C6
    Esp32c6,
    /// ESP32-H2
    Esp32h2,
    /// ESP32-P4
    Esp32p4,
    /// ESP32-S2
    Esp32s2,
    /// ESP32-S3
    Esp32s3,
}

impl Chip {
    /// Create a [Chip] from the value of the magic register.
    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        Chip::iter()
            .find(|chip| chip.has_magic_value(magic))
            .ok_or(Error::ChipDetectError(magic))
    }

    /// Check if the magic value belongs to this chip
    pub fn has_magic_value(&self, value: u32) -> bool {
        let magic: &[u32] = match self {
            Chip::Esp32 => &[0x00f0_1d83],
            Chip::Esp32c2 => &[
                0x6f51_306f, // ECO0
                0x7c41_a06f, // ECO1
            ],
            Chip::Esp32c3 => &[
                0x6921_506f, // ECO1 + ECO2
                0x1b31_506f, // ECO3
                0x4881_606f, // ECO6
                0x4361_606f, // ECO7
            ],
            Chip::Esp32c5 => &[0x1101_406f, 0x63e1_406f, 0x5fd1_406f],
            Chip::Esp32c6 => &[0x2ce0_806f],
            Chip::Esp32h2 => &[0xd7b7_3e80],
            // The P4 has no usable magic value, it always reports its chip id
            Chip::Esp32p4 => &[0x0add_bad0],
            Chip::Esp32s2 => &[0x0000_07c6],
            Chip::Esp32s3 => &[0x9],
        };

        magic.contains(&value)
    }

    /// Chip id as stored in the extended image header and reported by the
    /// `GET_SECURITY_INFO` command
    pub fn id(&self) -> u16 {
        match self {
            Chip::Esp32 => 0,
            Chip::Esp32c2 => 12,
            Chip::Esp32c3 => 5,
            Chip::Esp32c5 => 23,
            Chip::Esp32c6 => 13,
            Chip::Esp32h2 => 16,
            Chip::Esp32p4 => 18,
            Chip::Esp32s2 => 2,
            Chip::Esp32s3 => 9,
        }
    }

    /// Flash offset of the second stage bootloader
    pub fn boot_address(&self) -> u32 {
        match self {
            Chip::Esp32 | Chip::Esp32s2 => 0x1000,
            Chip::Esp32p4 | Chip::Esp32c5 => 0x2000,
            _ => 0x0,
        }
    }

    /// Whether the ROM loader of this chip expects the `encrypted` word in
    /// `FLASH_BEGIN`/`MEM_BEGIN`
    pub fn rom_supports_encryption_flag(&self) -> bool {
        *self != Chip::Esp32
    }
}

impl TryFrom<u16> for Chip {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Chip::iter()
            .find(|chip| chip.id() == value)
            .ok_or(Error::UnknownChipId(value))
    }
}
