//! OTA data partition: which OTA app slot boots next
//!
//! The partition holds two 4 KiB sectors, each starting with a 32 byte entry.
//! The valid entry with the higher sequence number wins; sequence `n`
//! selects app slot `(n - 1) % app_count`.

use std::fmt;

use log::debug;
use strum::FromRepr;

use super::{crc::crc32, decode_str, encode_str, le_u32};
use crate::{
    error::{Error, FormatError},
    image::FlashImage,
};

pub const OTA_SECTOR_SIZE: u32 = 0x1000;
const ENTRY_LEN: usize = 32;

/// Image state as recorded by the bootloader's rollback support
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum OtaState {
    New = 0,
    PendingVerify = 1,
    Valid = 2,
    Invalid = 3,
    Aborted = 4,
    Undefined = 0xFFFF_FFFF,
}

impl fmt::Display for OtaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OtaState::New => "new",
            OtaState::PendingVerify => "pending verify",
            OtaState::Valid => "valid",
            OtaState::Invalid => "invalid",
            OtaState::Aborted => "aborted",
            OtaState::Undefined => "undefined",
        };
        write!(f, "{name}")
    }
}

/// One of the two selector entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaEntry {
    pub sequence: u32,
    pub label: String,
    /// Raw state word, see [OtaEntry::state]
    pub raw_state: u32,
    pub stored_crc: u32,
}

impl OtaEntry {
    pub fn decode(bytes: &[u8]) -> Self {
        OtaEntry {
            sequence: le_u32(bytes, 0),
            label: decode_str(&bytes[4..24]),
            raw_state: le_u32(bytes, 24),
            stored_crc: le_u32(bytes, 28),
        }
    }

    /// A new entry with a correct CRC
    pub fn new(sequence: u32, state: OtaState) -> Self {
        OtaEntry {
            sequence,
            label: String::new(),
            raw_state: state as u32,
            stored_crc: crc32(&sequence.to_le_bytes()),
        }
    }

    pub fn encode(&self) -> [u8; ENTRY_LEN] {
        let mut out = [0xFF; ENTRY_LEN];
        out[0..4].copy_from_slice(&self.sequence.to_le_bytes());
        if !self.label.is_empty() {
            out[4..24].copy_from_slice(&encode_str::<20>(&self.label));
        }
        out[24..28].copy_from_slice(&self.raw_state.to_le_bytes());
        out[28..32].copy_from_slice(&self.stored_crc.to_le_bytes());
        out
    }

    pub fn state(&self) -> Option<OtaState> {
        OtaState::from_repr(self.raw_state)
    }

    pub fn crc_valid(&self) -> bool {
        crc32(&self.sequence.to_le_bytes()) == self.stored_crc
    }

    /// Whether the bootloader would consider this entry
    pub fn is_valid(&self) -> bool {
        self.sequence != u32::MAX
            && self.crc_valid()
            && !matches!(self.state(), Some(OtaState::Invalid | OtaState::Aborted))
    }
}

/// The decoded OTA data partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaData {
    /// Offset of the partition in the flash image
    pub offset: u32,
    pub entries: [OtaEntry; 2],
}

impl OtaData {
    pub async fn parse(image: &FlashImage, offset: u32) -> Result<Self, Error> {
        let mut entries = Vec::with_capacity(2);
        for slot in 0..2 {
            let bytes = image
                .read(offset + slot * OTA_SECTOR_SIZE, ENTRY_LEN)
                .await?;
            entries.push(OtaEntry::decode(&bytes));
        }

        let [first, second]: [OtaEntry; 2] = entries
            .try_into()
            .map_err(|_| FormatError::NotFound("OTA data entries".into()))?;

        Ok(OtaData {
            offset,
            entries: [first, second],
        })
    }

    /// Slot index of the entry in effect, `None` if neither is valid
    pub fn active(&self) -> Option<usize> {
        match (self.entries[0].is_valid(), self.entries[1].is_valid()) {
            (true, true) if self.entries[1].sequence > self.entries[0].sequence => Some(1),
            (true, _) => Some(0),
            (false, true) => Some(1),
            (false, false) => None,
        }
    }

    pub fn active_entry(&self) -> Option<&OtaEntry> {
        self.active().map(|slot| &self.entries[slot])
    }

    /// OTA app slot that boots next; `None` means the factory app
    pub fn boot_app_index(&self, ota_app_count: usize) -> Option<usize> {
        if ota_app_count == 0 {
            return None;
        }
        self.active_entry()
            .map(|entry| (entry.sequence as usize).wrapping_sub(1) % ota_app_count)
    }

    /// Make OTA app slot `app_index` boot next
    ///
    /// The entry is written to the slot not currently in effect, with the
    /// smallest sequence above the active one that maps to `app_index`.
    pub fn select(&mut self, image: &FlashImage, app_index: usize, ota_app_count: usize) -> Result<(), Error> {
        if app_index >= ota_app_count {
            return Err(FormatError::NotFound(format!(
                "OTA app slot {app_index} ({ota_app_count} available)"
            ))
            .into());
        }

        let target = match self.active() {
            Some(0) => 1,
            _ => 0,
        };
        let address = self.offset + target as u32 * OTA_SECTOR_SIZE;

        // Smallest sequence above the current one that boots `app_index`
        let current = self.active_entry().map_or(0, |entry| entry.sequence);
        let count = ota_app_count as u64;
        let next = current as u64 + 1;
        let sequence = next + (app_index as u64 + count - (next - 1) % count) % count;
        // All-ones is the erased value
        let sequence = u32::try_from(sequence)
            .ok()
            .filter(|&sequence| sequence != u32::MAX)
            .ok_or(FormatError::Implausible {
                what: "OTA sequence",
                offset: address,
                value: current,
            })?;

        let entry = OtaEntry::new(sequence, OtaState::Valid);
        image.write(address, &entry.encode())?;
        self.entries[target] = entry;

        debug!(
            "OTA data slot {} now selects app {} (sequence {})",
            target, app_index, sequence
        );
        Ok(())
    }

    /// Erase both entries, so the factory app boots
    pub fn erase(&mut self, image: &FlashImage) -> Result<(), Error> {
        let blank = vec![0xFF; OTA_SECTOR_SIZE as usize];
        for slot in 0..2 {
            image.write(self.offset + slot * OTA_SECTOR_SIZE, &blank)?;
        }
        self.entries = [
            OtaEntry::decode(&[0xFF; ENTRY_LEN]),
            OtaEntry::decode(&[0xFF; ENTRY_LEN]),
        ];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn image_with(entries: [Option<OtaEntry>; 2]) -> FlashImage {
        let mut flash = vec![0xFF; 0xd000 + 2 * OTA_SECTOR_SIZE as usize];
        for (slot, entry) in entries.iter().enumerate() {
            if let Some(entry) = entry {
                let at = 0xd000 + slot * OTA_SECTOR_SIZE as usize;
                flash[at..at + ENTRY_LEN].copy_from_slice(&entry.encode());
            }
        }
        FlashImage::from_bytes(flash)
    }

    #[tokio::test]
    async fn higher_sequence_wins() {
        let image = image_with([
            Some(OtaEntry::new(5, OtaState::Valid)),
            Some(OtaEntry::new(3, OtaState::Valid)),
        ]);
        let ota = OtaData::parse(&image, 0xd000).await.unwrap();

        assert!(ota.entries[0].crc_valid());
        assert_eq!(ota.entries[0].stored_crc, 0xc821_0fcd);
        assert_eq!(ota.active(), Some(0));
        assert_eq!(ota.boot_app_index(2), Some(0));
    }

    #[tokio::test]
    async fn invalid_entries_are_ignored() {
        let mut corrupt = OtaEntry::new(9, OtaState::Valid);
        corrupt.stored_crc ^= 1;
        let image = image_with([Some(corrupt), Some(OtaEntry::new(2, OtaState::Aborted))]);
        let ota = OtaData::parse(&image, 0xd000).await.unwrap();
        assert_eq!(ota.active(), None);
        assert_eq!(ota.boot_app_index(2), None);

        let image = image_with([None, Some(OtaEntry::new(2, OtaState::New))]);
        let ota = OtaData::parse(&image, 0xd000).await.unwrap();
        assert_eq!(ota.active(), Some(1));
        assert_eq!(ota.boot_app_index(2), Some(1));
    }

    #[tokio::test]
    async fn select_and_erase() {
        let image = image_with([Some(OtaEntry::new(1, OtaState::Valid)), None]);
        let mut ota = OtaData::parse(&image, 0xd000).await.unwrap();
        assert_eq!(ota.boot_app_index(2), Some(0));

        ota.select(&image, 1, 2).unwrap();
        let reparsed = OtaData::parse(&image, 0xd000).await.unwrap();
        assert_eq!(reparsed.active(), Some(1));
        assert_eq!(reparsed.entries[1].sequence, 2);
        assert_eq!(reparsed.boot_app_index(2), Some(1));

        ota.select(&image, 1, 2).unwrap();
        assert_eq!(ota.entries[0].sequence, 4);
        assert_eq!(ota.boot_app_index(2), Some(1));

        ota.erase(&image).unwrap();
        let reparsed = OtaData::parse(&image, 0xd000).await.unwrap();
        assert_eq!(reparsed.active(), None);
        assert!(matches!(
            ota.select(&image, 2, 2),
            Err(Error::Format(FormatError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn select_refuses_to_wrap_the_sequence() {
        let image = image_with([Some(OtaEntry::new(0xFFFF_FFFE, OtaState::Valid)), None]);
        let mut ota = OtaData::parse(&image, 0xd000).await.unwrap();

        for app in 0..2 {
            assert!(matches!(
                ota.select(&image, app, 2),
                Err(Error::Format(FormatError::Implausible {
                    what: "OTA sequence",
                    offset: 0xe000,
                    value: 0xFFFF_FFFE,
                }))
            ));
        }
        assert!(!image.is_dirty());
        assert_eq!(ota.active(), Some(0));
    }
}
