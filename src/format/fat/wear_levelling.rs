//! ESP-IDF wear levelling layer
//!
//! The last three sectors of a wear levelled partition hold two copies of
//! the state sector and a config sector. The FAT volume lives in the sectors
//! before them, rotated by `move_count` and with one dummy sector skipped.

use log::debug;

use crate::{
    error::Error,
    format::le_u32,
    image::FlashImage,
};

/// Granularity of the translation
pub const WL_SECTOR_SIZE: u32 = 0x1000;
/// Three footer sectors plus the dummy sector
const RESERVED_SECTORS: u32 = 4;
/// `wl_state_t` including its reserved words and CRC
const STATE_HEADER_LEN: usize = 64;
const STATE_RECORD_LEN: usize = 16;

/// The wear levelling state record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WlState {
    pub pos: u32,
    pub max_pos: u32,
    pub move_count: u32,
    pub access_count: u32,
    pub max_count: u32,
    pub block_size: u32,
    pub version: u32,
    pub device_id: u32,
    /// Number of move records following the state
    pub total_records: u32,
}

impl WlState {
    /// Decode a state sector
    pub fn decode(sector: &[u8]) -> Self {
        let total_records = sector
            .get(STATE_HEADER_LEN..)
            .unwrap_or_default()
            .chunks_exact(STATE_RECORD_LEN)
            .take_while(|record| record.iter().any(|&b| b != 0xFF))
            .count() as u32;

        WlState {
            pos: le_u32(sector, 0),
            max_pos: le_u32(sector, 4),
            move_count: le_u32(sector, 8),
            access_count: le_u32(sector, 12),
            max_count: le_u32(sector, 16),
            block_size: le_u32(sector, 20),
            version: le_u32(sector, 24),
            device_id: le_u32(sector, 28),
            total_records,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.pos != u32::MAX && self.block_size == WL_SECTOR_SIZE
    }
}

/// Maps logical FAT sectors onto physical partition sectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WearLevelling {
    pub state: WlState,
    /// Number of sectors available to the FAT volume
    pub fat_sectors: u32,
}

impl WearLevelling {
    pub fn new(state: WlState, partition_len: u32) -> Self {
        WearLevelling {
            state,
            fat_sectors: (partition_len / WL_SECTOR_SIZE).saturating_sub(RESERVED_SECTORS),
        }
    }

    /// Read the footer of the partition at `base`, `None` if neither state
    /// copy is valid
    pub async fn detect(image: &FlashImage, base: u32, len: u32) -> Result<Option<Self>, Error> {
        if len < RESERVED_SECTORS * WL_SECTOR_SIZE {
            return Ok(None);
        }

        for copy in [3, 2] {
            let offset = base + len - copy * WL_SECTOR_SIZE;
            let sector = image.read(offset, WL_SECTOR_SIZE as usize).await?;
            let state = WlState::decode(&sector);

            if state.is_valid() {
                debug!(
                    "Wear levelling state at {:#x}: move_count {}, {} record(s)",
                    offset, state.move_count, state.total_records
                );
                return Ok(Some(WearLevelling::new(state, len)));
            }
        }

        Ok(None)
    }

    /// Physical sector holding logical sector `logical`
    pub fn translate_sector(&self, logical: u32) -> u32 {
        if self.fat_sectors == 0 {
            return logical;
        }

        let shifted = logical as u64 + self.state.move_count as u64;
        let mut translated = (shifted % self.fat_sectors as u64) as u32;
        if translated >= self.state.total_records {
            translated += 1;
        }
        translated
    }

    /// Physical byte offset of logical byte offset `logical`
    pub fn translate(&self, logical: u64) -> u64 {
        let sector = (logical / WL_SECTOR_SIZE as u64) as u32;
        let within = logical % WL_SECTOR_SIZE as u64;

        self.translate_sector(sector) as u64 * WL_SECTOR_SIZE as u64 + within
    }

    /// Size of the logical volume in bytes
    pub fn volume_len(&self) -> u64 {
        self.fat_sectors as u64 * WL_SECTOR_SIZE as u64
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn state_sector(move_count: u32, records: usize) -> Vec<u8> {
        let mut sector = vec![0xFF; WL_SECTOR_SIZE as usize];
        let fields = [0, 0x10, move_count, 0, 0x10, WL_SECTOR_SIZE, 2, 0x1234];
        for (i, field) in fields.iter().enumerate() {
            sector[i * 4..][..4].copy_from_slice(&field.to_le_bytes());
        }
        for i in 0..records {
            sector[STATE_HEADER_LEN + i * STATE_RECORD_LEN] = 0x00;
        }
        sector
    }

    #[test]
    fn translation_rotates_and_skips() {
        let state = WlState {
            total_records: 3,
            ..WlState::decode(&state_sector(2, 3))
        };
        let wl = WearLevelling { state, fat_sectors: 10 };

        assert_eq!(wl.translate_sector(0), 2);
        assert_eq!(wl.translate_sector(1), 4);
        assert_eq!(wl.translate_sector(8), 0);
        assert_eq!(wl.translate(0x1010), 4 * 0x1000 + 0x10);
    }

    #[test]
    fn corrupt_move_count_stays_in_range() {
        let state = WlState::decode(&state_sector(u32::MAX, 0));
        let wl = WearLevelling { state, fat_sectors: 10 };

        // (0xFFFF_FFFF + 3) % 10 = 8, bumped past the dummy sector
        assert_eq!(wl.translate_sector(3), 9);
    }

    #[test]
    fn state_counts_records() {
        let state = WlState::decode(&state_sector(5, 7));
        assert_eq!(state.move_count, 5);
        assert_eq!(state.total_records, 7);
        assert!(state.is_valid());
        assert!(!WlState::decode(&[0xFF; 4096]).is_valid());
    }

    #[tokio::test]
    async fn second_copy_is_used_when_first_is_erased() {
        let len = 16 * WL_SECTOR_SIZE;
        let mut data = vec![0xFF; len as usize];
        data[(len - 2 * WL_SECTOR_SIZE) as usize..][..4096].copy_from_slice(&state_sector(4, 1));

        let image = FlashImage::from_bytes(data);
        let wl = WearLevelling::detect(&image, 0, len).await.unwrap().unwrap();

        assert_eq!(wl.state.move_count, 4);
        assert_eq!(wl.fat_sectors, 12);
    }
}
