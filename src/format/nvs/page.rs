use std::fmt;

use strum::Display;

use crate::format::{crc::crc32, le_u32};

pub const PAGE_SIZE: usize = 0x1000;
pub const ENTRY_SIZE: usize = 32;
pub const ENTRY_COUNT: usize = 126;
pub const HEADER_SIZE: usize = 32;
pub const BITMAP_OFFSET: usize = 32;
pub const FIRST_ENTRY_OFFSET: usize = 64;
/// Format version written to freshly initialised pages
pub const PAGE_VERSION: u8 = 0xFE;

/// Lifecycle state stored in the first word of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Uninit,
    Active,
    Full,
    Freeing,
    Corrupt,
    Invalid,
    Unknown(u32),
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageState::Uninit => write!(f, "UNINIT"),
            PageState::Active => write!(f, "ACTIVE"),
            PageState::Full => write!(f, "FULL"),
            PageState::Freeing => write!(f, "FREEING"),
            PageState::Corrupt => write!(f, "CORRUPT"),
            PageState::Invalid => write!(f, "INVALID"),
            PageState::Unknown(value) => write!(f, "UNKNOWN({value:#x})"),
        }
    }
}

impl From<u32> for PageState {
    fn from(value: u32) -> Self {
        match value {
            0xFFFF_FFFF => PageState::Uninit,
            0xFFFF_FFFE => PageState::Active,
            0xFFFF_FFFC => PageState::Full,
            0xFFFF_FFF8 => PageState::Freeing,
            0xFFFF_FFF0 => PageState::Corrupt,
            0x0000_0000 => PageState::Invalid,
            other => PageState::Unknown(other),
        }
    }
}

impl From<PageState> for u32 {
    fn from(state: PageState) -> Self {
        match state {
            PageState::Uninit => 0xFFFF_FFFF,
            PageState::Active => 0xFFFF_FFFE,
            PageState::Full => 0xFFFF_FFFC,
            PageState::Freeing => 0xFFFF_FFF8,
            PageState::Corrupt => 0xFFFF_FFF0,
            PageState::Invalid => 0,
            PageState::Unknown(value) => value,
        }
    }
}

impl PageState {
    /// Pages whose entries are meaningful
    pub fn holds_entries(&self) -> bool {
        matches!(self, PageState::Active | PageState::Full | PageState::Freeing)
    }
}

/// State of one entry slot in the page bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EntryState {
    Empty,
    Written,
    Erased,
    Illegal,
}

impl EntryState {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b11 => EntryState::Empty,
            0b10 => EntryState::Written,
            0b00 => EntryState::Erased,
            _ => EntryState::Illegal,
        }
    }

    pub(crate) fn bits(&self) -> u8 {
        match self {
            EntryState::Empty => 0b11,
            EntryState::Written => 0b10,
            EntryState::Erased => 0b00,
            EntryState::Illegal => 0b01,
        }
    }
}

/// Byte of the bitmap holding the state of `slot`, and the shift within it
pub(crate) fn bitmap_position(slot: usize) -> (usize, u32) {
    (BITMAP_OFFSET + slot / 4, (slot % 4) as u32 * 2)
}

/// `byte` with the state of `slot` replaced
pub(crate) fn with_entry_state(byte: u8, slot: usize, state: EntryState) -> u8 {
    let (_, shift) = bitmap_position(slot);
    (byte & !(0b11 << shift)) | (state.bits() << shift)
}

/// A decoded NVS page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvsPage {
    /// Page number within the partition
    pub index: u32,
    /// Offset of the page in the flash image
    pub address: u32,
    pub state: PageState,
    pub sequence: u32,
    pub version: u8,
    pub stored_crc: u32,
    pub computed_crc: u32,
    pub entries: Vec<EntryState>,
}

impl NvsPage {
    pub fn decode(index: u32, address: u32, bytes: &[u8]) -> Self {
        let entries = (0..ENTRY_COUNT)
            .map(|slot| {
                let (byte, shift) = bitmap_position(slot);
                EntryState::from_bits(bytes[byte] >> shift)
            })
            .collect();

        NvsPage {
            index,
            address,
            state: PageState::from(le_u32(bytes, 0)),
            sequence: le_u32(bytes, 4),
            version: bytes[8],
            stored_crc: le_u32(bytes, 28),
            computed_crc: crc32(&bytes[4..28]),
            entries,
        }
    }

    pub fn header_crc_valid(&self) -> bool {
        self.stored_crc == self.computed_crc
    }

    /// Address of entry slot `slot`
    pub fn entry_address(&self, slot: usize) -> u32 {
        self.address + (FIRST_ENTRY_OFFSET + slot * ENTRY_SIZE) as u32
    }

    /// First run of `span` empty slots
    pub fn find_free(&self, span: usize) -> Option<usize> {
        let mut run = 0;
        for (slot, state) in self.entries.iter().enumerate() {
            run = if *state == EntryState::Empty { run + 1 } else { 0 };
            if run == span {
                return Some(slot + 1 - span);
            }
        }
        None
    }
}

/// Header of a freshly initialised active page
pub(crate) fn encode_header(sequence: u32) -> [u8; HEADER_SIZE] {
    let mut header = [0xFF; HEADER_SIZE];
    header[0..4].copy_from_slice(&u32::from(PageState::Active).to_le_bytes());
    header[4..8].copy_from_slice(&sequence.to_le_bytes());
    header[8] = PAGE_VERSION;
    let crc = crc32(&header[4..28]);
    header[28..32].copy_from_slice(&crc.to_le_bytes());
    header
}
