//! FAT directory entries
//!
//! Short (8.3) entries, VFAT long file name entries and the DOS date/time
//! encoding.

use bitflags::bitflags;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::format::{le_u16, le_u32};

pub const ENTRY_LEN: usize = 32;
/// First name byte of a deleted entry
pub const DELETED: u8 = 0xE5;
/// First name byte marking the end of a directory
pub const END_OF_DIR: u8 = 0x00;

const LFN_LAST: u8 = 0x40;
const LFN_CHARS: usize = 13;
/// Byte offsets of the UTF-16 code units in a long name entry
const LFN_CHAR_OFFSETS: [usize; LFN_CHARS] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
/// Case flags in the reserved byte, as written by Windows NT and FatFs
const NT_LOWER_BASE: u8 = 0x08;
const NT_LOWER_EXT: u8 = 0x10;

bitflags! {
    /// Directory entry attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
        const LONG_NAME = Self::READ_ONLY.bits()
            | Self::HIDDEN.bits()
            | Self::SYSTEM.bits()
            | Self::VOLUME_ID.bits();
    }
}

/// A decoded directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Long name if present, otherwise the short name
    pub name: String,
    pub short_name: String,
    /// Full path from the root, `/` separated
    pub path: String,
    pub attributes: Attributes,
    pub cluster: u32,
    pub size: u32,
    pub created: Option<NaiveDateTime>,
    pub modified: Option<NaiveDateTime>,
    /// Volume offset of the short entry
    pub offset: u64,
    /// Volume offsets of the long name entries belonging to this entry
    pub lfn_offsets: Vec<u64>,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }

    /// Case-insensitive match against the long or the short name
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name) || self.short_name.eq_ignore_ascii_case(name)
    }
}

/// The fields of a raw 32 byte short entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawEntry {
    pub name: [u8; 11],
    pub attributes: Attributes,
    pub nt_flags: u8,
    pub cluster: u32,
    pub size: u32,
    pub created: Option<NaiveDateTime>,
    pub modified: Option<NaiveDateTime>,
}

impl RawEntry {
    pub fn decode(bytes: &[u8]) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&bytes[..11]);

        RawEntry {
            name,
            attributes: Attributes::from_bits_retain(bytes[11]),
            nt_flags: bytes[12],
            cluster: (le_u16(bytes, 20) as u32) << 16 | le_u16(bytes, 26) as u32,
            size: le_u32(bytes, 28),
            created: decode_datetime(le_u16(bytes, 16), le_u16(bytes, 14)),
            modified: decode_datetime(le_u16(bytes, 24), le_u16(bytes, 22)),
        }
    }

    pub fn encode(&self) -> [u8; ENTRY_LEN] {
        let mut out = [0u8; ENTRY_LEN];
        out[..11].copy_from_slice(&self.name);
        out[11] = self.attributes.bits();
        out[12] = self.nt_flags;

        if let Some(created) = self.created {
            let (date, time) = encode_datetime(created);
            out[14..16].copy_from_slice(&time.to_le_bytes());
            out[16..18].copy_from_slice(&date.to_le_bytes());
            out[18..20].copy_from_slice(&date.to_le_bytes());
        }
        out[20..22].copy_from_slice(&((self.cluster >> 16) as u16).to_le_bytes());
        if let Some(modified) = self.modified {
            let (date, time) = encode_datetime(modified);
            out[22..24].copy_from_slice(&time.to_le_bytes());
            out[24..26].copy_from_slice(&date.to_le_bytes());
        }
        out[26..28].copy_from_slice(&(self.cluster as u16).to_le_bytes());
        out[28..32].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn is_long_name(&self) -> bool {
        self.attributes.contains(Attributes::LONG_NAME)
    }

    /// The 8.3 name in its display form, honouring the NT case flags
    pub fn short_name(&self) -> String {
        let mut base = self.name[..8].to_vec();
        if base[0] == 0x05 {
            base[0] = DELETED;
        }
        let mut base = String::from_utf8_lossy(&base).trim_end().to_string();
        let mut ext = String::from_utf8_lossy(&self.name[8..]).trim_end().to_string();

        if self.nt_flags & NT_LOWER_BASE != 0 {
            base = base.to_ascii_lowercase();
        }
        if self.nt_flags & NT_LOWER_EXT != 0 {
            ext = ext.to_ascii_lowercase();
        }

        if ext.is_empty() {
            base
        } else {
            format!("{base}.{ext}")
        }
    }
}

/// Checksum of a short name stored in each of its long name entries
pub(crate) fn lfn_checksum(name: &[u8; 11]) -> u8 {
    name.iter()
        .fold(0u8, |sum, &b| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b))
}

/// A decoded long file name entry
#[derive(Debug, Clone)]
pub(crate) struct LfnEntry {
    pub ordinal: u8,
    pub last: bool,
    pub checksum: u8,
    pub chars: [u16; LFN_CHARS],
}

impl LfnEntry {
    pub fn decode(bytes: &[u8]) -> Self {
        let mut chars = [0u16; LFN_CHARS];
        for (c, &offset) in chars.iter_mut().zip(LFN_CHAR_OFFSETS.iter()) {
            *c = le_u16(bytes, offset);
        }

        LfnEntry {
            ordinal: bytes[0] & 0x1F,
            last: bytes[0] & LFN_LAST != 0,
            checksum: bytes[13],
            chars,
        }
    }
}

/// Collects long name entries until their short entry shows up
#[derive(Debug, Default)]
pub(crate) struct LfnAccumulator {
    parts: Vec<(LfnEntry, u64)>,
}

impl LfnAccumulator {
    pub fn push(&mut self, entry: LfnEntry, offset: u64) {
        if entry.last {
            self.parts.clear();
        }
        self.parts.push((entry, offset));
    }

    pub fn reset(&mut self) {
        self.parts.clear();
    }

    /// Assemble the long name for `short`, if the collected parts belong to
    /// it
    pub fn take(&mut self, short: &[u8; 11]) -> Option<(String, Vec<u64>)> {
        let parts = std::mem::take(&mut self.parts);
        let checksum = lfn_checksum(short);

        let complete = !parts.is_empty()
            && parts[0].0.last
            && parts.iter().all(|(e, _)| e.checksum == checksum)
            && parts
                .iter()
                .rev()
                .enumerate()
                .all(|(i, (e, _))| e.ordinal as usize == i + 1);
        if !complete {
            return None;
        }

        let units: Vec<u16> = parts
            .iter()
            .rev()
            .flat_map(|(e, _)| e.chars)
            .take_while(|&c| c != 0x0000 && c != 0xFFFF)
            .collect();
        let offsets = parts.iter().map(|(_, offset)| *offset).collect();

        Some((String::from_utf16_lossy(&units), offsets))
    }
}

/// Long name entries for `name`, in on-disk order
pub(crate) fn encode_lfn(name: &str, short: &[u8; 11]) -> Vec<[u8; ENTRY_LEN]> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let count = units.len().div_ceil(LFN_CHARS);
    let checksum = lfn_checksum(short);

    (1..=count)
        .rev()
        .map(|ordinal| {
            let mut out = [0u8; ENTRY_LEN];
            out[0] = ordinal as u8 | if ordinal == count { LFN_LAST } else { 0 };
            out[11] = Attributes::LONG_NAME.bits();
            out[13] = checksum;

            let chunk = &units[(ordinal - 1) * LFN_CHARS..];
            for (i, &offset) in LFN_CHAR_OFFSETS.iter().enumerate() {
                let unit = match chunk.get(i) {
                    Some(&c) => c,
                    // Terminator right after the name, padding after that
                    None if i == chunk.len() => 0x0000,
                    _ => 0xFFFF,
                };
                out[offset..offset + 2].copy_from_slice(&unit.to_le_bytes());
            }
            out
        })
        .collect()
}

const INVALID_SHORT_CHARS: &[u8] = b"\"*+,./:;<=>?[\\]|";

/// Whether `name` can be stored as a short name on its own, returning the
/// encoded name and NT case flags
pub(crate) fn exact_short_name(name: &str) -> Option<([u8; 11], u8)> {
    let (base, ext) = match name.rsplit_once('.') {
        Some((base, ext)) => (base, ext),
        None => (name, ""),
    };

    let valid = |part: &str, max: usize| {
        part.len() <= max
            && part
                .bytes()
                .all(|b| b.is_ascii_graphic() && !INVALID_SHORT_CHARS.contains(&b))
    };
    if base.is_empty() || !valid(base, 8) || !valid(ext, 3) {
        return None;
    }

    let mut flags = 0;
    for (part, flag) in [(base, NT_LOWER_BASE), (ext, NT_LOWER_EXT)] {
        let lower = part.bytes().any(|b| b.is_ascii_lowercase());
        let upper = part.bytes().any(|b| b.is_ascii_uppercase());
        match (lower, upper) {
            (true, true) => return None,
            (true, false) => flags |= flag,
            _ => {}
        }
    }

    let mut out = [b' '; 11];
    out[..base.len()].copy_from_slice(base.to_ascii_uppercase().as_bytes());
    out[8..8 + ext.len()].copy_from_slice(ext.to_ascii_uppercase().as_bytes());

    Some((out, flags))
}

/// Generate a `BASE~N.EXT` short name for a name needing a long entry
pub(crate) fn numbered_short_name(name: &str, n: u32) -> [u8; 11] {
    let (base, ext) = match name.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() => (base, ext),
        _ => (name, ""),
    };
    let clean = |s: &str| -> Vec<u8> {
        s.bytes()
            .filter(|b| b.is_ascii_graphic() && !INVALID_SHORT_CHARS.contains(b))
            .map(|b| b.to_ascii_uppercase())
            .collect()
    };

    let tail = format!("~{n}");
    let mut base = clean(base);
    base.truncate(8 - tail.len());
    if base.is_empty() {
        base.push(b'_');
    }
    base.extend_from_slice(tail.as_bytes());
    let mut ext = clean(ext);
    ext.truncate(3);

    let mut out = [b' '; 11];
    out[..base.len()].copy_from_slice(&base);
    out[8..8 + ext.len()].copy_from_slice(&ext);
    out
}

fn decode_datetime(date: u16, time: u16) -> Option<NaiveDateTime> {
    if date == 0 {
        return None;
    }

    NaiveDate::from_ymd_opt(
        1980 + (date >> 9) as i32,
        ((date >> 5) & 0x0F) as u32,
        (date & 0x1F) as u32,
    )?
    .and_hms_opt(
        (time >> 11) as u32,
        ((time >> 5) & 0x3F) as u32,
        (time & 0x1F) as u32 * 2,
    )
}

fn encode_datetime(value: NaiveDateTime) -> (u16, u16) {
    let year = value.year().clamp(1980, 2107) as u16 - 1980;
    let date = year << 9 | (value.month() as u16) << 5 | value.day() as u16;
    let time = (value.hour() as u16) << 11 | (value.minute() as u16) << 5 | (value.second() / 2) as u16;

    (date, time)
}
