use std::fmt;

use strum::{Display, FromRepr};

use super::page::ENTRY_SIZE;
use crate::format::{
    crc::{crc32, crc32_parts},
    decode_str,
    le_u16,
    le_u32,
};

/// Longest key, excluding the terminating NUL
pub const MAX_KEY_LEN: usize = 15;
/// Chunk index of items that are not blob chunks
pub const CHUNK_ANY: u8 = 0xFF;

/// Type tag of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemType {
    U8 = 0x01,
    I8 = 0x11,
    U16 = 0x02,
    I16 = 0x12,
    U32 = 0x04,
    I32 = 0x14,
    U64 = 0x08,
    I64 = 0x18,
    Str = 0x21,
    /// Single-entry blob of the original format
    Blob = 0x41,
    BlobData = 0x42,
    BlobIdx = 0x48,
}

impl ItemType {
    /// Types whose payload follows the header entry
    pub fn is_variable_length(&self) -> bool {
        matches!(self, ItemType::Str | ItemType::Blob | ItemType::BlobData)
    }
}

/// A decoded value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NvsValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    Str(String),
    Blob(Vec<u8>),
    /// Index of a chunked blob
    BlobIndex {
        size: u32,
        chunk_count: u8,
        chunk_start: u8,
    },
}

impl NvsValue {
    pub fn item_type(&self) -> ItemType {
        match self {
            NvsValue::U8(_) => ItemType::U8,
            NvsValue::I8(_) => ItemType::I8,
            NvsValue::U16(_) => ItemType::U16,
            NvsValue::I16(_) => ItemType::I16,
            NvsValue::U32(_) => ItemType::U32,
            NvsValue::I32(_) => ItemType::I32,
            NvsValue::U64(_) => ItemType::U64,
            NvsValue::I64(_) => ItemType::I64,
            NvsValue::Str(_) => ItemType::Str,
            NvsValue::Blob(_) => ItemType::BlobData,
            NvsValue::BlobIndex { .. } => ItemType::BlobIdx,
        }
    }

    /// Parse `text` as a value of type `ty`
    pub fn parse(ty: ItemType, text: &str) -> Option<Self> {
        Some(match ty {
            ItemType::U8 => NvsValue::U8(text.parse().ok()?),
            ItemType::I8 => NvsValue::I8(text.parse().ok()?),
            ItemType::U16 => NvsValue::U16(text.parse().ok()?),
            ItemType::I16 => NvsValue::I16(text.parse().ok()?),
            ItemType::U32 => NvsValue::U32(text.parse().ok()?),
            ItemType::I32 => NvsValue::I32(text.parse().ok()?),
            ItemType::U64 => NvsValue::U64(text.parse().ok()?),
            ItemType::I64 => NvsValue::I64(text.parse().ok()?),
            ItemType::Str => NvsValue::Str(text.to_string()),
            ItemType::Blob | ItemType::BlobData => NvsValue::Blob(text.as_bytes().to_vec()),
            ItemType::BlobIdx => return None,
        })
    }

    /// The 8 inline data bytes of a fixed-size value
    pub(crate) fn inline_data(&self) -> Option<[u8; 8]> {
        let mut data = [0xFF; 8];
        let bytes: Vec<u8> = match self {
            NvsValue::U8(v) => v.to_le_bytes().to_vec(),
            NvsValue::I8(v) => v.to_le_bytes().to_vec(),
            NvsValue::U16(v) => v.to_le_bytes().to_vec(),
            NvsValue::I16(v) => v.to_le_bytes().to_vec(),
            NvsValue::U32(v) => v.to_le_bytes().to_vec(),
            NvsValue::I32(v) => v.to_le_bytes().to_vec(),
            NvsValue::U64(v) => v.to_le_bytes().to_vec(),
            NvsValue::I64(v) => v.to_le_bytes().to_vec(),
            NvsValue::BlobIndex {
                size,
                chunk_count,
                chunk_start,
            } => {
                let mut bytes = size.to_le_bytes().to_vec();
                bytes.extend([*chunk_count, *chunk_start]);
                bytes
            }
            NvsValue::Str(_) | NvsValue::Blob(_) => return None,
        };
        data[..bytes.len()].copy_from_slice(&bytes);
        Some(data)
    }
}

impl fmt::Display for NvsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvsValue::U8(v) => write!(f, "{v}"),
            NvsValue::I8(v) => write!(f, "{v}"),
            NvsValue::U16(v) => write!(f, "{v}"),
            NvsValue::I16(v) => write!(f, "{v}"),
            NvsValue::U32(v) => write!(f, "{v}"),
            NvsValue::I32(v) => write!(f, "{v}"),
            NvsValue::U64(v) => write!(f, "{v}"),
            NvsValue::I64(v) => write!(f, "{v}"),
            NvsValue::Str(s) => write!(f, "{s:?}"),
            NvsValue::Blob(data) => {
                for byte in data.iter().take(32) {
                    write!(f, "{byte:02x}")?;
                }
                if data.len() > 32 {
                    write!(f, "... ({} bytes)", data.len())?;
                }
                Ok(())
            }
            NvsValue::BlobIndex {
                size,
                chunk_count,
                chunk_start,
            } => write!(f, "<{size} bytes in {chunk_count} chunk(s) from {chunk_start}>"),
        }
    }
}

/// The 32 byte header entry of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawItem {
    pub namespace: u8,
    pub item_type: u8,
    pub span: u8,
    pub chunk_index: u8,
    pub crc: u32,
    pub key: [u8; 16],
    pub data: [u8; 8],
}

impl RawItem {
    pub fn decode(bytes: &[u8]) -> Self {
        let mut key = [0u8; 16];
        key.copy_from_slice(&bytes[8..24]);
        let mut data = [0u8; 8];
        data.copy_from_slice(&bytes[24..32]);

        RawItem {
            namespace: bytes[0],
            item_type: bytes[1],
            span: bytes[2],
            chunk_index: bytes[3],
            crc: le_u32(bytes, 4),
            key,
            data,
        }
    }

    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        out[0] = self.namespace;
        out[1] = self.item_type;
        out[2] = self.span;
        out[3] = self.chunk_index;
        out[4..8].copy_from_slice(&self.crc.to_le_bytes());
        out[8..24].copy_from_slice(&self.key);
        out[24..32].copy_from_slice(&self.data);
        out
    }

    /// CRC over the entry excluding the CRC field itself
    pub fn compute_crc(&self) -> u32 {
        let bytes = self.encode();
        crc32_parts(&[&bytes[0..4], &bytes[8..32]])
    }

    /// Encode with a freshly computed CRC
    pub fn sealed(mut self) -> [u8; ENTRY_SIZE] {
        self.crc = self.compute_crc();
        self.encode()
    }

    pub fn key(&self) -> String {
        decode_str(&self.key)
    }

    /// Payload length and CRC of a variable length item
    pub fn payload_header(&self) -> (usize, u32) {
        (le_u16(&self.data, 0) as usize, le_u32(&self.data, 4))
    }
}

/// Encode `key` into the 16 byte key field
pub(crate) fn encode_key(key: &str) -> Option<[u8; 16]> {
    if key.is_empty() || key.len() > MAX_KEY_LEN || key.bytes().any(|b| b == 0) {
        return None;
    }
    let mut out = [0u8; 16];
    out[..key.len()].copy_from_slice(key.as_bytes());
    Some(out)
}

/// Inline data describing a variable length payload
pub(crate) fn payload_data(payload: &[u8]) -> [u8; 8] {
    let mut data = [0xFF; 8];
    data[0..2].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    data[4..8].copy_from_slice(&crc32(payload).to_le_bytes());
    data
}

/// An item found while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Page number holding the header entry
    pub page: u32,
    /// Slot of the header entry
    pub slot: usize,
    /// Offset of the header entry in the flash image
    pub address: u32,
    pub namespace: u8,
    pub item_type: ItemType,
    pub span: u8,
    pub chunk_index: u8,
    pub key: String,
    pub value: NvsValue,
    pub header_crc_valid: bool,
    /// Payload CRC check, `None` for fixed-size types
    pub payload_crc_valid: Option<bool>,
}

impl Item {
    /// Decode the value of an item from its header entry and the payload
    /// entries following it
    pub(crate) fn decode_value(raw: &RawItem, ty: ItemType, payload: &[u8]) -> (NvsValue, Option<bool>) {
        let d = &raw.data;
        let value = match ty {
            ItemType::U8 => NvsValue::U8(d[0]),
            ItemType::I8 => NvsValue::I8(d[0] as i8),
            ItemType::U16 => NvsValue::U16(le_u16(d, 0)),
            ItemType::I16 => NvsValue::I16(le_u16(d, 0) as i16),
            ItemType::U32 => NvsValue::U32(le_u32(d, 0)),
            ItemType::I32 => NvsValue::I32(le_u32(d, 0) as i32),
            ItemType::U64 => NvsValue::U64(u64::from_le_bytes(*d)),
            ItemType::I64 => NvsValue::I64(i64::from_le_bytes(*d)),
            ItemType::BlobIdx => NvsValue::BlobIndex {
                size: le_u32(d, 0),
                chunk_count: d[4],
                chunk_start: d[5],
            },
            ItemType::Str | ItemType::Blob | ItemType::BlobData => {
                let (size, crc) = raw.payload_header();
                let data = &payload[..size.min(payload.len())];
                let valid = size <= payload.len() && crc32(data) == crc;

                let value = if ty == ItemType::Str {
                    let text = data.strip_suffix(&[0]).unwrap_or(data);
                    NvsValue::Str(String::from_utf8_lossy(text).into_owned())
                } else {
                    NvsValue::Blob(data.to_vec())
                };
                return (value, Some(valid));
            }
        };

        (value, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_crc_skips_crc_field() {
        let raw = RawItem {
            namespace: 1,
            item_type: ItemType::U32 as u8,
            span: 1,
            chunk_index: CHUNK_ANY,
            crc: 0,
            key: encode_key("boot_count").unwrap(),
            data: NvsValue::U32(42).inline_data().unwrap(),
        };
        let sealed = RawItem::decode(&raw.sealed());

        assert_eq!(sealed.crc, raw.compute_crc());
        assert_eq!(sealed.compute_crc(), sealed.crc);
        assert_eq!(sealed.key(), "boot_count");
    }

    #[test]
    fn strings_drop_terminator() {
        let payload = b"hello\0";
        let raw = RawItem {
            namespace: 1,
            item_type: ItemType::Str as u8,
            span: 2,
            chunk_index: CHUNK_ANY,
            crc: 0,
            key: encode_key("greeting").unwrap(),
            data: payload_data(payload),
        };

        let mut padded = payload.to_vec();
        padded.resize(32, 0xFF);
        let (value, valid) = Item::decode_value(&raw, ItemType::Str, &padded);
        assert_eq!(value, NvsValue::Str("hello".into()));
        assert_eq!(valid, Some(true));

        padded[0] = b'j';
        let (_, valid) = Item::decode_value(&raw, ItemType::Str, &padded);
        assert_eq!(valid, Some(false));
    }

    #[test]
    fn keys_are_bounded() {
        assert!(encode_key("fifteen_chars_x").is_some());
        assert!(encode_key("sixteen_chars_xx").is_none());
        assert!(encode_key("").is_none());
        assert_eq!(ItemType::from_repr(0x48), Some(ItemType::BlobIdx));
        assert_eq!(ItemType::BlobData.to_string(), "BLOB_DATA");
    }
}
