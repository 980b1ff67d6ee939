//! Decoders and editors for the data structures found on ESP flash
//!
//! Every codec works on a [FlashImage](crate::image::FlashImage), so the same
//! code handles a live device and a dump loaded from disk.

pub mod app_image;
pub mod crc;
pub mod fat;
pub mod nvs;
pub mod ota;
pub mod partition_table;
pub mod spiffs;

/// Decode a fixed-size, NUL padded string field
///
/// Erased (0xFF) bytes terminate the string as well.
pub(crate) fn decode_str(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .position(|&b| b == 0 || b == 0xFF)
        .unwrap_or(bytes.len());

    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Encode a string into a fixed-size, NUL padded field
pub(crate) fn encode_str<const N: usize>(value: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let len = value.len().min(N);
    out[..len].copy_from_slice(&value.as_bytes()[..len]);
    out
}

pub(crate) fn le_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

pub(crate) fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_stop_at_padding() {
        assert_eq!(decode_str(b"nvs\0\0\0"), "nvs");
        assert_eq!(decode_str(&[b'o', b't', b'a', 0xFF, 0xFF]), "ota");
        assert_eq!(encode_str::<4>("phy_init"), *b"phy_");
        assert_eq!(encode_str::<6>("fat"), *b"fat\0\0\0");
    }
}
