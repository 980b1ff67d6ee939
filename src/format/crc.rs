//! CRC-32 as computed by the ESP ROM (`esp_rom_crc32_le`)
//!
//! This is the reflected IEEE polynomial with a zero initial register and a
//! final inversion, i.e. zlib's `crc32(data, 0xFFFFFFFF)`.

use crc::{Algorithm, Crc};

const ESP_CRC32_ALGORITHM: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04c1_1db7,
    init: 0x0000_0000,
    refin: true,
    refout: true,
    xorout: 0xffff_ffff,
    check: 0xd202_d277,
    residue: 0xdebb_20e3,
};

const ESP_CRC32: Crc<u32> = Crc::<u32>::new(&ESP_CRC32_ALGORITHM);

/// CRC-32 of `data` the way NVS and OTA data compute it
pub fn crc32(data: &[u8]) -> u32 {
    ESP_CRC32.checksum(data)
}

/// CRC-32 over several discontiguous byte ranges
pub fn crc32_parts(parts: &[&[u8]]) -> u32 {
    let mut digest = ESP_CRC32.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize()
}
