//! Commands understood by the ROM bootloader and the flasher stub

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::{Display, FromRepr};

use crate::flasher::{SpiAttachParams, SpiSetParams};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const ERASE_WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(40);
const ERASE_CHIP_TIMEOUT: Duration = Duration::from_secs(120);
const MEM_END_TIMEOUT: Duration = Duration::from_millis(50);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const MIN_SIZED_TIMEOUT: Duration = Duration::from_secs(10);
const FLASH_MD5_TIMEOUT: Duration = Duration::from_secs(8);
const FLASH_MD5_TIMEOUT_PER_MB: Duration = Duration::from_secs(8);

/// Input data for SYNC command (36 bytes: 0x07 0x07 0x12 0x20, followed by
/// 32 x 0x55)
const SYNC_FRAME: [u8; 36] = [
    0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55,
];

/// Seed of the data block checksum
pub const CHECKSUM_INIT: u8 = 0xEF;

/// Types of commands that can be sent to a target device
///
/// <https://docs.espressif.com/projects/esptool/en/latest/esp32c3/advanced-topics/serial-protocol.html#supported-by-stub-loader-and-rom-loader>
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    ChangeBaudrate = 0x0F,
    FlashMd5 = 0x13,
    // Not supported on ESP32
    GetSecurityInfo = 0x14,
    // Stub-only commands
    EraseFlash = 0xD0,
    EraseRegion = 0xD1,
    ReadFlash = 0xD2,
    RunUserCode = 0xD3,
}

impl CommandType {
    /// Return a timeout based on the command type
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::MemEnd => MEM_END_TIMEOUT,
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::EraseFlash => ERASE_CHIP_TIMEOUT,
            CommandType::FlashMd5 => FLASH_MD5_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Return a timeout based on the size
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        fn calc_timeout(timeout_per_mb: Duration, size: u32) -> Duration {
            let mb = size as f64 / 1_000_000.0;
            std::cmp::max(
                MIN_SIZED_TIMEOUT,
                Duration::from_millis((timeout_per_mb.as_millis() as f64 * mb) as u64),
            )
        }
        match self {
            CommandType::FlashBegin | CommandType::EraseRegion => {
                calc_timeout(ERASE_REGION_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashData => calc_timeout(ERASE_WRITE_TIMEOUT_PER_MB, size),
            CommandType::FlashMd5 => std::cmp::max(
                FLASH_MD5_TIMEOUT,
                calc_timeout(FLASH_MD5_TIMEOUT_PER_MB, size),
            ),
            _ => self.timeout(),
        }
    }
}

/// Available commands
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    MemEnd {
        no_entry: bool,
        entry: u32,
    },
    MemData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: Option<u32>,
    },
    ReadReg {
        address: u32,
    },
    SpiSetParams {
        spi_params: SpiSetParams,
    },
    SpiAttach {
        spi_params: SpiAttachParams,
        stub: bool,
    },
    ChangeBaudrate {
        /// New baud rate
        new_baud: u32,
        /// Prior baud rate ('0' for ROM flasher)
        prior_baud: u32,
    },
    FlashMd5 {
        offset: u32,
        size: u32,
    },
    EraseFlash,
    EraseRegion {
        offset: u32,
        size: u32,
    },
    ReadFlash {
        offset: u32,
        size: u32,
        block_size: u32,
        max_in_flight: u32,
    },
    RunUserCode,
    GetSecurityInfo,
}

impl Command<'_> {
    /// Return the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemData { .. } => CommandType::MemData,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach { .. } => CommandType::SpiAttach,
            Command::ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
            Command::EraseFlash => CommandType::EraseFlash,
            Command::EraseRegion { .. } => CommandType::EraseRegion,
            Command::ReadFlash { .. } => CommandType::ReadFlash,
            Command::RunUserCode => CommandType::RunUserCode,
            Command::GetSecurityInfo => CommandType::GetSecurityInfo,
        }
    }

    /// Return a timeout based on the size
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        self.command_type().timeout_for_size(size)
    }

    /// Serialize the command into a request packet (without SLIP framing)
    pub fn encode(&self) -> std::io::Result<Vec<u8>> {
        let mut packet = Vec::new();
        self.write(&mut packet)?;
        Ok(packet)
    }

    /// Serialize the command into `writer`
    ///
    /// The packet starts with the direction byte (0 for requests) and the op
    /// code; most commands carry a list of little-endian words.
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[0, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            }
            | Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            } => {
                let words = [size, blocks, block_size, offset, 0];
                // Only loaders that know about encryption take the last word
                let len = if supports_encryption { 5 } else { 4 };
                write_words(writer, &words[..len])
            }
            Command::FlashData {
                pad_to,
                pad_byte,
                data,
                sequence,
            }
            | Command::MemData {
                pad_to,
                pad_byte,
                data,
                sequence,
            } => data_command(writer, data, pad_to, pad_byte, sequence),
            // 0 reboots, 1 stays in the loader
            Command::FlashEnd { reboot } => write_words(writer, &[u32::from(!reboot)]),
            Command::MemEnd { no_entry, entry } => {
                write_words(writer, &[u32::from(no_entry), entry])
            }
            Command::Sync => write_basic(writer, &SYNC_FRAME, 0),
            Command::WriteReg {
                address,
                value,
                mask,
            } => write_words(writer, &[address, value, mask.unwrap_or(u32::MAX), 0]),
            Command::ReadReg { address } => write_words(writer, &[address]),
            Command::SpiSetParams { spi_params } => write_basic(writer, &spi_params.encode(), 0),
            Command::SpiAttach { spi_params, stub } => {
                write_basic(writer, &spi_params.encode(stub), 0)
            }
            Command::ChangeBaudrate {
                new_baud,
                prior_baud,
            } => write_words(writer, &[new_baud, prior_baud]),
            Command::FlashMd5 { offset, size } => write_words(writer, &[offset, size, 0, 0]),
            Command::EraseRegion { offset, size } => write_words(writer, &[offset, size]),
            Command::ReadFlash {
                offset,
                size,
                block_size,
                max_in_flight,
            } => write_words(writer, &[offset, size, block_size, max_in_flight]),
            Command::EraseFlash | Command::RunUserCode | Command::GetSecurityInfo => {
                write_basic(writer, &[], 0)
            }
        }
    }
}

/// Write the payload length, the checksum field and the payload
fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&(data.len() as u16).to_le_bytes())?;
    writer.write_all(&checksum.to_le_bytes())?;
    writer.write_all(data)
}

/// Write a payload of little-endian words
fn write_words<W: Write>(writer: W, words: &[u32]) -> std::io::Result<()> {
    let data: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    write_basic(writer, &data, 0)
}

/// Header of `FLASH_DATA`/`MEM_DATA` payloads
#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
struct BlockHeader {
    size: u32,
    sequence: u32,
    reserved: [u32; 2],
}

/// Write a data block padded to `pad_to` bytes; the checksum field covers
/// the block and its padding
fn data_command<W: Write>(
    writer: W,
    block: &[u8],
    pad_to: usize,
    pad_byte: u8,
    sequence: u32,
) -> std::io::Result<()> {
    let mut padded = block.to_vec();
    if padded.len() < pad_to {
        padded.resize(pad_to, pad_byte);
    }

    let header = BlockHeader {
        size: padded.len() as u32,
        sequence,
        reserved: [0; 2],
    };
    let mut payload = Vec::with_capacity(size_of::<BlockHeader>() + padded.len());
    payload.extend_from_slice(bytes_of(&header));
    payload.extend_from_slice(&padded);

    write_basic(writer, &payload, checksum(&padded, CHECKSUM_INIT) as u32)
}

/// XOR checksum over `data`, continuing from `checksum`
pub fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}
