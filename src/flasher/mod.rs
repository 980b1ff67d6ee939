//! Read, write and verify the flash of a device in its serial bootloader
//!
//! A [Flasher] owns a synced session with the ROM loader or the flasher stub.
//! Flash regions are read with a flow-controlled transfer, written in
//! checksummed blocks and verified against the device's MD5 digest.
//! [DeviceFlash](device_io::DeviceFlash) exposes the device as the backing
//! storage of a [FlashImage](crate::image::FlashImage).

use std::{fmt, sync::Arc, time::Duration};

use bitflags::bitflags;
use log::{debug, info, warn};
use md5::{Digest, Md5};
use tokio::{sync::Mutex, time::sleep};

use self::stubs::{FlashStub, EXPECTED_STUB_HANDSHAKE};
use crate::{
    config::ConnectionConfig,
    connection::{
        command::{Command, CommandType},
        port::SerialInterface,
        reset::{hard_reset, reset_sequence},
        Connection,
        Exchange,
        SessionState,
    },
    error::{ConnectionError, Error, ResultExt as _},
    targets::{Chip, CHIP_DETECT_MAGIC_REG_ADDR},
};

pub mod device_io;
pub mod stubs;

/// Sync packets sent after each reset
const MAX_SYNC_ATTEMPTS: usize = 5;
/// Pause between sync packets
const SYNC_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Settling time after the baud rate changed
const BAUD_CHANGE_DELAY: Duration = Duration::from_millis(50);

bitflags! {
    /// Flags word of the security info response
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SecurityFlags: u32 {
        const SECURE_BOOT_EN = 1 << 0;
        const SECURE_BOOT_AGGRESSIVE_REVOKE = 1 << 1;
        const SECURE_DOWNLOAD_ENABLE = 1 << 2;
        const SECURE_BOOT_KEY_REVOKE0 = 1 << 3;
        const SECURE_BOOT_KEY_REVOKE1 = 1 << 4;
        const SECURE_BOOT_KEY_REVOKE2 = 1 << 5;
        const SOFT_DIS_JTAG = 1 << 6;
        const HARD_DIS_JTAG = 1 << 7;
        const DIS_USB = 1 << 8;
        const DIS_DOWNLOAD_DCACHE = 1 << 9;
        const DIS_DOWNLOAD_ICACHE = 1 << 10;
        const _ = !0;
    }
}

/// Security Info Response containing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityInfo {
    /// 32 bits flags
    pub flags: SecurityFlags,
    /// 1 byte flash_crypt_cnt
    pub flash_crypt_cnt: u8,
    /// 7 bytes key purposes
    pub key_purposes: [u8; 7],
    /// 32-bit word chip id
    pub chip_id: Option<u32>,
    /// 32-bit word eco version
    pub eco_version: Option<u32>,
}

impl SecurityInfo {
    pub fn secure_boot_enabled(&self) -> bool {
        self.flags.contains(SecurityFlags::SECURE_BOOT_EN)
    }

    /// An odd number of set bits in the crypt counter enables encryption
    pub fn flash_encryption_enabled(&self) -> bool {
        self.flash_crypt_cnt.count_ones() % 2 != 0
    }

    pub fn revoked_keys(&self) -> Vec<usize> {
        [
            SecurityFlags::SECURE_BOOT_KEY_REVOKE0,
            SecurityFlags::SECURE_BOOT_KEY_REVOKE1,
            SecurityFlags::SECURE_BOOT_KEY_REVOKE2,
        ]
        .iter()
        .enumerate()
        .filter(|(_, flag)| self.flags.contains(**flag))
        .map(|(i, _)| i)
        .collect()
    }
}

impl TryFrom<&[u8]> for SecurityInfo {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let esp32s2 = bytes.len() == 12;

        if bytes.len() < 12 {
            return Err(Error::InvalidResponse(format!(
                "expected response of at least 12 bytes, received {} bytes",
                bytes.len()
            )));
        }

        let flags = u32::from_le_bytes(bytes[0..4].try_into()?);
        let flash_crypt_cnt = bytes[4];
        let key_purposes: [u8; 7] = bytes[5..12].try_into()?;

        let (chip_id, eco_version) = if esp32s2 {
            (None, None) // ESP32-S2 doesn't have these values
        } else {
            if bytes.len() < 20 {
                return Err(Error::InvalidResponse(format!(
                    "expected response of at least 20 bytes, received {} bytes",
                    bytes.len()
                )));
            }
            let chip_id = u32::from_le_bytes(bytes[12..16].try_into()?);
            let eco_version = u32::from_le_bytes(bytes[16..20].try_into()?);
            (Some(chip_id), Some(eco_version))
        };

        Ok(SecurityInfo {
            flags: SecurityFlags::from_bits_retain(flags),
            flash_crypt_cnt,
            key_purposes,
            chip_id,
            eco_version,
        })
    }
}

impl fmt::Display for SecurityInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key_purposes = self
            .key_purposes
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        writeln!(f, "Flags: {:#010x} ({:b})", self.flags.bits(), self.flags.bits())?;
        writeln!(f, "Key Purposes: [{key_purposes}]")?;

        if let Some(chip_id) = self.chip_id {
            writeln!(f, "Chip ID: {chip_id}")?;
        }
        if let Some(eco_version) = self.eco_version {
            writeln!(f, "API Version: {eco_version}")?;
        }

        if self.secure_boot_enabled() {
            writeln!(f, "Secure Boot: Enabled")?;
            if self
                .flags
                .contains(SecurityFlags::SECURE_BOOT_AGGRESSIVE_REVOKE)
            {
                writeln!(f, "Secure Boot Aggressive key revocation: Enabled")?;
            }
            for key in self.revoked_keys() {
                writeln!(f, "Secure Boot Key{key} is Revoked")?;
            }
        } else {
            writeln!(f, "Secure Boot: Disabled")?;
        }

        if self.flash_encryption_enabled() {
            writeln!(f, "Flash Encryption: Enabled")?;
        } else {
            writeln!(f, "Flash Encryption: Disabled")?;
        }

        writeln!(
            f,
            "SPI Boot Crypt Count (SPI_BOOT_CRYPT_CNT): {:#x}",
            self.flash_crypt_cnt
        )?;

        if self.flags.contains(SecurityFlags::SECURE_DOWNLOAD_ENABLE) {
            writeln!(f, "Secure Download: Enabled")?;
        }

        let jtag = match (
            self.flags.contains(SecurityFlags::HARD_DIS_JTAG),
            self.flags.contains(SecurityFlags::SOFT_DIS_JTAG),
        ) {
            (true, _) => "Permanently Disabled",
            (false, true) => "Software Access Disabled",
            (false, false) => "Enabled",
        };
        write!(f, "JTAG: {jtag}")
    }
}

/// Parameters of the attached SPI flash chip (sizes, etc).
///
/// See: <https://github.com/espressif/esptool/blob/da31d9d/esptool.py#L655>
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct SpiSetParams {
    /// Flash chip ID
    fl_id: u32,
    /// Total size in bytes
    total_size: u32,
    /// Block size
    block_size: u32,
    /// Sector size
    sector_size: u32,
    /// Page size
    page_size: u32,
    /// Status mask
    status_mask: u32,
}

impl SpiSetParams {
    pub const fn default(size: u32) -> Self {
        SpiSetParams {
            fl_id: 0,
            total_size: size,
            block_size: 64 * 1024,
            sector_size: 4 * 1024,
            page_size: 256,
            status_mask: 0xFFFF,
        }
    }

    /// Encode the parameters into a byte array
    pub fn encode(&self) -> Vec<u8> {
        [
            self.fl_id,
            self.total_size,
            self.block_size,
            self.sector_size,
            self.page_size,
            self.status_mask,
        ]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
    }
}

/// Parameters for attaching to a target devices SPI flash
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct SpiAttachParams {
    clk: u8,
    q: u8,
    d: u8,
    hd: u8,
    cs: u8,
}

impl SpiAttachParams {
    /// Use the pins configured in efuse
    pub const fn default() -> Self {
        SpiAttachParams {
            clk: 0,
            q: 0,
            d: 0,
            hd: 0,
            cs: 0,
        }
    }

    /// Encode the parameters into a byte array
    pub fn encode(self, stub: bool) -> Vec<u8> {
        let packed = ((self.hd as u32) << 24)
            | ((self.cs as u32) << 18)
            | ((self.d as u32) << 12)
            | ((self.q as u32) << 6)
            | (self.clk as u32);

        let mut encoded: Vec<u8> = packed.to_le_bytes().to_vec();

        if !stub {
            encoded.extend_from_slice(&[0u8; 4]);
        }

        encoded
    }
}

/// Connect to and flash a target device
#[derive(Debug)]
pub struct Flasher {
    connection: Connection,
    config: ConnectionConfig,
    chip: Chip,
    security_info: Option<SecurityInfo>,
    /// Baud rate the port currently runs at
    baud: Mutex<u32>,
}

impl Flasher {
    /// Reset the device into its bootloader, sync, identify the chip, upload
    /// the configured stub (if any) and attach the SPI flash
    pub async fn connect(
        port: Arc<dyn SerialInterface>,
        config: ConnectionConfig,
    ) -> Result<Self, Error> {
        Self::connect_with_stub(port, config, None).await
    }

    /// Like [Flasher::connect], with the stub given directly
    ///
    /// Without a stub argument, the stub configured for the detected chip is
    /// loaded; if there is none, the flasher keeps talking to the ROM loader.
    pub async fn connect_with_stub(
        port: Arc<dyn SerialInterface>,
        config: ConnectionConfig,
        stub: Option<FlashStub>,
    ) -> Result<Self, Error> {
        let baud = config.baud;
        let connection = Connection::open(port);

        if let Err(err) = Self::sync_with_reset(&connection, &config).await {
            connection.disconnect().await.ok();
            return Err(err);
        }

        let (chip, security_info) = detect_chip(&connection, &config).await?;
        info!("Detected chip: {}", chip);

        let mut flasher = Flasher {
            connection,
            config,
            chip,
            security_info,
            baud: Mutex::new(baud),
        };

        let stub = match stub {
            Some(stub) => Some(stub),
            None => match flasher.config.stub_for(chip) {
                Some(path) => Some(FlashStub::load(path)?),
                None => None,
            },
        };
        match stub {
            Some(stub) => flasher.load_stub(&stub).await?,
            None => debug!("No flasher stub for {}, using the ROM loader", chip),
        }

        flasher.spi_attach().await?;
        if let Some(size) = flasher.config.flash_size {
            flasher.spi_set_params(size).await?;
        }

        Ok(flasher)
    }

    /// Cycle through the reset strategies until the bootloader answers
    async fn sync_with_reset(
        connection: &Connection,
        config: &ConnectionConfig,
    ) -> Result<(), Error> {
        let port = connection.port().clone();
        let strategies = reset_sequence(port.usb_info());

        for (attempt, strategy) in (0..config.sync_attempts).zip(strategies.iter().cycle()) {
            strategy.reset(port.as_ref()).await?;

            match sync(connection, config).await {
                Ok(()) => {
                    connection.set_state(SessionState::Synced);
                    return Ok(());
                }
                Err(err @ Error::Connection(ConnectionError::Disconnected)) => return Err(err),
                Err(err) => {
                    debug!("Sync attempt {} failed: {:?}, retrying", attempt + 1, err);
                }
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Upload a flasher stub into RAM and start it
    pub async fn load_stub(&mut self, stub: &FlashStub) -> Result<(), Error> {
        self.require_state(SessionState::Synced)?;
        debug!("Loading flash stub for chip: {:?}", self.chip);

        let block_size = self.config.ram_block_size;
        let supports_encryption = self.chip.rom_supports_encryption_flag();
        let mut exchange = self.connection.exchange().await;

        for (name, (address, data)) in [("text", stub.text()?), ("data", stub.data()?)] {
            debug!("Write {} byte stub {}", data.len(), name);
            let blocks = (data.len() as u32).div_ceil(block_size);

            exchange
                .command(
                    Command::MemBegin {
                        size: data.len() as u32,
                        blocks,
                        block_size,
                        offset: address,
                        supports_encryption,
                    },
                    self.config.command_timeout,
                )
                .await
                .flashing()?;

            for (sequence, chunk) in data.chunks(block_size as usize).enumerate() {
                exchange
                    .command(
                        Command::MemData {
                            data: chunk,
                            pad_to: 0,
                            pad_byte: 0,
                            sequence: sequence as u32,
                        },
                        self.config.command_timeout,
                    )
                    .await
                    .flashing()?;
            }
        }

        debug!("Finish stub write");
        exchange
            .command(
                Command::MemEnd {
                    no_entry: false,
                    entry: stub.entry(),
                },
                self.config.command_timeout,
            )
            .await
            .flashing()?;

        let handshake = exchange
            .recv_raw(self.config.command_timeout, None)
            .await
            .for_command(CommandType::MemEnd)?;
        if handshake != EXPECTED_STUB_HANDSHAKE.as_bytes() {
            return Err(Error::Connection(ConnectionError::InvalidStubHandshake));
        }

        self.connection.set_state(SessionState::StubLoaded);
        info!("Flasher stub running");

        Ok(())
    }

    async fn spi_attach(&self) -> Result<(), Error> {
        let stub = self.is_stub();
        self.connection
            .command(
                Command::SpiAttach {
                    spi_params: SpiAttachParams::default(),
                    stub,
                },
                self.config.command_timeout,
            )
            .await?;

        Ok(())
    }

    /// Tell the loader about the flash chip geometry
    pub async fn spi_set_params(&self, size: u32) -> Result<(), Error> {
        self.require_synced()?;
        self.connection
            .command(
                Command::SpiSetParams {
                    spi_params: SpiSetParams::default(size),
                },
                self.config.command_timeout,
            )
            .await?;

        Ok(())
    }

    /// The chip type that the flasher is connected to
    pub fn chip(&self) -> Chip {
        self.chip
    }

    pub fn state(&self) -> SessionState {
        self.connection.state()
    }

    pub fn is_stub(&self) -> bool {
        self.connection.is_stub()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn require_state(&self, expected: SessionState) -> Result<(), Error> {
        let actual = self.state();
        if actual != expected {
            return Err(Error::InvalidState {
                expected: expected.into(),
                actual: actual.into(),
            });
        }
        Ok(())
    }

    fn require_synced(&self) -> Result<(), Error> {
        match self.state() {
            SessionState::Synced | SessionState::StubLoaded => Ok(()),
            SessionState::Disconnected => Err(ConnectionError::Disconnected.into()),
            actual => Err(Error::InvalidState {
                expected: SessionState::Synced.into(),
                actual: actual.into(),
            }),
        }
    }

    fn require_stub(&self) -> Result<(), Error> {
        match self.state() {
            SessionState::StubLoaded => Ok(()),
            SessionState::Disconnected => Err(ConnectionError::Disconnected.into()),
            _ => Err(Error::StubRequired),
        }
    }

    /// Read and write commands
    pub async fn read_reg(&self, address: u32) -> Result<u32, Error> {
        self.require_synced()?;
        let response = self
            .connection
            .command(Command::ReadReg { address }, self.config.command_timeout)
            .await?;
        Ok(response.value)
    }

    pub async fn write_reg(&self, address: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.require_synced()?;
        self.connection
            .command(
                Command::WriteReg {
                    address,
                    value,
                    mask,
                },
                self.config.command_timeout,
            )
            .await?;
        Ok(())
    }

    /// Get security info
    ///
    /// The value read while connecting is returned when the loader answered
    /// the command then.
    pub async fn security_info(&self) -> Result<SecurityInfo, Error> {
        if let Some(info) = &self.security_info {
            return Ok(info.clone());
        }
        self.require_synced()?;
        let mut exchange = self.connection.exchange().await;
        security_info(&mut exchange, &self.config, self.is_stub()).await
    }

    /// Get MD5 of region
    pub async fn checksum_md5(&self, address: u32, length: u32) -> Result<[u8; 16], Error> {
        self.require_synced()?;
        let timeout = std::cmp::max(
            self.config.md5_timeout,
            CommandType::FlashMd5.timeout_for_size(length),
        );
        let response = self
            .connection
            .command(
                Command::FlashMd5 {
                    offset: address,
                    size: length,
                },
                timeout,
            )
            .await?;

        parse_md5(&response.data)
    }

    /// Read `size` bytes of flash starting at `offset`
    ///
    /// Data packets are acknowledged with the running byte count whenever the
    /// stub's in-flight window is used up. The trailing MD5 digest must match
    /// the received data.
    pub async fn read_flash(&self, offset: u32, size: u32) -> Result<Vec<u8>, Error> {
        self.require_stub()?;
        debug!("Reading 0x{:x}B from 0x{:08x}", size, offset);

        let block_size = self.config.read_block_size;
        let max_in_flight = self.config.read_max_in_flight;
        let idle_timeout = self.config.read_idle_timeout;
        let liveness = move |idle: Duration| idle < idle_timeout;

        let mut exchange = self.connection.exchange().await;
        exchange
            .command(
                Command::ReadFlash {
                    offset,
                    size,
                    block_size,
                    max_in_flight,
                },
                self.config.command_timeout,
            )
            .await?;

        let mut data = Vec::with_capacity(size as usize);
        let mut acknowledged = 0u32;

        while data.len() < size as usize {
            let chunk = exchange
                .recv_raw(idle_timeout, Some(&liveness))
                .await
                .for_command(CommandType::ReadFlash)?;
            data.extend_from_slice(&chunk);

            if data.len() < size as usize && chunk.len() < block_size as usize {
                return Err(Error::CorruptData(block_size as usize, chunk.len()));
            }

            let received = data.len() as u32;
            if received >= acknowledged.saturating_add(max_in_flight) || received >= size {
                exchange.send_raw(&received.to_le_bytes()).await?;
                acknowledged = received;
            }
        }

        if data.len() > size as usize {
            return Err(Error::ReadMoreThanExpected);
        }

        let digest = exchange
            .recv_raw(idle_timeout, Some(&liveness))
            .await
            .for_command(CommandType::ReadFlash)?;
        if digest.len() != 16 {
            return Err(Error::IncorrectDigestLength(digest.len()));
        }

        let computed = Md5::digest(&data);
        if digest != computed.as_slice() {
            return Err(Error::DigestMismatch(digest, computed.to_vec()));
        }

        Ok(data)
    }

    /// Write `data` to flash at `address` and verify it
    ///
    /// The region is erased by the loader as part of `FLASH_BEGIN`; blocks
    /// are padded with erased bytes.
    pub async fn write_flash(&self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.require_synced()?;
        if data.is_empty() {
            return Ok(());
        }

        let stub = self.is_stub();
        let block_size = self.config.write_block_size(stub);
        let size = data.len() as u32;
        let blocks = size.div_ceil(block_size);
        debug!(
            "Writing 0x{:x}B to 0x{:08x} in {} block(s)",
            size, address, blocks
        );

        {
            let mut exchange = self.connection.exchange().await;
            exchange
                .command(
                    Command::FlashBegin {
                        size,
                        blocks,
                        block_size,
                        offset: address,
                        supports_encryption: self.chip.rom_supports_encryption_flag() && !stub,
                    },
                    CommandType::FlashBegin.timeout_for_size(size),
                )
                .await
                .flashing()?;

            for (sequence, block) in data.chunks(block_size as usize).enumerate() {
                self.write_block(&mut exchange, sequence as u32, block, block_size)
                    .await?;
            }
        }

        let expected = Md5::digest(data);
        let actual = self.checksum_md5(address, size).await?;
        if actual != expected.as_slice() {
            return Err(Error::VerifyFailed { address });
        }

        info!("Wrote and verified 0x{:x}B at 0x{:08x}", size, address);
        Ok(())
    }

    async fn write_block(
        &self,
        exchange: &mut Exchange<'_>,
        sequence: u32,
        block: &[u8],
        block_size: u32,
    ) -> Result<(), Error> {
        let mut attempt = 0;
        loop {
            let result = exchange
                .command(
                    Command::FlashData {
                        data: block,
                        pad_to: block_size as usize,
                        pad_byte: 0xFF,
                        sequence,
                    },
                    CommandType::FlashData.timeout_for_size(block_size),
                )
                .await
                .flashing();

            match result {
                Ok(_) => return Ok(()),
                Err(err @ Error::Flashing(ConnectionError::Disconnected)) => return Err(err),
                Err(err) if attempt < self.config.write_retries => {
                    attempt += 1;
                    warn!(
                        "Writing block {} failed ({}), retry {} of {}",
                        sequence, err, attempt, self.config.write_retries
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Leave flash mode, optionally rebooting into the application
    pub async fn finish(&self, reboot: bool) -> Result<(), Error> {
        self.require_synced()?;
        self.connection
            .command(Command::FlashEnd { reboot }, self.config.command_timeout)
            .await?;
        Ok(())
    }

    pub async fn erase_region(&self, offset: u32, size: u32) -> Result<(), Error> {
        self.require_stub()?;
        debug!("Erasing region of 0x{:x}B at 0x{:08x}", size, offset);

        self.connection
            .command(
                Command::EraseRegion { offset, size },
                CommandType::EraseRegion.timeout_for_size(size),
            )
            .await?;
        Ok(())
    }

    pub async fn erase_flash(&self) -> Result<(), Error> {
        self.require_stub()?;
        debug!("Erasing the entire flash");

        self.connection
            .command(Command::EraseFlash, CommandType::EraseFlash.timeout())
            .await?;
        Ok(())
    }

    pub async fn change_baud(&self, speed: u32) -> Result<(), Error> {
        self.require_synced()?;
        debug!("Change baud to: {}", speed);

        let mut baud = self.baud.lock().await;
        let prior_baud = match self.is_stub() {
            true => *baud,
            false => 0,
        };

        self.connection
            .command(
                Command::ChangeBaudrate {
                    new_baud: speed,
                    prior_baud,
                },
                self.config.command_timeout,
            )
            .await?;
        self.connection.port().set_baud_rate(speed).await?;
        *baud = speed;
        sleep(BAUD_CHANGE_DELAY).await;

        Ok(())
    }

    /// Reset the device into the application and close the connection
    pub async fn hard_reset(&self) -> Result<(), Error> {
        hard_reset(self.connection.port().as_ref()).await?;
        self.disconnect().await
    }

    pub async fn disconnect(&self) -> Result<(), Error> {
        self.connection.disconnect().await
    }
}

/// Send sync packets until one is answered
async fn sync(connection: &Connection, config: &ConnectionConfig) -> Result<(), Error> {
    let mut exchange = connection.exchange().await;
    let mut last_err = Error::Connection(ConnectionError::NoSyncReply);

    for _ in 0..MAX_SYNC_ATTEMPTS {
        match exchange.command(Command::Sync, config.sync_timeout).await {
            Ok(_) => return Ok(()),
            Err(err @ Error::Connection(ConnectionError::Disconnected)) => return Err(err),
            Err(err) => last_err = err,
        }
        sleep(SYNC_RETRY_DELAY).await;
    }

    Err(last_err)
}

async fn security_info(
    exchange: &mut Exchange<'_>,
    config: &ConnectionConfig,
    stub: bool,
) -> Result<SecurityInfo, Error> {
    let response = exchange
        .command(Command::GetSecurityInfo, config.command_timeout)
        .await?;
    debug!(
        "Security info response of {} bytes from the {}",
        response.data.len(),
        if stub { "stub" } else { "ROM" }
    );
    SecurityInfo::try_from(response.data.as_slice())
}

/// Identify the chip from its security info, or from the magic register on
/// chips which do not know that command
async fn detect_chip(
    connection: &Connection,
    config: &ConnectionConfig,
) -> Result<(Chip, Option<SecurityInfo>), Error> {
    let mut exchange = connection.exchange().await;

    match security_info(&mut exchange, config, connection.is_stub()).await {
        Ok(info) => {
            if let Some(chip_id) = info.chip_id {
                let chip = Chip::try_from(chip_id as u16)?;
                return Ok((chip, Some(info)));
            }
            let chip = read_magic(&mut exchange, config).await?;
            Ok((chip, Some(info)))
        }
        Err(err @ Error::Connection(ConnectionError::Disconnected)) => Err(err),
        Err(err) => {
            debug!("Security info unavailable ({}), reading magic register", err);
            let chip = read_magic(&mut exchange, config).await?;
            Ok((chip, None))
        }
    }
}

async fn read_magic(exchange: &mut Exchange<'_>, config: &ConnectionConfig) -> Result<Chip, Error> {
    let response = exchange
        .command(
            Command::ReadReg {
                address: CHIP_DETECT_MAGIC_REG_ADDR,
            },
            config.command_timeout,
        )
        .await?;
    Chip::from_magic(response.value)
}

/// The stub answers with the raw digest, the ROM loaders with 32 hex digits
fn parse_md5(data: &[u8]) -> Result<[u8; 16], Error> {
    match data.len() {
        16 => Ok(data.try_into()?),
        32 => {
            let mut digest = [0u8; 16];
            for (byte, pair) in digest.iter_mut().zip(data.chunks(2)) {
                let hex = std::str::from_utf8(pair)
                    .map_err(|_| Error::InvalidResponse("MD5 digest is not ASCII".into()))?;
                *byte = u8::from_str_radix(hex, 16)
                    .map_err(|_| Error::InvalidResponse(format!("invalid MD5 digit '{hex}'")))?;
            }
            Ok(digest)
        }
        len => Err(Error::IncorrectDigestLength(len)),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn security_info_layouts() {
        let mut bytes = vec![0x05, 0, 0, 0, 0b11, 1, 2, 3, 4, 5, 6, 7];
        let s2 = SecurityInfo::try_from(bytes.as_slice()).unwrap();
        assert_eq!(s2.chip_id, None);
        assert!(s2.secure_boot_enabled());
        assert!(!s2.flash_encryption_enabled());
        assert_eq!(s2.key_purposes, [1, 2, 3, 4, 5, 6, 7]);

        bytes.extend_from_slice(&5u32.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        let c3 = SecurityInfo::try_from(bytes.as_slice()).unwrap();
        assert_eq!(c3.chip_id, Some(5));
        assert_eq!(c3.eco_version, Some(3));

        assert!(matches!(
            SecurityInfo::try_from(&bytes[..16]),
            Err(Error::InvalidResponse(_))
        ));
        assert!(matches!(
            SecurityInfo::try_from(&bytes[..4]),
            Err(Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn security_info_display() {
        let info = SecurityInfo {
            flags: SecurityFlags::SECURE_BOOT_EN | SecurityFlags::SECURE_BOOT_KEY_REVOKE1,
            flash_crypt_cnt: 1,
            key_purposes: [0; 7],
            chip_id: None,
            eco_version: None,
        };
        let text = info.to_string();
        assert!(text.contains("Secure Boot: Enabled"));
        assert!(text.contains("Secure Boot Key1 is Revoked"));
        assert!(text.contains("Flash Encryption: Enabled"));
        assert!(text.ends_with("JTAG: Enabled"));
    }

    #[test]
    fn spi_attach_encoding() {
        assert_eq!(SpiAttachParams::default().encode(true), vec![0; 4]);
        assert_eq!(SpiAttachParams::default().encode(false), vec![0; 8]);

        let pins = SpiAttachParams {
            clk: 6,
            q: 17,
            d: 8,
            hd: 11,
            cs: 16,
        };
        let packed = u32::from_le_bytes(pins.encode(true)[..4].try_into().unwrap());
        assert_eq!(packed & 0x3F, 6);
        assert_eq!((packed >> 24) & 0x3F, 11);

        let params = SpiSetParams::default(0x40_0000).encode();
        assert_eq!(params.len(), 24);
        assert_eq!(params[4..8], 0x40_0000u32.to_le_bytes());
    }

    #[test]
    fn md5_formats() {
        let digest: Vec<u8> = (0u8..16).collect();
        assert_eq!(parse_md5(&digest).unwrap().to_vec(), digest);

        let hex = b"000102030405060708090a0b0c0d0e0f";
        assert_eq!(parse_md5(hex).unwrap().to_vec(), digest);

        assert!(matches!(
            parse_md5(&[0; 8]),
            Err(Error::IncorrectDigestLength(8))
        ));
    }
}
