//! Configuration
//!
//! All settings have defaults, so a missing file or a file which only sets a
//! few keys both work. Durations are written in milliseconds.
//!
//! ```toml
//! [connection]
//! baud = 460800
//! read_idle_timeout = 5000
//!
//! [connection.stubs]
//! esp32c3 = "stubs/esp32c3.toml"
//!
//! [image]
//! block_size = 4096
//! ```

use std::{
    collections::BTreeMap,
    fs::read_to_string,
    path::{Path, PathBuf},
    time::Duration,
};

use directories::ProjectDirs;
use log::debug;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    error::Error,
    image::{DEFAULT_BLOCK_SIZE, DEFAULT_FILL_RETRY_LIMIT},
    targets::Chip,
};

const CONFIG_FILE_NAME: &str = "espkit.toml";

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Duration::from_millis(u64::deserialize(deserializer)?))
}

fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Top level configuration
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub image: ImageConfig,
}

/// Tuning of the bootloader conversation
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Baud rate the port was opened with
    pub baud: u32,
    /// Reset and sync rounds before giving up
    pub sync_attempts: usize,
    /// Wait for a reply to each sync packet
    #[serde(
        serialize_with = "serialize_millis",
        deserialize_with = "deserialize_millis"
    )]
    pub sync_timeout: Duration,
    /// Wait for replies to commands without a size dependent timeout
    #[serde(
        serialize_with = "serialize_millis",
        deserialize_with = "deserialize_millis"
    )]
    pub command_timeout: Duration,
    /// Lower bound of the wait for a flash MD5 checksum
    #[serde(
        serialize_with = "serialize_millis",
        deserialize_with = "deserialize_millis"
    )]
    pub md5_timeout: Duration,
    /// Size of the data packets the stub sends for a flash read
    pub read_block_size: u32,
    /// Unacknowledged bytes the stub may send during a flash read
    pub read_max_in_flight: u32,
    /// A flash read fails after this long without any received byte
    #[serde(
        serialize_with = "serialize_millis",
        deserialize_with = "deserialize_millis"
    )]
    pub read_idle_timeout: Duration,
    /// Flash write block size when talking to the stub
    pub stub_write_block_size: u32,
    /// Flash write block size when talking to the ROM loader
    pub rom_write_block_size: u32,
    /// RAM block size used to upload the stub
    pub ram_block_size: u32,
    /// Extra attempts for a failing flash data block
    pub write_retries: usize,
    /// Flash chip size announced to the loader after attaching
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flash_size: Option<u32>,
    /// Flasher stub TOML files by chip
    pub stubs: BTreeMap<Chip, PathBuf>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            baud: 115_200,
            sync_attempts: 7,
            sync_timeout: Duration::from_millis(100),
            command_timeout: Duration::from_secs(3),
            md5_timeout: Duration::from_secs(8),
            read_block_size: 0x1000,
            read_max_in_flight: 0x4000,
            read_idle_timeout: Duration::from_secs(3),
            stub_write_block_size: 0x4000,
            rom_write_block_size: 0x400,
            ram_block_size: 0x1800,
            write_retries: 3,
            flash_size: None,
            stubs: BTreeMap::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn write_block_size(&self, stub: bool) -> u32 {
        match stub {
            true => self.stub_write_block_size,
            false => self.rom_write_block_size,
        }
    }

    /// Path of the stub configured for `chip`, if any
    pub fn stub_for(&self, chip: Chip) -> Option<&Path> {
        self.stubs.get(&chip).map(PathBuf::as_path)
    }

    fn validate(&self) -> Result<(), Error> {
        let sizes = [
            ("read_block_size", self.read_block_size),
            ("read_max_in_flight", self.read_max_in_flight),
            ("stub_write_block_size", self.stub_write_block_size),
            ("rom_write_block_size", self.rom_write_block_size),
            ("ram_block_size", self.ram_block_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, size)| *size == 0) {
            return Err(Error::Config(format!("'{name}' must not be zero")));
        }
        if self.flash_size == Some(0) {
            return Err(Error::Config("'flash_size' must not be zero".into()));
        }
        if self.sync_attempts == 0 {
            return Err(Error::Config("'sync_attempts' must not be zero".into()));
        }

        Ok(())
    }
}

/// Behaviour of [FlashImage](crate::image::FlashImage)s created from a device
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ImageConfig {
    /// Write granularity; staged blocks equal to the cache are dropped
    pub block_size: u32,
    /// Read callback invocations allowed per cache fill
    pub fill_retry_limit: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        ImageConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            fill_retry_limit: DEFAULT_FILL_RETRY_LIMIT,
        }
    }
}

impl Config {
    /// Load the configuration from `./espkit.toml`, or from the user's
    /// configuration directory, falling back to the defaults
    pub fn load() -> Result<Self, Error> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => {
                debug!("No configuration file found, using defaults");
                Ok(Config::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, Error> {
        debug!("Loading configuration from {}", path.display());
        let raw = read_to_string(path)?;
        let mut config = Self::from_toml_str(&raw)?;

        // Stub paths are relative to the file that names them
        if let Some(dir) = path.parent() {
            for stub in config.connection.stubs.values_mut() {
                if stub.is_relative() {
                    *stub = dir.join(&*stub);
                }
            }
        }

        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(s).map_err(|err| Error::Config(err.to_string()))?;
        config.connection.validate()?;
        if config.image.block_size == 0 {
            return Err(Error::Config("'block_size' must not be zero".into()));
        }

        Ok(config)
    }

    fn config_path() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }

        ProjectDirs::from("rs", "esp", "espkit")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
    }
}
