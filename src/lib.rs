//! Inspect, edit and flash the contents of Espressif SPI flash
//!
//! The crate is built around [FlashImage], a lazily populated and write
//! buffered view of a flash chip. The codecs in [format] decode and edit the
//! structures found on ESP flash (firmware images, partition tables, FAT
//! with wear levelling, SPIFFS, NVS and OTA data) through that view, and the
//! [Flasher] talks to the serial bootloader to back the view with a real
//! device.
//!
//! ```no_run
//! # async fn example(dump: Vec<u8>) -> Result<(), espkit::Error> {
//! use espkit::{format::partition_table::PartitionTable, FlashImage};
//!
//! let image = FlashImage::from_bytes(dump);
//! let offset = PartitionTable::discover_offset(&image, 0x1000).await?;
//! let table = PartitionTable::parse(&image, offset).await?;
//! for partition in &table.partitions {
//!     println!("{}", partition.label);
//! }
//! # Ok(())
//! # }
//! ```

pub use self::{
    config::Config,
    error::Error,
    flasher::Flasher,
    image::FlashImage,
    targets::Chip,
};

pub mod config;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod format;
pub mod image;
#[cfg(feature = "cli")]
pub mod logging;
pub mod targets;
