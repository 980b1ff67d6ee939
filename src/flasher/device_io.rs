//! A [FlashImage] backed by a connected device

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use super::Flasher;
use crate::{
    config::ImageConfig,
    error::Error,
    image::{Fetched, FlashImage, FlashIo},
};

/// Erase sector size of SPI flash
pub const SECTOR_SIZE: u32 = 0x1000;

/// [FlashIo] over the flasher's read and write commands
///
/// Reads are widened to whole sectors; writes are expanded to whole sectors
/// before flushing, since the loader erases every sector it writes to.
#[derive(Debug, Clone)]
pub struct DeviceFlash {
    flasher: Arc<Flasher>,
    size: u32,
}

impl DeviceFlash {
    /// Expose `size` bytes of flash
    pub fn new(flasher: Arc<Flasher>, size: u32) -> Self {
        DeviceFlash { flasher, size }
    }

    /// An image over the whole flash of the device
    pub fn image(flasher: Arc<Flasher>, size: u32, config: &ImageConfig) -> FlashImage {
        let io = Arc::new(Self::new(flasher, size));
        FlashImage::new(size, Some(io))
            .with_block_size(config.block_size)
            .with_fill_retry_limit(config.fill_retry_limit)
    }
}

#[async_trait]
impl FlashIo for DeviceFlash {
    async fn read_range(&self, address: u32, length: u32) -> Result<Fetched, Error> {
        let start = address / SECTOR_SIZE * SECTOR_SIZE;
        let end = (address as u64 + length as u64)
            .div_ceil(SECTOR_SIZE as u64)
            .saturating_mul(SECTOR_SIZE as u64)
            .min(self.size as u64) as u32;

        debug!(
            "Fetching 0x{:x}..0x{:x} for a request at 0x{:x}",
            start, end, address
        );
        let data = self.flasher.read_flash(start, end - start).await?;

        Ok(Fetched {
            address: start,
            data,
        })
    }

    async fn write_range(&self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.flasher.write_flash(address, data).await
    }

    async fn prepare_flush(&self, image: &FlashImage) -> Result<(), Error> {
        image.ensure_pending_blocks_cached(SECTOR_SIZE).await?;
        image.align_pending_writes(SECTOR_SIZE);
        Ok(())
    }
}
