//! Reset sequences that put a device into its serial bootloader
//!
//! The timings follow esptool.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::time::sleep;

use super::port::{SerialInterface, UsbInfo};
use crate::error::Error;

/// Default time to wait before releasing the boot pin after a reset
const DEFAULT_RESET_DELAY: u64 = 50; // ms
/// Amount of time to wait if the default reset delay does not work
const EXTRA_RESET_DELAY: u64 = 550; // ms

/// Some strategy for resetting a target device
#[async_trait]
pub trait ResetStrategy: Send + Sync + std::fmt::Debug {
    async fn reset(&self, port: &dyn SerialInterface) -> Result<(), Error>;
}

/// Classic reset sequence, sets DTR and RTS sequentially.
#[derive(Debug, Clone, Copy)]
pub struct ClassicReset {
    delay: u64,
}

impl ClassicReset {
    pub fn new(extra_delay: bool) -> Self {
        let delay = if extra_delay {
            EXTRA_RESET_DELAY
        } else {
            DEFAULT_RESET_DELAY
        };

        Self { delay }
    }
}

#[async_trait]
impl ResetStrategy for ClassicReset {
    async fn reset(&self, port: &dyn SerialInterface) -> Result<(), Error> {
        debug!(
            "Using Classic reset strategy with delay of {}ms",
            self.delay
        );

        port.set_dtr(false).await?; // IO0 = HIGH
        port.set_rts(true).await?; // EN = LOW, chip in reset

        sleep(Duration::from_millis(100)).await;

        port.set_dtr(true).await?; // IO0 = LOW
        port.set_rts(false).await?; // EN = HIGH, chip out of reset

        sleep(Duration::from_millis(self.delay)).await;

        port.set_dtr(false).await?; // IO0 = HIGH, done

        Ok(())
    }
}

/// Reset sequence required when the device is connected via its
/// USB-JTAG-Serial peripheral.
#[derive(Debug, Clone, Copy)]
pub struct UsbJtagSerialReset;

#[async_trait]
impl ResetStrategy for UsbJtagSerialReset {
    async fn reset(&self, port: &dyn SerialInterface) -> Result<(), Error> {
        debug!("Using UsbJtagSerial reset strategy");

        port.set_rts(false).await?;
        port.set_dtr(false).await?; // Idle

        sleep(Duration::from_millis(100)).await;

        port.set_dtr(true).await?; // Set IO0
        port.set_rts(false).await?;

        sleep(Duration::from_millis(100)).await;

        port.set_rts(true).await?; // Reset through (1,1) instead of (0,0)
        port.set_dtr(false).await?;
        port.set_rts(true).await?; // Windows only propagates DTR on RTS setting

        sleep(Duration::from_millis(100)).await;

        port.set_dtr(false).await?;
        port.set_rts(false).await?;

        Ok(())
    }
}

/// Reset sequences to try, in order, for a port with the given identity
pub fn reset_sequence(usb: Option<UsbInfo>) -> Vec<Box<dyn ResetStrategy>> {
    if usb.is_some_and(|info| info.is_usb_serial_jtag()) {
        return vec![Box::new(UsbJtagSerialReset)];
    }

    vec![
        Box::new(ClassicReset::new(false)),
        Box::new(ClassicReset::new(true)),
    ]
}

/// Reset the device into the application
pub async fn hard_reset(port: &dyn SerialInterface) -> Result<(), Error> {
    sleep(Duration::from_millis(100)).await;

    if port.usb_info().is_some_and(|info| info.is_usb_serial_jtag()) {
        port.set_dtr(false).await?;

        sleep(Duration::from_millis(100)).await;

        port.set_rts(true).await?;
        port.set_dtr(false).await?;
        port.set_rts(true).await?;

        sleep(Duration::from_millis(100)).await;

        port.set_rts(false).await?;
    } else {
        port.set_rts(true).await?;

        sleep(Duration::from_millis(100)).await;

        port.set_rts(false).await?;
    }

    Ok(())
}
