//! The byte stream a [Connection](super::Connection) runs over
//!
//! No concrete backend ships with the crate; applications plug in a serial
//! port, a WebUSB bridge, or a test double.

use async_trait::async_trait;

use crate::error::ConnectionError;

/// Espressif's USB vendor id
pub const ESPRESSIF_VID: u16 = 0x303A;
/// Product id of the built-in USB-JTAG-Serial peripheral
pub const USB_SERIAL_JTAG_PID: u16 = 0x1001;

/// USB identity of the port, when it is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbInfo {
    pub vid: u16,
    pub pid: u16,
}

impl UsbInfo {
    /// Whether the device is attached through its native USB-JTAG-Serial
    /// peripheral rather than a USB-to-UART bridge
    pub fn is_usb_serial_jtag(&self) -> bool {
        self.vid == ESPRESSIF_VID && self.pid == USB_SERIAL_JTAG_PID
    }
}

/// Duplex byte stream with two modem control lines
#[async_trait]
pub trait SerialInterface: Send + Sync {
    /// Drive the DTR line (boot mode select on most boards)
    async fn set_dtr(&self, level: bool) -> Result<(), ConnectionError>;

    /// Drive the RTS line (chip enable on most boards)
    async fn set_rts(&self, level: bool) -> Result<(), ConnectionError>;

    async fn write_all(&self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Wait for the next chunk of received bytes
    ///
    /// Chunks have arbitrary sizes. `None` signals that the stream has been
    /// closed or the device went away.
    async fn read(&self) -> Result<Option<Vec<u8>>, ConnectionError>;

    fn usb_info(&self) -> Option<UsbInfo> {
        None
    }

    async fn set_baud_rate(&self, _baud: u32) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError>;
}
