//! Library and application errors

use std::{
    array::TryFromSliceError,
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use strum::VariantNames;
use thiserror::Error;

use crate::{connection::command::CommandType, targets::Chip};

/// All possible errors returned by espkit
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Malformed on-flash data")]
    #[diagnostic(transparent)]
    Format(#[from] FormatError),

    #[error("Flash image access failed")]
    #[diagnostic(transparent)]
    Coverage(#[from] CoverageError),

    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Communication error while flashing device")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    RomError(#[from] RomError),

    #[error("Unrecognized magic value: {0:#x}")]
    #[diagnostic(
        code(espkit::chip_detect_error),
        help("Supported chips are: {}\n\
              If your chip is supported, try hard-resetting the device and try again",
             Chip::VARIANTS.join(", "))
    )]
    ChipDetectError(u32),

    #[error("Unrecognized chip id: {0}")]
    #[diagnostic(code(espkit::chip_id))]
    UnknownChipId(u16),

    #[error("Corrupt data, expected {0:#x} bytes but received {1:#x} bytes")]
    #[diagnostic(code(espkit::read_flash::corrupt_data))]
    CorruptData(usize, usize),

    #[error("MD5 digest mismatch: expected {0:02x?}, received: {1:02x?}")]
    #[diagnostic(code(espkit::read_flash::digest_mismatch))]
    DigestMismatch(Vec<u8>, Vec<u8>),

    #[error("Expected MD5 digest (16 bytes), received: {0:#x} bytes")]
    #[diagnostic(code(espkit::read_flash::incorrect_digest_length))]
    IncorrectDigestLength(usize),

    #[error("Read more bytes than expected")]
    #[diagnostic(code(espkit::read_flash::read_more_than_expected))]
    ReadMoreThanExpected,

    #[error("Invalid response: {0}")]
    #[diagnostic(code(espkit::invalid_response))]
    InvalidResponse(String),

    #[error("Verification of flash content at {address:#010x} failed")]
    #[diagnostic(
        code(espkit::verify_failed),
        help("The device computed a different MD5 digest than the data that was sent")
    )]
    VerifyFailed { address: u32 },

    #[error("This command requires using the RAM stub")]
    #[diagnostic(
        code(espkit::stub_required),
        help("Provide a flasher stub for the chip in the configuration file")
    )]
    StubRequired,

    #[error("No flasher stub is configured for the {0}")]
    #[diagnostic(
        code(espkit::stub_missing),
        help("Add the chip to the `[connection.stubs]` table of the configuration file")
    )]
    StubMissing(Chip),

    #[error("Invalid flasher stub: {0}")]
    #[diagnostic(code(espkit::stub_invalid))]
    InvalidStub(String),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(espkit::config))]
    Config(String),

    #[error("Operation requires a connected device in state {expected}, current state is {actual}")]
    #[diagnostic(code(espkit::session_state))]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error(transparent)]
    #[diagnostic(code(espkit::io))]
    Io(#[from] io::Error),
}

impl From<TryFromSliceError> for Error {
    fn from(_: TryFromSliceError) -> Self {
        Error::InvalidResponse("response slice has an unexpected length".into())
    }
}

/// Structural problems found in on-flash data
#[derive(Debug, Clone, Diagnostic, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FormatError {
    #[error("Bad magic at {offset:#x}: expected {expected:#x}, found {found:#x}")]
    #[diagnostic(code(espkit::format::magic))]
    BadMagic {
        offset: u32,
        expected: u32,
        found: u32,
    },

    #[error("Implausible {what} of {value:#x} at {offset:#x}")]
    #[diagnostic(
        code(espkit::format::implausible),
        help("The region is probably erased or corrupted")
    )]
    Implausible {
        what: &'static str,
        offset: u32,
        value: u32,
    },

    #[error("{what} at {offset:#x} (length {length:#x}) lies outside of the {limit:#x} byte region")]
    #[diagnostic(code(espkit::format::out_of_bounds))]
    OutOfBounds {
        what: &'static str,
        offset: u32,
        length: u32,
        limit: u32,
    },

    #[error("Checksum mismatch at {offset:#x}: stored {stored:#x}, computed {computed:#x}")]
    #[diagnostic(code(espkit::format::checksum))]
    ChecksumMismatch {
        offset: u32,
        stored: u32,
        computed: u32,
    },

    #[error("Digest mismatch at {offset:#x}: stored {stored:02x?}, computed {computed:02x?}")]
    #[diagnostic(code(espkit::format::digest))]
    DigestMismatch {
        offset: u32,
        stored: Vec<u8>,
        computed: Vec<u8>,
    },

    #[error("No {0} found")]
    #[diagnostic(code(espkit::format::not_found))]
    NotFound(String),

    #[error("Not enough free space: {0}")]
    #[diagnostic(code(espkit::format::no_space))]
    NoSpace(String),

    #[error("{0} already exists")]
    #[diagnostic(code(espkit::format::exists))]
    AlreadyExists(String),

    #[error("Invalid name '{0}'")]
    #[diagnostic(code(espkit::format::name))]
    InvalidName(String),

    #[error("Unsupported: {0}")]
    #[diagnostic(code(espkit::format::unsupported))]
    Unsupported(String),
}

/// Errors raised by the addressable flash image
#[derive(Debug, Clone, Diagnostic, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoverageError {
    #[error("Address range {address:#x}..{end:#x} exceeds the image size of {size:#x} bytes")]
    #[diagnostic(code(espkit::image::out_of_range))]
    OutOfRange { address: u64, end: u64, size: u32 },

    #[error("Read callback made no progress filling {address:#x} (length {length:#x})")]
    #[diagnostic(
        code(espkit::image::no_progress),
        help("The read callback returned data that does not cover the requested address")
    )]
    NoProgress { address: u32, length: u32 },

    #[error("Gave up filling the cache after {0} read callback invocations")]
    #[diagnostic(code(espkit::image::retry_limit))]
    RetryLimit(usize),
}

/// Connection-related errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(espkit::connection_failed),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    ConnectionFailed,

    #[error("The device was disconnected")]
    #[diagnostic(
        code(espkit::disconnected),
        help("Reconnect the device and open a new connection")
    )]
    Disconnected,

    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(
        code(espkit::slip_framing),
        help("Try hard-resetting the device and try again, if the error persists your ROM may be corrupted")
    )]
    FramingError,

    #[error("Invalid stub handshake response received")]
    InvalidStubHandshake,

    #[error("Download mode successfully detected, but getting no sync reply")]
    #[diagnostic(
        code(espkit::no_sync_reply),
        help("The serial TX path seems to be down")
    )]
    NoSyncReply,

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(espkit::timeout))]
    Timeout(TimedOutCommand),

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(espkit::serial_error))]
    Serial(#[source] io::Error),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
            io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => ConnectionError::Disconnected,
            _ => ConnectionError::Serial(err),
        }
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

/// An executed command which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand { command: Some(ct) }
    }
}

/// Errors originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Default, Diagnostic, Error, PartialEq, Eq, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(espkit::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(espkit::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid CRC")]
    #[diagnostic(code(espkit::rom::crc))]
    InvalidCrc = 0x07,

    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(espkit::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(espkit::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(espkit::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[error("Malformed compressed data received")]
    #[diagnostic(code(espkit::rom::deflate))]
    DeflateError = 0x0b,

    #[error("Bad data length")]
    #[diagnostic(code(espkit::rom::data_len))]
    BadDataLen = 0xc0,

    #[error("Bad data checksum")]
    #[diagnostic(code(espkit::rom::data_crc))]
    BadDataChecksum = 0xc1,

    #[error("Bad block size")]
    #[diagnostic(code(espkit::rom::block_size))]
    BadBlocksize = 0xc2,

    #[error("Invalid command")]
    #[diagnostic(code(espkit::rom::cmd))]
    InvalidCommand = 0xc3,

    #[error("SPI operation failed")]
    #[diagnostic(code(espkit::rom::spi))]
    FailedSpiOp = 0xc4,

    #[error("SPI unlock failed")]
    #[diagnostic(code(espkit::rom::spi_unlock))]
    FailedSpiUnlock = 0xc5,

    #[error("Not in flash mode")]
    #[diagnostic(code(espkit::rom::flash_mode))]
    NotInFlashMode = 0xc6,

    #[error("Error when uncompressing the data")]
    #[diagnostic(code(espkit::rom::inflate))]
    InflateError = 0xc7,

    #[error("Didn't receive enough data")]
    #[diagnostic(code(espkit::rom::not_enough))]
    NotEnoughData = 0xc8,

    #[error("Received too much data")]
    #[diagnostic(code(espkit::rom::too_much_data))]
    TooMuchData = 0xc9,

    #[default]
    #[error("Other")]
    #[diagnostic(code(espkit::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// An error originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Diagnostic, Error)]
#[error("Error while running {command} command")]
#[non_exhaustive]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }

    /// The command which failed
    pub fn command(&self) -> CommandType {
        self.command
    }

    /// The reason reported by the device
    pub fn kind(&self) -> RomErrorKind {
        self.kind
    }
}

pub(crate) trait ResultExt {
    /// Mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }

    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            Err(Error::Flashing(ConnectionError::Timeout(_))) => {
                Err(Error::Flashing(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}
