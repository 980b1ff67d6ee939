//! Establish a connection with a target device
//!
//! The [Connection] struct owns the byte stream, decodes incoming SLIP frames
//! on a background task and hands them to whichever command currently holds
//! the command lock. Outbound frames go through a separate write lock, so a
//! flow control acknowledgement can be sent while a command is still waiting
//! for its data.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use log::{debug, trace, warn};
use strum::{Display, IntoStaticStr};
use tokio::{
    sync::{mpsc, MutexGuard},
    task::JoinHandle,
    time::Instant,
};

use self::{
    command::Command,
    port::SerialInterface,
    slip::SlipDecoder,
};
use crate::error::{ConnectionError, Error, ResultExt, RomError, RomErrorKind};

pub mod command;
pub mod port;
pub mod reset;
pub mod slip;

/// Direction byte of packets sent by the device
const DIRECTION_RESPONSE: u8 = 0x01;
/// Length of the fixed packet header
const HEADER_LEN: usize = 8;

/// Where the conversation with the device stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum SessionState {
    Disconnected,
    /// Stream open, bootloader not answering yet
    Connected,
    /// Talking to the ROM bootloader
    Synced,
    /// Talking to the flasher stub
    StubLoaded,
}

/// A response from a target device following a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub return_op: u8,
    pub return_length: u16,
    pub value: u32,
    /// Response payload without the trailing status bytes
    pub data: Vec<u8>,
    /// Failure flag of the status bytes
    pub failed: bool,
    /// Error code of the status bytes
    pub error: u8,
}

impl CommandResponse {
    /// Decode a response frame
    ///
    /// The stub always appends two status bytes; the ROM loaders append four
    /// unless the payload length says otherwise.
    pub fn parse(frame: &[u8], stub: bool) -> Result<Self, Error> {
        if frame.len() < HEADER_LEN {
            return Err(Error::InvalidResponse(format!(
                "expected a packet of at least {HEADER_LEN} bytes, received {} bytes",
                frame.len()
            )));
        }
        if frame[0] != DIRECTION_RESPONSE {
            return Err(Error::InvalidResponse(format!(
                "unexpected direction byte {:#04x}",
                frame[0]
            )));
        }

        let body = &frame[HEADER_LEN..];
        let status_len = match stub {
            true => 2,
            false if body.len() % 4 == 0 => 4,
            false => 2,
        };
        if body.len() < status_len {
            return Err(Error::InvalidResponse(format!(
                "response to {:#04x} is missing its status bytes",
                frame[1]
            )));
        }
        let status = body.len() - status_len;

        Ok(CommandResponse {
            return_op: frame[1],
            return_length: u16::from_le_bytes([frame[2], frame[3]]),
            value: u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]),
            data: body[..status].to_vec(),
            failed: body[status] != 0,
            error: body[status + 1],
        })
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SessionState>,
    started: Instant,
    /// Microseconds after `started` at which bytes last arrived
    last_rx: AtomicU64,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            debug!("Session state {} -> {}", *current, state);
            *current = state;
        }
    }

    fn touch(&self) {
        let micros = self.started.elapsed().as_micros() as u64;
        self.last_rx.store(micros, Ordering::Relaxed);
    }

    fn idle_time(&self) -> Duration {
        let last = Duration::from_micros(self.last_rx.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

/// An established connection with a target device
pub struct Connection {
    port: Arc<dyn SerialInterface>,
    frames: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    write_lock: tokio::sync::Mutex<()>,
    shared: Arc<Shared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("usb", &self.port.usb_info())
            .finish()
    }
}

impl Connection {
    /// Take over `port` and start decoding what it receives
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(port: Arc<dyn SerialInterface>) -> Self {
        let (sender, frames) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::Connected),
            started: Instant::now(),
            last_rx: AtomicU64::new(0),
        });

        let receiver = tokio::spawn(receive_loop(port.clone(), sender, shared.clone()));

        Connection {
            port,
            frames: tokio::sync::Mutex::new(frames),
            write_lock: tokio::sync::Mutex::new(()),
            shared,
            receiver: Mutex::new(Some(receiver)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.shared.set_state(state);
    }

    /// Whether responses are expected in the stub's format
    pub fn is_stub(&self) -> bool {
        self.state() == SessionState::StubLoaded
    }

    pub fn port(&self) -> &Arc<dyn SerialInterface> {
        &self.port
    }

    /// Time since bytes last arrived from the device
    pub fn idle_time(&self) -> Duration {
        self.shared.idle_time()
    }

    /// Wait for exclusive use of the command channel
    ///
    /// Waiters are served in FIFO order, so concurrently issued operations
    /// run one after the other in the order they asked.
    pub async fn exchange(&self) -> Exchange<'_> {
        Exchange {
            connection: self,
            frames: self.frames.lock().await,
        }
    }

    /// Send a single command and wait for its response
    pub async fn command(
        &self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResponse, Error> {
        self.exchange().await.command(command, timeout).await
    }

    /// Frame `packet` and write it to the stream
    pub async fn send_packet(&self, packet: &[u8]) -> Result<(), Error> {
        if self.state() == SessionState::Disconnected {
            return Err(ConnectionError::Disconnected.into());
        }

        let frame = slip::encode(packet);
        let _guard = self.write_lock.lock().await;
        trace!("Writing {} byte frame", frame.len());
        self.port.write_all(&frame).await?;

        Ok(())
    }

    /// Close the stream and stop the receive task
    ///
    /// Safe to call repeatedly and from any state.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.shared.set_state(SessionState::Disconnected);

        let handle = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closing serial interface");
            self.port.close().await?;
        }

        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn receive_loop(
    port: Arc<dyn SerialInterface>,
    sender: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<Shared>,
) {
    let mut decoder = SlipDecoder::new();

    loop {
        match port.read().await {
            Ok(Some(chunk)) => {
                shared.touch();
                for frame in decoder.feed(&chunk) {
                    trace!("Received {} byte frame", frame.len());
                    if sender.send(frame).is_err() {
                        return;
                    }
                }
            }
            Ok(None) => {
                debug!("Serial stream closed");
                break;
            }
            Err(err) => {
                warn!("Reading from the serial stream failed: {}", err);
                break;
            }
        }
    }

    shared.set_state(SessionState::Disconnected);
}

/// Exclusive use of the command channel, see [Connection::exchange]
pub struct Exchange<'a> {
    connection: &'a Connection,
    frames: MutexGuard<'a, mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl Exchange<'_> {
    /// Throw away frames nobody waited for, e.g. duplicate sync replies
    fn drain(&mut self) {
        while let Ok(frame) = self.frames.try_recv() {
            trace!("Discarding stale {} byte frame", frame.len());
        }
    }

    /// Send a command and wait for the response carrying its op code
    ///
    /// Frames with other op codes are skipped. A response with its failure
    /// flag set becomes a [RomError].
    pub async fn command(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResponse, Error> {
        let ty = command.command_type();
        debug!("Writing command: {}", ty);

        self.drain();
        let packet = command.encode()?;
        self.connection.send_packet(&packet).await.for_command(ty)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = self.recv_raw(remaining, None).await.for_command(ty)?;

            match CommandResponse::parse(&frame, self.connection.is_stub()) {
                Ok(response) if response.return_op == ty as u8 => {
                    return if response.failed {
                        Err(Error::RomError(RomError::new(
                            ty,
                            RomErrorKind::from(response.error),
                        )))
                    } else {
                        Ok(response)
                    };
                }
                Ok(response) => {
                    trace!(
                        "Ignoring response to {:#04x} while waiting for {}",
                        response.return_op,
                        ty
                    );
                }
                Err(err) => trace!("Ignoring frame: {}", err),
            }
        }
    }

    /// Wait for the next frame, whatever it contains
    ///
    /// When `timeout` elapses, `liveness` is asked whether the device still
    /// counts as active given the time since bytes last arrived; if it does,
    /// the wait starts over.
    pub async fn recv_raw(
        &mut self,
        timeout: Duration,
        liveness: Option<&(dyn Fn(Duration) -> bool + Send + Sync)>,
    ) -> Result<Vec<u8>, Error> {
        loop {
            match tokio::time::timeout(timeout, self.frames.recv()).await {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {
                    self.connection.set_state(SessionState::Disconnected);
                    return Err(ConnectionError::Disconnected.into());
                }
                Err(_) => {
                    let idle = self.connection.idle_time();
                    if liveness.is_some_and(|alive| alive(idle)) {
                        trace!("Device active {:?} ago, waiting longer", idle);
                        continue;
                    }
                    return Err(ConnectionError::Timeout(Default::default()).into());
                }
            }
        }
    }

    /// Send a frame outside the command/response scheme
    pub async fn send_raw(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.connection.send_packet(payload).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rom_and_stub_status_lengths() {
        let rom = [0x01, 0x0A, 4, 0, 0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0];
        let response = CommandResponse::parse(&rom, false).unwrap();
        assert_eq!(response.value, 0x1234_5678);
        assert!(response.data.is_empty());
        assert!(!response.failed);

        let stub = [0x01, 0x13, 18, 0, 0, 0, 0, 0, 0xAA, 0xBB, 0, 0];
        let response = CommandResponse::parse(&stub, true).unwrap();
        assert_eq!(response.data, vec![0xAA, 0xBB]);

        let failed = [0x01, 0x14, 4, 0, 0, 0, 0, 0, 1, 0xC3, 0, 0];
        let response = CommandResponse::parse(&failed, false).unwrap();
        assert!(response.failed);
        assert_eq!(RomErrorKind::from(response.error), RomErrorKind::InvalidCommand);
    }

    #[test]
    fn malformed_responses_are_rejected() {
        assert!(matches!(
            CommandResponse::parse(&[0x01, 0x08, 0], false),
            Err(Error::InvalidResponse(_))
        ));
        assert!(matches!(
            CommandResponse::parse(&[0x00, 0x08, 0, 0, 0, 0, 0, 0, 0, 0], true),
            Err(Error::InvalidResponse(_))
        ));
        assert!(matches!(
            CommandResponse::parse(&[0x01, 0x08, 0, 0, 0, 0, 0, 0, 0], true),
            Err(Error::InvalidResponse(_))
        ));
    }
}
