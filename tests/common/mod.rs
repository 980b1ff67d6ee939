//! An in-memory device speaking the serial bootloader protocol

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use espkit::{
    connection::{
        command::{checksum, CommandType, CHECKSUM_INIT},
        port::SerialInterface,
        slip::{self, SlipDecoder},
    },
    error::ConnectionError,
    flasher::stubs::FlashStub,
    Chip,
};
use md5::{Digest, Md5};
use tokio::sync::mpsc;

pub const FLASH_SIZE: usize = 0x10000;
const SECTOR: usize = 0x1000;

/// Behaviour knobs of the [MockDevice]
#[derive(Debug, Clone)]
pub struct MockOptions {
    pub chip: Chip,
    /// Answer `GET_SECURITY_INFO`, otherwise it fails like on the ESP32
    pub security_info: bool,
    /// Sync packets to leave unanswered before replying
    pub ignored_syncs: usize,
    /// Replies sent for every answered sync packet
    pub sync_replies: usize,
    /// Delay before each command response
    pub latency: Option<Duration>,
    /// Flip a bit of the digest closing a flash read
    pub corrupt_read_digest: bool,
    /// Handshake sent once the stub is started
    pub handshake: &'static [u8],
}

impl Default for MockOptions {
    fn default() -> Self {
        MockOptions {
            chip: Chip::Esp32c3,
            security_info: true,
            ignored_syncs: 0,
            sync_replies: 3,
            latency: None,
            corrupt_read_digest: false,
            handshake: b"OHAI",
        }
    }
}

#[derive(Debug)]
struct FlashWrite {
    offset: usize,
    block_size: usize,
}

#[derive(Debug)]
struct FlashRead {
    offset: usize,
    size: usize,
    block_size: usize,
    max_in_flight: usize,
    sent: usize,
    acked: usize,
}

#[derive(Debug, Default)]
struct DeviceState {
    decoder: SlipDecoder,
    stub: bool,
    syncs_seen: usize,
    write: Option<FlashWrite>,
    read: Option<FlashRead>,
    ram: Vec<u8>,
    commands: Vec<CommandType>,
    acks: Vec<u32>,
    max_unacked: usize,
    bad_checksums: usize,
    baud: Option<u32>,
    lines: Vec<(&'static str, bool)>,
}

/// A fake chip behind a serial port
pub struct MockDevice {
    options: MockOptions,
    to_host: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    from_device: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    state: Mutex<DeviceState>,
    flash: Mutex<Vec<u8>>,
    /// Commands received but not answered yet
    outstanding: Arc<AtomicUsize>,
    /// Commands that arrived while another one was outstanding
    interleaved: AtomicUsize,
    closes: AtomicUsize,
}

impl MockDevice {
    pub fn new(options: MockOptions) -> Arc<Self> {
        let flash = (0..FLASH_SIZE).map(|i| (i * 7 % 251) as u8).collect();
        Self::with_flash(options, flash)
    }

    pub fn with_flash(options: MockOptions, flash: Vec<u8>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(MockDevice {
            options,
            to_host: Mutex::new(Some(tx)),
            from_device: tokio::sync::Mutex::new(rx),
            state: Mutex::new(DeviceState::default()),
            flash: Mutex::new(flash),
            outstanding: Arc::new(AtomicUsize::new(0)),
            interleaved: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn flash(&self) -> Vec<u8> {
        self.flash.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<CommandType> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn count(&self, ty: CommandType) -> usize {
        self.commands().iter().filter(|c| **c == ty).count()
    }

    pub fn acks(&self) -> Vec<u32> {
        self.state.lock().unwrap().acks.clone()
    }

    pub fn max_unacked(&self) -> usize {
        self.state.lock().unwrap().max_unacked
    }

    pub fn bad_checksums(&self) -> usize {
        self.state.lock().unwrap().bad_checksums
    }

    pub fn baud(&self) -> Option<u32> {
        self.state.lock().unwrap().baud
    }

    pub fn ram(&self) -> Vec<u8> {
        self.state.lock().unwrap().ram.clone()
    }

    pub fn interleaved(&self) -> usize {
        self.interleaved.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.to_host.lock().unwrap().clone()
    }

    fn send_frame(&self, payload: &[u8]) {
        if let Some(tx) = self.sender() {
            tx.send(slip::encode(payload)).ok();
        }
    }

    fn response_frame(op: u8, value: u32, data: &[u8], error: Option<u8>, stub: bool) -> Vec<u8> {
        let mut body = data.to_vec();
        let (failed, code) = match error {
            Some(code) => (1, code),
            None => (0, 0),
        };
        match stub {
            true => body.extend_from_slice(&[failed, code]),
            false => body.extend_from_slice(&[failed, code, 0, 0]),
        }

        let mut frame = vec![0x01, op];
        frame.extend_from_slice(&(body.len() as u16).to_le_bytes());
        frame.extend_from_slice(&value.to_le_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    fn respond(&self, op: u8, value: u32, data: &[u8], error: Option<u8>, stub: bool) {
        let frame = Self::response_frame(op, value, data, error, stub);
        self.emit_response(vec![frame]);
    }

    /// Send a command response, followed by `frames[1..]`, after the
    /// configured latency
    fn emit_response(&self, frames: Vec<Vec<u8>>) {
        let Some(tx) = self.sender() else { return };
        let outstanding = self.outstanding.clone();
        let send = move || {
            outstanding.fetch_sub(1, Ordering::SeqCst);
            for frame in frames {
                tx.send(slip::encode(&frame)).ok();
            }
        };

        match self.options.latency {
            Some(latency) => {
                tokio::spawn(async move {
                    tokio::time::sleep(latency).await;
                    send();
                });
            }
            None => send(),
        }
    }

    fn security_info(&self) -> Vec<u8> {
        let mut info = vec![0u8; 20];
        info[12..16].copy_from_slice(&(self.options.chip.id() as u32).to_le_bytes());
        info[16..20].copy_from_slice(&3u32.to_le_bytes());
        info
    }

    fn magic(&self) -> u32 {
        match self.options.chip {
            Chip::Esp32 => 0x00f0_1d83,
            Chip::Esp32s2 => 0x0000_07c6,
            Chip::Esp32s3 => 0x9,
            _ => 0x1b31_506f,
        }
    }

    fn handle_packet(&self, packet: &[u8]) {
        let mut state = self.state.lock().unwrap();

        // Flash read acknowledgements are bare byte counts
        if packet.len() == 4 && state.read.is_some() {
            let acked = u32::from_le_bytes(packet.try_into().unwrap());
            state.acks.push(acked);
            self.stream_read(&mut state, Some(acked as usize));
            return;
        }

        if packet.len() < 8 || packet[0] != 0x00 {
            return;
        }
        let op = packet[1];
        let Some(ty) = CommandType::from_repr(op) else {
            return;
        };
        let data = &packet[8..];
        let stub = state.stub;
        state.commands.push(ty);

        if ty == CommandType::Sync {
            state.syncs_seen += 1;
            if state.syncs_seen <= self.options.ignored_syncs {
                return;
            }
            // Sync replies come back immediately, and more than once
            for _ in 0..self.options.sync_replies {
                self.send_frame(&Self::response_frame(op, 0, &[], None, stub));
            }
            return;
        }

        if self.outstanding.fetch_add(1, Ordering::SeqCst) > 0 {
            self.interleaved.fetch_add(1, Ordering::SeqCst);
        }

        let word = |i: usize| u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap()) as usize;

        match ty {
            CommandType::GetSecurityInfo if self.options.security_info => {
                self.respond(op, 0, &self.security_info(), None, stub)
            }
            CommandType::GetSecurityInfo => self.respond(op, 0, &[], Some(0x05), stub),
            CommandType::ReadReg => self.respond(op, self.magic(), &[], None, stub),
            // Sections are appended in upload order
            CommandType::MemBegin => self.respond(op, 0, &[], None, stub),
            CommandType::MemData => {
                let block = &data[16..];
                if checksum(block, CHECKSUM_INIT) as u32
                    != u32::from_le_bytes(packet[4..8].try_into().unwrap())
                {
                    state.bad_checksums += 1;
                    self.respond(op, 0, &[], Some(0x07), stub);
                    return;
                }
                state.ram.extend_from_slice(block);
                self.respond(op, 0, &[], None, stub);
            }
            CommandType::MemEnd => {
                let response = Self::response_frame(op, 0, &[], None, stub);
                self.emit_response(vec![response, self.options.handshake.to_vec()]);
                state.stub = true;
            }
            CommandType::FlashBegin => {
                let (size, block_size, offset) = (word(0), word(2), word(3));
                let end = (offset + size).div_ceil(SECTOR) * SECTOR;
                let mut flash = self.flash.lock().unwrap();
                let end = end.min(flash.len());
                flash[offset..end].fill(0xFF);
                state.write = Some(FlashWrite { offset, block_size });
                self.respond(op, 0, &[], None, stub);
            }
            CommandType::FlashData => {
                let sequence = word(1);
                let block = &data[16..];
                if checksum(block, CHECKSUM_INIT) as u32
                    != u32::from_le_bytes(packet[4..8].try_into().unwrap())
                {
                    state.bad_checksums += 1;
                    self.respond(op, 0, &[], Some(0x07), stub);
                    return;
                }
                let Some(write) = &state.write else {
                    self.respond(op, 0, &[], Some(0x05), stub);
                    return;
                };
                let mut flash = self.flash.lock().unwrap();
                let start = write.offset + sequence * write.block_size;
                let end = (start + block.len()).min(flash.len());
                // Programming can only clear bits
                for (cell, byte) in flash[start..end].iter_mut().zip(block) {
                    *cell &= *byte;
                }
                self.respond(op, 0, &[], None, stub);
            }
            CommandType::FlashEnd => {
                state.write = None;
                self.respond(op, 0, &[], None, stub);
            }
            CommandType::FlashMd5 => {
                let (offset, size) = (word(0), word(1));
                let digest = Md5::digest(&self.flash.lock().unwrap()[offset..offset + size]);
                match stub {
                    true => self.respond(op, 0, &digest, None, stub),
                    false => {
                        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
                        self.respond(op, 0, hex.as_bytes(), None, stub);
                    }
                }
            }
            CommandType::EraseRegion if stub => {
                let (offset, size) = (word(0), word(1));
                self.flash.lock().unwrap()[offset..offset + size].fill(0xFF);
                self.respond(op, 0, &[], None, stub);
            }
            CommandType::ReadFlash if stub => {
                state.read = Some(FlashRead {
                    offset: word(0),
                    size: word(1),
                    block_size: word(2),
                    max_in_flight: word(3),
                    sent: 0,
                    acked: 0,
                });
                self.respond(op, 0, &[], None, stub);
                self.stream_read(&mut state, None);
            }
            CommandType::ChangeBaudrate => {
                state.baud = Some(word(0) as u32);
                self.respond(op, 0, &[], None, stub);
            }
            CommandType::SpiAttach | CommandType::SpiSetParams | CommandType::WriteReg => {
                self.respond(op, 0, &[], None, stub)
            }
            _ => self.respond(op, 0, &[], Some(0x05), stub),
        }
    }

    /// Send flash read data up to the in-flight window, and the digest once
    /// everything has been acknowledged
    fn stream_read(&self, state: &mut DeviceState, ack: Option<usize>) {
        let Some(read) = state.read.as_mut() else {
            return;
        };
        if let Some(ack) = ack {
            read.acked = ack;
        }

        let flash = self.flash.lock().unwrap();
        while read.sent < read.size && read.sent - read.acked < read.max_in_flight {
            let len = read.block_size.min(read.size - read.sent);
            let start = read.offset + read.sent;
            self.send_frame(&flash[start..start + len]);
            read.sent += len;
            state.max_unacked = state.max_unacked.max(read.sent - read.acked);
        }

        if read.acked >= read.size {
            let mut digest = Md5::digest(&flash[read.offset..read.offset + read.size]).to_vec();
            if self.options.corrupt_read_digest {
                digest[0] ^= 0x01;
            }
            drop(flash);
            self.send_frame(&digest);
            state.read = None;
        }
    }
}

#[async_trait]
impl SerialInterface for MockDevice {
    async fn set_dtr(&self, level: bool) -> Result<(), ConnectionError> {
        self.state.lock().unwrap().lines.push(("dtr", level));
        Ok(())
    }

    async fn set_rts(&self, level: bool) -> Result<(), ConnectionError> {
        self.state.lock().unwrap().lines.push(("rts", level));
        Ok(())
    }

    async fn write_all(&self, data: &[u8]) -> Result<(), ConnectionError> {
        if self.sender().is_none() {
            return Err(ConnectionError::Disconnected);
        }

        let frames = self.state.lock().unwrap().decoder.feed(data);
        for frame in frames {
            self.handle_packet(&frame);
        }

        Ok(())
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, ConnectionError> {
        Ok(self.from_device.lock().await.recv().await)
    }

    async fn set_baud_rate(&self, _baud: u32) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.to_host.lock().unwrap().take();
        Ok(())
    }
}

/// A stub image with recognisable sections
pub fn test_stub() -> FlashStub {
    let text: Vec<u8> = (0..0x2000u32).map(|i| (i % 253) as u8).collect();
    let data: Vec<u8> = (0..0x300u32).map(|i| (i % 13) as u8).collect();
    FlashStub::new(0x4038_0000, 0x4037_C400, &text, 0x3FC9_6BA8, &data)
}
