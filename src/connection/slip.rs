//! SLIP framing of bootloader packets
//!
//! See <https://docs.espressif.com/projects/esptool/en/latest/esp32c3/advanced-topics/serial-protocol.html#low-level-protocol>

use std::io::Write;

use log::warn;

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

pub struct SlipEncoder<'a, W: Write> {
    writer: &'a mut W,
    len: usize,
}

impl<'a, W: Write> SlipEncoder<'a, W> {
    /// Creates a new encoder context
    pub fn new(writer: &'a mut W) -> std::io::Result<Self> {
        let len = writer.write(&[END])?;
        Ok(Self { writer, len })
    }

    pub fn finish(mut self) -> std::io::Result<usize> {
        self.len += self.writer.write(&[END])?;
        Ok(self.len)
    }
}

impl<W: Write> Write for SlipEncoder<'_, W> {
    /// Writes the given buffer replacing the END and ESC bytes
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for value in buf.iter() {
            match *value {
                END => {
                    self.len += self.writer.write(&[ESC, ESC_END])?;
                }
                ESC => {
                    self.len += self.writer.write(&[ESC, ESC_ESC])?;
                }
                _ => {
                    self.len += self.writer.write(&[*value])?;
                }
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Wrap `payload` into a single delimited frame
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    // Writing into a Vec cannot fail
    let _ = SlipEncoder::new(&mut out).and_then(|mut encoder| {
        encoder.write_all(payload)?;
        encoder.finish()
    });
    out
}

/// Incremental decoder over an arbitrarily chunked byte stream
#[derive(Debug, Default)]
pub struct SlipDecoder {
    buffer: Vec<u8>,
    escaped: bool,
    discarding: bool,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume `chunk`, returning every frame completed by it
    ///
    /// Empty frames (back to back delimiters) are skipped. A frame with an
    /// invalid escape sequence is dropped up to the next delimiter.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for &byte in chunk {
            if byte == END {
                if !self.discarding && !self.buffer.is_empty() {
                    frames.push(std::mem::take(&mut self.buffer));
                }
                self.buffer.clear();
                self.escaped = false;
                self.discarding = false;
                continue;
            }

            if self.discarding {
                continue;
            }

            if self.escaped {
                self.escaped = false;
                match byte {
                    ESC_END => self.buffer.push(END),
                    ESC_ESC => self.buffer.push(ESC),
                    other => {
                        warn!("Invalid SLIP escape 0xdb 0x{:02x}, dropping frame", other);
                        self.buffer.clear();
                        self.discarding = true;
                    }
                }
            } else if byte == ESC {
                self.escaped = true;
            } else {
                self.buffer.push(byte);
            }
        }

        frames
    }

    /// Bytes of the frame currently being assembled
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn escapes_delimiters() {
        assert_eq!(
            encode(&[0x01, END, 0x02, ESC, 0x03]),
            vec![END, 0x01, ESC, ESC_END, 0x02, ESC, ESC_ESC, 0x03, END]
        );
    }

    #[test]
    fn decodes_across_chunks() {
        let frame = encode(&[0xAA, END, ESC, 0xBB]);
        let mut decoder = SlipDecoder::new();

        let (head, tail) = frame.split_at(3);
        assert!(decoder.feed(head).is_empty());
        assert_eq!(decoder.pending(), 1);
        assert_eq!(decoder.feed(tail), vec![vec![0xAA, END, ESC, 0xBB]]);
    }

    #[test]
    fn skips_empty_and_broken_frames() {
        let mut decoder = SlipDecoder::new();
        let mut stream = vec![END, END, 0x01, ESC, 0x42, 0x02, END];
        stream.extend(encode(&[0x07]));

        assert_eq!(decoder.feed(&stream), vec![vec![0x07]]);
    }
}
