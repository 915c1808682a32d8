//! Resynchronizing frame extraction from a raw byte stream.
//!
//! The transport may hand over chunks that start mid-frame, split a frame
//! in two, or carry corrupted bytes. [`Framer`] buffers everything it is
//! given and only emits frames whose checksum matches.

use crate::protocol::{checksum, Frame, HEADER_LENGTH, MIN_FRAME_LENGTH, START_BYTE};

#[derive(Debug, Default)]
pub struct Framer {
    buffer: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes waiting for more data.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Appends `chunk` and returns every frame that became complete, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while self.buffer.len() >= MIN_FRAME_LENGTH {
            let Some(start) = self.buffer.iter().position(|b| *b == START_BYTE) else {
                log::trace!("no start byte, dropping {} bytes", self.buffer.len());
                self.buffer.clear();
                break;
            };
            if start > 0 {
                log::trace!("skipping {start} bytes before start byte");
                self.buffer.drain(..start);
                if self.buffer.len() < MIN_FRAME_LENGTH {
                    break;
                }
            }

            let length = self.buffer[3] as usize;
            let total = HEADER_LENGTH + length + 1;
            if self.buffer.len() < total {
                break;
            }

            let expected = checksum(&self.buffer[..total - 1]);
            if expected != self.buffer[total - 1] {
                log::debug!(
                    "Invalid checksum - calculated={:02X?} received={:02X?}, resynchronizing",
                    expected,
                    self.buffer[total - 1]
                );
                self.buffer.drain(..1);
                continue;
            }

            let frame = Frame {
                source: self.buffer[1],
                command: self.buffer[2],
                length: self.buffer[3],
                payload: self.buffer[HEADER_LENGTH..total - 1].to_vec(),
            };
            log::trace!("frame: {frame}");
            frames.push(frame);
            self.buffer.drain(..total);
        }
        frames
    }
}
