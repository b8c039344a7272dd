//! RAM write coalescing
//!
//! Records are staged as `(tag: u8, len: u16 LE, payload)` frames and only
//! reach the backend when the buffer overflows or is flushed.

use byteorder::{ByteOrder, LittleEndian};

/// Size of the frame prefix in front of each buffered record
pub const FRAME_HEADER_SIZE: usize = 3;

/// What the caller must do with a submitted record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Record was copied into the buffer
    Buffered,
    /// Buffer is empty and the record does not fit, write it directly
    Direct,
    /// Flush all buffered frames, then write the record directly
    FlushThenDirect,
}

/// A buffered record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub block_type: u8,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct RamBuffer {
    buf: Vec<u8>,
    capacity: usize,
}

impl RamBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently used, frame prefixes included
    pub fn used(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of buffered frames
    pub fn pending(&self) -> usize {
        let mut offset = 0;
        let mut count = 0;
        while offset + FRAME_HEADER_SIZE <= self.buf.len() {
            let len = LittleEndian::read_u16(&self.buf[offset + 1..offset + 3]) as usize;
            offset += FRAME_HEADER_SIZE + len;
            count += 1;
        }
        count
    }

    /// Stage a record if there is room for it
    pub fn submit(&mut self, block_type: u8, data: &[u8]) -> Admission {
        let space = self.capacity - self.buf.len();
        if data.len() <= u16::MAX as usize && space > FRAME_HEADER_SIZE + data.len() {
            let mut prefix = [block_type, 0, 0];
            LittleEndian::write_u16(&mut prefix[1..], data.len() as u16);
            self.buf.extend_from_slice(&prefix);
            self.buf.extend_from_slice(data);
            log::debug!("Pending {} byte {:02X} block", data.len(), block_type);
            Admission::Buffered
        } else if self.buf.is_empty() {
            Admission::Direct
        } else {
            Admission::FlushThenDirect
        }
    }

    /// Remove every buffered frame in submission order
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut offset = 0;
        while offset + FRAME_HEADER_SIZE <= self.buf.len() {
            let block_type = self.buf[offset];
            let len = LittleEndian::read_u16(&self.buf[offset + 1..offset + 3]) as usize;
            offset += FRAME_HEADER_SIZE;
            let end = (offset + len).min(self.buf.len());
            frames.push(Frame {
                block_type,
                data: self.buf[offset..end].to_vec(),
            });
            offset = end;
        }
        self.buf.clear();
        frames
    }
}
