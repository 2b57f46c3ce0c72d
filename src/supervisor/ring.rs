//! Fixed-capacity byte ring for captured child stdout/stderr.
//!
//! Oldest bytes are dropped on overflow; capacity is 16 KiB per stream.

use std::collections::VecDeque;

pub const RING_CAPACITY: usize = 16 * 1024;

#[derive(Debug)]
pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(RING_CAPACITY)
    }
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(RING_CAPACITY)),
            capacity,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        // A single write larger than the whole ring keeps only its tail.
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Current contents, oldest first.
    pub fn contents(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    pub fn contents_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_tail_on_overflow() {
        let mut ring = RingBuffer::new(8);
        ring.write(b"abcdef");
        ring.write(b"ghij");
        assert_eq!(ring.contents(), b"cdefghij");
        assert_eq!(ring.len(), 8);
    }

    #[test]
    fn oversized_single_write_keeps_its_tail() {
        let mut ring = RingBuffer::new(4);
        ring.write(b"0123456789");
        assert_eq!(ring.contents(), b"6789");
    }

    #[test]
    fn lossy_string_view() {
        let mut ring = RingBuffer::new(64);
        ring.write(b"server listening on 9100\n");
        assert!(ring.contents_lossy().contains("listening"));
    }
}
