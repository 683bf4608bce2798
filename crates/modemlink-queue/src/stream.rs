use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use serde::Serialize;

use crate::config::MAX_QUEUE_CAPACITY;
use crate::error::{QueueError, Result};
use crate::ring::Ring;

/// Counters of an [`RxStreamBuffer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub capacity: usize,
    pub available: usize,
    pub total_received: u64,
    pub dropped: u64,
}

/// Unframed single-producer, single-consumer byte FIFO.
///
/// Used by channels in stream mode, where the layer above parses the byte
/// stream itself. There is no pause state: when the ring is full, new bytes
/// are dropped and counted.
#[derive(Debug)]
pub struct RxStreamBuffer {
    ring: Ring,
    buf: Box<[AtomicU8]>,
    read: AtomicUsize,
    write: AtomicUsize,
    stored: AtomicUsize,
    taken: AtomicUsize,
    total_received: AtomicU64,
    dropped: AtomicU64,
}

impl RxStreamBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(QueueError::Undersized {
                capacity,
                required: 0,
            });
        }
        if capacity > MAX_QUEUE_CAPACITY {
            return Err(QueueError::TooLarge {
                capacity,
                max: MAX_QUEUE_CAPACITY,
            });
        }
        Ok(Self {
            ring: Ring::new(capacity),
            buf: (0..capacity).map(|_| AtomicU8::new(0)).collect(),
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
            stored: AtomicUsize::new(0),
            taken: AtomicUsize::new(0),
            total_received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Producer side. Returns false if the byte was dropped.
    pub fn write_byte(&self, byte: u8) -> bool {
        self.total_received.fetch_add(1, Ordering::Relaxed);
        if self.available() >= self.ring.capacity() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let write = self.write.load(Ordering::Relaxed);
        self.buf[write].store(byte, Ordering::Relaxed);
        self.write.store(self.ring.advance(write, 1), Ordering::Relaxed);
        let stored = self.stored.load(Ordering::Relaxed);
        self.stored.store(stored.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side. Moves up to `out.len()` bytes into `out`, oldest first.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let n = self.available().min(out.len());
        if n == 0 {
            return 0;
        }
        let read = self.read.load(Ordering::Relaxed);
        let (head, tail) = self.ring.spans(read, n);
        for (slot, i) in out.iter_mut().zip(head.chain(tail)) {
            *slot = self.buf[i].load(Ordering::Relaxed);
        }
        self.read.store(self.ring.advance(read, n), Ordering::Relaxed);
        let taken = self.taken.load(Ordering::Relaxed);
        self.taken.store(taken.wrapping_add(n), Ordering::Release);
        n
    }

    /// Bytes waiting to be read.
    pub fn available(&self) -> usize {
        let stored = self.stored.load(Ordering::Acquire);
        let taken = self.taken.load(Ordering::Acquire);
        stored.wrapping_sub(taken)
    }

    pub fn free_bytes(&self) -> usize {
        self.ring.capacity() - self.available()
    }

    /// Every byte handed to [`write_byte`](Self::write_byte), stored or not.
    pub fn total_received(&self) -> u64 {
        self.total_received.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            capacity: self.capacity(),
            available: self.available(),
            total_received: self.total_received(),
            dropped: self.dropped(),
        }
    }

    /// Discard content and counters. Neither side may be running.
    pub fn reset(&self) {
        self.read.store(0, Ordering::Relaxed);
        self.write.store(0, Ordering::Relaxed);
        self.stored.store(0, Ordering::Relaxed);
        self.taken.store(0, Ordering::Relaxed);
        self.total_received.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_and_partial_reads() {
        let buf = RxStreamBuffer::new(16).unwrap();
        for &b in b"hello" {
            assert!(buf.write_byte(b));
        }
        let mut out = [0u8; 3];
        assert_eq!(buf.read(&mut out), 3);
        assert_eq!(&out, b"hel");
        assert_eq!(buf.available(), 2);
        let mut out = [0u8; 8];
        assert_eq!(buf.read(&mut out), 2);
        assert_eq!(&out[..2], b"lo");
    }

    #[test]
    fn empty_read_returns_zero() {
        let buf = RxStreamBuffer::new(4).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out), 0);
        buf.write_byte(1);
        assert_eq!(buf.read(&mut []), 0);
        assert_eq!(buf.available(), 1);
    }

    #[test]
    fn wraps_around() {
        let buf = RxStreamBuffer::new(4).unwrap();
        let mut out = [0u8; 4];
        for &b in b"abc" {
            buf.write_byte(b);
        }
        assert_eq!(buf.read(&mut out[..2]), 2);
        for &b in b"def" {
            assert!(buf.write_byte(b));
        }
        assert_eq!(buf.read(&mut out), 4);
        assert_eq!(&out, b"cdef");
    }

    #[test]
    fn full_buffer_drops_new_bytes() {
        let buf = RxStreamBuffer::new(3).unwrap();
        for &b in b"abcde" {
            buf.write_byte(b);
        }
        assert_eq!(buf.total_received(), 5);
        assert_eq!(buf.dropped(), 2);
        assert_eq!(buf.free_bytes(), 0);
        let mut out = [0u8; 5];
        assert_eq!(buf.read(&mut out), 3);
        assert_eq!(&out[..3], b"abc");
    }

    #[test]
    fn reset_clears_counters() {
        let buf = RxStreamBuffer::new(3).unwrap();
        buf.write_byte(7);
        buf.reset();
        assert_eq!(buf.stats(), StreamStats { capacity: 3, ..StreamStats::default() });
    }

    #[test]
    fn rejects_bad_capacity() {
        assert!(matches!(RxStreamBuffer::new(0), Err(QueueError::Undersized { .. })));
        assert!(matches!(
            RxStreamBuffer::new(MAX_QUEUE_CAPACITY + 1),
            Err(QueueError::TooLarge { .. })
        ));
    }
}
