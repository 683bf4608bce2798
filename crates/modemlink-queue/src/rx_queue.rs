//! Framed receive queue.
//!
//! ```text
//!  index_read                      current_msg_index      index_write
//!      │                                  │                    │
//!  ────┼──────┬─────────┬──────┬──────────┼──────┬─────────────┼──── free ────
//!      │ hdr  │ payload │ hdr  │ payload  │ hdr  │ partial ... │
//!      │ 1|n  │         │ 1|m  │          │ 0|0  │             │
//! ```
//! Every unread message is a complete header followed by its payload. The
//! message being accumulated sits behind a zeroed header that is backpatched
//! when the classifier reports its last byte.
//!
//! The producer (`write_byte`) owns `write`, `msg_start`, `msg_size` and
//! `completed`; the consumer (`read`) owns `read` and `consumed`. The unread
//! count is `completed - consumed`.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use bytes::{BufMut, BytesMut};
use serde::Serialize;

use crate::classifier::Classifier;
use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::flow::FlowController;
use crate::header::{Header, HEADER_SIZE};
use crate::ring::Ring;

/// Result of storing one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// False when the overflow guard dropped the byte.
    pub stored: bool,
    /// The byte ended a message, which is now readable.
    pub message_complete: bool,
    /// The caller should arm another receive.
    pub keep_receiving: bool,
}

/// Result of reading one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Payload bytes appended to the output buffer.
    pub size: usize,
    /// Complete messages still unread.
    pub remaining: usize,
    /// The queue left the paused state; the caller must re-arm reception.
    pub resume: bool,
}

/// Counters kept by a queue since its last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub bytes_received: u64,
    pub overruns: u64,
    pub messages_completed: u64,
    pub messages_consumed: u64,
    pub pauses: u32,
}

/// One unread message found by [`RxQueue::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageView {
    /// Ring index of the message header.
    pub start: usize,
    pub size: usize,
    pub payload: Vec<u8>,
}

/// Point-in-time dump of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub capacity: usize,
    pub index_read: usize,
    pub index_write: usize,
    pub current_msg_index: usize,
    pub current_msg_size: usize,
    pub free_bytes: usize,
    pub unread: usize,
    pub paused: bool,
    pub messages: Vec<MessageView>,
    /// Bytes of the message still being accumulated.
    pub partial: Vec<u8>,
}

/// Single-producer, single-consumer ring of framed messages.
#[derive(Debug)]
pub struct RxQueue {
    ring: Ring,
    buf: Box<[AtomicU8]>,
    read: AtomicUsize,
    write: AtomicUsize,
    msg_start: AtomicUsize,
    msg_size: AtomicUsize,
    completed: AtomicUsize,
    consumed: AtomicUsize,
    flow: FlowController,
    received: AtomicU64,
    overruns: AtomicU64,
    consumed_total: AtomicU64,
    completed_total: AtomicU64,
}

impl RxQueue {
    pub fn new(config: QueueConfig) -> Result<Self> {
        config.validate()?;
        let buf = (0..config.capacity).map(|_| AtomicU8::new(0)).collect();
        Ok(Self {
            ring: Ring::new(config.capacity),
            buf,
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(HEADER_SIZE),
            msg_start: AtomicUsize::new(0),
            msg_size: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            consumed: AtomicUsize::new(0),
            flow: FlowController::new(config.pause_threshold),
            received: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            consumed_total: AtomicU64::new(0),
            completed_total: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn pause_threshold(&self) -> usize {
        self.flow.threshold()
    }

    /// Discard all content and counters.
    ///
    /// Neither [`write_byte`](Self::write_byte) nor [`read`](Self::read) may
    /// run concurrently.
    pub fn reset(&self) {
        for cell in self.buf.iter() {
            cell.store(0, Ordering::Relaxed);
        }
        self.read.store(0, Ordering::Relaxed);
        self.write.store(HEADER_SIZE, Ordering::Relaxed);
        self.msg_start.store(0, Ordering::Relaxed);
        self.msg_size.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.consumed.store(0, Ordering::Relaxed);
        self.received.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);
        self.consumed_total.store(0, Ordering::Relaxed);
        self.completed_total.store(0, Ordering::Relaxed);
        self.flow.reset();
    }

    /// Producer side: store one received byte.
    ///
    /// Never blocks. When at most a header's worth of space is left the byte
    /// is dropped and counted as an overrun, so unread messages are never
    /// overwritten.
    pub fn write_byte(&self, byte: u8, classifier: &dyn Classifier) -> WriteOutcome {
        self.received.fetch_add(1, Ordering::Relaxed);

        if self.free_bytes() <= HEADER_SIZE {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            let paused = self.flow.note_free(self.free_bytes());
            return WriteOutcome {
                stored: false,
                message_complete: false,
                keep_receiving: !paused,
            };
        }

        let write = self.write.load(Ordering::Relaxed);
        self.buf[write].store(byte, Ordering::Relaxed);
        let size = self.msg_size.load(Ordering::Relaxed) + 1;
        self.msg_size.store(size, Ordering::Relaxed);
        self.write.store(self.ring.advance(write, 1), Ordering::Release);
        self.flow.note_free(self.free_bytes());

        let message_complete = classifier.is_end_of_message(byte);
        if message_complete {
            self.finish_message(size);
        }

        WriteOutcome {
            stored: true,
            message_complete,
            keep_receiving: !self.flow.is_paused(),
        }
    }

    fn finish_message(&self, size: usize) {
        let start = self.msg_start.load(Ordering::Relaxed);
        self.put_header(start, Header::complete(size));

        let next = self.write.load(Ordering::Relaxed);
        self.put_header(next, Header::reserved());
        self.msg_start.store(next, Ordering::Relaxed);
        self.msg_size.store(0, Ordering::Relaxed);
        self.write.store(self.ring.advance(next, HEADER_SIZE), Ordering::Release);
        self.flow.note_free(self.free_bytes());

        self.completed_total.fetch_add(1, Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed);
        self.completed.store(completed.wrapping_add(1), Ordering::Release);
    }

    /// Consumer side: append the oldest complete message to `out`.
    ///
    /// Returns `Ok(None)` when no complete message is available.
    pub fn read(&self, out: &mut BytesMut) -> Result<Option<ReadOutcome>> {
        let consumed = self.consumed.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Acquire);
        if completed == consumed {
            return Ok(None);
        }

        let read = self.read.load(Ordering::Relaxed);
        let header = self.header_at(read);
        if !header.complete {
            debug_assert!(header.complete, "incomplete message header at {read}");
            return Err(QueueError::Framing { index: read });
        }

        let start = self.ring.advance(read, HEADER_SIZE);
        let size = header.size();
        let (head, tail) = self.ring.spans(start, size);
        out.reserve(size);
        for i in head.chain(tail) {
            out.put_u8(self.buf[i].load(Ordering::Relaxed));
        }

        self.read.store(self.ring.advance(start, size), Ordering::Release);
        let consumed = consumed.wrapping_add(1);
        self.consumed.store(consumed, Ordering::Release);
        self.consumed_total.fetch_add(1, Ordering::Relaxed);

        let resume = self.flow.try_resume(self.free_bytes());
        Ok(Some(ReadOutcome {
            size,
            remaining: completed.wrapping_sub(consumed),
            resume,
        }))
    }

    /// Bytes available for new data.
    ///
    /// A header is always reserved, so equal cursors mean the ring is full.
    pub fn free_bytes(&self) -> usize {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        match self.ring.distance(read, write) {
            0 => 0,
            used => self.ring.capacity() - used,
        }
    }

    /// Complete messages not yet read.
    pub fn unread(&self) -> usize {
        let completed = self.completed.load(Ordering::Acquire);
        let consumed = self.consumed.load(Ordering::Acquire);
        completed.wrapping_sub(consumed)
    }

    pub fn is_empty(&self) -> bool {
        self.unread() == 0
    }

    pub fn is_paused(&self) -> bool {
        self.flow.is_paused()
    }

    /// Paused, though enough space is already free to resume.
    pub fn resume_due(&self) -> bool {
        self.flow.resume_due(self.free_bytes())
    }

    /// Consumer side: resume without reading.
    ///
    /// The producer decides to pause from a free-space figure that may
    /// predate the consumer's last read, so a pause can land after the read
    /// that would have lifted it. Returns true once per such pause; the
    /// caller must then re-arm reception.
    pub fn poll_resume(&self) -> bool {
        self.flow.try_resume(self.free_bytes())
    }

    /// Payload bytes of the message still being accumulated.
    pub fn pending_size(&self) -> usize {
        self.msg_size.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            bytes_received: self.received.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            messages_completed: self.completed_total.load(Ordering::Relaxed),
            messages_consumed: self.consumed_total.load(Ordering::Relaxed),
            pauses: self.flow.pause_count(),
        }
    }

    /// Walk the unread messages without consuming them.
    ///
    /// The walk stops at the first incomplete header or at the message still
    /// being accumulated. Taken concurrently with the producer the dump may
    /// lag behind, but it never reads past published data.
    pub fn snapshot(&self) -> QueueSnapshot {
        let unread = self.unread();
        let read = self.read.load(Ordering::Acquire);
        let current = self.msg_start.load(Ordering::Acquire);

        let mut messages = Vec::with_capacity(unread);
        let mut index = read;
        for _ in 0..unread {
            if index == current {
                break;
            }
            let header = self.header_at(index);
            if !header.complete {
                break;
            }
            let size = header.size();
            let payload_start = self.ring.advance(index, HEADER_SIZE);
            messages.push(MessageView {
                start: index,
                size,
                payload: self.copy_out(payload_start, size),
            });
            index = self.ring.advance(payload_start, size);
        }

        let pending = self.pending_size();
        let partial = self.copy_out(self.ring.advance(current, HEADER_SIZE), pending);

        QueueSnapshot {
            capacity: self.ring.capacity(),
            index_read: read,
            index_write: self.write.load(Ordering::Acquire),
            current_msg_index: current,
            current_msg_size: pending,
            free_bytes: self.free_bytes(),
            unread,
            paused: self.is_paused(),
            messages,
            partial,
        }
    }

    fn copy_out(&self, start: usize, len: usize) -> Vec<u8> {
        let (head, tail) = self.ring.spans(start, len);
        head.chain(tail)
            .map(|i| self.buf[i].load(Ordering::Relaxed))
            .collect()
    }

    // Header bytes may straddle the end of the ring.
    fn put_header(&self, index: usize, header: Header) {
        for (offset, byte) in header.encode().into_iter().enumerate() {
            self.buf[self.ring.advance(index, offset)].store(byte, Ordering::Relaxed);
        }
    }

    fn header_at(&self, index: usize) -> Header {
        let mut bytes = [0u8; HEADER_SIZE];
        for (offset, byte) in bytes.iter_mut().enumerate() {
            *byte = self.buf[self.ring.advance(index, offset)].load(Ordering::Relaxed);
        }
        Header::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::classifier::{Terminator, CR};

    fn queue(capacity: usize, threshold: usize) -> RxQueue {
        RxQueue::new(QueueConfig::new(capacity, threshold)).unwrap()
    }

    fn feed(queue: &RxQueue, bytes: &[u8]) -> Vec<WriteOutcome> {
        bytes
            .iter()
            .map(|&b| queue.write_byte(b, &Terminator(CR)))
            .collect()
    }

    fn read_one(queue: &RxQueue) -> Option<Vec<u8>> {
        let mut out = BytesMut::new();
        queue.read(&mut out).unwrap().map(|_| out.to_vec())
    }

    fn used_by(messages: &[&[u8]]) -> usize {
        messages.iter().map(|m| HEADER_SIZE + m.len()).sum()
    }

    #[test]
    fn at_command_roundtrip() {
        let q = queue(64, 20);
        let outcomes = feed(&q, b"AT\r");
        assert!(outcomes.iter().all(|o| o.stored && o.keep_receiving));
        assert!(outcomes[2].message_complete);
        assert_eq!(q.unread(), 1);

        let mut out = BytesMut::new();
        let outcome = q.read(&mut out).unwrap().unwrap();
        assert_eq!(&out[..], b"AT\r");
        assert_eq!(outcome.size, 3);
        assert_eq!(outcome.remaining, 0);
        assert!(!outcome.resume);
        assert!(q.read(&mut out).unwrap().is_none());
    }

    #[test]
    fn pause_published_after_last_read_is_lifted() {
        let q = queue(40, 10);
        feed(&q, b"0123456789012345\r");
        assert_eq!(read_one(&q).unwrap(), b"0123456789012345\r");
        assert!(!q.is_paused());

        // the producer measured free space before that read
        q.flow.note_free(10);
        assert!(q.is_paused());
        assert!(q.resume_due());
        assert!(read_one(&q).is_none());

        assert!(q.poll_resume());
        assert!(!q.is_paused());
        assert!(!q.resume_due());
        assert!(!q.poll_resume());
    }

    #[test]
    fn poll_resume_waits_for_space() {
        let q = queue(40, 10);
        feed(&q, b"0123456789012345\rabcdefghi");
        assert!(q.is_paused());
        assert!(!q.resume_due());
        assert!(!q.poll_resume());
        assert!(q.is_paused());
    }

    #[test]
    fn messages_come_back_in_order() {
        let q = queue(256, 20);
        let payloads: [&[u8]; 4] = [b"AT\r", b"OK\r", b"+CSQ: 21,99\r", b"\r"];
        for p in payloads {
            feed(&q, p);
        }
        assert_eq!(q.unread(), 4);
        for (i, p) in payloads.iter().enumerate() {
            let mut out = BytesMut::new();
            let outcome = q.read(&mut out).unwrap().unwrap();
            assert_eq!(&out[..], *p);
            assert_eq!(outcome.remaining, payloads.len() - i - 1);
        }
    }

    #[test]
    fn partial_message_is_not_readable() {
        let q = queue(64, 20);
        feed(&q, b"+CREG");
        assert_eq!(q.unread(), 0);
        assert_eq!(q.pending_size(), 5);
        assert!(read_one(&q).is_none());
        feed(&q, b": 1\r");
        assert_eq!(read_one(&q).unwrap(), b"+CREG: 1\r");
    }

    #[test]
    fn free_space_accounts_for_headers_and_partial() {
        let q = queue(64, 20);
        assert_eq!(q.free_bytes(), 62);

        feed(&q, b"AT\r");
        feed(&q, b"OK\r");
        feed(&q, b"+C");
        let complete: [&[u8]; 2] = [b"AT\r", b"OK\r"];
        let in_progress = HEADER_SIZE + q.pending_size();
        assert_eq!(q.free_bytes() + used_by(&complete) + in_progress, 64);

        read_one(&q).unwrap();
        assert_eq!(q.free_bytes() + used_by(&complete[1..]) + in_progress, 64);
    }

    #[test]
    fn payload_wraps_around_ring_end() {
        let q = queue(32, 4);
        let first = b"0123456789ABCDEFGHI\r";
        feed(&q, first);
        assert_eq!(read_one(&q).unwrap(), first);

        // write index is 24; this payload straddles the end of the array
        let second = b"wrap-around-msg\r";
        feed(&q, second);
        let snap = q.snapshot();
        assert_eq!(snap.messages.len(), 1);
        assert!(snap.messages[0].start + HEADER_SIZE + second.len() > 32);
        assert_eq!(read_one(&q).unwrap(), second);
    }

    #[test]
    fn header_straddles_ring_end() {
        let q = queue(32, 4);
        feed(&q, b"ab\r");
        read_one(&q).unwrap();

        let long = b"abcdefghijklmnopqrstuvw\r";
        feed(&q, long);
        // next header occupies indices 31 and 0
        assert_eq!(q.snapshot().current_msg_index, 31);
        assert_eq!(read_one(&q).unwrap(), long);

        feed(&q, b"xy\r");
        assert_eq!(read_one(&q).unwrap(), b"xy\r");
    }

    #[test]
    fn pauses_and_resumes_exactly_once() {
        let q = queue(40, 10);
        let mut last = None;
        for b in b"0123456789012345\r".iter() {
            last = Some(q.write_byte(*b, &Terminator(CR)));
        }
        // 40 - (2 + 17) - 2 = 19 free
        assert!(last.unwrap().keep_receiving);

        let outcomes = feed(&q, b"abcdefghi");
        // 19 - 9 = 10 free, at threshold
        assert!(!outcomes.last().unwrap().keep_receiving);
        assert!(q.is_paused());
        assert_eq!(q.stats().pauses, 1);

        // a byte already in flight is still stored
        let late = q.write_byte(b'j', &Terminator(CR));
        assert!(late.stored);
        assert!(!late.keep_receiving);

        let mut out = BytesMut::new();
        let outcome = q.read(&mut out).unwrap().unwrap();
        assert!(outcome.resume);
        assert!(!q.is_paused());

        let follow_up = feed(&q, b"\r");
        assert!(follow_up[0].keep_receiving);
        let outcome = q.read(&mut out).unwrap().unwrap();
        assert!(!outcome.resume);
    }

    #[test]
    fn resume_requires_free_above_threshold() {
        let q = queue(30, 10);
        feed(&q, b"\r");
        feed(&q, b"0123456789abcdefgh");
        assert_eq!(q.free_bytes(), 7);
        assert!(q.is_paused());

        let mut out = BytesMut::new();
        let outcome = q.read(&mut out).unwrap().unwrap();
        assert_eq!(q.free_bytes(), 10);
        assert!(!outcome.resume);
        assert!(q.is_paused());

        feed(&q, b"\r");
        let outcome = q.read(&mut out).unwrap().unwrap();
        assert!(outcome.resume);
        assert_eq!(q.stats().pauses, 1);
    }

    #[test]
    fn overflow_guard_drops_instead_of_overwriting() {
        let q = queue(32, 4);
        feed(&q, b"first\r");
        let outcomes = feed(&q, &[b'x'; 40]);
        let dropped = outcomes.iter().filter(|o| !o.stored).count();
        assert!(dropped > 0);
        assert_eq!(q.stats().overruns, dropped as u64);
        assert!(q.free_bytes() <= HEADER_SIZE);
        assert_eq!(read_one(&q).unwrap(), b"first\r");
    }

    #[test]
    fn completion_at_guard_still_reserves_next_header() {
        let q = queue(16, 2);
        let outcomes = feed(&q, b"0123456789a\r");
        assert!(outcomes.iter().all(|o| o.stored));
        assert!(outcomes.last().unwrap().message_complete);
        // 16 - (2 + 12) - 2 = 0
        assert_eq!(q.free_bytes(), 0);
        assert!(!q.write_byte(b'z', &Terminator(CR)).stored);
        assert_eq!(read_one(&q).unwrap(), b"0123456789a\r");
        assert_eq!(q.free_bytes(), 14);
    }

    #[test]
    fn empty_message_is_legal() {
        let q = queue(64, 20);
        feed(&q, b"\r\r");
        assert_eq!(q.unread(), 2);
        assert_eq!(read_one(&q).unwrap(), b"\r");
        assert_eq!(read_one(&q).unwrap(), b"\r");
    }

    #[test]
    fn read_appends_to_output() {
        let q = queue(64, 20);
        feed(&q, b"A\rB\r");
        let mut out = BytesMut::new();
        q.read(&mut out).unwrap();
        q.read(&mut out).unwrap();
        assert_eq!(&out[..], b"A\rB\r");
    }

    #[test]
    fn snapshot_lists_unread_and_partial() {
        let q = queue(64, 20);
        feed(&q, b"AT\rOK\r+CS");
        let snap = q.snapshot();
        assert_eq!(snap.unread, 2);
        assert_eq!(snap.messages.len(), 2);
        assert_eq!(snap.messages[0].start, 0);
        assert_eq!(snap.messages[0].payload, b"AT\r");
        assert_eq!(snap.messages[1].start, 5);
        assert_eq!(snap.messages[1].payload, b"OK\r");
        assert_eq!(snap.current_msg_index, 10);
        assert_eq!(snap.partial, b"+CS");
        assert_eq!(snap.index_write, 15);
        // snapshot does not consume
        assert_eq!(q.unread(), 2);
    }

    #[test]
    fn stats_track_traffic() {
        let q = queue(64, 20);
        feed(&q, b"AT\rOK\rX");
        read_one(&q).unwrap();
        let stats = q.stats();
        assert_eq!(stats.bytes_received, 7);
        assert_eq!(stats.messages_completed, 2);
        assert_eq!(stats.messages_consumed, 1);
        assert_eq!(stats.overruns, 0);
    }

    #[test]
    fn reset_discards_everything() {
        let q = queue(64, 20);
        feed(&q, b"AT\rpartial");
        q.reset();
        assert_eq!(q.unread(), 0);
        assert_eq!(q.pending_size(), 0);
        assert_eq!(q.free_bytes(), 62);
        assert_eq!(q.stats(), QueueStats::default());
        feed(&q, b"OK\r");
        assert_eq!(read_one(&q).unwrap(), b"OK\r");
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "incomplete message header"))]
    fn corrupted_header_is_a_framing_error() {
        let q = queue(64, 20);
        feed(&q, b"AT\r");
        q.buf[0].store(0, Ordering::Relaxed);
        let mut out = BytesMut::new();
        assert_eq!(q.read(&mut out), Err(QueueError::Framing { index: 0 }));
    }

    #[test]
    fn concurrent_producer_and_consumer() {
        let q = Arc::new(queue(128, 8));
        let total = 500usize;
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                for n in 0..total {
                    let msg = format!("msg{n}\r");
                    for &b in msg.as_bytes() {
                        while q.is_paused() || q.free_bytes() <= HEADER_SIZE + 1 {
                            std::thread::yield_now();
                        }
                        assert!(q.write_byte(b, &Terminator(CR)).stored);
                    }
                }
            })
        };

        let mut received = 0;
        let mut out = BytesMut::new();
        while received < total {
            out.clear();
            match q.read(&mut out).unwrap() {
                Some(_) => {
                    assert_eq!(&out[..], format!("msg{received}\r").as_bytes());
                    received += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert_eq!(q.unread(), 0);
    }
}
