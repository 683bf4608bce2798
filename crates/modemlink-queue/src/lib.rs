//! Interrupt-safe receive queues for byte-at-a-time serial links.
//!
//! This is the core value-add layer of modemlink. A producer running in
//! interrupt context appends one byte at a time; a consumer task reads out
//! whole messages. Message boundaries are found by a [`Classifier`], and every
//! message is stored in place as:
//! - A 2-byte header, reserved when the message starts and backpatched once
//!   the classifier sees its last byte
//! - The payload bytes, possibly wrapping around the end of the ring
//!
//! Every shared field has exactly one writer, so neither side ever takes a
//! lock.

pub mod classifier;
pub mod config;
pub mod error;
pub mod flow;
pub mod header;
pub mod ring;
pub mod rx_queue;
pub mod stream;

pub use classifier::{AnyOf, Classifier, Sequence, Terminator, CR, LF};
pub use config::{QueueConfig, DEFAULT_CAPACITY, DEFAULT_PAUSE_THRESHOLD, MAX_QUEUE_CAPACITY};
pub use error::{QueueError, Result};
pub use flow::FlowController;
pub use header::{Header, HEADER_SIZE, MAX_MESSAGE_SIZE};
pub use ring::Ring;
pub use rx_queue::{MessageView, QueueSnapshot, QueueStats, ReadOutcome, RxQueue, WriteOutcome};
pub use stream::{RxStreamBuffer, StreamStats};
