use std::sync::atomic::{AtomicU32, Ordering};

/// Pause/resume decision for a receive queue.
///
/// The producer counts pauses and the consumer counts resumes; the queue is
/// paused while the two differ. Each counter has a single writer, so the
/// decision needs no lock on either side.
#[derive(Debug)]
pub struct FlowController {
    threshold: usize,
    pauses: AtomicU32,
    resumes: AtomicU32,
}

impl FlowController {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            pauses: AtomicU32::new(0),
            resumes: AtomicU32::new(0),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn is_paused(&self) -> bool {
        self.pauses.load(Ordering::Acquire) != self.resumes.load(Ordering::Acquire)
    }

    /// Producer side. Pauses when `free` is at or below the threshold.
    /// Returns true while paused.
    pub fn note_free(&self, free: usize) -> bool {
        if self.is_paused() {
            return true;
        }
        if free <= self.threshold {
            let pauses = self.pauses.load(Ordering::Relaxed);
            self.pauses.store(pauses.wrapping_add(1), Ordering::Release);
            return true;
        }
        false
    }

    /// Consumer side. Resumes once `free` rises above the threshold.
    ///
    /// Returns true exactly once per pause: the caller must then re-arm
    /// reception.
    pub fn try_resume(&self, free: usize) -> bool {
        let pauses = self.pauses.load(Ordering::Acquire);
        let resumes = self.resumes.load(Ordering::Relaxed);
        if pauses == resumes || free <= self.threshold {
            return false;
        }
        self.resumes.store(pauses, Ordering::Release);
        true
    }

    /// Consumer side. Paused with `free` already above the threshold.
    pub fn resume_due(&self, free: usize) -> bool {
        self.is_paused() && free > self.threshold
    }

    /// Number of times the producer has paused.
    pub fn pause_count(&self) -> u32 {
        self.pauses.load(Ordering::Acquire)
    }

    /// Clear both counters. Neither side may be running.
    pub fn reset(&self) {
        self.pauses.store(0, Ordering::Release);
        self.resumes.store(0, Ordering::Release);
    }
}
