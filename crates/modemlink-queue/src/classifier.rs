//! End-of-message classifiers.
//!
//! A classifier sees every stored byte, in order, from the producer context.
//! It must not block and must not allocate.

use std::sync::atomic::{AtomicUsize, Ordering};

pub const CR: u8 = b'\r';
pub const LF: u8 = b'\n';

/// Decides whether a byte ends the message being accumulated.
pub trait Classifier: Send + Sync {
    fn is_end_of_message(&self, byte: u8) -> bool;

    /// Forget any partial match. Called when the owning queue is emptied.
    fn reset(&self) {}
}

impl<F> Classifier for F
where
    F: Fn(u8) -> bool + Send + Sync,
{
    fn is_end_of_message(&self, byte: u8) -> bool {
        self(byte)
    }
}

/// Ends a message on one specific byte (e.g. `\r` for AT responses).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminator(pub u8);

impl Classifier for Terminator {
    fn is_end_of_message(&self, byte: u8) -> bool {
        byte == self.0
    }
}

/// Ends a message on any byte of a set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnyOf {
    set: [bool; 256],
}

impl AnyOf {
    pub fn new(bytes: &[u8]) -> Self {
        let mut set = [false; 256];
        for &b in bytes {
            set[b as usize] = true;
        }
        Self { set }
    }
}

impl Classifier for AnyOf {
    fn is_end_of_message(&self, byte: u8) -> bool {
        self.set[byte as usize]
    }
}

/// Ends a message after a multi-byte terminator such as `\r\n`.
///
/// The match position is producer-owned state; only the receive path may
/// call [`Classifier::is_end_of_message`].
#[derive(Debug)]
pub struct Sequence {
    pattern: Box<[u8]>,
    matched: AtomicUsize,
}

impl Sequence {
    /// # Panics
    /// Panics if `pattern` is empty.
    pub fn new(pattern: &[u8]) -> Self {
        assert!(!pattern.is_empty(), "terminator sequence must not be empty");
        Self {
            pattern: pattern.into(),
            matched: AtomicUsize::new(0),
        }
    }

    pub fn crlf() -> Self {
        Self::new(&[CR, LF])
    }

    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    // Longest prefix of the pattern that is a suffix of the bytes matched so
    // far followed by `byte`.
    fn fallback(&self, matched: usize, byte: u8) -> usize {
        let mut k = matched;
        while k > 0 {
            let prefix = &self.pattern[..k];
            let tail = &self.pattern[matched + 1 - k..matched];
            if prefix[..k - 1] == *tail && prefix[k - 1] == byte {
                return k;
            }
            k -= 1;
        }
        0
    }
}

impl Classifier for Sequence {
    fn is_end_of_message(&self, byte: u8) -> bool {
        let matched = self.matched.load(Ordering::Relaxed);
        let next = if self.pattern[matched] == byte {
            matched + 1
        } else {
            self.fallback(matched, byte)
        };
        if next == self.pattern.len() {
            self.matched.store(0, Ordering::Relaxed);
            true
        } else {
            self.matched.store(next, Ordering::Relaxed);
            false
        }
    }

    fn reset(&self) {
        self.matched.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ends(classifier: &dyn Classifier, input: &[u8]) -> Vec<usize> {
        input
            .iter()
            .enumerate()
            .filter(|(_, b)| classifier.is_end_of_message(**b))
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn terminator_matches_single_byte() {
        assert_eq!(ends(&Terminator(CR), b"AT\rOK\r"), vec![2, 5]);
    }

    #[test]
    fn closures_are_classifiers() {
        let classifier = |b: u8| b == b';';
        assert_eq!(ends(&classifier, b"a;b;;"), vec![1, 3, 4]);
    }

    #[test]
    fn any_of_matches_set() {
        let classifier = AnyOf::new(&[CR, LF]);
        assert_eq!(ends(&classifier, b"A\rB\nC"), vec![1, 3]);
    }

    #[test]
    fn crlf_sequence() {
        let classifier = Sequence::crlf();
        assert_eq!(ends(&classifier, b"OK\r\n\r\r\nX\n"), vec![3, 6]);
    }

    #[test]
    fn sequence_with_self_overlap() {
        let classifier = Sequence::new(b"aab");
        assert_eq!(ends(&classifier, b"aaab"), vec![3]);
        assert_eq!(ends(&classifier, b"aabaab"), vec![2, 5]);
    }

    #[test]
    fn sequence_reset_forgets_partial_match() {
        let classifier = Sequence::crlf();
        assert!(!classifier.is_end_of_message(CR));
        classifier.reset();
        assert!(!classifier.is_end_of_message(LF));
    }
}
