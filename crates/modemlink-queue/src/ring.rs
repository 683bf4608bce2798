use std::ops::Range;

/// Index arithmetic for a fixed-capacity ring.
///
/// Both queues route every cursor computation through this type, so the
/// free-space math and the wraparound copies share one definition of
/// "distance".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ring {
    capacity: usize,
}

impl Ring {
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self { capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `index` moved forward by `by` positions.
    pub fn advance(&self, index: usize, by: usize) -> usize {
        debug_assert!(index < self.capacity);
        (index + by % self.capacity) % self.capacity
    }

    /// Forward distance from `from` to `to`, in `0..capacity`.
    pub fn distance(&self, from: usize, to: usize) -> usize {
        debug_assert!(from < self.capacity && to < self.capacity);
        (to + self.capacity - from) % self.capacity
    }

    /// Positions remaining before the end of the backing array.
    pub fn until_end(&self, index: usize) -> usize {
        debug_assert!(index < self.capacity);
        self.capacity - index
    }

    /// Split `len` bytes starting at `start` into at most two contiguous
    /// ranges of the backing array. The second range is empty unless the
    /// run wraps.
    pub fn spans(&self, start: usize, len: usize) -> (Range<usize>, Range<usize>) {
        debug_assert!(len <= self.capacity);
        let head = self.until_end(start);
        if len <= head {
            (start..start + len, 0..0)
        } else {
            (start..self.capacity, 0..len - head)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_wraps() {
        let ring = Ring::new(8);
        assert_eq!(ring.advance(3, 2), 5);
        assert_eq!(ring.advance(7, 1), 0);
        assert_eq!(ring.advance(6, 5), 3);
        assert_eq!(ring.advance(2, 8), 2);
    }

    #[test]
    fn distance_is_forward_only() {
        let ring = Ring::new(8);
        assert_eq!(ring.distance(2, 5), 3);
        assert_eq!(ring.distance(5, 2), 5);
        assert_eq!(ring.distance(4, 4), 0);
    }

    #[test]
    fn until_end_counts_to_array_end() {
        let ring = Ring::new(8);
        assert_eq!(ring.until_end(0), 8);
        assert_eq!(ring.until_end(5), 3);
        assert_eq!(ring.until_end(7), 1);
    }

    #[test]
    fn contiguous_span() {
        let ring = Ring::new(8);
        assert_eq!(ring.spans(2, 4), (2..6, 0..0));
        assert_eq!(ring.spans(4, 4), (4..8, 0..0));
    }

    #[test]
    fn wrapped_span() {
        let ring = Ring::new(8);
        assert_eq!(ring.spans(6, 5), (6..8, 0..3));
        assert_eq!(ring.spans(7, 1), (7..8, 0..0));
    }

    #[test]
    fn empty_span() {
        let ring = Ring::new(8);
        assert_eq!(ring.spans(5, 0), (5..5, 0..0));
    }
}
