/// In-queue message header: complete flag (1 bit) + payload size (15 bits).
pub const HEADER_SIZE: usize = 2;

/// Bit 15 of the header word.
pub const COMPLETE_FLAG: u16 = 0x8000;

/// Bits 14..0 of the header word.
pub const SIZE_MASK: u16 = 0x7FFF;

/// Largest payload a header can describe.
pub const MAX_MESSAGE_SIZE: usize = SIZE_MASK as usize;

/// Decoded message header.
///
/// Layout (big-endian, never leaves the process):
/// ```text
/// byte 0: │C│S S S S S S S│   C = complete, S = size bits 14..8
/// byte 1: │S S S S S S S S│   size bits 7..0
/// ```
/// A header that is still being accumulated is all zeroes, which decodes as
/// incomplete with size 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub complete: bool,
    pub size: u16,
}

impl Header {
    /// Header of a finished message of `size` payload bytes.
    ///
    /// Sizes above [`MAX_MESSAGE_SIZE`] are truncated to 15 bits; queue
    /// capacity validation keeps real messages below that bound.
    pub fn complete(size: usize) -> Self {
        Self {
            complete: true,
            size: (size as u16) & SIZE_MASK,
        }
    }

    /// The placeholder reserved while a message accumulates.
    pub const fn reserved() -> Self {
        Self {
            complete: false,
            size: 0,
        }
    }

    pub fn encode(self) -> [u8; HEADER_SIZE] {
        let flag = if self.complete { COMPLETE_FLAG } else { 0 };
        (flag | (self.size & SIZE_MASK)).to_be_bytes()
    }

    pub fn decode(bytes: [u8; HEADER_SIZE]) -> Self {
        let word = u16::from_be_bytes(bytes);
        Self {
            complete: word & COMPLETE_FLAG != 0,
            size: word & SIZE_MASK,
        }
    }

    pub fn size(self) -> usize {
        self.size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_header_layout() {
        assert_eq!(Header::complete(3).encode(), [0x80, 0x03]);
        assert_eq!(Header::complete(0x1234).encode(), [0x92, 0x34]);
        assert_eq!(Header::complete(MAX_MESSAGE_SIZE).encode(), [0xFF, 0xFF]);
    }

    #[test]
    fn reserved_header_is_zero_and_incomplete() {
        assert_eq!(Header::reserved().encode(), [0, 0]);
        let decoded = Header::decode([0, 0]);
        assert!(!decoded.complete);
        assert_eq!(decoded.size(), 0);
    }

    #[test]
    fn decode_reads_flag_and_size() {
        let header = Header::decode([0x87, 0xD0]);
        assert!(header.complete);
        assert_eq!(header.size(), 2000);

        let partial = Header::decode([0x07, 0xD0]);
        assert!(!partial.complete);
        assert_eq!(partial.size(), 2000);
    }

    #[test]
    fn empty_complete_message_is_distinct_from_reserved() {
        let empty = Header::complete(0);
        assert_ne!(empty.encode(), Header::reserved().encode());
        assert!(Header::decode(empty.encode()).complete);
    }
}
