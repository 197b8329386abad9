//! 16-bit sequence number arithmetic.
//!
//! All sequence numbers, ack targets, and window keys wrap modulo 65536.

use crate::core::constants::{MAX_RECV_AHEAD, SEQUENCE_SPACE};

/// Forward distance from `from` to `to`, modulo 65536.
pub fn distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from)
}

/// `base + offset`, modulo 65536.
pub fn offset(base: u16, offset: usize) -> u16 {
    base.wrapping_add((offset % SEQUENCE_SPACE as usize) as u16)
}

/// Whether `seq` lies ahead of the receive `cursor` and may be buffered.
///
/// Anything within half the sequence space after the cursor is ahead; the
/// cursor itself and everything behind it has already been delivered.
pub fn is_ahead(cursor: u16, seq: u16) -> bool {
    let d = distance(cursor, seq);
    d != 0 && d <= MAX_RECV_AHEAD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_wraps() {
        assert_eq!(distance(65535, 0), 1);
        assert_eq!(distance(65530, 4), 10);
        assert_eq!(distance(7, 7), 0);
    }

    #[test]
    fn test_offset_wraps() {
        assert_eq!(offset(65535, 1), 0);
        assert_eq!(offset(65000, 1000), 464);
        assert_eq!(offset(3, 65536), 3);
    }

    #[test]
    fn test_is_ahead() {
        assert!(is_ahead(0, 1));
        assert!(is_ahead(65535, 0));
        assert!(is_ahead(65535, 2));
        assert!(!is_ahead(10, 10));
        assert!(!is_ahead(10, 9));
        assert!(!is_ahead(0, 0x8001));
    }
}
