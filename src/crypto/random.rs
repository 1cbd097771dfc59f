//! Secure random number generation and traffic-shape padding.
//!
//! Random bytes come from the operating system's entropy source. Padding
//! lengths must be unpredictable to a network observer, so they are drawn
//! from the same source rather than a seeded PRNG.

use rand::RngCore;
use rand_core::OsRng;

/// Cryptographically secure random number generator.
///
/// Wraps the OS-provided entropy source (e.g., /dev/urandom on Unix).
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with cryptographically secure random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// Generate a fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Generate a random u32.
    pub fn u32() -> u32 {
        OsRng.next_u32()
    }
}

/// Pick a padding length, uniform in `[0, 255)`.
///
/// The exclusive upper bound keeps the length encodable in one byte while
/// still spreading on-wire segment sizes over 255 values.
pub fn padding_len() -> usize {
    (SecureRandom::u32() % 255) as usize
}

/// Generate `len` bytes of random padding.
///
/// Padding carries no authenticated binding; it exists purely to obscure
/// segment boundaries and lengths.
pub fn new_padding(len: usize) -> Vec<u8> {
    let mut padding = vec![0u8; len];
    SecureRandom::fill(&mut padding);
    padding
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_fill_produces_entropy() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        SecureRandom::fill(&mut buf1);
        SecureRandom::fill(&mut buf2);
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_padding_len_range() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let len = padding_len();
            assert!(len < 255);
            seen.insert(len);
        }
        // 1000 draws over 255 values should hit a broad spread.
        assert!(seen.len() > 100);
    }

    #[test]
    fn test_new_padding() {
        assert!(new_padding(0).is_empty());

        let padding = new_padding(200);
        assert_eq!(padding.len(), 200);
        assert!(!padding.iter().all(|&b| b == 0));
    }
}
