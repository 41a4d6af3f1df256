//! Deterministic hashing for content identity.
//!
//! File digests and the manifest's content checksum must be identical on
//! every peer and across runs, so `DefaultHasher` (randomly seeded) cannot be
//! used. This module implements FNV-1a, which is fast and seed-free.
//!
//! FNV-1a is NOT cryptographically secure. It identifies content; it does
//! not authenticate it. Authentication is the job of [`trust`](crate::trust).
//!
//! ```
//! use kart_netsync::hash::{fnv1a_bytes, DeterministicHasher};
//! use std::hash::Hasher;
//!
//! let mut hasher = DeterministicHasher::new();
//! hasher.write(b"track01.pk3");
//! assert_eq!(hasher.finish(), fnv1a_bytes(b"track01.pk3"));
//! ```

use std::hash::Hasher;

/// FNV-1a 64-bit offset basis constant.
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime constant.
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// A deterministic hasher using the FNV-1a algorithm.
#[derive(Debug, Clone)]
pub struct DeterministicHasher {
    state: u64,
}

impl DeterministicHasher {
    /// Creates a new hasher with the standard FNV-1a offset basis.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }

    /// Feeds a length-prefixed string so that `("ab", "c")` and `("a", "bc")`
    /// hash differently.
    pub fn write_str_prefixed(&mut self, text: &str) {
        self.write_u64(text.len() as u64);
        self.write(text.as_bytes());
    }
}

impl Default for DeterministicHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for DeterministicHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.state
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }

    // Integers are hashed little-endian regardless of host byte order.
    #[inline]
    fn write_u64(&mut self, value: u64) {
        self.write(&value.to_le_bytes());
    }

    #[inline]
    fn write_u32(&mut self, value: u32) {
        self.write(&value.to_le_bytes());
    }
}

/// FNV-1a digest of a byte slice.
#[must_use]
pub fn fnv1a_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = DeterministicHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        // Reference values for FNV-1a 64.
        assert_eq!(fnv1a_bytes(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_bytes(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn prefixed_strings_do_not_collide_on_concatenation() {
        let mut a = DeterministicHasher::new();
        a.write_str_prefixed("ab");
        a.write_str_prefixed("c");
        let mut b = DeterministicHasher::new();
        b.write_str_prefixed("a");
        b.write_str_prefixed("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn integers_hash_little_endian() {
        let mut hasher = DeterministicHasher::new();
        hasher.write_u32(0x0102_0304);
        assert_eq!(hasher.finish(), fnv1a_bytes(&[4, 3, 2, 1]));
    }
}
