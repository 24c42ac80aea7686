//! Process-independent string hashing
//!
//! `std`'s `DefaultHasher` is randomly keyed per process, which would send the same
//! routing token to different backends (and build different mazes) depending on
//! which process computed it. SHA-256 is stable everywhere.

use sha2::{Digest, Sha256};

/// Stable 64-bit hash of a string: the first eight bytes of its SHA-256 digest.
pub fn stable_hash(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Map a string onto `0..len`. Returns `None` for an empty range.
pub fn stable_index(value: &str, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    Some((stable_hash(value) % len as u64) as usize)
}
