//! Hashing primitives for Nimbus.
//!
//! Provides three things:
//!   1. `ulong_hash` — the 64-bit rolling mix used as the progressive
//!      transfer CRC and as the base of every path fingerprint
//!   2. `hash256` — SHA-256, used for PIN proofs and user-id derivation
//!   3. `hash_file_name` — the 64-bit path fingerprint with the
//!      directory marker folded in
//!
//! `ulong_hash` is part of the protocol: both endpoints must produce
//! identical values for identical input on every platform. The mix is
//! byte-at-a-time with no architecture-dependent reads, so endianness
//! never enters the picture.

use sha2::{Digest, Sha256};

/// Initial seed for the rolling hash. Every progressive CRC starts here.
pub const START_CRC: u64 = 2993167723948948793;

const MIX_PRIME: u64 = 0x0000_0100_0000_01B3;

/// Mix `data` into a running 64-bit state.
///
/// Chaining is equivalent to hashing the concatenation:
/// `ulong_hash(ulong_hash(s, a), b) == ulong_hash(s, a ++ b)`.
/// The transfer driver relies on this to accumulate a whole-file CRC
/// one chunk at a time.
pub fn ulong_hash(seed: u64, data: &[u8]) -> u64 {
    let mut state = seed;
    for &byte in data {
        state ^= u64::from(byte);
        state = state.wrapping_mul(MIX_PRIME);
    }
    state
}

/// SHA-256 digest of `data`.
///
/// Never used for file content — only for PIN proofs, user ids, and the
/// zero-knowledge filename key.
pub fn hash256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Fingerprint a cloud-relative path (unix form: forward slashes, no
/// leading slash).
///
/// A one-byte directory marker is folded into the stream so a file and a
/// directory of the same name produce distinct hashes.
pub fn hash_file_name(relative_path: &str, is_directory: bool) -> u64 {
    let state = ulong_hash(START_CRC, relative_path.as_bytes());
    ulong_hash(state, &[u8::from(is_directory)])
}
