//! Hashing primitives shared by the getwork translator and the share path.
//!
//! Everything here operates on the bitcoin header conventions: hashes travel
//! the wire with every aligned 32-bit word byte-swapped, and hash-vs-target
//! comparison interprets the digest as a little-endian 256-bit integer.

pub mod midstate;
pub mod target;

pub use midstate::midstate;
pub use target::{difficulty_to_target, target_to_hex, DIFF1_SCRYPT, DIFF1_SHA256};

use num_bigint::BigUint;
use sha2::{Digest, Sha256};

/// Double SHA-256.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Byte-swap every aligned 4-byte word of a 32-byte hash, preserving word
/// order. This is the transform between the raw digest and its wire form
/// inside serialized headers. Applying it twice restores the input.
pub fn reverse_hash32(hash: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (src, dst) in hash.chunks_exact(4).zip(out.chunks_exact_mut(4)) {
        dst[0] = src[3];
        dst[1] = src[2];
        dst[2] = src[1];
        dst[3] = src[0];
    }
    out
}

/// The same per-word byte swap over an arbitrary 4-byte-aligned buffer.
/// Used on the 80-byte header before hashing a submitted share and on the
/// 64-byte midstate input.
pub fn swap_words(data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() % 4 == 0);
    let mut out = Vec::with_capacity(data.len());
    for word in data.chunks_exact(4) {
        out.extend_from_slice(&[word[3], word[2], word[1], word[0]]);
    }
    out
}

/// Interpret 32 bytes as a little-endian 256-bit integer.
pub fn uint256_le(hash: &[u8; 32]) -> BigUint {
    BigUint::from_bytes_le(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn sha256d_matches_nested_sha256() {
        // dsha(x) == sha256(sha256(x)), checked against an independently
        // computed vector for the empty string.
        let expected = hex!("5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456");
        assert_eq!(sha256d(b""), expected);

        let manual: [u8; 32] = Sha256::digest(Sha256::digest(b"stratum")).into();
        assert_eq!(sha256d(b"stratum"), manual);
    }

    #[test]
    fn reverse_hash_is_involution() {
        let h = hex!("000000000000000000021901f2dd03f24fe0d8701cfcb4b22695b586f2f0bbd4");
        assert_eq!(reverse_hash32(&reverse_hash32(&h)), h);
    }

    #[test]
    fn reverse_hash_swaps_each_word() {
        let mut h = [0u8; 32];
        h[..8].copy_from_slice(&hex!("0102030405060708"));
        let r = reverse_hash32(&h);
        assert_eq!(&r[..8], &hex!("0403020108070605"));
        // Word order is preserved, only bytes within each word move.
        assert_eq!(&r[8..], &[0u8; 24]);
    }

    #[test]
    fn uint256_le_reads_low_bytes_first() {
        let mut h = [0u8; 32];
        h[0] = 0x01;
        h[31] = 0x80;
        let v = uint256_le(&h);
        let expected = BigUint::from(1u8) + (BigUint::from(0x80u8) << 248);
        assert_eq!(v, expected);
    }
}
