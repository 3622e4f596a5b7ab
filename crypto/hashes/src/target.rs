//! Difficulty to target conversion.
//!
//! A share is valid when its header hash, read as a little-endian 256-bit
//! integer, is at or below `target = diff1 / difficulty`. The diff-1 base
//! differs between sha256 and scrypt pools.

use num_bigint::BigUint;
use num_traits::Num;

/// Big-endian hex of the sha256 diff-1 target.
pub const DIFF1_SHA256: &str = "00000000ffff0000000000000000000000000000000000000000000000000000";

/// Big-endian hex of the scrypt diff-1 target.
pub const DIFF1_SCRYPT: &str = "0000ffff00000000000000000000000000000000000000000000000000000000";

// Fixed-point scale for fractional difficulties. Eighteen decimal places
// keeps f64 difficulties exact through the division.
const SCALE: u128 = 1_000_000_000_000_000_000;

fn diff1(scrypt: bool) -> BigUint {
    let hex = if scrypt { DIFF1_SCRYPT } else { DIFF1_SHA256 };
    <BigUint as Num>::from_str_radix(hex, 16).unwrap()
}

/// `floor(diff1 / difficulty)`. Non-positive or non-finite difficulties
/// clamp to diff-1 (the loosest meaningful target).
pub fn difficulty_to_target(difficulty: f64, scrypt: bool) -> BigUint {
    let diff1 = diff1(scrypt);
    if !difficulty.is_finite() || difficulty <= 0.0 {
        return diff1;
    }
    let scaled = (difficulty * SCALE as f64) as u128;
    if scaled == 0 {
        return diff1;
    }
    diff1 * BigUint::from(SCALE) / BigUint::from(scaled)
}

/// 64-character big-endian hex of a target.
pub fn target_to_hex(target: &BigUint) -> String {
    format!("{target:064x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff1_sha256_target() {
        let target = difficulty_to_target(1.0, false);
        assert_eq!(target_to_hex(&target), DIFF1_SHA256);
    }

    #[test]
    fn diff1_scrypt_target() {
        let target = difficulty_to_target(1.0, true);
        assert_eq!(target_to_hex(&target), DIFF1_SCRYPT);
    }

    #[test]
    fn diff16_is_diff1_shifted() {
        let target = difficulty_to_target(16.0, false);
        assert_eq!(target, diff1(false) >> 4u32);
    }

    #[test]
    fn fractional_difficulty_widens_target() {
        // diff 0.5 doubles the target.
        let target = difficulty_to_target(0.5, false);
        assert_eq!(target, diff1(false) << 1u32);
    }

    #[test]
    fn nonsense_difficulty_clamps_to_diff1() {
        assert_eq!(difficulty_to_target(0.0, false), diff1(false));
        assert_eq!(difficulty_to_target(-3.0, false), diff1(false));
        assert_eq!(difficulty_to_target(f64::NAN, false), diff1(false));
    }

    #[test]
    fn target_hex_is_zero_padded() {
        let target = difficulty_to_target(65536.0, false);
        let hex = target_to_hex(&target);
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("000000000000ffff"));
    }
}
