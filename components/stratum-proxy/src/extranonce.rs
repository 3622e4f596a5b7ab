//! Extranonce space partitioning.
//!
//! Stratum downstreams each get a short tail appended to the pool's
//! extranonce1, carving the extranonce2 space so concurrent miners never
//! search overlapping shares. Getwork downstreams keep the whole pool
//! extranonce2 width and are identified by the reserved empty tail.

use crate::constants::MAX_EXTRANONCE_TAILS;
use crate::errors::ExtranonceError;
use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::{error, warn};

/// A tail handed to one downstream stratum connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tail {
    pub bytes: Vec<u8>,
    pub hex: String,
    /// extranonce2 width left for the miner after the tail.
    pub extranonce2_size: usize,
}

/// Serialize a tail value: one byte when it fits, two bytes big-endian
/// otherwise. Zero is never encoded; the iterator skips it.
fn var_int(value: u16) -> Vec<u8> {
    if value <= 0xff {
        vec![value as u8]
    } else {
        value.to_be_bytes().to_vec()
    }
}

#[derive(Default)]
struct PartitionerInner {
    cursor: u16,
    registered: HashSet<Vec<u8>>,
}

/// Allocator for unique extranonce1 tails, up to 65534 concurrent clients.
#[derive(Default)]
pub struct ExtranoncePartitioner {
    inner: Mutex<PartitionerInner>,
}

impl ExtranoncePartitioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an unused tail. `extranonce2_size` is the pool-declared
    /// width; the returned tail reduces it by the tail length.
    pub fn allocate(&self, extranonce2_size: usize) -> Result<Tail, ExtranonceError> {
        let mut inner = self.inner.lock();
        for _ in 0..MAX_EXTRANONCE_TAILS {
            inner.cursor = inner.cursor.wrapping_add(1) % MAX_EXTRANONCE_TAILS;
            // Zero extranonce is reserved for getwork connections.
            if inner.cursor == 0 {
                inner.cursor += 1;
            }

            let bytes = var_int(inner.cursor);
            if inner.registered.contains(&bytes) {
                continue;
            }

            let tail_len = bytes.len();
            inner.registered.insert(bytes.clone());
            return Ok(Tail {
                hex: hex::encode(&bytes),
                bytes,
                extranonce2_size: extranonce2_size.saturating_sub(tail_len),
            });
        }
        Err(ExtranonceError::SlotsFull)
    }

    /// Return a tail on client disconnect.
    pub fn release(&self, tail: &[u8]) {
        if !self.inner.lock().registered.remove(tail) {
            error!("released extranonce tail {} was not registered", hex::encode(tail));
        }
    }

    pub fn active(&self) -> usize {
        self.inner.lock().registered.len()
    }
}

/// Pad an extranonce2 value big-endian to the pool-declared width. Values
/// wider than the field are truncated from the high end; the pool will
/// reject those shares, which is still better than panicking mid-submit.
pub fn pad_extranonce2(value: u32, size: usize) -> Vec<u8> {
    let be = value.to_be_bytes();
    if size >= be.len() {
        let mut padded = vec![0u8; size - be.len()];
        padded.extend_from_slice(&be);
        padded
    } else {
        warn!("extranonce2 size mismatch ({size} < 4), please report this to the pool operator");
        be[be.len() - size..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_byte_tails_then_two_byte_rollover() {
        let partitioner = ExtranoncePartitioner::new();
        for expected in 1..=0xffu16 {
            let tail = partitioner.allocate(8).unwrap();
            assert_eq!(tail.bytes, vec![expected as u8]);
            assert_eq!(tail.extranonce2_size, 7);
        }
        // Values past 0xff take the two-byte big-endian form.
        let tail = partitioner.allocate(8).unwrap();
        assert_eq!(tail.hex, "0100");
        assert_eq!(tail.extranonce2_size, 6);
    }

    #[test]
    fn tail_zero_is_never_issued() {
        let partitioner = ExtranoncePartitioner::new();
        for _ in 0..1000 {
            let tail = partitioner.allocate(4).unwrap();
            assert!(tail.bytes.iter().any(|&b| b != 0), "tail {:?} is all zeroes", tail.bytes);
            partitioner.release(&tail.bytes);
        }
    }

    #[test]
    fn no_duplicates_and_release_recycles() {
        let partitioner = ExtranoncePartitioner::new();
        let a = partitioner.allocate(4).unwrap();
        let b = partitioner.allocate(4).unwrap();
        assert_ne!(a.bytes, b.bytes);
        assert_eq!(partitioner.active(), 2);

        partitioner.release(&a.bytes);
        assert_eq!(partitioner.active(), 1);

        // The freed slot comes around again once the cursor wraps.
        let mut seen = false;
        for _ in 0..MAX_EXTRANONCE_TAILS {
            let t = partitioner.allocate(4).unwrap();
            if t.bytes == a.bytes {
                seen = true;
                break;
            }
        }
        assert!(seen);
    }

    #[test]
    fn exhaustion_reports_full_slots() {
        let partitioner = ExtranoncePartitioner::new();
        for _ in 0..(MAX_EXTRANONCE_TAILS - 1) {
            partitioner.allocate(4).unwrap();
        }
        assert!(matches!(partitioner.allocate(4), Err(ExtranonceError::SlotsFull)));
    }

    #[test]
    fn extranonce2_padding_widths() {
        assert_eq!(hex::encode(pad_extranonce2(1, 4)), "00000001");
        assert_eq!(hex::encode(pad_extranonce2(1, 8)), "0000000000000001");
        assert_eq!(hex::encode(pad_extranonce2(0xdead, 4)), "0000dead");
        // Overflow drops the high-order surplus.
        assert_eq!(hex::encode(pad_extranonce2(0x01020304, 2)), "0304");
    }
}
