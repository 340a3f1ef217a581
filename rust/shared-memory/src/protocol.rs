//! Ring memory layout
//!
//! A ring pair occupies two consecutive rings inside one shared region:
//!
//! ```text
//! +----------------------+----------------------+
//! | ring 0: low -> high  | ring 1: high -> low  |
//! +----------------------+----------------------+
//!   control | slot 0 | slot 1 | ... | slot N-1
//! ```
//!
//! Each slot is a little-endian u32 length, four bytes of padding and
//! `slot_size` data bytes, padded to 8-byte alignment.

use crate::{align_up, Result, SharedMemoryError};
use multicore_ipc_core::ProcId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicU32;

/// Bytes preceding the data of every slot
pub const SLOT_PREFIX_SIZE: usize = 8;

/// Ring start alignment inside a region
pub const RING_ALIGN: usize = 64;

/// State word value while the first binder fills in the geometry
pub const RING_INITIALIZING: u32 = 1;

/// Ring control block.
///
/// The producer index and the consumer index live on their own cache lines;
/// each is written by exactly one side. Both are free-running and wrap at
/// `u32::MAX`; slot position is `index & (slot_count - 1)`.
#[repr(C, align(64))]
pub struct RingControl {
    /// 0 = never bound, `RING_INITIALIZING`, or `RING_MAGIC` once ready
    pub state: AtomicU32,
    /// Slots in this ring
    pub slot_count: AtomicU32,
    /// Data bytes per slot
    pub slot_size: AtomicU32,
    /// Layout version
    pub version: AtomicU32,
    _pad0: [u8; 48],
    /// Producer index
    pub head: AtomicU32,
    _pad1: [u8; 60],
    /// Consumer index
    pub tail: AtomicU32,
    _pad2: [u8; 60],
}

/// Size of the control block at the start of every ring
pub const CONTROL_BLOCK_SIZE: usize = std::mem::size_of::<RingControl>();

/// Fixed ring parameters shared by both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingGeometry {
    pub slot_count: u32,
    pub slot_size: u32,
}

impl RingGeometry {
    pub fn new(slot_count: u32, slot_size: usize) -> Result<Self> {
        if slot_count == 0 || !slot_count.is_power_of_two() {
            return Err(SharedMemoryError::NotPowerOfTwo(slot_count));
        }
        if slot_size == 0 || slot_size > u32::MAX as usize - SLOT_PREFIX_SIZE {
            return Err(SharedMemoryError::InvalidGeometry(format!(
                "slot size {} out of range",
                slot_size
            )));
        }
        let geometry = Self {
            slot_count,
            slot_size: slot_size as u32,
        };
        geometry
            .ring_bytes()
            .checked_mul(2)
            .ok_or_else(|| SharedMemoryError::InvalidGeometry("ring pair too large".to_string()))?;
        Ok(geometry)
    }

    /// Distance between consecutive slots
    pub fn slot_stride(&self) -> usize {
        align_up(SLOT_PREFIX_SIZE + self.slot_size as usize, 8)
    }

    /// Bytes of one ring, including its control block
    pub fn ring_bytes(&self) -> usize {
        align_up(
            CONTROL_BLOCK_SIZE + self.slot_count as usize * self.slot_stride(),
            RING_ALIGN,
        )
    }

    /// Bytes of both rings
    pub fn pair_bytes(&self) -> usize {
        2 * self.ring_bytes()
    }

    pub fn mask(&self) -> u32 {
        self.slot_count - 1
    }
}

/// Bytes a region must provide for a ring pair of `slot_count` slots each
/// holding `slot_size` bytes
pub fn ring_bytes_required(slot_count: u32, slot_size: usize) -> Result<usize> {
    Ok(RingGeometry::new(slot_count, slot_size)?.pair_bytes())
}

/// Which half of the pair a processor transmits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// Lower processor id: transmits on ring 0
    Low,
    /// Higher processor id: transmits on ring 1
    High,
}

impl Side {
    pub fn for_pair(local: ProcId, remote: ProcId) -> Self {
        if local < remote {
            Side::Low
        } else {
            Side::High
        }
    }

    /// Ring index this side writes to
    pub fn tx_ring(self) -> usize {
        match self {
            Side::Low => 0,
            Side::High => 1,
        }
    }

    /// Ring index this side reads from
    pub fn rx_ring(self) -> usize {
        1 - self.tx_ring()
    }
}

/// Encode `name` into a NUL-terminated field of `width` bytes.
///
/// Names that do not fit are cut at the last character boundary that
/// leaves room for the terminator.
pub fn encode_fixed_name(name: &str, width: usize) -> Vec<u8> {
    let mut end = name.len().min(width.saturating_sub(1));
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut field = vec![0u8; width];
    field[..end].copy_from_slice(&name.as_bytes()[..end]);
    field
}

/// Read a NUL-terminated name field; a field without terminator is taken whole
pub fn decode_fixed_name(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_block_layout() {
        assert_eq!(CONTROL_BLOCK_SIZE, 192);
        assert_eq!(std::mem::align_of::<RingControl>(), 64);
        assert_eq!(std::mem::offset_of!(RingControl, head), 64);
        assert_eq!(std::mem::offset_of!(RingControl, tail), 128);
    }

    #[test]
    fn test_geometry_sizes() {
        let geometry = RingGeometry::new(256, 512).unwrap();
        assert_eq!(geometry.slot_stride(), 520);
        assert_eq!(geometry.ring_bytes(), align_up(192 + 256 * 520, 64));
        assert_eq!(geometry.pair_bytes(), 2 * geometry.ring_bytes());
        assert_eq!(geometry.mask(), 255);

        // Never less than two directions of raw slot data
        assert!(ring_bytes_required(256, 512).unwrap() >= 256 * 512 * 2);
    }

    #[test]
    fn test_geometry_rejects_bad_values() {
        assert!(matches!(
            RingGeometry::new(12, 64),
            Err(SharedMemoryError::NotPowerOfTwo(12))
        ));
        assert!(RingGeometry::new(0, 64).is_err());
        assert!(RingGeometry::new(8, 0).is_err());
    }

    #[test]
    fn test_sides_are_complementary() {
        let low = Side::for_pair(ProcId(0), ProcId(3));
        let high = Side::for_pair(ProcId(3), ProcId(0));
        assert_eq!(low, Side::Low);
        assert_eq!(high, Side::High);
        assert_eq!(low.tx_ring(), high.rx_ring());
        assert_eq!(low.rx_ring(), high.tx_ring());
    }

    #[test]
    fn test_fixed_name_truncation() {
        let field = encode_fixed_name("rpmsg-echo", 32);
        assert_eq!(field.len(), 32);
        assert_eq!(decode_fixed_name(&field), "rpmsg-echo");

        let long = "x".repeat(40);
        let field = encode_fixed_name(&long, 32);
        assert_eq!(field[31], 0);
        assert_eq!(decode_fixed_name(&field), "x".repeat(31));

        // Never splits a multi-byte character
        let wide = format!("{}\u{e9}", "a".repeat(30));
        assert_eq!(decode_fixed_name(&encode_fixed_name(&wide, 32)), "a".repeat(30));
    }
}
