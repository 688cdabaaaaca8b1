//! Block header, guard sentinels and tail snapshots.
//!
//! Every tracked block is laid out as:
//!
//! ```text
//! raw_base                                    user_base          user_base + size
//! | header: [u64 serial | u64 size] | lead: 16 x 0xA5 | payload ... | trail: 16 x 0x5A |
//! ```
//!
//! The header ties the block back to its ledger record at pointer
//! granularity. Both sentinels are fixed byte patterns so that dumps taken at
//! different times stay comparable.

#![allow(unsafe_code)]

use serde::Serialize;

use crate::error::GuardSide;

/// Size of the block header that precedes the leading sentinel.
pub const HEADER_SIZE: usize = 16;

/// Size of each sentinel region.
pub const GUARD_SIZE: usize = 16;

/// Bytes between the real block start and the user pointer.
pub const LEADING_SIZE: usize = HEADER_SIZE + GUARD_SIZE;

/// Bytes after the payload.
pub const TRAILING_SIZE: usize = GUARD_SIZE;

/// Total overhead per block.
pub const TOTAL_OVERHEAD: usize = LEADING_SIZE + TRAILING_SIZE;

/// Alignment of real blocks (and therefore of user pointers).
pub const BLOCK_ALIGN: usize = 16;

/// Sentinel byte written before the payload.
pub const LEADING_SENTINEL: u8 = 0xA5;

/// Sentinel byte written after the payload.
pub const TRAILING_SENTINEL: u8 = 0x5A;

/// Fill byte for freshly allocated payload bytes.
pub const FRESH_FILL: u8 = 0xCD;

/// Number of payload bytes kept from a block at release.
pub const TAIL_SNAPSHOT_LEN: usize = 16;

const _: () = assert!(LEADING_SIZE % BLOCK_ALIGN == 0);

/// Real block size needed for a payload of `user_size` bytes.
#[must_use]
pub fn total_size(user_size: usize) -> Option<usize> {
    user_size.checked_add(TOTAL_OVERHEAD)
}

/// Header stored at the start of every real block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BlockHeader {
    pub serial: u64,
    pub size: u64,
}

impl BlockHeader {
    #[must_use]
    pub fn new(serial: u64, size: usize) -> Self {
        Self {
            serial,
            size: size as u64,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.serial.to_le_bytes());
        buf[8..16].copy_from_slice(&self.size.to_le_bytes());
        buf
    }
}

/// A damaged sentinel byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardFault {
    pub side: GuardSide,
    /// Offset of the first damaged byte relative to the user pointer.
    pub offset: isize,
}

/// Write the header, the leading sentinel and the trailing sentinel.
///
/// # Safety
///
/// `raw_base` must be valid for writes of `total_size(user_size)` bytes.
pub unsafe fn stamp(raw_base: *mut u8, user_size: usize, serial: u64) {
    let header = BlockHeader::new(serial, user_size).to_bytes();
    // SAFETY: all three regions lie inside the block per the caller contract.
    unsafe {
        std::ptr::copy_nonoverlapping(header.as_ptr(), raw_base, HEADER_SIZE);
        std::ptr::write_bytes(raw_base.add(HEADER_SIZE), LEADING_SENTINEL, GUARD_SIZE);
        std::ptr::write_bytes(
            raw_base.add(LEADING_SIZE + user_size),
            TRAILING_SENTINEL,
            TRAILING_SIZE,
        );
    }
}

/// Fill `len` payload bytes starting at `from` with [`FRESH_FILL`].
///
/// # Safety
///
/// `user_base + from .. user_base + from + len` must be writable.
pub unsafe fn fill_fresh(user_base: *mut u8, from: usize, len: usize) {
    // SAFETY: caller contract.
    unsafe { std::ptr::write_bytes(user_base.add(from), FRESH_FILL, len) }
}

/// Verify the header and both sentinels of a block.
///
/// # Safety
///
/// `raw_base` must be valid for reads of `total_size(user_size)` bytes.
pub unsafe fn check(raw_base: *const u8, user_size: usize, serial: u64) -> Result<(), GuardFault> {
    // SAFETY: the leading region is the first LEADING_SIZE bytes of the block.
    let leading = unsafe { std::slice::from_raw_parts(raw_base, LEADING_SIZE) };
    let expected = BlockHeader::new(serial, user_size).to_bytes();

    let header_damage = leading[..HEADER_SIZE]
        .iter()
        .zip(expected.iter())
        .position(|(actual, want)| actual != want);
    let lead_damage = || {
        leading[HEADER_SIZE..]
            .iter()
            .position(|&b| b != LEADING_SENTINEL)
            .map(|i| HEADER_SIZE + i)
    };
    if let Some(i) = header_damage.or_else(lead_damage) {
        return Err(GuardFault {
            side: GuardSide::Leading,
            offset: i as isize - LEADING_SIZE as isize,
        });
    }

    // SAFETY: the trailing region sits right after the payload.
    let trailing = unsafe {
        std::slice::from_raw_parts(raw_base.add(LEADING_SIZE + user_size), TRAILING_SIZE)
    };
    if let Some(i) = trailing.iter().position(|&b| b != TRAILING_SENTINEL) {
        return Err(GuardFault {
            side: GuardSide::Trailing,
            offset: (user_size + i) as isize,
        });
    }
    Ok(())
}

/// Snapshot the payload tail of a block being released.
///
/// # Safety
///
/// `user_base` must be valid for reads of `user_size` bytes.
#[must_use]
pub unsafe fn snapshot_tail(user_base: *const u8, user_size: usize) -> TailSnapshot {
    // SAFETY: caller contract.
    unsafe { TailSnapshot::capture(user_base, user_size) }
}

/// Copy of the final payload bytes taken when a block is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TailSnapshot {
    len: u8,
    bytes: [u8; TAIL_SNAPSHOT_LEN],
}

impl TailSnapshot {
    /// Capture the last `min(size, TAIL_SNAPSHOT_LEN)` payload bytes.
    ///
    /// # Safety
    ///
    /// `user_base` must be valid for reads of `user_size` bytes.
    #[must_use]
    pub unsafe fn capture(user_base: *const u8, user_size: usize) -> Self {
        let len = user_size.min(TAIL_SNAPSHOT_LEN);
        let mut bytes = [0u8; TAIL_SNAPSHOT_LEN];
        // SAFETY: the copied range is the last `len` bytes of the payload.
        unsafe {
            std::ptr::copy_nonoverlapping(
                user_base.add(user_size - len),
                bytes.as_mut_ptr(),
                len,
            );
        }
        Self {
            len: len as u8,
            bytes,
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    /// Compare against the current payload tail; returns the payload offset of
    /// the first byte that changed.
    ///
    /// # Safety
    ///
    /// `user_base` must be valid for reads of `user_size` bytes.
    #[must_use]
    pub unsafe fn first_change(&self, user_base: *const u8, user_size: usize) -> Option<usize> {
        let len = usize::from(self.len);
        let start = user_size - len;
        // SAFETY: caller contract; `len <= user_size` by construction.
        let current = unsafe { std::slice::from_raw_parts(user_base.add(start), len) };
        current
            .iter()
            .zip(self.bytes())
            .position(|(now, then)| now != then)
            .map(|i| start + i)
    }
}
