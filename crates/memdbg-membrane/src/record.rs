//! Allocation records held by the ledger.

#![allow(unsafe_code)]

use std::ptr::NonNull;

use serde::Serialize;

use crate::error::{Detection, GuardSide, MemDbgError};
use crate::guard::{self, LEADING_SIZE, TailSnapshot};
use crate::site::CallSite;

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Live,
    Released,
}

/// Metadata for one tracked block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocationRecord {
    /// Sequence number, unique per ledger, kept across reallocation.
    pub serial: u64,
    /// Start of the real block (header included).
    pub raw_base: usize,
    /// Pointer handed to the host.
    pub user_base: usize,
    /// Size the host asked for.
    pub user_size: usize,
    /// Site of the allocation (or of the last reallocation).
    pub site: CallSite,
    pub state: RecordState,
    pub released_at: Option<CallSite>,
    /// Final payload bytes at release time.
    pub tail: Option<TailSnapshot>,
    /// Whether the real block is still held after release.
    pub block_retained: bool,
}

impl AllocationRecord {
    pub(crate) fn live(serial: u64, raw: NonNull<u8>, user_size: usize, site: CallSite) -> Self {
        let raw_base = raw.as_ptr() as usize;
        Self {
            serial,
            raw_base,
            user_base: raw_base + LEADING_SIZE,
            user_size,
            site,
            state: RecordState::Live,
            released_at: None,
            tail: None,
            block_retained: false,
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state == RecordState::Live
    }

    #[must_use]
    pub fn user_ptr(&self) -> *mut u8 {
        self.user_base as *mut u8
    }

    /// Size of the real block backing this record.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.user_size + guard::TOTAL_OVERHEAD
    }

    /// Whether the real block is still owned by the ledger.
    #[must_use]
    pub fn owns_block(&self) -> bool {
        self.is_live() || self.block_retained
    }

    /// Check header and sentinels, mapping a fault to `GuardCorruption`.
    ///
    /// # Safety
    ///
    /// The record's block must still be owned by the ledger.
    pub(crate) unsafe fn verify_guards(&self, detected: &Detection) -> Result<(), MemDbgError> {
        // SAFETY: caller guarantees the block is owned and therefore readable.
        let outcome = unsafe { guard::check(self.raw_base as *const u8, self.user_size, self.serial) };
        outcome.map_err(|fault| self.corruption(fault.side, fault.offset, detected))
    }

    pub(crate) fn corruption(
        &self,
        side: GuardSide,
        offset: isize,
        detected: &Detection,
    ) -> MemDbgError {
        MemDbgError::GuardCorruption {
            side,
            addr: self.user_base,
            size: self.user_size,
            serial: self.serial,
            offset,
            allocated_at: self.site,
            detected: detected.clone(),
        }
    }
}
