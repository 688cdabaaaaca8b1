//! Sharded ledger of allocation records.
//!
//! Every tracked block gets a record keyed by its user pointer. Released
//! records stay behind as tombstones so that a second release, or a write into
//! a retained released block, can still be attributed to its allocation site.
//! Released blocks either go straight back to the backing allocator or wait in
//! a per-shard quarantine queue.
//!
//! Thread-safe via sharded `parking_lot::Mutex`. Totals are kept in atomics,
//! independently of the slot tables, so the validator can cross-check them.

#![allow(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::backing::{BackingAllocator, SystemBacking};
use crate::error::{Detection, InvalidReason, MemDbgError, Operation};
use crate::guard::{self, LEADING_SIZE};
use crate::record::{AllocationRecord, RecordState};
use crate::site::CallSite;

/// Number of shards for ledger locks (power of 2).
pub(crate) const NUM_SHARDS: usize = 16;

/// Upper bounds for blocks held in quarantine, per shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuarantineLimits {
    pub max_bytes: usize,
    pub max_entries: usize,
}

impl QuarantineLimits {
    /// 64 MB or 65 536 blocks per shard.
    pub const DEFAULT: Self = Self {
        max_bytes: 64 * 1024 * 1024,
        max_entries: 65_536,
    };

    /// Never hand released blocks back.
    pub const UNBOUNDED: Self = Self {
        max_bytes: usize::MAX,
        max_entries: usize::MAX,
    };
}

/// What happens to the real block when its record is released.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum BlockPolicy {
    /// Hand the block back to the backing allocator immediately.
    #[default]
    Recycle,
    /// Keep the block so writes after release can be detected.
    Quarantine(QuarantineLimits),
}

/// What happens to a record when it is released.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RecordPolicy {
    /// Keep a tombstone until `compact()`.
    #[default]
    Retain,
    /// Drop the record at once. A second release then reads as unmanaged.
    Purge,
}

/// A released block still owned by the ledger.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QuarantineEntry {
    pub(crate) user_base: usize,
    pub(crate) raw_base: usize,
    pub(crate) total_size: usize,
}

/// A single shard of the ledger.
#[derive(Debug, Default)]
pub(crate) struct LedgerShard {
    pub(crate) slots: Vec<Option<AllocationRecord>>,
    /// Map from user_base address to slot index.
    pub(crate) addr_to_slot: HashMap<usize, usize>,
    /// Vacant slot indices for reuse.
    pub(crate) free_list: Vec<usize>,
    pub(crate) quarantine: VecDeque<QuarantineEntry>,
    pub(crate) quarantine_bytes: usize,
}

impl LedgerShard {
    /// Insert a record; returns the tombstone it superseded, if any.
    fn insert(&mut self, record: AllocationRecord) -> Option<AllocationRecord> {
        if let Some(&idx) = self.addr_to_slot.get(&record.user_base) {
            return self.slots[idx].replace(record);
        }
        let idx = if let Some(free_idx) = self.free_list.pop() {
            self.slots[free_idx] = Some(record);
            free_idx
        } else {
            self.slots.push(Some(record));
            self.slots.len() - 1
        };
        self.addr_to_slot.insert(record.user_base, idx);
        None
    }

    fn take(&mut self, user_base: usize) -> Option<AllocationRecord> {
        let idx = self.addr_to_slot.remove(&user_base)?;
        let record = self.slots[idx].take();
        self.free_list.push(idx);
        record
    }

    pub(crate) fn find(&self, user_base: usize) -> Option<&AllocationRecord> {
        let idx = *self.addr_to_slot.get(&user_base)?;
        self.slots.get(idx)?.as_ref()
    }

    fn lookup_mut(
        &mut self,
        user_base: usize,
        op: Operation,
        site: CallSite,
    ) -> Result<&mut AllocationRecord, MemDbgError> {
        let Some(&idx) = self.addr_to_slot.get(&user_base) else {
            return Err(MemDbgError::InvalidPointer {
                addr: user_base,
                op,
                site,
                reason: InvalidReason::Unmanaged,
                allocated_at: None,
            });
        };
        self.slots
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or_else(|| MemDbgError::LedgerDesync {
                detail: format!("index entry {user_base:#x} names vacant slot {idx}"),
                detected: Detection::During { op, site },
            })
    }

    fn drain_quarantine(&mut self, limits: QuarantineLimits) -> Vec<QuarantineEntry> {
        let mut drained = Vec::new();
        while self.quarantine_bytes > limits.max_bytes || self.quarantine.len() > limits.max_entries
        {
            let Some(entry) = self.quarantine.pop_front() else {
                break;
            };
            if let Some(&idx) = self.addr_to_slot.get(&entry.user_base)
                && let Some(record) = self.slots[idx].as_mut()
            {
                record.block_retained = false;
            }
            self.quarantine_bytes -= entry.total_size;
            drained.push(entry);
        }
        drained
    }
}

/// Point-in-time copy of the running totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerTotals {
    pub live_blocks: usize,
    pub live_bytes: usize,
    pub released_blocks: usize,
    pub released_bytes: usize,
}

#[derive(Debug, Default)]
struct RunningTotals {
    live_blocks: AtomicUsize,
    live_bytes: AtomicUsize,
    released_blocks: AtomicUsize,
    released_bytes: AtomicUsize,
}

impl RunningTotals {
    fn add_live(&self, bytes: usize) {
        self.live_blocks.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn sub_live(&self, bytes: usize) {
        self.live_blocks.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn resize_live(&self, old: usize, new: usize) {
        self.live_bytes.fetch_add(new, Ordering::Relaxed);
        self.live_bytes.fetch_sub(old, Ordering::Relaxed);
    }

    fn add_released(&self, bytes: usize) {
        self.released_blocks.fetch_add(1, Ordering::Relaxed);
        self.released_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn sub_released(&self, bytes: usize) {
        self.released_blocks.fetch_sub(1, Ordering::Relaxed);
        self.released_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LedgerTotals {
        LedgerTotals {
            live_blocks: self.live_blocks.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            released_blocks: self.released_blocks.load(Ordering::Relaxed),
            released_bytes: self.released_bytes.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn shard_for(addr: usize) -> usize {
    // Blocks are 16-aligned; fold in page bits so neighbours spread out.
    ((addr >> 4) ^ (addr >> 12)) % NUM_SHARDS
}

/// Thread-safe ledger of every block handed out through it.
pub struct Ledger<B: BackingAllocator = SystemBacking> {
    backing: B,
    pub(crate) shards: Box<[Mutex<LedgerShard>]>,
    next_serial: AtomicU64,
    totals: RunningTotals,
    block_policy: BlockPolicy,
    record_policy: RecordPolicy,
}

impl Ledger<SystemBacking> {
    /// Ledger over the Rust global allocator with default policies.
    #[must_use]
    pub fn system() -> Self {
        Self::new(SystemBacking, BlockPolicy::default(), RecordPolicy::default())
    }
}

impl<B: BackingAllocator> Ledger<B> {
    #[must_use]
    pub fn new(backing: B, block_policy: BlockPolicy, record_policy: RecordPolicy) -> Self {
        let shards: Vec<Mutex<LedgerShard>> = (0..NUM_SHARDS)
            .map(|_| Mutex::new(LedgerShard::default()))
            .collect();
        Self {
            backing,
            shards: shards.into_boxed_slice(),
            next_serial: AtomicU64::new(1),
            totals: RunningTotals::default(),
            block_policy,
            record_policy,
        }
    }

    #[must_use]
    pub fn backing(&self) -> &B {
        &self.backing
    }

    #[must_use]
    pub fn block_policy(&self) -> BlockPolicy {
        self.block_policy
    }

    #[must_use]
    pub fn record_policy(&self) -> RecordPolicy {
        self.record_policy
    }

    /// Allocate a guarded block of `user_size` bytes and record it.
    ///
    /// The payload is filled with [`guard::FRESH_FILL`].
    pub fn create(&self, user_size: usize, site: CallSite) -> Result<AllocationRecord, MemDbgError> {
        self.create_for(user_size, site, Operation::Allocate)
    }

    pub(crate) fn create_for(
        &self,
        user_size: usize,
        site: CallSite,
        op: Operation,
    ) -> Result<AllocationRecord, MemDbgError> {
        let raw = self.allocate_block(user_size, op, site)?;
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        // SAFETY: the block spans total_size(user_size) bytes.
        unsafe {
            guard::stamp(raw.as_ptr(), user_size, serial);
            guard::fill_fresh(raw.as_ptr().add(LEADING_SIZE), 0, user_size);
        }

        let record = AllocationRecord::live(serial, raw, user_size, site);
        self.insert(record);
        self.totals.add_live(user_size);
        log::trace!("memdbg: {op} #{serial} {user_size}B at {site} -> {:#x}", record.user_base);
        Ok(record)
    }

    /// Move a live block to a block of `new_size` bytes, keeping its serial.
    ///
    /// The first `min(old, new)` payload bytes are preserved. On any error the
    /// original block and record are left untouched.
    pub fn resize(
        &self,
        user_ptr: *const u8,
        new_size: usize,
        site: CallSite,
    ) -> Result<AllocationRecord, MemDbgError> {
        let old_base = user_ptr as usize;
        let op = Operation::Reallocate;
        let detected = Detection::During { op, site };

        let old = {
            let mut shard = self.shards[shard_for(old_base)].lock();
            let record = shard.lookup_mut(old_base, op, site)?;
            if !record.is_live() {
                return Err(released_pointer(old_base, op, site, record.site));
            }
            // SAFETY: live records own their block.
            unsafe { record.verify_guards(&detected)? };
            *record
        };

        let raw = self.allocate_block(new_size, op, site)?;
        let keep = old.user_size.min(new_size);
        // SAFETY: the new block spans total_size(new_size) bytes and the old
        // block is live with at least `keep` payload bytes.
        unsafe {
            guard::stamp(raw.as_ptr(), new_size, old.serial);
            let new_user = raw.as_ptr().add(LEADING_SIZE);
            std::ptr::copy_nonoverlapping(old.user_ptr().cast_const(), new_user, keep);
            guard::fill_fresh(new_user, keep, new_size - keep);
        }
        let moved = AllocationRecord::live(old.serial, raw, new_size, site);

        {
            let mut shard = self.shards[shard_for(old_base)].lock();
            let still_live = shard
                .find(old_base)
                .is_some_and(|r| r.is_live() && r.serial == old.serial);
            if !still_live {
                drop(shard);
                self.free_block(moved.raw_base, moved.total_size());
                return Err(released_pointer(old_base, op, site, old.site));
            }
            shard.take(old_base);
        }
        self.insert(moved);
        self.totals.resize_live(old.user_size, new_size);
        self.free_block(old.raw_base, old.total_size());

        log::trace!(
            "memdbg: reallocate #{} {}B -> {new_size}B at {site}: {old_base:#x} -> {:#x}",
            old.serial,
            old.user_size,
            moved.user_base
        );
        Ok(moved)
    }

    /// Mark a live block released.
    ///
    /// Guards are verified first; the last payload bytes are snapshotted, then
    /// the block and record follow the configured policies. Returns the record
    /// as it stood after release.
    pub fn release(
        &self,
        user_ptr: *const u8,
        site: CallSite,
    ) -> Result<AllocationRecord, MemDbgError> {
        let user_base = user_ptr as usize;
        let op = Operation::Release;
        let detected = Detection::During { op, site };

        let mut shard = self.shards[shard_for(user_base)].lock();
        let record = shard.lookup_mut(user_base, op, site)?;
        if !record.is_live() {
            return Err(MemDbgError::DoubleRelease {
                addr: user_base,
                site,
                allocated_at: record.site,
                released_at: record.released_at.unwrap_or(CallSite::UNKNOWN),
            });
        }
        // SAFETY: live records own their block.
        unsafe { record.verify_guards(&detected)? };
        // SAFETY: as above; the payload is readable for user_size bytes.
        let tail = unsafe { guard::snapshot_tail(record.user_ptr(), record.user_size) };
        record.state = RecordState::Released;
        record.released_at = Some(site);
        record.tail = Some(tail);
        self.totals.sub_live(record.user_size);
        let released = *record;

        log::trace!(
            "memdbg: release #{} {}B at {site} (allocated at {})",
            released.serial,
            released.user_size,
            released.site
        );

        if self.record_policy == RecordPolicy::Purge {
            shard.take(user_base);
            drop(shard);
            self.free_block(released.raw_base, released.total_size());
            return Ok(released);
        }

        self.totals.add_released(released.user_size);
        match self.block_policy {
            BlockPolicy::Recycle => {
                drop(shard);
                self.free_block(released.raw_base, released.total_size());
                Ok(released)
            }
            BlockPolicy::Quarantine(limits) => {
                if let Ok(record) = shard.lookup_mut(user_base, op, site) {
                    record.block_retained = true;
                }
                shard.quarantine.push_back(QuarantineEntry {
                    user_base,
                    raw_base: released.raw_base,
                    total_size: released.total_size(),
                });
                shard.quarantine_bytes += released.total_size();
                let drained = shard.drain_quarantine(limits);
                let after = shard.find(user_base).copied().unwrap_or(released);
                drop(shard);
                for entry in drained {
                    self.free_block(entry.raw_base, entry.total_size);
                }
                Ok(after)
            }
        }
    }

    /// Exact lookup by user pointer.
    #[must_use]
    pub fn find(&self, user_ptr: *const u8) -> Option<AllocationRecord> {
        let user_base = user_ptr as usize;
        self.shards[shard_for(user_base)]
            .lock()
            .find(user_base)
            .copied()
    }

    /// Every record (live and released), ordered by serial.
    #[must_use]
    pub fn records(&self) -> Vec<AllocationRecord> {
        let mut out: Vec<AllocationRecord> = Vec::new();
        for shard in self.shards.iter() {
            out.extend(shard.lock().slots.iter().flatten().copied());
        }
        out.sort_by_key(|r| r.serial);
        out
    }

    /// Live records ordered by serial.
    #[must_use]
    pub fn live_records(&self) -> Vec<AllocationRecord> {
        let mut out = self.records();
        out.retain(AllocationRecord::is_live);
        out
    }

    /// Running totals, maintained independently of the slot tables.
    #[must_use]
    pub fn totals(&self) -> LedgerTotals {
        self.totals.snapshot()
    }

    /// Drop every released record and hand quarantined blocks back.
    ///
    /// Never triggered automatically. Returns the number of records purged.
    pub fn compact(&self) -> usize {
        let mut purged = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let drained: Vec<QuarantineEntry> = shard.quarantine.drain(..).collect();
            shard.quarantine_bytes = 0;
            let released: Vec<usize> = shard
                .slots
                .iter()
                .flatten()
                .filter(|r| !r.is_live())
                .map(|r| r.user_base)
                .collect();
            for user_base in released {
                if let Some(record) = shard.take(user_base) {
                    self.totals.sub_released(record.user_size);
                    purged += 1;
                }
            }
            drop(shard);
            for entry in drained {
                self.free_block(entry.raw_base, entry.total_size);
            }
        }
        log::debug!("memdbg: compact purged {purged} released record(s)");
        purged
    }

    fn allocate_block(
        &self,
        user_size: usize,
        op: Operation,
        site: CallSite,
    ) -> Result<NonNull<u8>, MemDbgError> {
        let failure = || MemDbgError::AllocatorFailure {
            requested: user_size,
            op,
            site,
        };
        let total = guard::total_size(user_size).ok_or_else(failure)?;
        self.backing.allocate(total).ok_or_else(failure)
    }

    fn insert(&self, record: AllocationRecord) {
        let superseded = self.shards[shard_for(record.user_base)].lock().insert(record);
        if let Some(old) = superseded {
            // The backing allocator recycled a released block; its tombstone goes.
            debug_assert!(!old.is_live(), "live record at a freshly allocated address");
            if !old.is_live() {
                self.totals.sub_released(old.user_size);
            }
            log::debug!(
                "memdbg: #{} reuses {:#x}, dropping tombstone #{}",
                record.serial,
                record.user_base,
                old.serial
            );
        }
    }

    fn free_block(&self, raw_base: usize, total_size: usize) {
        if let Some(ptr) = NonNull::new(raw_base as *mut u8) {
            // SAFETY: the ledger allocated this block with `total_size` bytes
            // and gives up ownership exactly once, here.
            unsafe { self.backing.release(ptr, total_size) }
        }
    }
}

impl<B: BackingAllocator> Drop for Ledger<B> {
    fn drop(&mut self) {
        // Leaked live blocks may still be in use by the host; only the
        // quarantine is ours to return.
        let entries: Vec<QuarantineEntry> = self
            .shards
            .iter_mut()
            .flat_map(|shard| shard.get_mut().quarantine.drain(..).collect::<Vec<_>>())
            .collect();
        for entry in entries {
            self.free_block(entry.raw_base, entry.total_size);
        }
    }
}

fn released_pointer(addr: usize, op: Operation, site: CallSite, allocated_at: CallSite) -> MemDbgError {
    MemDbgError::InvalidPointer {
        addr,
        op,
        site,
        reason: InvalidReason::Released,
        allocated_at: Some(allocated_at),
    }
}
