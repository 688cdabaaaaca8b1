//! Multi-level ledger validation.
//!
//! Each level includes every check of the levels below it:
//!
//! | Level   | Checks                                                        |
//! |---------|---------------------------------------------------------------|
//! | MIN     | header and both guards of every live block                    |
//! | DEEP    | slot table, address index, free list, quarantine, overlaps    |
//! | DEEPER  | recount of live/released blocks and bytes vs running totals   |
//! | DEEPEST | guards and tail bytes of released blocks still held           |
//!
//! Validation locks every shard (in index order) for the duration of the walk.
//! Totals are only meaningful at a quiescent point.

#![allow(unsafe_code)]

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::backing::BackingAllocator;
use crate::error::{Detection, GuardSide, MemDbgError};
use crate::guard::LEADING_SIZE;
use crate::ledger::{Ledger, LedgerShard, LedgerTotals, shard_for};
use crate::record::AllocationRecord;

/// How much of the ledger a validation pass inspects.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum ValidationLevel {
    #[default]
    Min = 0,
    Deep = 1,
    Deeper = 2,
    Deepest = 3,
}

impl ValidationLevel {
    pub const ALL: [Self; 4] = [Self::Min, Self::Deep, Self::Deeper, Self::Deepest];

    /// Map a C level constant; out-of-range values clamp to the nearest level.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        match raw {
            i32::MIN..=0 => Self::Min,
            1 => Self::Deep,
            2 => Self::Deeper,
            _ => Self::Deepest,
        }
    }

    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "min" | "0" => Some(Self::Min),
            "deep" | "1" => Some(Self::Deep),
            "deeper" | "2" => Some(Self::Deeper),
            "deepest" | "3" => Some(Self::Deepest),
            _ => None,
        }
    }
}

impl fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Min => "MIN",
            Self::Deep => "DEEP",
            Self::Deeper => "DEEPER",
            Self::Deepest => "DEEPEST",
        })
    }
}

/// Parameters of one validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidateRequest<'a> {
    pub level: ValidationLevel,
    /// Caller context attached to any error.
    pub message: Option<&'a str>,
    /// Return every released record's snapshot in the report.
    pub show_extended: bool,
}

impl<'a> ValidateRequest<'a> {
    #[must_use]
    pub const fn new(level: ValidationLevel) -> Self {
        Self {
            level,
            message: None,
            show_extended: false,
        }
    }

    #[must_use]
    pub const fn with_message(mut self, message: &'a str) -> Self {
        self.message = Some(message);
        self
    }

    #[must_use]
    pub const fn extended(mut self, show: bool) -> Self {
        self.show_extended = show;
        self
    }
}

/// Outcome of a clean validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub level: ValidationLevel,
    /// Live blocks whose guards were checked.
    pub live_checked: usize,
    /// Released blocks whose guards and tail were checked.
    pub released_checked: usize,
    /// Released records, when requested.
    pub extended: Vec<AllocationRecord>,
}

impl<B: BackingAllocator> Ledger<B> {
    /// Walk the ledger at `request.level`.
    pub fn validate(&self, request: &ValidateRequest<'_>) -> Result<ValidationReport, MemDbgError> {
        let level = request.level;
        let detected = Detection::Validation {
            level,
            message: request.message.map(str::to_owned),
        };
        let shards: Vec<_> = self.shards.iter().map(|shard| shard.lock()).collect();
        let mut report = ValidationReport {
            level,
            ..ValidationReport::default()
        };

        for shard in &shards {
            for record in shard.slots.iter().flatten().filter(|r| r.is_live()) {
                // SAFETY: live records own their block.
                unsafe { record.verify_guards(&detected)? };
                report.live_checked += 1;
            }
        }

        if level >= ValidationLevel::Deep {
            for (idx, shard) in shards.iter().enumerate() {
                check_shard(idx, shard, &detected)?;
            }
            check_cross_shard(shards.iter().flat_map(|s| s.slots.iter().flatten()), &detected)?;
        }

        if level >= ValidationLevel::Deeper {
            let mut counted = LedgerTotals::default();
            for record in shards.iter().flat_map(|s| s.slots.iter().flatten()) {
                if record.is_live() {
                    counted.live_blocks += 1;
                    counted.live_bytes += record.user_size;
                } else {
                    counted.released_blocks += 1;
                    counted.released_bytes += record.user_size;
                }
            }
            let running = self.totals();
            if counted != running {
                return Err(desync(
                    format!("recount {counted:?} disagrees with running totals {running:?}"),
                    &detected,
                ));
            }
        }

        if level >= ValidationLevel::Deepest {
            for shard in &shards {
                for record in shard.slots.iter().flatten().filter(|r| !r.is_live()) {
                    if record.block_retained {
                        check_released(record, &detected)?;
                        report.released_checked += 1;
                    }
                    if request.show_extended {
                        report.extended.push(*record);
                    }
                }
            }
            report.extended.sort_by_key(|r| r.serial);
        }

        drop(shards);
        log::debug!(
            "memdbg: validate({level}) checked {} live, {} released",
            report.live_checked,
            report.released_checked
        );
        Ok(report)
    }
}

fn desync(detail: String, detected: &Detection) -> MemDbgError {
    MemDbgError::LedgerDesync {
        detail,
        detected: detected.clone(),
    }
}

fn check_shard(idx: usize, shard: &LedgerShard, detected: &Detection) -> Result<(), MemDbgError> {
    for (&addr, &slot) in &shard.addr_to_slot {
        match shard.slots.get(slot) {
            Some(Some(record)) if record.user_base == addr => {}
            Some(Some(record)) => {
                return Err(desync(
                    format!(
                        "shard {idx}: index {addr:#x} names slot {slot} holding {:#x}",
                        record.user_base
                    ),
                    detected,
                ));
            }
            _ => {
                return Err(desync(
                    format!("shard {idx}: index {addr:#x} names vacant slot {slot}"),
                    detected,
                ));
            }
        }
    }

    let occupied = shard.slots.iter().flatten().count();
    if occupied != shard.addr_to_slot.len() {
        return Err(desync(
            format!(
                "shard {idx}: {occupied} occupied slots but {} index entries",
                shard.addr_to_slot.len()
            ),
            detected,
        ));
    }

    let mut vacant = HashSet::with_capacity(shard.free_list.len());
    for &slot in &shard.free_list {
        if !vacant.insert(slot) {
            return Err(desync(format!("shard {idx}: slot {slot} on free list twice"), detected));
        }
        if !matches!(shard.slots.get(slot), Some(None)) {
            return Err(desync(
                format!("shard {idx}: free slot {slot} is occupied or out of range"),
                detected,
            ));
        }
    }

    for record in shard.slots.iter().flatten() {
        if record.user_base != record.raw_base + LEADING_SIZE {
            return Err(desync(
                format!(
                    "serial {}: user {:#x} is not raw {:#x} + {LEADING_SIZE}",
                    record.serial, record.user_base, record.raw_base
                ),
                detected,
            ));
        }
        let home = shard_for(record.user_base);
        if home != idx {
            return Err(desync(
                format!("serial {} filed in shard {idx}, belongs in {home}", record.serial),
                detected,
            ));
        }
    }

    let mut queued_bytes = 0usize;
    for entry in &shard.quarantine {
        let held = shard
            .find(entry.user_base)
            .is_some_and(|r| !r.is_live() && r.block_retained && r.raw_base == entry.raw_base);
        if !held {
            return Err(desync(
                format!(
                    "shard {idx}: quarantined block {:#x} has no retained released record",
                    entry.user_base
                ),
                detected,
            ));
        }
        queued_bytes += entry.total_size;
    }
    let retained = shard.slots.iter().flatten().filter(|r| r.block_retained).count();
    if queued_bytes != shard.quarantine_bytes || retained != shard.quarantine.len() {
        return Err(desync(
            format!(
                "shard {idx}: quarantine holds {} blocks / {queued_bytes} bytes, expected {retained} blocks / {} bytes",
                shard.quarantine.len(),
                shard.quarantine_bytes
            ),
            detected,
        ));
    }
    Ok(())
}

fn check_cross_shard<'a>(
    records: impl Iterator<Item = &'a AllocationRecord>,
    detected: &Detection,
) -> Result<(), MemDbgError> {
    let mut serials = HashSet::new();
    let mut blocks: Vec<(usize, usize, u64)> = Vec::new();
    for record in records {
        if !serials.insert(record.serial) {
            return Err(desync(format!("serial {} recorded twice", record.serial), detected));
        }
        if record.owns_block() {
            blocks.push((record.raw_base, record.raw_base + record.total_size(), record.serial));
        }
    }
    blocks.sort_unstable();
    for pair in blocks.windows(2) {
        let (_, end, first) = pair[0];
        let (start, _, second) = pair[1];
        if start < end {
            return Err(desync(
                format!("blocks of serial {first} and serial {second} overlap"),
                detected,
            ));
        }
    }
    Ok(())
}

fn check_released(record: &AllocationRecord, detected: &Detection) -> Result<(), MemDbgError> {
    // SAFETY: the block is still held by the quarantine.
    unsafe { record.verify_guards(detected)? };
    if let Some(tail) = record.tail {
        // SAFETY: as above; the payload spans user_size bytes.
        let changed = unsafe { tail.first_change(record.user_ptr().cast_const(), record.user_size) };
        if let Some(offset) = changed {
            return Err(record.corruption(GuardSide::ReleasedPayload, offset as isize, detected));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::SystemBacking;
    use crate::ledger::{BlockPolicy, QuarantineLimits, RecordPolicy};
    use crate::record::RecordState;
    use crate::site::CallSite;

    fn site(line: u32) -> CallSite {
        CallSite::new("validator_test.rs", line)
    }

    fn quarantined() -> Ledger {
        Ledger::new(
            SystemBacking,
            BlockPolicy::Quarantine(QuarantineLimits::UNBOUNDED),
            RecordPolicy::Retain,
        )
    }

    #[test]
    fn levels_are_ordered() {
        assert!(ValidationLevel::Min < ValidationLevel::Deep);
        assert!(ValidationLevel::Deeper < ValidationLevel::Deepest);
        assert_eq!(ValidationLevel::from_raw(2), ValidationLevel::Deeper);
        assert_eq!(ValidationLevel::from_raw(-4), ValidationLevel::Min);
        assert_eq!(ValidationLevel::from_raw(99), ValidationLevel::Deepest);
        assert_eq!(ValidationLevel::from_str_loose("Deep"), Some(ValidationLevel::Deep));
        assert_eq!(ValidationLevel::Deepest.to_string(), "DEEPEST");
    }

    #[test]
    fn clean_ledger_passes_every_level() {
        let ledger = quarantined();
        let kept: Vec<_> = (0..8).map(|i| ledger.create(i * 3, site(i as u32)).unwrap()).collect();
        for r in kept.iter().step_by(2) {
            ledger.release(r.user_ptr(), site(100)).unwrap();
        }
        for level in ValidationLevel::ALL {
            let report = ledger.validate(&ValidateRequest::new(level)).unwrap();
            assert_eq!(report.live_checked, 4);
        }
        let report = ledger
            .validate(&ValidateRequest::new(ValidationLevel::Deepest).extended(true))
            .unwrap();
        assert_eq!(report.released_checked, 4);
        assert_eq!(report.extended.len(), 4);
        assert!(report.extended.iter().all(|r| r.state == RecordState::Released));
    }

    #[test]
    fn min_reports_overflow_with_message() {
        let ledger = Ledger::system();
        let record = ledger.create(10, site(7)).unwrap();
        // SAFETY: intentionally damage the trailing guard.
        unsafe { record.user_ptr().add(11).write(0xEE) };

        let err = ledger
            .validate(&ValidateRequest::new(ValidationLevel::Min).with_message("checkpoint"))
            .unwrap_err();
        match err {
            MemDbgError::GuardCorruption {
                side,
                offset,
                allocated_at,
                detected,
                ..
            } => {
                assert_eq!(side, GuardSide::Trailing);
                assert_eq!(offset, 11);
                assert_eq!(allocated_at, site(7));
                assert_eq!(
                    detected,
                    Detection::Validation {
                        level: ValidationLevel::Min,
                        message: Some("checkpoint".into()),
                    }
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        // SAFETY: repair so the test leaves a consistent block behind.
        unsafe { record.user_ptr().add(11).write(crate::guard::TRAILING_SENTINEL) };
        ledger.release(record.user_ptr(), site(8)).unwrap();
    }

    #[test]
    fn deep_catches_broken_index() {
        let ledger = Ledger::system();
        let record = ledger.create(16, site(1)).unwrap();
        ledger.shards[shard_for(record.user_base)]
            .lock()
            .addr_to_slot
            .clear();

        assert!(ledger.validate(&ValidateRequest::new(ValidationLevel::Min)).is_ok());
        let err = ledger
            .validate(&ValidateRequest::new(ValidationLevel::Deep))
            .unwrap_err();
        assert_eq!(err.kind(), "LedgerDesync");
    }

    #[test]
    fn deep_catches_duplicate_free_slot() {
        let ledger = Ledger::system();
        let a = ledger.create(16, site(1)).unwrap();
        ledger.release(a.user_ptr(), site(2)).unwrap();
        ledger.compact();
        let mut shard = ledger.shards[shard_for(a.user_base)].lock();
        let slot = shard.free_list[0];
        shard.free_list.push(slot);
        drop(shard);

        let err = ledger
            .validate(&ValidateRequest::new(ValidationLevel::Deep))
            .unwrap_err();
        assert!(err.to_string().contains("free list twice"), "{err}");
    }

    #[test]
    fn deeper_catches_totals_drift() {
        let ledger = Ledger::system();
        let record = ledger.create(16, site(1)).unwrap();
        ledger.release(record.user_ptr(), site(2)).unwrap();
        // Drop the tombstone behind the totals' back.
        {
            let mut shard = ledger.shards[shard_for(record.user_base)].lock();
            let slot = shard.addr_to_slot.remove(&record.user_base).unwrap();
            shard.slots[slot] = None;
            shard.free_list.push(slot);
        }
        assert!(ledger.validate(&ValidateRequest::new(ValidationLevel::Deep)).is_ok());
        let err = ledger
            .validate(&ValidateRequest::new(ValidationLevel::Deeper))
            .unwrap_err();
        assert!(err.to_string().contains("running totals"), "{err}");
    }

    #[test]
    fn deepest_catches_write_after_release() {
        let ledger = quarantined();
        let record = ledger.create(40, site(3)).unwrap();
        ledger.release(record.user_ptr(), site(4)).unwrap();
        // SAFETY: the block is quarantined, so still allocated.
        unsafe { record.user_ptr().add(35).write(0x00) };

        assert!(ledger.validate(&ValidateRequest::new(ValidationLevel::Deeper)).is_ok());
        let err = ledger
            .validate(&ValidateRequest::new(ValidationLevel::Deepest))
            .unwrap_err();
        match err {
            MemDbgError::GuardCorruption {
                side,
                offset,
                allocated_at,
                ..
            } => {
                assert_eq!(side, GuardSide::ReleasedPayload);
                assert_eq!(offset, 35);
                assert_eq!(allocated_at, site(3));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn extended_report_is_empty_unless_requested() {
        let ledger = quarantined();
        let record = ledger.create(8, site(1)).unwrap();
        ledger.release(record.user_ptr(), site(2)).unwrap();
        let report = ledger
            .validate(&ValidateRequest::new(ValidationLevel::Deepest))
            .unwrap();
        assert!(report.extended.is_empty());
        assert_eq!(report.released_checked, 1);
    }
}
