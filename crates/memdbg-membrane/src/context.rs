//! Allocation interceptors.
//!
//! [`Tracker`] is the seam between the host-facing surfaces and the engine.
//! [`TrackingContext`] records every block in a [`Ledger`]; the pass-through
//! implementation lives in `passthrough`.

#![allow(unsafe_code)]

use std::ffi::CStr;
use std::io::{self, Write};
use std::ptr::NonNull;

use crate::backing::{BackingAllocator, SystemBacking};
use crate::config::MemDbgConfig;
use crate::error::{MemDbgError, Operation};
use crate::ledger::Ledger;
use crate::metrics::{MetricsSnapshot, TrackerMetrics};
use crate::record::AllocationRecord;
use crate::report::{LeakReport, Usage};
use crate::site::CallSite;
use crate::validator::{ValidateRequest, ValidationReport};

/// The four primitives plus the administrative queries.
///
/// Primitives may be called concurrently. `used`, `display` and `validate`
/// are only meaningful at a quiescent point.
pub trait Tracker: Send + Sync {
    /// Allocate `size` bytes. Zero-size requests are tracked too.
    fn allocate(&self, size: usize, site: CallSite) -> Result<NonNull<u8>, MemDbgError>;

    /// Resize a block. A null `ptr` allocates; `size == 0` releases and
    /// returns `None`.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer obtained from this tracker.
    unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        size: usize,
        site: CallSite,
    ) -> Result<Option<NonNull<u8>>, MemDbgError>;

    /// Release a block. Releasing null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer obtained from this tracker.
    unsafe fn release(&self, ptr: *mut u8, site: CallSite) -> Result<(), MemDbgError>;

    /// Copy a C string, terminator included, into a new block.
    fn duplicate_string(&self, s: &CStr, site: CallSite) -> Result<NonNull<u8>, MemDbgError>;

    fn used(&self, include_released: bool) -> Usage;

    fn display(&self, sink: &mut dyn Write) -> io::Result<()>;

    fn validate(&self, request: &ValidateRequest<'_>) -> Result<ValidationReport, MemDbgError>;

    fn is_instrumented(&self) -> bool;

    /// Drop released records. Returns how many were purged.
    fn compact(&self) -> usize {
        0
    }

    fn leak_report(&self) -> LeakReport {
        LeakReport::default()
    }

    fn metrics(&self) -> Option<MetricsSnapshot> {
        None
    }
}

/// Instrumented tracker: guard regions, ledger and validator.
pub struct TrackingContext<B: BackingAllocator = SystemBacking> {
    ledger: Ledger<B>,
    metrics: TrackerMetrics,
}

impl TrackingContext<SystemBacking> {
    #[must_use]
    pub fn new(config: &MemDbgConfig) -> Self {
        Self::with_backing(SystemBacking, config)
    }
}

impl Default for TrackingContext<SystemBacking> {
    fn default() -> Self {
        Self::new(&MemDbgConfig::default())
    }
}

impl<B: BackingAllocator> TrackingContext<B> {
    #[must_use]
    pub fn with_backing(backing: B, config: &MemDbgConfig) -> Self {
        let ledger = Ledger::new(backing, config.block_policy, config.record_policy);
        log::debug!(
            "memdbg: tracking context over {} ({:?}, {:?})",
            ledger.backing().name(),
            ledger.block_policy(),
            ledger.record_policy()
        );
        Self {
            ledger,
            metrics: TrackerMetrics::new(),
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &Ledger<B> {
        &self.ledger
    }

    #[must_use]
    pub fn find(&self, ptr: *const u8) -> Option<AllocationRecord> {
        self.ledger.find(ptr)
    }

    fn observe<T>(&self, result: Result<T, MemDbgError>) -> Result<T, MemDbgError> {
        if let Err(MemDbgError::GuardCorruption { .. }) = &result {
            TrackerMetrics::inc(&self.metrics.guard_failures);
        }
        result
    }

    fn created(&self, record: &AllocationRecord) {
        TrackerMetrics::inc(&self.metrics.allocations);
        TrackerMetrics::add(&self.metrics.bytes_requested, record.user_size);
        self.metrics.observe_live(self.ledger.totals().live_bytes);
    }
}

impl<B: BackingAllocator> Tracker for TrackingContext<B> {
    fn allocate(&self, size: usize, site: CallSite) -> Result<NonNull<u8>, MemDbgError> {
        let record = self.ledger.create(size, site)?;
        self.created(&record);
        Ok(non_null(record.user_ptr()))
    }

    unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        size: usize,
        site: CallSite,
    ) -> Result<Option<NonNull<u8>>, MemDbgError> {
        if ptr.is_null() {
            return self.allocate(size, site).map(Some);
        }
        if size == 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.release(ptr, site)? };
            return Ok(None);
        }
        let moved = self.observe(self.ledger.resize(ptr, size, site))?;
        TrackerMetrics::inc(&self.metrics.reallocations);
        TrackerMetrics::add(&self.metrics.bytes_requested, size);
        self.metrics.observe_live(self.ledger.totals().live_bytes);
        Ok(Some(non_null(moved.user_ptr())))
    }

    unsafe fn release(&self, ptr: *mut u8, site: CallSite) -> Result<(), MemDbgError> {
        if ptr.is_null() {
            TrackerMetrics::inc(&self.metrics.null_releases);
            return Ok(());
        }
        self.observe(self.ledger.release(ptr, site))?;
        TrackerMetrics::inc(&self.metrics.releases);
        Ok(())
    }

    fn duplicate_string(&self, s: &CStr, site: CallSite) -> Result<NonNull<u8>, MemDbgError> {
        let bytes = s.to_bytes_with_nul();
        let record = self
            .ledger
            .create_for(bytes.len(), site, Operation::DuplicateString)?;
        // SAFETY: the fresh payload holds exactly `bytes.len()` bytes.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), record.user_ptr(), bytes.len()) };
        TrackerMetrics::inc(&self.metrics.string_duplicates);
        self.created(&record);
        Ok(non_null(record.user_ptr()))
    }

    fn used(&self, include_released: bool) -> Usage {
        self.ledger.used(include_released)
    }

    fn display(&self, sink: &mut dyn Write) -> io::Result<()> {
        self.ledger.display(sink)
    }

    fn validate(&self, request: &ValidateRequest<'_>) -> Result<ValidationReport, MemDbgError> {
        let report = self.observe(self.ledger.validate(request))?;
        TrackerMetrics::inc(&self.metrics.validations);
        Ok(report)
    }

    fn is_instrumented(&self) -> bool {
        true
    }

    fn compact(&self) -> usize {
        self.ledger.compact()
    }

    fn leak_report(&self) -> LeakReport {
        self.ledger.leak_report()
    }

    fn metrics(&self) -> Option<MetricsSnapshot> {
        Some(self.metrics.snapshot())
    }
}

fn non_null(ptr: *mut u8) -> NonNull<u8> {
    // User pointers sit LEADING_SIZE bytes into a non-null block.
    NonNull::new(ptr).unwrap_or(NonNull::dangling())
}
