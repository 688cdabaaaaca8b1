//! Host-facing facade.
//!
//! [`MemDbg`] picks a tracker once from configuration, captures the caller's
//! file and line on every call, and turns every engine error into a fatal
//! stop: the diagnostic goes to the log and to stderr (as text, plus a JSON
//! line under [`DiagnosticFormat::Jsonl`]), then the process aborts or, under
//! [`FatalPolicy::Panic`], the thread panics.

#![allow(unsafe_code)]

use std::ffi::{CStr, c_char};
use std::io::{self, Write};

use crate::backing::{BackingAllocator, SystemBacking};
use crate::config::{DiagnosticFormat, FatalPolicy, MemDbgConfig};
use crate::context::{Tracker, TrackingContext};
use crate::diagnostic::Diagnostic;
use crate::error::MemDbgError;
use crate::passthrough::Passthrough;
use crate::report::{Usage, write_released};
use crate::site::CallSite;
use crate::validator::{ValidateRequest, ValidationLevel, ValidationReport};

/// Message attached to the validation run by [`MemDbg::program_exit_checks`].
pub const EXIT_CHECK_MESSAGE: &str = "At Program Exit";

pub struct MemDbg {
    tracker: Box<dyn Tracker>,
    fatal: FatalPolicy,
    diagnostics: DiagnosticFormat,
}

impl MemDbg {
    #[must_use]
    pub fn from_config(config: &MemDbgConfig) -> Self {
        Self::with_backing(SystemBacking, config)
    }

    /// Instrumented blocks come from `backing`; it is unused in pass-through mode.
    #[must_use]
    pub fn with_backing<B: BackingAllocator + 'static>(backing: B, config: &MemDbgConfig) -> Self {
        let tracker: Box<dyn Tracker> = if config.mode.tracking_enabled() {
            Box::new(TrackingContext::with_backing(backing, config))
        } else {
            Box::new(Passthrough)
        };
        Self::with_tracker(tracker, config.fatal).with_diagnostics(config.diagnostics)
    }

    #[must_use]
    pub fn from_env() -> Self {
        Self::from_config(&MemDbgConfig::from_env())
    }

    #[must_use]
    pub fn with_tracker(tracker: Box<dyn Tracker>, fatal: FatalPolicy) -> Self {
        Self {
            tracker,
            fatal,
            diagnostics: DiagnosticFormat::default(),
        }
    }

    #[must_use]
    pub fn with_diagnostics(mut self, format: DiagnosticFormat) -> Self {
        self.diagnostics = format;
        self
    }

    #[must_use]
    pub fn tracker(&self) -> &dyn Tracker {
        self.tracker.as_ref()
    }

    #[must_use]
    pub fn fatal_policy(&self) -> FatalPolicy {
        self.fatal
    }

    #[track_caller]
    pub fn alloc(&self, size: usize) -> *mut u8 {
        self.alloc_at(size, CallSite::caller())
    }

    pub fn alloc_at(&self, size: usize, site: CallSite) -> *mut u8 {
        match self.tracker.allocate(size, site) {
            Ok(ptr) => ptr.as_ptr(),
            Err(err) => self.fatal(&err),
        }
    }

    /// Resize `ptr`; returns null when `size` is zero (the block is released).
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer obtained from this instance.
    #[track_caller]
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        // SAFETY: forwarded caller contract.
        unsafe { self.realloc_at(ptr, size, CallSite::caller()) }
    }

    /// # Safety
    ///
    /// See [`MemDbg::realloc`].
    pub unsafe fn realloc_at(&self, ptr: *mut u8, size: usize, site: CallSite) -> *mut u8 {
        // SAFETY: forwarded caller contract.
        match unsafe { self.tracker.reallocate(ptr, size, site) } {
            Ok(Some(moved)) => moved.as_ptr(),
            Ok(None) => std::ptr::null_mut(),
            Err(err) => self.fatal(&err),
        }
    }

    /// Release `*ptr` and null it. Null is accepted.
    ///
    /// # Safety
    ///
    /// `*ptr` must be null or a pointer obtained from this instance.
    #[track_caller]
    pub unsafe fn free(&self, ptr: &mut *mut u8) {
        // SAFETY: forwarded caller contract.
        unsafe { self.free_at(ptr, CallSite::caller()) }
    }

    /// # Safety
    ///
    /// See [`MemDbg::free`].
    pub unsafe fn free_at(&self, ptr: &mut *mut u8, site: CallSite) {
        // SAFETY: forwarded caller contract.
        if let Err(err) = unsafe { self.tracker.release(*ptr, site) } {
            self.fatal(&err);
        }
        *ptr = std::ptr::null_mut();
    }

    #[track_caller]
    pub fn strdup(&self, s: &CStr) -> *mut c_char {
        self.strdup_at(s, CallSite::caller())
    }

    pub fn strdup_at(&self, s: &CStr, site: CallSite) -> *mut c_char {
        match self.tracker.duplicate_string(s, site) {
            Ok(ptr) => ptr.as_ptr().cast(),
            Err(err) => self.fatal(&err),
        }
    }

    /// Outstanding blocks and bytes; released ones too when `show_freed`.
    #[must_use]
    pub fn used(&self, show_freed: bool) -> Usage {
        self.tracker.used(show_freed)
    }

    pub fn display(&self, sink: &mut dyn Write) -> io::Result<()> {
        self.tracker.display(sink)
    }

    pub fn validate(&self, level: ValidationLevel) -> ValidationReport {
        self.run_validation(&ValidateRequest::new(level))
    }

    pub fn validate_msg(&self, level: ValidationLevel, message: &str) -> ValidationReport {
        self.run_validation(&ValidateRequest::new(level).with_message(message))
    }

    /// Validate; with `show_extended`, released records are printed to stderr.
    pub fn validate_msg2(
        &self,
        level: ValidationLevel,
        message: &str,
        show_extended: bool,
    ) -> ValidationReport {
        self.validate_msg2_to(level, message, show_extended, &mut io::stderr().lock())
    }

    /// [`MemDbg::validate_msg2`] printing released records to `sink`.
    pub fn validate_msg2_to(
        &self,
        level: ValidationLevel,
        message: &str,
        show_extended: bool,
        sink: &mut dyn Write,
    ) -> ValidationReport {
        let report = self.run_validation(
            &ValidateRequest::new(level)
                .with_message(message)
                .extended(show_extended),
        );
        if show_extended && let Err(err) = write_released(sink, &report.extended) {
            log::warn!("memdbg: could not write released records: {err}");
        }
        report
    }

    /// Leak table (when anything is outstanding) followed by a DEEPEST walk
    /// whose released records go to the same sink.
    pub fn program_exit_checks(&self, sink: &mut dyn Write) -> ValidationReport {
        if self.used(false).blocks > 0
            && let Err(err) = self.display(sink)
        {
            log::warn!("memdbg: could not write leak table: {err}");
        }
        self.validate_msg2_to(ValidationLevel::Deepest, EXIT_CHECK_MESSAGE, true, sink)
    }

    fn run_validation(&self, request: &ValidateRequest<'_>) -> ValidationReport {
        match self.tracker.validate(request) {
            Ok(report) => report,
            Err(err) => self.fatal(&err),
        }
    }

    fn fatal(&self, err: &MemDbgError) -> ! {
        let diag = self.diagnose(err);
        log::error!("memdbg: {err}");
        let mut stderr = io::stderr().lock();
        // Nothing left to do if stderr is gone.
        let _ = diag.write_to(&mut stderr);
        if self.diagnostics == DiagnosticFormat::Jsonl
            && let Ok(line) = diag.to_jsonl()
        {
            let _ = writeln!(stderr, "{line}");
        }
        drop(stderr);
        match self.fatal {
            FatalPolicy::Abort => std::process::abort(),
            FatalPolicy::Panic => panic!("{}", diag.render_text()),
        }
    }

    /// Diagnostic for `err`, with usage and counters attached as details.
    fn diagnose(&self, err: &MemDbgError) -> Diagnostic {
        let details = serde_json::json!({
            "usage": self.tracker.used(false),
            "including_released": self.tracker.used(true),
            "metrics": self.tracker.metrics(),
        });
        Diagnostic::from_error(err).with_details(details)
    }
}

impl Default for MemDbg {
    fn default() -> Self {
        Self::from_config(&MemDbgConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{BlockPolicy, QuarantineLimits};
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn panicking() -> MemDbg {
        MemDbg::from_config(&MemDbgConfig::default().with_fatal(FatalPolicy::Panic))
    }

    fn panic_text(result: std::thread::Result<()>) -> String {
        let payload = result.expect_err("expected a fatal stop");
        payload
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default()
    }

    #[test]
    fn alloc_records_caller_site() {
        let dbg = panicking();
        let line = line!() + 1;
        let mut ptr = dbg.alloc(12);
        let mut out = Vec::new();
        dbg.display(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(&format!("memdbg.rs:{line}")), "{text}");
        unsafe { dbg.free(&mut ptr) };
        assert!(ptr.is_null());
    }

    #[test]
    fn free_null_twice_is_fine() {
        let dbg = panicking();
        let mut ptr = std::ptr::null_mut();
        unsafe {
            dbg.free(&mut ptr);
            dbg.free(&mut ptr);
        }
        assert_eq!(dbg.used(true), Usage::default());
    }

    #[test]
    fn double_free_is_fatal() {
        let dbg = panicking();
        let ptr = dbg.alloc(4);
        let mut first = ptr;
        unsafe { dbg.free(&mut first) };
        let text = panic_text(catch_unwind(AssertUnwindSafe(|| {
            let mut again = ptr;
            unsafe { dbg.free(&mut again) };
        })));
        assert!(text.contains("DoubleRelease"), "{text}");
    }

    #[test]
    fn overflow_caught_by_validate_msg() {
        let dbg = panicking();
        let mut ptr = dbg.alloc(3);
        unsafe { ptr.add(3).write(b'!') };
        let text = panic_text(catch_unwind(AssertUnwindSafe(|| {
            dbg.validate_msg(ValidationLevel::Min, "after copy");
        })));
        assert!(text.contains("GuardCorruption"), "{text}");
        assert!(text.contains("validate(MIN): after copy"), "{text}");
        unsafe {
            ptr.add(3).write(crate::guard::TRAILING_SENTINEL);
            dbg.free(&mut ptr);
        }
    }

    #[test]
    fn realloc_to_zero_returns_null() {
        let dbg = panicking();
        let ptr = dbg.alloc(16);
        let out = unsafe { dbg.realloc(ptr, 0) };
        assert!(out.is_null());
        assert_eq!(dbg.used(false), Usage::default());
    }

    #[test]
    fn strdup_copies() {
        let dbg = panicking();
        let copy = dbg.strdup(c"memdbg");
        assert_eq!(unsafe { CStr::from_ptr(copy) }, c"memdbg");
        let mut raw = copy.cast::<u8>();
        unsafe { dbg.free(&mut raw) };
    }

    #[test]
    fn exit_checks_print_leaks() {
        let dbg = panicking();
        let _leak = dbg.alloc(21);
        let mut out = Vec::new();
        let report = dbg.program_exit_checks(&mut out);
        assert_eq!(report.level, ValidationLevel::Deepest);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("memdbg: 1 block(s) outstanding, 21 bytes"), "{text}");
    }

    #[test]
    fn exit_checks_are_silent_when_clean() {
        let dbg = panicking();
        let mut out = Vec::new();
        dbg.program_exit_checks(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn exit_checks_list_released_records() {
        let config = MemDbgConfig::default()
            .with_block_policy(BlockPolicy::Quarantine(QuarantineLimits::UNBOUNDED))
            .with_fatal(FatalPolicy::Panic);
        let dbg = MemDbg::from_config(&config);
        let _leak = dbg.alloc(8);
        let alloc_line = line!() + 1;
        let mut freed = dbg.alloc(24);
        let addr = freed as usize;
        let free_line = line!() + 1;
        unsafe { dbg.free(&mut freed) };

        let mut out = Vec::new();
        let report = dbg.program_exit_checks(&mut out);
        assert_eq!(report.extended.len(), 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("memdbg: 1 block(s) outstanding, 8 bytes"), "{text}");
        assert!(text.contains("memdbg: 1 released block(s) in ledger"), "{text}");
        let row = text
            .lines()
            .find(|line| line.contains(&format!("{addr:#x}")))
            .unwrap_or_else(|| panic!("no released row in {text}"));
        assert!(row.contains(" 24 "), "{row}");
        assert!(row.contains(&format!("memdbg.rs:{alloc_line}")), "{row}");
        assert!(row.contains(&format!("released at {}", CallSite::new(file!(), free_line))), "{row}");
        assert!(row.contains("tail cdcdcdcd"), "{row}");
    }

    #[test]
    fn validate_msg2_without_extended_writes_nothing() {
        let dbg = panicking();
        let mut ptr = dbg.alloc(5);
        unsafe { dbg.free(&mut ptr) };
        let mut out = Vec::new();
        let report = dbg.validate_msg2_to(ValidationLevel::Deepest, "quiet", false, &mut out);
        assert!(report.extended.is_empty());
        assert!(out.is_empty());
    }

    #[test]
    fn fatal_diagnostic_carries_usage_details() {
        let dbg = panicking();
        let _held = dbg.alloc(9);
        let err = MemDbgError::InvalidPointer {
            addr: 0x10,
            op: crate::error::Operation::Release,
            site: CallSite::new("x.c", 3),
            reason: crate::error::InvalidReason::Unmanaged,
            allocated_at: None,
        };
        let diag = dbg.diagnose(&err);
        let details = diag.details.unwrap();
        assert_eq!(details["usage"]["blocks"], 1);
        assert_eq!(details["usage"]["bytes"], 9);
        assert_eq!(details["metrics"]["allocations"], 1);
    }

    #[test]
    fn passthrough_mode_reports_nothing() {
        let dbg = MemDbg::from_config(&MemDbgConfig::default().with_mode(crate::config::Mode::Passthrough));
        assert!(!dbg.tracker().is_instrumented());
        let mut ptr = dbg.alloc(10);
        assert!(!ptr.is_null());
        assert_eq!(dbg.used(false), Usage::default());
        unsafe { dbg.free(&mut ptr) };
    }
}
