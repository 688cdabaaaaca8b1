//! Disabled tracker: straight calls into the C allocator.
//!
//! Nothing is recorded, so administrative queries report an empty ledger and
//! validation always succeeds.

#![allow(unsafe_code)]

use std::ffi::CStr;
use std::io::{self, Write};
use std::ptr::NonNull;

use crate::context::Tracker;
use crate::error::{MemDbgError, Operation};
use crate::report::Usage;
use crate::site::CallSite;
use crate::validator::{ValidateRequest, ValidationReport};

#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

fn out_of_memory(requested: usize, op: Operation, site: CallSite) -> MemDbgError {
    MemDbgError::AllocatorFailure {
        requested,
        op,
        site,
    }
}

impl Tracker for Passthrough {
    fn allocate(&self, size: usize, site: CallSite) -> Result<NonNull<u8>, MemDbgError> {
        // SAFETY: malloc has no preconditions; zero is bumped so null means failure.
        let ptr = unsafe { libc::malloc(size.max(1)) };
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| out_of_memory(size, Operation::Allocate, site))
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
            // SAFETY: caller contract; `ptr` came from this allocator.
            unsafe { libc::free(ptr.cast()) };
            return Ok(None);
        }
        // SAFETY: as above.
        let moved = unsafe { libc::realloc(ptr.cast(), size) };
        NonNull::new(moved.cast::<u8>())
            .map(Some)
            .ok_or_else(|| out_of_memory(size, Operation::Reallocate, site))
    }

    unsafe fn release(&self, ptr: *mut u8, _site: CallSite) -> Result<(), MemDbgError> {
        if !ptr.is_null() {
            // SAFETY: caller contract.
            unsafe { libc::free(ptr.cast()) };
        }
        Ok(())
    }

    fn duplicate_string(&self, s: &CStr, site: CallSite) -> Result<NonNull<u8>, MemDbgError> {
        let bytes = s.to_bytes_with_nul();
        // SAFETY: malloc has no preconditions.
        let ptr = unsafe { libc::malloc(bytes.len()) }.cast::<u8>();
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| out_of_memory(bytes.len(), Operation::DuplicateString, site))?;
        // SAFETY: the new block holds `bytes.len()` bytes.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
        Ok(ptr)
    }

    fn used(&self, _include_released: bool) -> Usage {
        Usage::default()
    }

    fn display(&self, _sink: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    fn validate(&self, request: &ValidateRequest<'_>) -> Result<ValidationReport, MemDbgError> {
        Ok(ValidationReport {
            level: request.level,
            ..ValidationReport::default()
        })
    }

    fn is_instrumented(&self) -> bool {
        false
    }
}
