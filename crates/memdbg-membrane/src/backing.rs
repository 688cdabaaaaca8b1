//! The real allocator behind the ledger.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::ptr::NonNull;

use crate::guard::BLOCK_ALIGN;

/// Source of real blocks for a ledger.
///
/// # Safety
///
/// `allocate` must return blocks aligned to [`BLOCK_ALIGN`] and valid for
/// reads and writes of `size` bytes until handed back through `release`.
pub unsafe trait BackingAllocator: Send + Sync {
    /// Allocate `size` bytes (`size` is never zero). `None` on exhaustion.
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Return a block.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate(size)` on this allocator and must not
    /// have been released already.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize);

    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;
}

/// Blocks from the Rust global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBacking;

// SAFETY: layouts always carry BLOCK_ALIGN.
unsafe impl BackingAllocator for SystemBacking {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, BLOCK_ALIGN).ok()?;
        // SAFETY: `size` is non-zero per the trait contract.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: `allocate` accepted this exact layout.
        let layout = unsafe { Layout::from_size_align_unchecked(size, BLOCK_ALIGN) };
        // SAFETY: caller contract.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }

    fn name(&self) -> &'static str {
        "system"
    }
}

/// Blocks straight from the C library allocator.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcBacking;

// SAFETY: posix_memalign is asked for BLOCK_ALIGN.
#[cfg(unix)]
unsafe impl BackingAllocator for LibcBacking {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let mut out: *mut libc::c_void = std::ptr::null_mut();
        // SAFETY: BLOCK_ALIGN is a power of two multiple of pointer size.
        let rc = unsafe { libc::posix_memalign(&mut out, BLOCK_ALIGN, size) };
        if rc != 0 {
            return None;
        }
        NonNull::new(out.cast::<u8>())
    }

    unsafe fn release(&self, ptr: NonNull<u8>, _size: usize) {
        // SAFETY: caller contract; the block came from posix_memalign.
        unsafe { libc::free(ptr.as_ptr().cast()) }
    }

    fn name(&self) -> &'static str {
        "libc"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(backing: &dyn BackingAllocator) {
        let ptr = backing.allocate(64).expect("allocation should succeed");
        assert_eq!(ptr.as_ptr() as usize % BLOCK_ALIGN, 0);
        // SAFETY: block is valid for 64 bytes.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0x11, 64);
            backing.release(ptr, 64);
        }
    }

    #[test]
    fn system_backing_is_aligned() {
        exercise(&SystemBacking);
    }

    #[cfg(unix)]
    #[test]
    fn libc_backing_is_aligned() {
        exercise(&LibcBacking);
    }

    #[test]
    fn system_backing_rejects_impossible_sizes() {
        assert!(SystemBacking.allocate(usize::MAX - 8).is_none());
    }
}
