//! ABI layer for the four allocation primitives and the raw free helpers.
//!
//! `include/memdbg.h` maps `malloc`, `realloc`, `free` and `strdup` onto these
//! entry points, passing `__FILE__` and `__LINE__`.

use std::ffi::{CStr, c_char, c_int, c_void};

use crate::membrane_state::global_memdbg;
use crate::util::site;

/// Tracked `malloc`. Zero-size requests return a unique tracked pointer.
///
/// # Safety
///
/// `file` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memdbg_alloc(size: usize, file: *const c_char, line: c_int) -> *mut c_void {
    // SAFETY: caller contract.
    let site = unsafe { site(file, line) };
    global_memdbg().alloc_at(size, site).cast()
}

/// Tracked `realloc`. A null `ptr` allocates; `size == 0` releases and
/// returns null.
///
/// # Safety
///
/// `ptr` must be null or come from `memdbg_alloc`/`memdbg_realloc`/`memdbg_strdup`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memdbg_realloc(
    ptr: *mut c_void,
    size: usize,
    file: *const c_char,
    line: c_int,
) -> *mut c_void {
    // SAFETY: caller contract.
    unsafe {
        let site = site(file, line);
        global_memdbg().realloc_at(ptr.cast(), size, site).cast()
    }
}

/// Tracked `free`. Null is accepted.
///
/// # Safety
///
/// `ptr` must be null or come from one of the tracked allocation entry points.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memdbg_free(ptr: *mut c_void, file: *const c_char, line: c_int) {
    let mut ptr = ptr.cast::<u8>();
    // SAFETY: caller contract.
    unsafe {
        let site = site(file, line);
        global_memdbg().free_at(&mut ptr, site);
    }
}

/// Tracked `strdup`. A null string yields null.
///
/// # Safety
///
/// `s` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memdbg_strdup(
    s: *const c_char,
    file: *const c_char,
    line: c_int,
) -> *mut c_char {
    // SAFETY: caller contract.
    let site = unsafe { site(file, line) };
    if s.is_null() {
        log::warn!("memdbg: strdup(NULL) at {site}");
        return std::ptr::null_mut();
    }
    // SAFETY: caller contract.
    let s = unsafe { CStr::from_ptr(s) };
    global_memdbg().strdup_at(s, site)
}

/// Free a block that came from the C library rather than from memdbg.
///
/// # Safety
///
/// `ptr` must be null or a live block from the C allocator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memdbg_libc_free(ptr: *mut c_void) {
    // SAFETY: caller contract.
    unsafe { raw_free(ptr) }
}

/// `free` used by code built without tracking: null tolerant, no bookkeeping.
///
/// # Safety
///
/// `ptr` must be null or a live block from the C allocator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memdbg_off_free(ptr: *mut c_void) {
    // SAFETY: caller contract.
    unsafe { raw_free(ptr) }
}

unsafe fn raw_free(ptr: *mut c_void) {
    if !ptr.is_null() {
        // SAFETY: caller contract.
        unsafe { libc::free(ptr) }
    }
}
