//! ABI layer for usage, leak display and validation.
//!
//! These entry points are not thread safe with respect to the primitives: call
//! them at quiescent points (typically at exit or between test phases).

use std::ffi::{c_char, c_int, c_ulong};

use memdbg_membrane::ValidationLevel;

use crate::membrane_state::global_memdbg;
use crate::util::{message, with_stream};

pub const MEMDBG_VALIDATE_MIN: c_int = ValidationLevel::Min as c_int;
pub const MEMDBG_VALIDATE_DEEP: c_int = ValidationLevel::Deep as c_int;
pub const MEMDBG_VALIDATE_DEEPER: c_int = ValidationLevel::Deeper as c_int;
pub const MEMDBG_VALIDATE_DEEPEST: c_int = ValidationLevel::Deepest as c_int;

/// Number of outstanding blocks, plus released ones when `show_freed` is non-zero.
#[unsafe(no_mangle)]
pub extern "C" fn memdbg_used(show_freed: c_int) -> c_ulong {
    let blocks = global_memdbg().used(show_freed != 0).blocks;
    c_ulong::try_from(blocks).unwrap_or(c_ulong::MAX)
}

/// Print outstanding blocks to `stream` (stderr when null).
///
/// # Safety
///
/// `stream` must be null or an open `FILE*`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memdbg_display(stream: *mut libc::FILE) {
    // SAFETY: caller contract.
    unsafe {
        with_stream(stream, |sink| {
            if let Err(err) = global_memdbg().display(sink) {
                log::warn!("memdbg: display failed: {err}");
            }
        });
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn memdbg_validate(level: c_int) {
    global_memdbg().validate(ValidationLevel::from_raw(level));
}

/// # Safety
///
/// `msg` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memdbg_validate_msg(level: c_int, msg: *const c_char) {
    // SAFETY: caller contract.
    let msg = unsafe { message(msg) };
    global_memdbg().validate_msg(ValidationLevel::from_raw(level), &msg);
}

/// Validate; with `show_ex_data` non-zero, released records are printed to stderr.
///
/// # Safety
///
/// `msg` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memdbg_validate_msg2(level: c_int, msg: *const c_char, show_ex_data: c_int) {
    // SAFETY: caller contract.
    let msg = unsafe { message(msg) };
    global_memdbg().validate_msg2(ValidationLevel::from_raw(level), &msg, show_ex_data != 0);
}

/// Leak table on `stream` when anything is outstanding, then a DEEPEST walk
/// whose released records are printed to the same stream.
///
/// # Safety
///
/// `stream` must be null or an open `FILE*`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memdbg_program_exit_checks(stream: *mut libc::FILE) {
    // SAFETY: caller contract.
    unsafe {
        with_stream(stream, |sink| {
            global_memdbg().program_exit_checks(sink);
        });
    }
}
