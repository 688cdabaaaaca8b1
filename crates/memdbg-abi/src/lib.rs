//! # memdbg-abi
//!
//! `extern "C"` boundary for memdbg.
//!
//! This crate produces a `cdylib` (`libmemdbg.so`) exposing the `memdbg_*`
//! entry points declared in `include/memdbg.h`. Every entry point goes through
//! one process-wide [`memdbg_membrane::MemDbg`] built from the environment the
//! first time it is needed.
//!
//! ```text
//! C caller -> malloc/free macro -> memdbg_* entry (this crate) -> tracker -> backing allocator
//! ```
//!
//! Every detected corruption is fatal: the diagnostic is written to stderr and
//! the process aborts.

mod membrane_state;
mod util;

pub mod alloc_abi;
pub mod report_abi;

pub use alloc_abi::{
    memdbg_alloc, memdbg_free, memdbg_libc_free, memdbg_off_free, memdbg_realloc, memdbg_strdup,
};
pub use report_abi::{
    MEMDBG_VALIDATE_DEEP, MEMDBG_VALIDATE_DEEPER, MEMDBG_VALIDATE_DEEPEST, MEMDBG_VALIDATE_MIN,
    memdbg_display, memdbg_program_exit_checks, memdbg_used, memdbg_validate, memdbg_validate_msg,
    memdbg_validate_msg2,
};
