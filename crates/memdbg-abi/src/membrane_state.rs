//! Process-wide tracker shared by every entry point.
//!
//! Blocks allocated through `memdbg_alloc` must be visible to `memdbg_free`
//! and to the reporting entry points, so there is exactly one instance.

use std::sync::OnceLock;

use memdbg_membrane::MemDbg;
use memdbg_membrane::config::{MemDbgConfig, global_config};

pub(crate) fn global_memdbg() -> &'static MemDbg {
    static STATE: OnceLock<MemDbg> = OnceLock::new();
    STATE.get_or_init(|| {
        let config = global_config();
        log::debug!(
            "memdbg: process tracker {:?} (blocks {:?}, records {:?})",
            config.mode,
            config.block_policy,
            config.record_policy
        );
        new_memdbg(&config)
    })
}

/// C callers get blocks from the C library allocator.
#[cfg(unix)]
fn new_memdbg(config: &MemDbgConfig) -> MemDbg {
    MemDbg::with_backing(memdbg_membrane::LibcBacking, config)
}

#[cfg(not(unix))]
fn new_memdbg(config: &MemDbgConfig) -> MemDbg {
    MemDbg::from_config(config)
}
