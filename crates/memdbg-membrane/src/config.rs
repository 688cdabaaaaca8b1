//! Runtime configuration.
//!
//! Tracking is selected once, from the environment:
//! - `MEMDBG_MODE`: `on` (default) records every block; `off` forwards straight
//!   to the C allocator with no bookkeeping.
//! - `MEMDBG_BLOCKS`: `recycle` (default) hands released blocks back at once;
//!   `quarantine` holds them within [`QuarantineLimits::DEFAULT`]; `retain`
//!   holds them all.
//! - `MEMDBG_RECORDS`: `retain` (default) keeps released tombstones; `purge`
//!   drops them at release.
//! - `MEMDBG_DIAGNOSTICS`: `text` (default) prints fatal diagnostics as text;
//!   `jsonl` adds a JSON line carrying usage and counters.

use std::sync::OnceLock;

use crate::ledger::{BlockPolicy, QuarantineLimits, RecordPolicy};

/// Whether the context keeps a ledger at all.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Every block is recorded, guarded and validated.
    #[default]
    Instrumented,
    /// Direct C allocator calls. Admin operations report nothing.
    Passthrough,
}

impl Mode {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "on" | "tracking" | "full" | "default" => Self::Instrumented,
            "off" | "none" | "disabled" | "passthrough" => Self::Passthrough,
            _ => Self::Instrumented,
        }
    }

    #[must_use]
    pub const fn tracking_enabled(self) -> bool {
        matches!(self, Self::Instrumented)
    }
}

/// What the host facade does once a fatal error has been reported.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FatalPolicy {
    #[default]
    Abort,
    /// Panic with the diagnostic text. Used by tests.
    Panic,
}

/// How fatal diagnostics are written to stderr.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticFormat {
    #[default]
    Text,
    /// Text followed by one JSON line with usage and tracker counters.
    Jsonl,
}

impl DiagnosticFormat {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "jsonl" | "json" | "structured" => Self::Jsonl,
            _ => Self::Text,
        }
    }
}

fn block_policy_loose(s: &str) -> BlockPolicy {
    match s.to_ascii_lowercase().as_str() {
        "quarantine" | "hold" => BlockPolicy::Quarantine(QuarantineLimits::DEFAULT),
        "retain" | "keep" | "unbounded" => BlockPolicy::Quarantine(QuarantineLimits::UNBOUNDED),
        _ => BlockPolicy::Recycle,
    }
}

fn record_policy_loose(s: &str) -> RecordPolicy {
    match s.to_ascii_lowercase().as_str() {
        "purge" | "drop" | "forget" => RecordPolicy::Purge,
        _ => RecordPolicy::Retain,
    }
}

/// Full tracker configuration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemDbgConfig {
    pub mode: Mode,
    pub block_policy: BlockPolicy,
    pub record_policy: RecordPolicy,
    pub fatal: FatalPolicy,
    pub diagnostics: DiagnosticFormat,
}

impl MemDbgConfig {
    /// Resolve from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = lookup("MEMDBG_MODE") {
            config.mode = Mode::from_str_loose(&v);
        }
        if let Some(v) = lookup("MEMDBG_BLOCKS") {
            config.block_policy = block_policy_loose(&v);
        }
        if let Some(v) = lookup("MEMDBG_RECORDS") {
            config.record_policy = record_policy_loose(&v);
        }
        if let Some(v) = lookup("MEMDBG_DIAGNOSTICS") {
            config.diagnostics = DiagnosticFormat::from_str_loose(&v);
        }
        config
    }

    /// Resolve from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_block_policy(mut self, policy: BlockPolicy) -> Self {
        self.block_policy = policy;
        self
    }

    #[must_use]
    pub fn with_record_policy(mut self, policy: RecordPolicy) -> Self {
        self.record_policy = policy;
        self
    }

    #[must_use]
    pub fn with_fatal(mut self, fatal: FatalPolicy) -> Self {
        self.fatal = fatal;
        self
    }

    #[must_use]
    pub fn with_diagnostics(mut self, format: DiagnosticFormat) -> Self {
        self.diagnostics = format;
        self
    }
}

static GLOBAL_CONFIG: OnceLock<MemDbgConfig> = OnceLock::new();

/// Process-wide configuration (reads the environment on first call, caches thereafter).
#[must_use]
pub fn global_config() -> MemDbgConfig {
    *GLOBAL_CONFIG.get_or_init(MemDbgConfig::from_env)
}
