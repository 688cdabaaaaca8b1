//! Allocation-tracking membrane for memdbg.
//!
//! This crate is the debugging allocator engine: every block handed out by a
//! [`TrackingContext`] is wrapped in guard regions and recorded in a sharded
//! ledger, so that double releases, releases of foreign pointers, writes past
//! either end of a block and leaked blocks are reported with the call site
//! that allocated them.
//!
//! # Architecture
//!
//! - **Guard scheme** (`guard`): block header, leading/trailing sentinels, tail snapshots
//! - **Backing allocators** (`backing`): the real allocator behind the ledger
//! - **Ledger** (`ledger`): authoritative set of allocation records, sharded
//! - **Interceptors** (`context`): the four primitives behind the [`Tracker`] trait
//! - **Pass-through** (`passthrough`): the disabled tracker, same interface
//! - **Validator** (`validator`): MIN..DEEPEST integrity walks
//! - **Reporter** (`report`): usage counts, leak table, serializable leak report
//! - **Host facade** (`memdbg`): call-site capture and fatal error handling
//! - **Configuration** (`config`): mode and retention policies, resolved once
//! - **Metrics** (`metrics`): atomic counters for observability
//! - **Diagnostics** (`diagnostic`): human and JSONL renderings of fatal errors

#![deny(unsafe_code)]

pub mod backing;
pub mod config;
pub mod context;
pub mod diagnostic;
pub mod error;
pub mod guard;
pub mod ledger;
pub mod memdbg;
pub mod metrics;
pub mod passthrough;
pub mod record;
pub mod report;
pub mod site;
pub mod validator;

#[cfg(unix)]
pub use backing::LibcBacking;
pub use backing::{BackingAllocator, SystemBacking};
pub use config::{DiagnosticFormat, FatalPolicy, MemDbgConfig, Mode};
pub use context::{Tracker, TrackingContext};
pub use diagnostic::Diagnostic;
pub use error::{GuardSide, MemDbgError, Operation};
pub use ledger::{BlockPolicy, Ledger, LedgerTotals, QuarantineLimits, RecordPolicy};
pub use memdbg::MemDbg;
pub use metrics::MetricsSnapshot;
pub use passthrough::Passthrough;
pub use record::{AllocationRecord, RecordState};
pub use report::{LeakReport, Usage, write_released};
pub use site::CallSite;
pub use validator::{ValidateRequest, ValidationLevel, ValidationReport};
