//! Error taxonomy for the tracking engine.
//!
//! Every variant signals memory corruption (or an allocator that can no longer
//! make progress). The engine returns them as values; the host facade and the
//! C surface treat all of them as fatal.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::site::CallSite;
use crate::validator::ValidationLevel;

/// Primitive or administrative operation that observed a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Allocate,
    Reallocate,
    Release,
    DuplicateString,
    Validate,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allocate => "allocate",
            Self::Reallocate => "reallocate",
            Self::Release => "release",
            Self::DuplicateString => "duplicate_string",
            Self::Validate => "validate",
        })
    }
}

/// Which sentinel region was found modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardSide {
    /// Block header or leading sentinel: header overwrite or buffer underflow.
    Leading,
    /// Trailing sentinel: payload overflow.
    Trailing,
    /// Payload of a retained released block changed after release.
    ReleasedPayload,
}

impl fmt::Display for GuardSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Leading => "leading guard overwritten (header overwrite or underflow)",
            Self::Trailing => "trailing guard overwritten (write past end of block)",
            Self::ReleasedPayload => "released block written after release",
        })
    }
}

/// Why a pointer was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    /// The pointer was never produced by this tracker.
    Unmanaged,
    /// The pointer names a block that was already released.
    Released,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unmanaged => "pointer is not managed by this tracker",
            Self::Released => "block was already released",
        })
    }
}

/// Where a corruption was detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Detection {
    /// While executing a primitive.
    During { op: Operation, site: CallSite },
    /// While walking the ledger.
    Validation {
        level: ValidationLevel,
        message: Option<String>,
    },
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::During { op, site } => write!(f, "during {op} at {site}"),
            Self::Validation {
                level,
                message: Some(msg),
            } => write!(f, "during validate({level}): {msg}"),
            Self::Validation {
                level,
                message: None,
            } => write!(f, "during validate({level})"),
        }
    }
}

/// Fatal conditions raised by the tracking engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemDbgError {
    #[error("allocator failure: {requested} bytes requested by {op} at {site}")]
    AllocatorFailure {
        requested: usize,
        op: Operation,
        site: CallSite,
    },
    #[error("invalid pointer {addr:#x} passed to {op} at {site}: {reason}")]
    InvalidPointer {
        addr: usize,
        op: Operation,
        site: CallSite,
        reason: InvalidReason,
        /// Allocation site when the pointer names a known (released) block.
        allocated_at: Option<CallSite>,
    },
    #[error(
        "double release of {addr:#x} at {site} (allocated at {allocated_at}, first released at {released_at})"
    )]
    DoubleRelease {
        addr: usize,
        site: CallSite,
        allocated_at: CallSite,
        released_at: CallSite,
    },
    #[error(
        "{side} at offset {offset:+} of block {addr:#x} ({size} bytes, serial {serial}) allocated at {allocated_at}, detected {detected}"
    )]
    GuardCorruption {
        side: GuardSide,
        addr: usize,
        size: usize,
        serial: u64,
        /// Offset of the first damaged byte relative to the user pointer.
        offset: isize,
        allocated_at: CallSite,
        detected: Detection,
    },
    #[error("ledger desynchronized: {detail}, detected {detected}")]
    LedgerDesync { detail: String, detected: Detection },
}

impl MemDbgError {
    /// Stable name of the error kind, used in diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AllocatorFailure { .. } => "AllocatorFailure",
            Self::InvalidPointer { .. } => "InvalidPointer",
            Self::DoubleRelease { .. } => "DoubleRelease",
            Self::GuardCorruption { .. } => "GuardCorruption",
            Self::LedgerDesync { .. } => "LedgerDesync",
        }
    }

    /// Call site that allocated the block involved, when known.
    #[must_use]
    pub fn allocated_at(&self) -> Option<CallSite> {
        match self {
            Self::DoubleRelease { allocated_at, .. }
            | Self::GuardCorruption { allocated_at, .. } => Some(*allocated_at),
            Self::InvalidPointer { allocated_at, .. } => *allocated_at,
            Self::AllocatorFailure { .. } | Self::LedgerDesync { .. } => None,
        }
    }

    /// Call site of the operation that tripped the error, when there was one.
    #[must_use]
    pub fn offending_site(&self) -> Option<CallSite> {
        match self {
            Self::AllocatorFailure { site, .. }
            | Self::InvalidPointer { site, .. }
            | Self::DoubleRelease { site, .. } => Some(*site),
            Self::GuardCorruption { detected, .. } | Self::LedgerDesync { detected, .. } => {
                match detected {
                    Detection::During { site, .. } => Some(*site),
                    Detection::Validation { .. } => None,
                }
            }
        }
    }
}
