//! Renderings of fatal errors.
//!
//! A [`Diagnostic`] carries everything needed to locate a corruption: the
//! error kind, the allocation site of the block involved, the site of the
//! operation that tripped over it and, for validation failures, the level and
//! caller message. It renders both as human text (for the stderr / `FILE*`
//! sink) and as a JSONL record.

use std::io::{self, Write};

use serde::Serialize;

use crate::error::{Detection, MemDbgError};
use crate::site::CallSite;
use crate::validator::ValidationLevel;

/// Serializable description of one fatal condition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_at: Option<CallSite>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offending_site: Option<CallSite>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<ValidationLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validate_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            allocated_at: None,
            offending_site: None,
            level: None,
            validate_message: None,
            details: None,
        }
    }

    #[must_use]
    pub fn from_error(err: &MemDbgError) -> Self {
        let mut diag = Self::new(err.kind(), err.to_string());
        diag.allocated_at = err.allocated_at();
        diag.offending_site = err.offending_site();
        let detected = match err {
            MemDbgError::GuardCorruption { detected, .. }
            | MemDbgError::LedgerDesync { detected, .. } => Some(detected),
            _ => None,
        };
        if let Some(Detection::Validation { level, message }) = detected {
            diag.level = Some(*level);
            diag.validate_message.clone_from(message);
        }
        diag
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Multi-line human rendering, terminated by a newline.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = format!("memdbg: FATAL {}: {}\n", self.kind, self.message);
        if let Some(site) = self.allocated_at {
            out.push_str(&format!("memdbg:   block allocated at {site}\n"));
        }
        if let Some(site) = self.offending_site {
            out.push_str(&format!("memdbg:   detected at {site}\n"));
        }
        if let Some(level) = self.level {
            match &self.validate_message {
                Some(msg) => out.push_str(&format!("memdbg:   validate({level}): {msg}\n")),
                None => out.push_str(&format!("memdbg:   validate({level})\n")),
            }
        }
        out
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn write_to(&self, sink: &mut dyn Write) -> io::Result<()> {
        sink.write_all(self.render_text().as_bytes())?;
        sink.flush()
    }
}
