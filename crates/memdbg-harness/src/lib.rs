//! Scenario harness for memdbg.
//!
//! This crate provides:
//! - Scenarios: JSON descriptions of allocation steps and the fatal error they must stop on
//! - Runner: replays a scenario against a fresh tracker, one call site per step
//! - Structured logs: JSONL records for every scenario and step
//! - Report generation: markdown and JSON run summaries
//! - Self-test: the built-in scenario suite
//!
//! Replaying deliberate corruption needs raw writes, so unlike the engine's
//! other consumers this crate is not `forbid(unsafe_code)`.

pub mod report;
pub mod scenario;
pub mod selftest;
pub mod structured_log;

pub use report::RunReport;
pub use scenario::{Overrides, Scenario, ScenarioError, ScenarioResult, ScenarioRunner, Step};
pub use structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
