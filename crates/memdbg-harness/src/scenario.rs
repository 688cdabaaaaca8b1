//! Allocation scenarios and the runner that replays them.
//!
//! A scenario is a JSON document naming a list of steps against named slots.
//! Every step runs at call site `scenario.json:<step number>` (1-based), so
//! expectations can name the step that allocated a corrupted block.

use std::collections::HashMap;
use std::ffi::CString;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use memdbg_membrane::guard::{LEADING_SIZE, TRAILING_SIZE};
use memdbg_membrane::{
    CallSite, Diagnostic, GuardSide, LeakReport, MemDbgConfig, MemDbgError, MetricsSnapshot,
    Mode, Passthrough, Tracker, TrackingContext, Usage, ValidateRequest, ValidationLevel,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

/// File name reported in every call site a scenario produces.
pub const SCENARIO_FILE: &str = "scenario.json";

/// A named sequence of allocation steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// `MEMDBG_MODE` value for this scenario.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// `MEMDBG_BLOCKS` value for this scenario.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocks: Option<String>,
    /// `MEMDBG_RECORDS` value for this scenario.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<String>,
    pub steps: Vec<Step>,
    /// The fatal error the scenario must stop on. `None` means it must run clean.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_error: Option<ExpectedError>,
}

impl Scenario {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let text = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ScenarioError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedError {
    /// `MemDbgError::kind()`, e.g. `DoubleRelease`.
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<GuardSide>,
    /// Step number that allocated the block named by the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_line: Option<u32>,
}

fn one() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Alloc {
        slot: String,
        size: usize,
    },
    Realloc {
        slot: String,
        size: usize,
    },
    /// Release a slot; without a slot, release null.
    Free {
        #[serde(default)]
        slot: Option<String>,
    },
    /// Release a pointer the tracker never handed out.
    FreeForeign,
    Strdup {
        slot: String,
        text: String,
    },
    /// Store `len` copies of `byte` at `offset` from the slot's user pointer.
    Write {
        slot: String,
        offset: isize,
        byte: u8,
        #[serde(default = "one")]
        len: usize,
    },
    Validate {
        level: String,
        #[serde(default)]
        message: Option<String>,
    },
    Used {
        #[serde(default)]
        show_freed: bool,
        #[serde(default)]
        expect_blocks: Option<usize>,
        #[serde(default)]
        expect_bytes: Option<usize>,
    },
    Display {
        #[serde(default)]
        expect_rows: Option<usize>,
    },
    Compact {
        #[serde(default)]
        expect_purged: Option<usize>,
    },
}

impl Step {
    #[must_use]
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Alloc { .. } => "alloc",
            Self::Realloc { .. } => "realloc",
            Self::Free { .. } => "free",
            Self::FreeForeign => "free_foreign",
            Self::Strdup { .. } => "strdup",
            Self::Write { .. } => "write",
            Self::Validate { .. } => "validate",
            Self::Used { .. } => "used",
            Self::Display { .. } => "display",
            Self::Compact { .. } => "compact",
        }
    }
}

/// A scenario that cannot be replayed as written.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("step {step}: unknown slot '{slot}'")]
    UnknownSlot { step: usize, slot: String },
    #[error("step {step}: unknown validation level '{level}'")]
    UnknownLevel { step: usize, level: String },
    #[error("step {step}: string contains an interior NUL")]
    InteriorNul { step: usize },
    #[error("step {step}: {detail}")]
    Unsafe { step: usize, detail: String },
}

/// Tracker selection for one run. Scenario values win over the environment;
/// these win over both.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub mode: Option<String>,
    pub blocks: Option<String>,
    pub records: Option<String>,
}

impl Overrides {
    /// Resolve the configuration a scenario runs under.
    pub fn resolve(&self, scenario: &Scenario) -> MemDbgConfig {
        MemDbgConfig::from_lookup(|key| {
            let (forced, declared) = match key {
                "MEMDBG_MODE" => (&self.mode, &scenario.mode),
                "MEMDBG_BLOCKS" => (&self.blocks, &scenario.blocks),
                "MEMDBG_RECORDS" => (&self.records, &scenario.records),
                _ => return None,
            };
            forced
                .clone()
                .or_else(|| declared.clone())
                .or_else(|| std::env::var(key).ok())
        })
    }
}

/// Result of replaying one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub name: String,
    pub mode: String,
    pub outcome: Outcome,
    pub steps_run: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
    /// Why the outcome is not `Pass`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub usage: Usage,
    pub leaks: LeakReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
    pub duration_us: u64,
}

impl ScenarioResult {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    addr: usize,
    size: usize,
    serial: Option<u64>,
    released: bool,
}

enum Subject {
    Tracking(TrackingContext),
    Passthrough(Passthrough),
}

impl Subject {
    fn new(config: &MemDbgConfig) -> Self {
        match config.mode {
            Mode::Instrumented => Self::Tracking(TrackingContext::new(config)),
            Mode::Passthrough => Self::Passthrough(Passthrough),
        }
    }

    fn tracker(&self) -> &dyn Tracker {
        match self {
            Self::Tracking(ctx) => ctx,
            Self::Passthrough(p) => p,
        }
    }

    fn serial_of(&self, addr: usize) -> Option<u64> {
        match self {
            Self::Tracking(ctx) => ctx.find(addr as *const u8).map(|r| r.serial),
            Self::Passthrough(_) => None,
        }
    }

    /// Byte range, relative to the user pointer, that a write may touch.
    fn writable(&self, slot: &Slot) -> Option<(isize, isize)> {
        match self {
            Self::Tracking(ctx) => {
                let record = ctx.find(slot.addr as *const u8)?;
                let same_block = Some(record.serial) == slot.serial
                    && record.owns_block()
                    && record.is_live() != slot.released;
                same_block.then_some((
                    -(LEADING_SIZE as isize),
                    (slot.size + TRAILING_SIZE) as isize,
                ))
            }
            Self::Passthrough(_) => (!slot.released).then_some((0, slot.size as isize)),
        }
    }

    /// Whether handing `slot` back to the tracker cannot touch another block.
    /// Untracked addresses are rejected by the ledger without being read.
    fn may_release(&self, slot: &Slot) -> bool {
        match self {
            Self::Tracking(ctx) => ctx
                .find(slot.addr as *const u8)
                .is_none_or(|r| Some(r.serial) == slot.serial),
            Self::Passthrough(_) => !slot.released,
        }
    }
}

enum StepError {
    Fatal(MemDbgError),
    Expectation(String),
    Invalid(ScenarioError),
}

impl From<MemDbgError> for StepError {
    fn from(err: MemDbgError) -> Self {
        Self::Fatal(err)
    }
}

impl From<ScenarioError> for StepError {
    fn from(err: ScenarioError) -> Self {
        Self::Invalid(err)
    }
}

/// Replays scenarios, one fresh tracker per scenario.
#[derive(Debug, Clone, Default)]
pub struct ScenarioRunner {
    overrides: Overrides,
}

impl ScenarioRunner {
    #[must_use]
    pub fn new(overrides: Overrides) -> Self {
        Self { overrides }
    }

    /// Run `scenario`, writing per-step entries to `emitter`.
    pub fn run<W: Write>(
        &self,
        scenario: &Scenario,
        emitter: &mut LogEmitter<W>,
    ) -> std::io::Result<ScenarioResult> {
        let config = self.overrides.resolve(scenario);
        let mode = match config.mode {
            Mode::Instrumented => "instrumented",
            Mode::Passthrough => "passthrough",
        };
        let subject = Subject::new(&config);
        let mut slots: HashMap<String, Slot> = HashMap::new();
        let started = Instant::now();

        emitter.emit_entry(
            LogEntry::new("", LogLevel::Info, "scenario_start")
                .with_scenario(&scenario.name)
                .with_mode(mode)
                .with_details(serde_json::json!({ "steps": scenario.steps.len() })),
        )?;

        let mut steps_run = 0;
        let mut stopped = None;
        for (index, step) in scenario.steps.iter().enumerate() {
            steps_run = index + 1;
            log::debug!("memdbg-harness: {} step {steps_run} {:?}", scenario.name, step);
            let result = execute(&subject, &mut slots, index, step);
            let entry = LogEntry::new("", LogLevel::Debug, "step")
                .with_scenario(&scenario.name)
                .with_step(index, step.op_name());
            match result {
                Ok(()) => {
                    emitter.emit_entry(entry.with_outcome(Outcome::Pass))?;
                }
                Err(err) => {
                    let kind = match &err {
                        StepError::Fatal(e) => e.kind(),
                        StepError::Expectation(_) => "Expectation",
                        StepError::Invalid(_) => "InvalidScenario",
                    };
                    emitter.emit_entry(
                        entry
                            .with_outcome(Outcome::Fail)
                            .with_error_kind(kind),
                    )?;
                    stopped = Some(err);
                    break;
                }
            }
        }

        let tracker = subject.tracker();
        let usage = tracker.used(false);
        let leaks = tracker.leak_report();
        let metrics = tracker.metrics();
        let (outcome, diagnostic, failure) = judge(scenario, stopped);
        release_remaining(tracker, &slots);

        let result = ScenarioResult {
            name: scenario.name.clone(),
            mode: mode.to_string(),
            outcome,
            steps_run,
            diagnostic,
            failure,
            usage,
            leaks,
            metrics,
            duration_us: started.elapsed().as_micros() as u64,
        };

        let level = if result.passed() { LogLevel::Info } else { LogLevel::Error };
        let mut entry = LogEntry::new("", level, "scenario_end")
            .with_scenario(&scenario.name)
            .with_mode(mode)
            .with_outcome(result.outcome)
            .with_duration_us(result.duration_us);
        if let Some(diag) = &result.diagnostic {
            entry = entry.with_error_kind(diag.kind);
        }
        if let Some(failure) = &result.failure {
            entry = entry.with_details(serde_json::json!({ "failure": failure }));
        }
        emitter.emit_entry(entry)?;
        Ok(result)
    }
}

fn judge(
    scenario: &Scenario,
    stopped: Option<StepError>,
) -> (Outcome, Option<Diagnostic>, Option<String>) {
    match (stopped, &scenario.expect_error) {
        (None, None) => (Outcome::Pass, None, None),
        (None, Some(expected)) => (
            Outcome::Fail,
            None,
            Some(format!("expected {} but the scenario ran clean", expected.kind)),
        ),
        (Some(StepError::Invalid(err)), _) => (Outcome::Error, None, Some(err.to_string())),
        (Some(StepError::Expectation(msg)), _) => (Outcome::Fail, None, Some(msg)),
        (Some(StepError::Fatal(err)), expected) => {
            let diag = Diagnostic::from_error(&err);
            match expected {
                Some(expected) => match mismatch(expected, &err) {
                    None => (Outcome::Pass, Some(diag), None),
                    Some(why) => (Outcome::Fail, Some(diag), Some(why)),
                },
                None => (Outcome::Fail, Some(diag), Some(format!("unexpected {err}"))),
            }
        }
    }
}

fn mismatch(expected: &ExpectedError, err: &MemDbgError) -> Option<String> {
    if expected.kind != err.kind() {
        return Some(format!("expected {}, got {}", expected.kind, err.kind()));
    }
    if let Some(side) = expected.side {
        match err {
            MemDbgError::GuardCorruption { side: got, .. } if *got == side => {}
            _ => return Some(format!("expected guard side {side:?}: {err}")),
        }
    }
    if let Some(line) = expected.allocated_line
        && err.allocated_at().map(|s| s.line) != Some(line)
    {
        return Some(format!("expected allocation at step {line}: {err}"));
    }
    None
}

fn site(index: usize) -> CallSite {
    CallSite::new(SCENARIO_FILE, (index + 1) as u32)
}

fn slot<'a>(
    slots: &'a HashMap<String, Slot>,
    index: usize,
    name: &str,
) -> Result<&'a Slot, ScenarioError> {
    slots.get(name).ok_or_else(|| ScenarioError::UnknownSlot {
        step: index + 1,
        slot: name.to_string(),
    })
}

fn unsafe_step(index: usize, detail: impl Into<String>) -> ScenarioError {
    ScenarioError::Unsafe {
        step: index + 1,
        detail: detail.into(),
    }
}

fn execute(
    subject: &Subject,
    slots: &mut HashMap<String, Slot>,
    index: usize,
    step: &Step,
) -> Result<(), StepError> {
    let tracker = subject.tracker();
    let site = site(index);
    match step {
        Step::Alloc { slot: name, size } => {
            let ptr = tracker.allocate(*size, site)?;
            let addr = ptr.as_ptr() as usize;
            slots.insert(
                name.clone(),
                Slot {
                    addr,
                    size: *size,
                    serial: subject.serial_of(addr),
                    released: false,
                },
            );
        }
        Step::Realloc { slot: name, size } => {
            let current = *slot(slots, index, name)?;
            if !subject.may_release(&current) {
                return Err(unsafe_step(index, format!("'{name}' no longer names its block")).into());
            }
            // SAFETY: `may_release` ruled out a recycled address.
            let moved = unsafe { tracker.reallocate(current.addr as *mut u8, *size, site)? };
            let next = match moved {
                Some(ptr) => {
                    let addr = ptr.as_ptr() as usize;
                    Slot {
                        addr,
                        size: *size,
                        serial: subject.serial_of(addr),
                        released: false,
                    }
                }
                None => Slot {
                    released: true,
                    ..current
                },
            };
            slots.insert(name.clone(), next);
        }
        Step::Free { slot: None } => {
            // SAFETY: null is always accepted.
            unsafe { tracker.release(std::ptr::null_mut(), site)? };
        }
        Step::Free { slot: Some(name) } => {
            let current = *slot(slots, index, name)?;
            if !subject.may_release(&current) {
                return Err(unsafe_step(index, format!("'{name}' no longer names its block")).into());
            }
            // SAFETY: as above.
            unsafe { tracker.release(current.addr as *mut u8, site)? };
            if let Some(entry) = slots.get_mut(name) {
                entry.released = true;
            }
        }
        Step::FreeForeign => {
            if !tracker.is_instrumented() {
                return Err(unsafe_step(index, "foreign release needs tracking").into());
            }
            let mut local = [0u8; 32];
            // SAFETY: the instrumented tracker rejects unmanaged pointers
            // without touching them.
            unsafe { tracker.release(local.as_mut_ptr().wrapping_add(16), site)? };
        }
        Step::Strdup { slot: name, text } => {
            let owned = CString::new(text.as_str())
                .map_err(|_| ScenarioError::InteriorNul { step: index + 1 })?;
            let ptr = tracker.duplicate_string(&owned, site)?;
            let addr = ptr.as_ptr() as usize;
            slots.insert(
                name.clone(),
                Slot {
                    addr,
                    size: text.len() + 1,
                    serial: subject.serial_of(addr),
                    released: false,
                },
            );
        }
        Step::Write {
            slot: name,
            offset,
            byte,
            len,
        } => {
            let current = *slot(slots, index, name)?;
            let Some((low, high)) = subject.writable(&current) else {
                return Err(unsafe_step(index, format!("'{name}' has no block to write")).into());
            };
            let end = offset.checked_add(*len as isize);
            if *offset < low || end.is_none_or(|end| end > high) {
                return Err(unsafe_step(
                    index,
                    format!("write [{offset}, +{len}) leaves [{low}, {high}) of '{name}'"),
                )
                .into());
            }
            let target = (current.addr as *mut u8).wrapping_offset(*offset);
            // SAFETY: the range lies inside the real block still owned for this slot.
            unsafe { std::ptr::write_bytes(target, *byte, *len) };
        }
        Step::Validate { level, message } => {
            let level = ValidationLevel::from_str_loose(level).ok_or_else(|| {
                ScenarioError::UnknownLevel {
                    step: index + 1,
                    level: level.clone(),
                }
            })?;
            let mut request = ValidateRequest::new(level);
            if let Some(message) = message {
                request = request.with_message(message);
            }
            tracker.validate(&request)?;
        }
        Step::Used {
            show_freed,
            expect_blocks,
            expect_bytes,
        } => {
            let usage = tracker.used(*show_freed);
            if let Some(blocks) = expect_blocks
                && usage.blocks != *blocks
            {
                return Err(StepError::Expectation(format!(
                    "step {}: expected {blocks} block(s), found {}",
                    index + 1,
                    usage.blocks
                )));
            }
            if let Some(bytes) = expect_bytes
                && usage.bytes != *bytes
            {
                return Err(StepError::Expectation(format!(
                    "step {}: expected {bytes} bytes, found {}",
                    index + 1,
                    usage.bytes
                )));
            }
        }
        Step::Display { expect_rows } => {
            let mut out = Vec::new();
            tracker
                .display(&mut out)
                .map_err(|e| StepError::Expectation(format!("display failed: {e}")))?;
            let text = String::from_utf8_lossy(&out);
            let rows = text
                .lines()
                .filter(|line| line.contains(SCENARIO_FILE))
                .count();
            if let Some(expected) = expect_rows
                && rows != *expected
            {
                return Err(StepError::Expectation(format!(
                    "step {}: expected {expected} leak row(s), found {rows}:\n{text}",
                    index + 1
                )));
            }
        }
        Step::Compact { expect_purged } => {
            let purged = tracker.compact();
            if let Some(expected) = expect_purged
                && purged != *expected
            {
                return Err(StepError::Expectation(format!(
                    "step {}: expected {expected} purged record(s), found {purged}",
                    index + 1
                )));
            }
        }
    }
    Ok(())
}

/// Hand back whatever the scenario left live. Corrupted blocks fail their
/// release and stay with the backing allocator.
fn release_remaining(tracker: &dyn Tracker, slots: &HashMap<String, Slot>) {
    let mut live: Vec<&Slot> = slots.values().filter(|s| !s.released).collect();
    live.sort_by_key(|s| s.addr);
    live.dedup_by_key(|s| s.addr);
    for slot in live {
        // SAFETY: the slot names a live block handed out by this tracker.
        if let Err(err) = unsafe { tracker.release(slot.addr as *mut u8, CallSite::UNKNOWN) } {
            log::debug!("memdbg-harness: cleanup skipped {:#x}: {}", slot.addr, err.kind());
        }
    }
}
