//! Run reports for scenario replays.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::scenario::{Scenario, ScenarioResult};
use crate::structured_log::{Outcome, now_utc};

/// One scenario as it appears in a report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportedScenario {
    /// SHA-256 of the scenario's canonical JSON, to tie results to inputs.
    pub digest: String,
    #[serde(flatten)]
    pub result: ScenarioResult,
}

/// Summary of one harness run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub title: String,
    pub run_id: String,
    /// Timestamp (UTC).
    pub timestamp: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub scenarios: Vec<ReportedScenario>,
}

impl RunReport {
    #[must_use]
    pub fn new(title: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            run_id: run_id.into(),
            timestamp: now_utc(),
            total: 0,
            passed: 0,
            failed: 0,
            errors: 0,
            scenarios: Vec::new(),
        }
    }

    pub fn push(&mut self, scenario: &Scenario, result: ScenarioResult) {
        self.total += 1;
        match result.outcome {
            Outcome::Pass => self.passed += 1,
            Outcome::Fail => self.failed += 1,
            Outcome::Error => self.errors += 1,
        }
        self.scenarios.push(ReportedScenario {
            digest: scenario_digest(scenario),
            result,
        });
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }

    /// Render the report as markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", self.title));
        out.push_str(&format!("- Run: {}\n", self.run_id));
        out.push_str(&format!("- Timestamp: {}\n", self.timestamp));
        out.push_str(&format!("- Total: {}\n", self.total));
        out.push_str(&format!("- Passed: {}\n", self.passed));
        out.push_str(&format!("- Failed: {}\n", self.failed));
        out.push_str(&format!("- Errors: {}\n\n", self.errors));

        out.push_str("| Scenario | Mode | Steps | Stopped on | Status |\n");
        out.push_str("|----------|------|-------|------------|--------|\n");
        for s in &self.scenarios {
            let r = &s.result;
            let status = match r.outcome {
                Outcome::Pass => "PASS",
                Outcome::Fail => "FAIL",
                Outcome::Error => "ERROR",
            };
            let stopped = r.diagnostic.as_ref().map_or("-", |d| d.kind);
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                r.name, r.mode, r.steps_run, stopped, status
            ));
        }

        let failures: Vec<_> = self
            .scenarios
            .iter()
            .filter_map(|s| s.result.failure.as_ref().map(|f| (&s.result.name, f)))
            .collect();
        if !failures.is_empty() {
            out.push_str("\n## Failures\n\n");
            for (name, failure) in failures {
                out.push_str(&format!("- **{name}**: {failure}\n"));
            }
        }
        out
    }

    /// Render the report as JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}

/// Lowercase hex SHA-256 of the scenario's JSON form.
#[must_use]
pub fn scenario_digest(scenario: &Scenario) -> String {
    let bytes = serde_json::to_vec(scenario).unwrap_or_default();
    Sha256::digest(&bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::ScenarioRunner;
    use crate::structured_log::LogEmitter;

    fn scenario(json: &str) -> Scenario {
        Scenario::from_json(json).unwrap()
    }

    #[test]
    fn counts_and_markdown_rows() {
        let ok = scenario(r#"{"name":"ok","mode":"on","steps":[{"op":"free"}]}"#);
        let bad = scenario(
            r#"{"name":"bad","mode":"on","steps":[{"op":"free"}],
                "expect_error":{"kind":"DoubleRelease"}}"#,
        );
        let runner = ScenarioRunner::default();
        let mut log = LogEmitter::to_buffer("r");
        let mut report = RunReport::new("memdbg scenarios", "r");
        for s in [&ok, &bad] {
            let result = runner.run(s, &mut log).unwrap();
            report.push(s, result);
        }

        assert_eq!((report.total, report.passed, report.failed), (2, 1, 1));
        assert!(!report.all_passed());
        let md = report.to_markdown();
        assert!(md.contains("| ok | instrumented | 1 | - | PASS |"), "{md}");
        assert!(md.contains("| bad | instrumented | 1 | - | FAIL |"), "{md}");
        assert!(md.contains("**bad**: expected DoubleRelease"), "{md}");

        let json: serde_json::Value = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(json["scenarios"][0]["name"], "ok");
        assert_eq!(json["scenarios"][0]["digest"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn digest_tracks_content() {
        let a = scenario(r#"{"name":"a","steps":[]}"#);
        let b = scenario(r#"{"name":"b","steps":[]}"#);
        assert_eq!(scenario_digest(&a), scenario_digest(&a.clone()));
        assert_ne!(scenario_digest(&a), scenario_digest(&b));
    }
}
