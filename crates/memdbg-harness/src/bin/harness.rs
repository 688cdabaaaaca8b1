//! CLI entrypoint for the memdbg scenario harness.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use memdbg_harness::{
    LogEmitter, Overrides, RunReport, Scenario, ScenarioRunner, selftest,
};

/// Scenario tooling for memdbg.
#[derive(Debug, Parser)]
#[command(name = "memdbg-harness")]
#[command(about = "Replay allocation scenarios against the memdbg tracker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct Output {
    /// Output report path (markdown). A `.json` twin is written next to it.
    #[arg(long)]
    report: Option<PathBuf>,
    /// Structured JSONL log path (defaults to stdout).
    #[arg(long)]
    log: Option<PathBuf>,
    /// Run identifier used in trace ids.
    #[arg(long, default_value = "local")]
    run_id: String,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run scenario files.
    Run {
        /// A scenario JSON file, or a directory of them.
        #[arg(long)]
        scenario: PathBuf,
        /// Tracking mode (`on` or `off`), overriding scenario and environment.
        #[arg(long)]
        mode: Option<String>,
        /// Block policy (`recycle`, `quarantine` or `retain`).
        #[arg(long)]
        blocks: Option<String>,
        /// Record policy (`retain` or `purge`).
        #[arg(long)]
        records: Option<String>,
        #[command(flatten)]
        output: Output,
    },
    /// Run the built-in scenario suite.
    Selftest {
        #[command(flatten)]
        output: Output,
    },
}

fn collect_scenarios(path: &Path) -> Result<Vec<Scenario>, Box<dyn std::error::Error>> {
    if path.is_file() {
        return Ok(vec![Scenario::load(path)?]);
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    paths.sort();

    let mut scenarios = Vec::new();
    for path in paths {
        match Scenario::load(&path) {
            Ok(scenario) => scenarios.push(scenario),
            Err(err) => log::warn!("skipping {}: {err}", path.display()),
        }
    }
    if scenarios.is_empty() {
        return Err(format!("No scenario JSON files found in {}", path.display()).into());
    }
    Ok(scenarios)
}

fn run_all(
    scenarios: &[Scenario],
    overrides: Overrides,
    output: &Output,
) -> Result<RunReport, Box<dyn std::error::Error>> {
    let mut emitter = match &output.log {
        Some(path) => LogEmitter::to_file(path, &output.run_id)?,
        None => LogEmitter::to_stdout(&output.run_id),
    };
    let runner = ScenarioRunner::new(overrides);
    let mut report = RunReport::new("memdbg Scenario Report", output.run_id.clone());
    for scenario in scenarios {
        let result = runner.run(scenario, &mut emitter)?;
        if !result.passed() {
            eprintln!(
                "{}: {:?}: {}",
                result.name,
                result.outcome,
                result.failure.as_deref().unwrap_or("")
            );
        }
        report.push(scenario, result);
    }
    emitter.flush()?;

    eprintln!(
        "Scenarios complete: total={}, passed={}, failed={}, errors={}",
        report.total, report.passed, report.failed, report.errors
    );

    if let Some(path) = &output.report {
        std::fs::write(path, report.to_markdown())?;
        std::fs::write(path.with_extension("json"), report.to_json())?;
        eprintln!("Report written to {}", path.display());
    }
    Ok(report)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let report = match cli.command {
        Command::Run {
            scenario,
            mode,
            blocks,
            records,
            output,
        } => {
            let scenarios = collect_scenarios(&scenario)?;
            let overrides = Overrides {
                mode,
                blocks,
                records,
            };
            run_all(&scenarios, overrides, &output)?
        }
        Command::Selftest { output } => {
            let scenarios = selftest::builtin_scenarios()?;
            run_all(&scenarios, Overrides::default(), &output)?
        }
    };

    if !report.all_passed() {
        return Err(format!("{} scenario(s) did not pass", report.total - report.passed).into());
    }
    Ok(())
}
