//! Pluggable test runners.
//!
//! A [`TestRunner`] turns a checked-out working copy into a [`TestSession`]; the
//! session is asked for one [`Verdict`] per attempt after the patch applier has
//! rewritten the sources.

pub mod compare;
pub mod io;
pub mod parse;
pub mod suite;

use crate::config::{RunConfig, RunnerKind, ToolchainCheck};
use crate::engine::verdict::Verdict;
use crate::lab::runner::{run_command, CommandSpec};
use crate::model::BugId;
use anyhow::{anyhow, Context, Result};
use compare::Comparator;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::{Duration, Instant};

const TOOLCHAIN_CHECK_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-bug adjustments coming from the override table.
#[derive(Debug, Clone, Default)]
pub struct RunnerHints {
    pub flaky: BTreeSet<String>,
    pub compare: Option<Comparator>,
}

pub trait TestRunner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bind the runner to one working copy. Expensive per-bug setup (test
    /// discovery, reference runs) happens here, once.
    fn prepare(&self, bug: &BugId, root: &Path, hints: &RunnerHints) -> Result<Box<dyn TestSession>>;
}

pub trait TestSession: Send {
    /// Build, run the fixed test set, and classify. Never retries.
    fn run(&mut self, timeout: Duration) -> Verdict;
}

pub fn build_runner(config: &RunConfig) -> Result<Box<dyn TestRunner>> {
    let separator = config.run.project_separator.clone();
    match config.runner.kind {
        RunnerKind::Suite => {
            let suite = config
                .runner
                .suite
                .clone()
                .ok_or_else(|| anyhow!("[runner.suite] is required for kind = \"suite\""))?;
            Ok(Box::new(suite::SuiteRunner::new(suite, separator)?))
        }
        RunnerKind::Io => {
            let io = config
                .runner
                .io
                .clone()
                .ok_or_else(|| anyhow!("[runner.io] is required for kind = \"io\""))?;
            Ok(Box::new(io::IoRunner::new(io, separator)))
        }
    }
}

/// Wall-clock budget shared by every command of one attempt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    pub(crate) fn new(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    /// Time left, or `None` once the budget is spent.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.budget
            .checked_sub(self.start.elapsed())
            .filter(|left| !left.is_zero())
    }
}

/// Check every configured toolchain requirement; any failure is fatal for the batch.
pub fn preflight(checks: &[ToolchainCheck]) -> Result<Vec<String>> {
    let mut found = Vec::new();
    for check in checks {
        found.push(check_toolchain(check)?);
    }
    Ok(found)
}

fn check_toolchain(check: &ToolchainCheck) -> Result<String> {
    let cwd = std::env::temp_dir();
    let mut spec = CommandSpec::new("toolchain", &cwd, &check.program).timeout(TOOLCHAIN_CHECK_TIMEOUT);
    spec.args = check.args.clone();
    let outcome = run_command(&spec);
    if let Some(note) = outcome.note {
        return Err(anyhow!("Toolchain '{}' is not available: {}", check.program, note));
    }
    if outcome.timed_out {
        return Err(anyhow!("Toolchain check '{}' timed out", outcome.command));
    }
    let combined = format!("{}\n{}", outcome.stdout, outcome.stderr_tail);

    let Some(pattern) = check.pattern.as_deref() else {
        if !outcome.success {
            return Err(anyhow!(
                "Toolchain check '{}' failed with exit code {:?}",
                outcome.command,
                outcome.exit_code
            ));
        }
        return Ok(first_line(&combined));
    };

    let re = Regex::new(pattern).with_context(|| format!("Invalid toolchain pattern '{}'", pattern))?;
    let captures = re.captures(&combined).ok_or_else(|| {
        anyhow!(
            "Toolchain '{}' output does not match '{}':\n{}",
            check.program,
            pattern,
            combined.trim()
        )
    })?;
    let version = captures
        .get(1)
        .or_else(|| captures.get(0))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    if let Some(expect) = check.expect.as_deref() {
        if !version.contains(expect) {
            return Err(anyhow!(
                "Toolchain '{}' reports version '{}', expected '{}'",
                check.program,
                version,
                expect
            ));
        }
    }
    Ok(format!("{} {}", check.program, version))
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}
