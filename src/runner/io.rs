//! Stdin/stdout runner for competitive-programming style benchmarks.
//!
//! Each test case is an input file fed to the program on stdin; the program's
//! stdout is compared against the matching expected-output file.

use super::compare::Comparator;
use super::{Deadline, RunnerHints, TestRunner, TestSession};
use crate::config::{IoConfig, NonZeroExit, Placeholders};
use crate::engine::verdict::Verdict;
use crate::lab::runner::{run_command, CommandOutcome, CommandSpec};
use crate::model::BugId;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound for one reference run during test discovery.
const REFERENCE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoCase {
    pub name: String,
    pub input: PathBuf,
    pub expected: PathBuf,
}

pub struct IoRunner {
    config: IoConfig,
    separator: String,
}

impl IoRunner {
    pub fn new(config: IoConfig, separator: String) -> Self {
        Self { config, separator }
    }
}

impl TestRunner for IoRunner {
    fn name(&self) -> &'static str {
        "io"
    }

    fn prepare(&self, bug: &BugId, root: &Path, hints: &RunnerHints) -> Result<Box<dyn TestSession>> {
        let vars = Placeholders::new(root, bug, &self.separator);
        let tests_dir = PathBuf::from(vars.expand(&self.config.tests_dir));
        let compare = hints.compare.unwrap_or(self.config.compare);

        let mut cases = discover_cases(&tests_dir, &self.config.input_prefix)?;
        let before = cases.len();
        cases.retain(|case| !hints.flaky.contains(&case.name));
        if cases.len() != before {
            debug!(bug = %bug, skipped = before - cases.len(), "skipping flaky cases");
        }

        if !self.config.reference_run.is_empty() {
            cases = self.filter_by_reference(root, &vars, cases, compare)?;
        }
        if cases.is_empty() {
            return Err(anyhow!(
                "No usable test cases for '{}' under '{}'",
                bug,
                tests_dir.display()
            ));
        }

        let build = if self.config.build.is_empty() {
            None
        } else {
            Some(CommandSpec::from_template("build", root, &self.config.build, &vars)?)
        };
        let run = CommandSpec::from_template("run", root, &self.config.run, &vars)?
            .max_stdout_bytes(self.config.max_output_bytes);

        Ok(Box::new(IoSession {
            build,
            run,
            cases,
            compare,
            nonzero_exit: self.config.nonzero_exit,
        }))
    }
}

impl IoRunner {
    /// Keep only cases the reference program passes.
    fn filter_by_reference(
        &self,
        root: &Path,
        vars: &Placeholders,
        cases: Vec<IoCase>,
        compare: Comparator,
    ) -> Result<Vec<IoCase>> {
        if !self.config.reference_build.is_empty() {
            let spec =
                CommandSpec::from_template("reference-build", root, &self.config.reference_build, vars)?
                    .timeout(REFERENCE_TIMEOUT);
            let outcome = run_command(&spec);
            if !outcome.success {
                return Err(anyhow!(
                    "Reference build failed ({}):\n{}",
                    outcome.command,
                    outcome.note.unwrap_or(outcome.stderr_tail)
                ));
            }
        }

        let reference = CommandSpec::from_template("reference", root, &self.config.reference_run, vars)?
            .timeout(REFERENCE_TIMEOUT)
            .max_stdout_bytes(self.config.max_output_bytes);
        let total = cases.len();
        let kept: Vec<IoCase> = cases
            .into_iter()
            .filter(|case| {
                let outcome = run_command(&reference.clone().stdin_file(&case.input));
                outcome.success && case_passes(&outcome, &case.expected, compare).unwrap_or(false)
            })
            .collect();
        if kept.len() < total {
            debug!(kept = kept.len(), total, "reference filter dropped cases");
        }
        Ok(kept)
    }
}

/// Input files start with `prefix`; the expected output replaces `input` with `output`.
pub fn discover_cases(tests_dir: &Path, prefix: &str) -> Result<Vec<IoCase>> {
    let entries = std::fs::read_dir(tests_dir)
        .with_context(|| format!("Failed to list test directory '{}'", tests_dir.display()))?;
    let mut cases = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read '{}'", tests_dir.display()))?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(prefix) {
            continue;
        }
        let expected = tests_dir.join(name.replacen("input", "output", 1));
        if expected == entry.path() || !expected.is_file() {
            warn!(case = %name, "no expected output, skipping");
            continue;
        }
        cases.push(IoCase {
            name,
            input: entry.path(),
            expected,
        });
    }
    cases.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(cases)
}

fn case_passes(outcome: &CommandOutcome, expected: &Path, compare: Comparator) -> Result<bool> {
    if outcome.stdout_truncated {
        return Ok(false);
    }
    let expected_bytes = std::fs::read(expected)
        .with_context(|| format!("Failed to read expected output '{}'", expected.display()))?;
    Ok(compare.matches(&outcome.stdout, &String::from_utf8_lossy(&expected_bytes)))
}

pub struct IoSession {
    build: Option<CommandSpec>,
    run: CommandSpec,
    cases: Vec<IoCase>,
    compare: Comparator,
    nonzero_exit: NonZeroExit,
}

impl TestSession for IoSession {
    fn run(&mut self, timeout: Duration) -> Verdict {
        let deadline = Deadline::new(timeout);

        if let Some(build) = self.build.as_ref() {
            let outcome = run_command(&build.clone().timeout(timeout));
            if outcome.timed_out {
                return Verdict::Timeout;
            }
            if !outcome.success {
                return Verdict::Uncompilable;
            }
        }

        let mut failed = 0u32;
        for case in &self.cases {
            let Some(remaining) = deadline.remaining() else {
                return Verdict::Timeout;
            };
            let outcome = run_command(&self.run.clone().timeout(remaining).stdin_file(&case.input));
            if outcome.timed_out {
                return Verdict::Timeout;
            }
            if outcome.note.is_some() {
                return Verdict::Uncompilable;
            }
            if !outcome.success {
                match self.nonzero_exit {
                    NonZeroExit::Uncompilable => return Verdict::Uncompilable,
                    NonZeroExit::Failure => {
                        failed += 1;
                        continue;
                    }
                }
            }
            match case_passes(&outcome, &case.expected, self.compare) {
                Ok(true) => {}
                Ok(false) => failed += 1,
                Err(err) => {
                    warn!(case = %case.name, "{err:#}");
                    failed += 1;
                }
            }
        }
        Verdict::compilable(failed)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn io_config(run: &str) -> IoConfig {
        IoConfig {
            build: Vec::new(),
            run: vec!["sh".into(), "-c".into(), run.into()],
            tests_dir: "{dir}/tests".into(),
            input_prefix: "input".into(),
            reference_build: Vec::new(),
            reference_run: Vec::new(),
            nonzero_exit: NonZeroExit::Failure,
            compare: Comparator::Exact,
            max_output_bytes: 1024,
        }
    }

    /// Three cases: doubling 1, 2 and 3.
    fn workspace() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let tests = dir.path().join("tests");
        std::fs::create_dir_all(&tests).unwrap();
        for n in 1..=3 {
            std::fs::write(tests.join(format!("input{n}")), format!("{n}\n")).unwrap();
            std::fs::write(tests.join(format!("output{n}")), format!("{}\n", n * 2)).unwrap();
        }
        std::fs::write(tests.join("input9"), "9\n").unwrap();
        dir
    }

    fn prepare(config: IoConfig, root: &Path, hints: &RunnerHints) -> Result<Box<dyn TestSession>> {
        IoRunner::new(config, "-".into()).prepare(&BugId::new("p0001-1"), root, hints)
    }

    #[test]
    fn discovers_cases_with_expected_outputs_only() {
        let dir = workspace();
        let cases = discover_cases(&dir.path().join("tests"), "input").unwrap();
        let names: Vec<&str> = cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["input1", "input2", "input3"]);
        assert!(cases[0].expected.ends_with("output1"));
    }

    #[test]
    fn counts_mismatching_cases() {
        let dir = workspace();
        let mut session = prepare(
            io_config("read n; if [ $n -eq 2 ]; then echo 5; else echo $((n*2)); fi"),
            dir.path(),
            &RunnerHints::default(),
        )
        .unwrap();
        assert_eq!(session.run(Duration::from_secs(10)), Verdict::compilable(1));
    }

    #[test]
    fn all_matching_is_plausible() {
        let dir = workspace();
        let mut session = prepare(io_config("read n; echo $((n*2))"), dir.path(), &RunnerHints::default())
            .unwrap();
        assert_eq!(session.run(Duration::from_secs(10)), Verdict::Plausible);
    }

    #[test]
    fn nonzero_exit_policy() {
        let dir = workspace();
        let script = "read n; if [ $n -eq 3 ]; then exit 1; fi; echo $((n*2))";
        let mut session = prepare(io_config(script), dir.path(), &RunnerHints::default()).unwrap();
        assert_eq!(session.run(Duration::from_secs(10)), Verdict::compilable(1));

        let mut config = io_config(script);
        config.nonzero_exit = NonZeroExit::Uncompilable;
        let mut session = prepare(config, dir.path(), &RunnerHints::default()).unwrap();
        assert_eq!(session.run(Duration::from_secs(10)), Verdict::Uncompilable);
    }

    #[test]
    fn oversized_output_fails_the_case() {
        let dir = workspace();
        let mut config = io_config("read n; if [ $n -eq 1 ]; then yes | head -c 4096; fi; echo $((n*2))");
        config.max_output_bytes = 64;
        let mut session = prepare(config, dir.path(), &RunnerHints::default()).unwrap();
        assert_eq!(session.run(Duration::from_secs(10)), Verdict::compilable(1));
    }

    #[test]
    fn hanging_program_times_out() {
        let dir = workspace();
        let mut session =
            prepare(io_config("sleep 20"), dir.path(), &RunnerHints::default()).unwrap();
        assert_eq!(session.run(Duration::from_millis(300)), Verdict::Timeout);
    }

    #[test]
    fn flaky_cases_are_skipped() {
        let dir = workspace();
        let hints = RunnerHints {
            flaky: BTreeSet::from(["input2".to_string()]),
            compare: None,
        };
        let mut session = prepare(
            io_config("read n; if [ $n -eq 2 ]; then echo 5; else echo $((n*2)); fi"),
            dir.path(),
            &hints,
        )
        .unwrap();
        assert_eq!(session.run(Duration::from_secs(10)), Verdict::Plausible);
    }

    #[test]
    fn reference_filter_keeps_only_verified_cases() {
        let dir = workspace();
        let mut config = io_config("read n; echo $((n*2))");
        config.reference_run = vec![
            "sh".into(),
            "-c".into(),
            "read n; if [ $n -eq 1 ]; then echo 0; else echo $((n*2)); fi".into(),
        ];
        let runner = IoRunner::new(config, "-".into());
        let vars = Placeholders::new(dir.path(), &BugId::new("p0001-1"), "-");
        let cases = discover_cases(&dir.path().join("tests"), "input").unwrap();
        let kept = runner
            .filter_by_reference(dir.path(), &vars, cases, Comparator::Exact)
            .unwrap();
        let names: Vec<&str> = kept.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["input2", "input3"]);
    }

    #[test]
    fn no_cases_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tests")).unwrap();
        assert!(prepare(io_config("true"), dir.path(), &RunnerHints::default()).is_err());
    }
}
