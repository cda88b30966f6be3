//! Build-then-test runner for benchmarks that ship their own test driver.

use super::parse::FailureParser;
use super::{Deadline, RunnerHints, TestRunner, TestSession};
use crate::config::{Placeholders, SuiteConfig};
use crate::engine::verdict::Verdict;
use crate::lab::runner::{run_command, CommandSpec};
use crate::model::BugId;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub struct SuiteRunner {
    config: SuiteConfig,
    parser: FailureParser,
    failing_test: Option<Regex>,
    separator: String,
}

impl SuiteRunner {
    pub fn new(config: SuiteConfig, separator: String) -> Result<Self> {
        let parser = FailureParser::from_config(&config)?;
        let failing_test = config
            .failing_test_pattern
            .as_deref()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid failing_test_pattern '{}'", p)))
            .transpose()?;
        Ok(Self {
            config,
            parser,
            failing_test,
            separator,
        })
    }
}

impl TestRunner for SuiteRunner {
    fn name(&self) -> &'static str {
        "suite"
    }

    fn prepare(&self, bug: &BugId, root: &Path, hints: &RunnerHints) -> Result<Box<dyn TestSession>> {
        let vars = Placeholders::new(root, bug, &self.separator);
        let build = if self.config.build.is_empty() {
            None
        } else {
            Some(
                CommandSpec::from_template("build", root, &self.config.build, &vars)?
                    .with_env_overrides(&self.config.env),
            )
        };
        let test = CommandSpec::from_template("test", root, &self.config.test, &vars)?
            .with_env_overrides(&self.config.env);
        let clean = self
            .config
            .clean
            .iter()
            .map(|p| root.join(vars.expand(p)))
            .collect();

        Ok(Box::new(SuiteSession {
            build,
            test,
            clean,
            parser: self.parser.clone(),
            failing_test: self.failing_test.clone(),
            flaky: hints.flaky.clone(),
        }))
    }
}

pub struct SuiteSession {
    build: Option<CommandSpec>,
    test: CommandSpec,
    clean: Vec<PathBuf>,
    parser: FailureParser,
    failing_test: Option<Regex>,
    flaky: BTreeSet<String>,
}

impl SuiteSession {
    /// Stale build outputs must never mask a failed compile.
    fn clean_outputs(&self) {
        for path in &self.clean {
            let result = if path.is_dir() {
                std::fs::remove_dir_all(path)
            } else if path.exists() {
                std::fs::remove_file(path)
            } else {
                continue;
            };
            if let Err(err) = result {
                debug!(path = %path.display(), "failed to clean build output: {err}");
            }
        }
    }

    fn flaky_failures(&self, stdout: &str) -> u32 {
        let Some(re) = self.failing_test.as_ref() else {
            return 0;
        };
        if self.flaky.is_empty() {
            return 0;
        }
        let failing: BTreeSet<&str> = re
            .captures_iter(stdout)
            .filter_map(|c| c.get(1).map(|m| m.as_str().trim()))
            .collect();
        failing.iter().filter(|name| self.flaky.contains(**name)).count() as u32
    }
}

impl TestSession for SuiteSession {
    fn run(&mut self, timeout: Duration) -> Verdict {
        let deadline = Deadline::new(timeout);
        self.clean_outputs();

        if let Some(build) = self.build.as_ref() {
            let outcome = run_command(&build.clone().timeout(timeout));
            if outcome.timed_out {
                return Verdict::Timeout;
            }
            if !outcome.success {
                debug!(command = %outcome.command, "build failed");
                return Verdict::Uncompilable;
            }
        }

        let Some(remaining) = deadline.remaining() else {
            return Verdict::Timeout;
        };
        let outcome = run_command(&self.test.clone().timeout(remaining));
        if outcome.timed_out {
            return Verdict::Timeout;
        }
        if outcome.note.is_some() {
            return Verdict::Uncompilable;
        }

        match self
            .parser
            .failed_count(&outcome.stdout, &outcome.stderr_tail, outcome.exit_code)
        {
            Some(failed) => {
                Verdict::compilable(failed.saturating_sub(self.flaky_failures(&outcome.stdout)))
            }
            None => {
                debug!(command = %outcome.command, tail = %outcome.stdout_tail(), "no failure count in test output");
                Verdict::Uncompilable
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ParserKind;
    use tempfile::tempdir;

    fn suite(build: &str, test: &str) -> SuiteConfig {
        SuiteConfig {
            build: if build.is_empty() {
                Vec::new()
            } else {
                vec!["sh".into(), "-c".into(), build.into()]
            },
            test: vec!["sh".into(), "-c".into(), test.into()],
            parser: ParserKind::Summary,
            pattern: None,
            failing_test_pattern: None,
            clean: vec!["out".into()],
            env: Default::default(),
        }
    }

    fn session(config: SuiteConfig, root: &Path, hints: &RunnerHints) -> Box<dyn TestSession> {
        SuiteRunner::new(config, String::new())
            .unwrap()
            .prepare(&BugId::new("Lang 1"), root, hints)
            .unwrap()
    }

    #[test]
    fn build_failure_is_uncompilable() {
        let dir = tempdir().unwrap();
        let mut s = session(
            suite("exit 1", "echo 'Failing tests: 0'"),
            dir.path(),
            &RunnerHints::default(),
        );
        assert_eq!(s.run(Duration::from_secs(10)), Verdict::Uncompilable);
    }

    #[test]
    fn summary_count_drives_verdict() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("count"), "2").unwrap();
        let mut s = session(
            suite("true", "echo \"Failing tests: $(cat count)\""),
            dir.path(),
            &RunnerHints::default(),
        );
        assert_eq!(s.run(Duration::from_secs(10)), Verdict::compilable(2));
        std::fs::write(dir.path().join("count"), "0").unwrap();
        assert_eq!(s.run(Duration::from_secs(10)), Verdict::Plausible);
    }

    #[test]
    fn unparseable_output_is_uncompilable() {
        let dir = tempdir().unwrap();
        let mut s = session(suite("", "echo BUILD FAILED"), dir.path(), &RunnerHints::default());
        assert_eq!(s.run(Duration::from_secs(10)), Verdict::Uncompilable);
    }

    #[test]
    fn slow_tests_time_out() {
        let dir = tempdir().unwrap();
        let mut s = session(
            suite("", "sleep 20; echo 'Failing tests: 0'"),
            dir.path(),
            &RunnerHints::default(),
        );
        assert_eq!(s.run(Duration::from_millis(300)), Verdict::Timeout);
    }

    #[test]
    fn clean_paths_are_removed_before_each_attempt() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("out/classes")).unwrap();
        let mut s = session(
            suite("", "test -d out && echo 'Failing tests: 1' || echo 'Failing tests: 0'"),
            dir.path(),
            &RunnerHints::default(),
        );
        assert_eq!(s.run(Duration::from_secs(10)), Verdict::Plausible);
    }

    #[test]
    fn listed_flaky_failures_are_subtracted() {
        let dir = tempdir().unwrap();
        let mut config = suite(
            "",
            "printf 'Failing tests: 2\\n  - FooTest::flaky\\n  - FooTest::real\\n'",
        );
        config.failing_test_pattern = Some(r"(?m)^\s+- (\S+)$".to_string());
        let hints = RunnerHints {
            flaky: BTreeSet::from(["FooTest::flaky".to_string()]),
            compare: None,
        };
        let mut s = session(config, dir.path(), &hints);
        assert_eq!(s.run(Duration::from_secs(10)), Verdict::compilable(1));
    }
}
