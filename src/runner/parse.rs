//! Failed-count extraction from test tool output.

use crate::config::{ParserKind, SuiteConfig};
use anyhow::{Context, Result};
use regex::Regex;
use std::sync::LazyLock;

/// Markers in combined output that mean the session never really ran.
const PYTEST_ERROR_MARKERS: &[&str] = &[
    "= ERRORS =",
    "ERROR collecting",
    "ERROR:",
    "ImportError while",
    "SyntaxError:",
    "NameError:",
    ": command not found",
];

#[derive(Debug, Clone)]
pub enum FailureParser {
    Summary(Regex),
    Pytest,
    ExitCode,
}

impl FailureParser {
    pub fn from_config(suite: &SuiteConfig) -> Result<Self> {
        Ok(match suite.parser {
            ParserKind::Summary => {
                let pattern = suite.summary_pattern();
                FailureParser::Summary(
                    Regex::new(pattern)
                        .with_context(|| format!("Invalid summary pattern '{}'", pattern))?,
                )
            }
            ParserKind::Pytest => FailureParser::Pytest,
            ParserKind::ExitCode => FailureParser::ExitCode,
        })
    }

    /// Number of failing tests, or `None` when the output carries no usable count.
    pub fn failed_count(&self, stdout: &str, stderr: &str, exit_code: Option<i32>) -> Option<u32> {
        match self {
            FailureParser::Summary(re) => summary_count(re, stdout)
                .or_else(|| summary_count(re, stderr)),
            FailureParser::Pytest => pytest_count(&format!("{stdout}\n{stderr}")),
            FailureParser::ExitCode => match exit_code {
                Some(0) => Some(0),
                Some(_) => Some(1),
                None => None,
            },
        }
    }
}

fn summary_count(re: &Regex, text: &str) -> Option<u32> {
    let captures = re.captures(text)?;
    captures.get(1)?.as_str().trim().parse().ok()
}

static SESSION_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"RUN EVERY COMMAND\s+\d+").unwrap());

static PYTEST_FAILED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+failed").unwrap());

static UNITTEST_FAILURES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"failures=(\d+)").unwrap());

static PASSED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:passed|OK)\b").unwrap());

/// Sum failures across sessions. Output without session markers is one session.
fn pytest_count(output: &str) -> Option<u32> {
    let mut pieces = SESSION_MARKER_RE.split(output);
    let sessions: Vec<&str> = if SESSION_MARKER_RE.is_match(output) {
        pieces.next();
        pieces.collect()
    } else {
        vec![output]
    };

    let mut total = 0u32;
    for session in sessions {
        total = total.checked_add(pytest_session_count(session)?)?;
    }
    Some(total)
}

fn pytest_session_count(session: &str) -> Option<u32> {
    if PYTEST_ERROR_MARKERS.iter().any(|m| session.contains(m)) {
        return None;
    }
    for re in [&*PYTEST_FAILED_RE, &*UNITTEST_FAILURES_RE] {
        if let Some(captures) = re.captures(session) {
            return captures.get(1)?.as_str().parse().ok();
        }
    }
    PASSED_RE.is_match(session).then_some(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reads_first_capture() {
        let parser = FailureParser::Summary(Regex::new(r"Failing tests: (\d+)").unwrap());
        assert_eq!(parser.failed_count("Failing tests: 3\n  - Foo::bar", "", Some(0)), Some(3));
        assert_eq!(parser.failed_count("", "Failing tests: 0", Some(0)), Some(0));
        assert_eq!(parser.failed_count("BUILD FAILED", "", Some(1)), None);
    }

    #[test]
    fn pytest_sums_sessions() {
        let out = "RUN EVERY COMMAND 0\n==== 2 failed, 10 passed ====\n\
                   RUN EVERY COMMAND 1\nRan 4 tests\nFAILED (failures=1)\n";
        assert_eq!(FailureParser::Pytest.failed_count(out, "", Some(1)), Some(3));
    }

    #[test]
    fn pytest_passing_session_counts_zero() {
        let out = "RUN EVERY COMMAND 0\n==== 5 passed in 0.2s ====\nRUN EVERY COMMAND 1\nOK\n";
        assert_eq!(FailureParser::Pytest.failed_count(out, "", Some(0)), Some(0));
    }

    #[test]
    fn pytest_error_markers_mean_no_count() {
        let out = "RUN EVERY COMMAND 0\nImportError while loading conftest\n";
        assert_eq!(FailureParser::Pytest.failed_count(out, "", Some(2)), None);
        let out = "RUN EVERY COMMAND 0\n1 passed\nRUN EVERY COMMAND 1\nSyntaxError: bad\n";
        assert_eq!(FailureParser::Pytest.failed_count(out, "", Some(2)), None);
    }

    #[test]
    fn pytest_without_markers_is_single_session() {
        assert_eq!(FailureParser::Pytest.failed_count("1 failed, 2 passed", "", Some(1)), Some(1));
        assert_eq!(FailureParser::Pytest.failed_count("collected 0 items", "", Some(5)), None);
    }

    #[test]
    fn pytest_reads_errors_from_stderr() {
        let stdout = "RUN EVERY COMMAND 0\n==== 1 failed, 3 passed ====\n";
        let stderr = "ImportError while importing test module 'tests/test_io.py'\n";
        assert_eq!(FailureParser::Pytest.failed_count(stdout, stderr, Some(1)), None);

        let stdout = "==== 2 passed ====\n";
        let stderr = "RUN EVERY COMMAND 0\nRan 2 tests\nOK\nRUN EVERY COMMAND 1\nFAILED (failures=2)\n";
        assert_eq!(FailureParser::Pytest.failed_count(stdout, stderr, Some(1)), Some(2));
    }

    #[test]
    fn exit_code_parser() {
        assert_eq!(FailureParser::ExitCode.failed_count("", "", Some(0)), Some(0));
        assert_eq!(FailureParser::ExitCode.failed_count("", "", Some(7)), Some(1));
        assert_eq!(FailureParser::ExitCode.failed_count("", "", None), None);
    }
}
