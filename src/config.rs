//! Run configuration (`patchlab.toml`).

use crate::engine::{EngineOptions, SearchStrategy};
use crate::model::BugId;
use crate::reflow::CandidateTransform;
use crate::runner::compare::Comparator;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "patchlab.toml";
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_SUMMARY_PATTERN: &str = r"Failing tests: (\d+)";
const DEFAULT_MAX_OUTPUT_BYTES: usize = 100 * 1024 * 1024;

fn default_schema_version() -> u32 {
    1
}

fn default_dataset() -> String {
    "default".to_string()
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_tests_dir() -> String {
    "{dir}/tests".to_string()
}

fn default_input_prefix() -> String {
    "input".to_string()
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn default_checkout_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Dataset label; overrides may be scoped to it.
    #[serde(default = "default_dataset")]
    pub dataset: String,
    pub paths: PathsConfig,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub toolchain: Vec<ToolchainCheck>,
    pub checkout: CheckoutConfig,
    pub runner: RunnerConfig,
    #[serde(default)]
    pub overrides: Vec<BugOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub bugs: PathBuf,
    pub candidates: PathBuf,
    pub checkpoints: PathBuf,
    #[serde(default)]
    pub work_root: Option<PathBuf>,
    pub aggregate: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub strategy: SearchStrategy,
    #[serde(default)]
    pub joint_prepass: bool,
    #[serde(default)]
    pub max_candidates_per_hunk: Option<usize>,
    /// Separates project from bug number in ids; empty means whitespace.
    #[serde(default)]
    pub project_separator: String,
    /// Repair applied to candidate text before it is indented and inserted.
    #[serde(default)]
    pub candidate_transform: CandidateTransform,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            strategy: SearchStrategy::default(),
            joint_prepass: false,
            max_candidates_per_hunk: None,
            project_separator: String::new(),
            candidate_transform: CandidateTransform::default(),
        }
    }
}

/// Toolchain precondition checked once before a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainCheck {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Regex applied to combined stdout/stderr; capture group 1 (or the whole
    /// match) must contain `expect`.
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub expect: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutKind {
    Command,
    Copy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutConfig {
    pub kind: CheckoutKind,
    /// `command` kind: program and arguments, with placeholders.
    #[serde(default)]
    pub command: Vec<String>,
    /// `copy` kind: per-bug source directory template.
    #[serde(default)]
    pub source: Option<String>,
    /// Paths relative to the working copy removed before checkout.
    #[serde(default)]
    pub stale_locks: Vec<String>,
    /// Prefix joined in front of every hunk's `source_path`.
    #[serde(default)]
    pub source_root: Option<String>,
    #[serde(default = "default_checkout_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    Suite,
    Io,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub kind: RunnerKind,
    #[serde(default)]
    pub suite: Option<SuiteConfig>,
    #[serde(default)]
    pub io: Option<IoConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParserKind {
    /// Regex with one capture group holding the failed count.
    #[default]
    Summary,
    /// pytest / unittest session output.
    Pytest,
    /// Exit status only: zero passes, anything else is one failure.
    ExitCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    #[serde(default)]
    pub build: Vec<String>,
    pub test: Vec<String>,
    #[serde(default)]
    pub parser: ParserKind,
    #[serde(default)]
    pub pattern: Option<String>,
    /// Regex whose group 1 names one failing test per match; listed flaky
    /// tests are subtracted from the failed count.
    #[serde(default)]
    pub failing_test_pattern: Option<String>,
    /// Build-output paths deleted before every attempt.
    #[serde(default)]
    pub clean: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl SuiteConfig {
    pub fn summary_pattern(&self) -> &str {
        self.pattern.as_deref().unwrap_or(DEFAULT_SUMMARY_PATTERN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonZeroExit {
    /// A crashing program counts as a failed test.
    #[default]
    Failure,
    /// A crashing program makes the whole attempt uncompilable.
    Uncompilable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    #[serde(default)]
    pub build: Vec<String>,
    pub run: Vec<String>,
    #[serde(default = "default_tests_dir")]
    pub tests_dir: String,
    /// Test inputs are files whose name starts with this; the expected output
    /// is the same name with `input` replaced by `output`.
    #[serde(default = "default_input_prefix")]
    pub input_prefix: String,
    /// Reference build and run commands; when set, only tests the reference
    /// passes are kept.
    #[serde(default)]
    pub reference_build: Vec<String>,
    #[serde(default)]
    pub reference_run: Vec<String>,
    #[serde(default)]
    pub nonzero_exit: NonZeroExit,
    #[serde(default)]
    pub compare: Comparator,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

/// Data-driven per-bug fixups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BugOverride {
    pub bug: String,
    #[serde(default)]
    pub dataset: Option<String>,
    /// Restrict the bug to these original hunk indices.
    #[serde(default)]
    pub hunks: Option<Vec<usize>>,
    /// Corrected start line keyed by original hunk index.
    #[serde(default)]
    pub line_start: BTreeMap<String, usize>,
    #[serde(default)]
    pub flaky: Vec<String>,
    #[serde(default)]
    pub compare: Option<Comparator>,
}

/// Values substituted into command and path templates.
#[derive(Debug, Clone)]
pub struct Placeholders {
    pub dir: PathBuf,
    pub bug: String,
    pub project: String,
    pub bug_number: String,
}

impl Placeholders {
    pub fn new(dir: &Path, bug: &BugId, separator: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            bug: bug.to_string(),
            project: bug.project(separator).to_string(),
            bug_number: bug.number(separator).to_string(),
        }
    }

    pub fn expand(&self, template: &str) -> String {
        template
            .replace("{dir}", &self.dir.to_string_lossy())
            .replace("{bug_number}", &self.bug_number)
            .replace("{project}", &self.project)
            .replace("{bug}", &self.bug)
    }

    pub fn expand_all(&self, templates: &[String]) -> Vec<String> {
        templates.iter().map(|t| self.expand(t)).collect()
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run config '{}'", path.display()))?;
        let mut config: RunConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse run config TOML '{}'", path.display()))?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RunConfig = toml::from_str(content).context("Failed to parse run config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// CLI flags take precedence over the file.
    pub fn apply_cli(&mut self, jobs: Option<usize>, timeout_secs: Option<u64>) -> Result<()> {
        if let Some(jobs) = jobs {
            self.run.jobs = jobs;
        }
        if let Some(secs) = timeout_secs {
            self.run.timeout_secs = secs;
        }
        self.validate()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.run.timeout_secs)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            strategy: self.run.strategy,
            joint_prepass: self.run.joint_prepass,
            timeout: self.timeout(),
            transform: self.run.candidate_transform,
        }
    }

    pub fn work_root(&self) -> PathBuf {
        self.paths.work_root.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("patchlab")
                .join("work")
        })
    }

    /// Overrides that apply to `bug` under this run's dataset.
    pub fn overrides_for<'a>(&'a self, bug: &'a BugId) -> impl Iterator<Item = &'a BugOverride> + 'a {
        self.overrides.iter().filter(move |o| {
            o.bug == bug.as_str()
                && o.dataset
                    .as_deref()
                    .map(|d| d == self.dataset)
                    .unwrap_or(true)
        })
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.paths.bugs);
        resolve(&mut self.paths.candidates);
        resolve(&mut self.paths.checkpoints);
        resolve(&mut self.paths.aggregate);
        if let Some(work_root) = self.paths.work_root.as_mut() {
            resolve(work_root);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.schema_version != 1 {
            return Err(anyhow!(
                "Unsupported run config schema_version={} (expected 1)",
                self.schema_version
            ));
        }
        if self.run.jobs == 0 {
            return Err(anyhow!("run.jobs must be at least 1"));
        }
        if self.run.timeout_secs == 0 {
            return Err(anyhow!("run.timeout_secs must be at least 1"));
        }
        if self.run.max_candidates_per_hunk == Some(0) {
            return Err(anyhow!("run.max_candidates_per_hunk must be at least 1 when set"));
        }

        for check in &self.toolchain {
            if check.program.trim().is_empty() {
                return Err(anyhow!("toolchain.program must not be empty"));
            }
            if let Some(pattern) = check.pattern.as_deref() {
                regex::Regex::new(pattern)
                    .with_context(|| format!("Invalid toolchain pattern '{}'", pattern))?;
            }
        }

        match self.checkout.kind {
            CheckoutKind::Command if is_blank(&self.checkout.command) => {
                return Err(anyhow!("checkout.command must not be empty for kind = \"command\""));
            }
            CheckoutKind::Copy
                if self
                    .checkout
                    .source
                    .as_deref()
                    .map(|s| s.trim().is_empty())
                    .unwrap_or(true) =>
            {
                return Err(anyhow!("checkout.source is required for kind = \"copy\""));
            }
            _ => {}
        }

        match self.runner.kind {
            RunnerKind::Suite => {
                let suite = self
                    .runner
                    .suite
                    .as_ref()
                    .ok_or_else(|| anyhow!("[runner.suite] is required for kind = \"suite\""))?;
                if is_blank(&suite.test) {
                    return Err(anyhow!("runner.suite.test must not be empty"));
                }
                if let Some(pattern) = suite.failing_test_pattern.as_deref() {
                    regex::Regex::new(pattern)
                        .with_context(|| format!("Invalid failing_test_pattern '{}'", pattern))?;
                }
                if suite.parser == ParserKind::Summary {
                    let pattern = suite.summary_pattern();
                    let re = regex::Regex::new(pattern)
                        .with_context(|| format!("Invalid summary pattern '{}'", pattern))?;
                    if re.captures_len() < 2 {
                        return Err(anyhow!(
                            "Summary pattern '{}' needs a capture group for the failed count",
                            pattern
                        ));
                    }
                }
            }
            RunnerKind::Io => {
                let io = self
                    .runner
                    .io
                    .as_ref()
                    .ok_or_else(|| anyhow!("[runner.io] is required for kind = \"io\""))?;
                if is_blank(&io.run) {
                    return Err(anyhow!("runner.io.run must not be empty"));
                }
                if io.input_prefix.trim().is_empty() {
                    return Err(anyhow!("runner.io.input_prefix must not be empty"));
                }
                if !io.reference_build.is_empty() && io.reference_run.is_empty() {
                    return Err(anyhow!(
                        "runner.io.reference_build is set but reference_run is empty"
                    ));
                }
            }
        }

        let mut seen: HashSet<(Option<&str>, &str)> = HashSet::new();
        for entry in &self.overrides {
            if entry.bug.trim().is_empty() {
                return Err(anyhow!("overrides.bug must not be empty"));
            }
            if !seen.insert((entry.dataset.as_deref(), entry.bug.as_str())) {
                return Err(anyhow!("Duplicate override for bug '{}'", entry.bug));
            }
            if matches!(entry.hunks.as_deref(), Some([])) {
                return Err(anyhow!("Override for '{}' selects no hunks", entry.bug));
            }
            for key in entry.line_start.keys() {
                key.parse::<usize>().map_err(|_| {
                    anyhow!(
                        "Override for '{}' has non-numeric line_start key '{}'",
                        entry.bug,
                        key
                    )
                })?;
            }
        }
        Ok(())
    }
}

fn is_blank(command: &[String]) -> bool {
    command.first().map(|p| p.trim().is_empty()).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUITE: &str = r#"
dataset = "defects4j"

[paths]
bugs = "bugs.jsonl"
candidates = "candidates.jsonl"
checkpoints = "checkpoints"
aggregate = "results.jsonl"

[run]
jobs = 4
timeout_secs = 300
strategy = "first-improvement"

[[toolchain]]
program = "java"
args = ["-version"]
pattern = 'version "([^"]+)"'
expect = "1.8"

[checkout]
kind = "command"
command = ["defects4j", "checkout", "-p", "{project}", "-v", "{bug_number}b", "-w", "{dir}"]
stale_locks = [".git/index.lock"]

[runner]
kind = "suite"

[runner.suite]
build = ["defects4j", "compile"]
test = ["defects4j", "test"]
clean = ["target/classes", "build"]

[[overrides]]
bug = "Gson 14"
hunks = [0, 2]
line_start = { "2" = 120 }
"#;

    #[test]
    fn parses_suite_config_with_defaults() {
        let config = RunConfig::from_toml_str(SUITE).unwrap();
        assert_eq!(config.run.jobs, 4);
        assert_eq!(config.timeout(), Duration::from_secs(300));
        assert_eq!(config.checkout.kind, CheckoutKind::Command);
        assert!(!config.run.joint_prepass);
        let suite = config.runner.suite.as_ref().unwrap();
        assert_eq!(suite.parser, ParserKind::Summary);
        assert_eq!(suite.summary_pattern(), DEFAULT_SUMMARY_PATTERN);
        assert_eq!(config.toolchain[0].expect.as_deref(), Some("1.8"));
    }

    #[test]
    fn cli_overrides_take_precedence() {
        let mut config = RunConfig::from_toml_str(SUITE).unwrap();
        config.apply_cli(Some(2), Some(60)).unwrap();
        assert_eq!(config.run.jobs, 2);
        assert_eq!(config.run.timeout_secs, 60);
        assert!(config.apply_cli(Some(0), None).is_err());
    }

    #[test]
    fn rejects_unknown_runner_kind() {
        let broken = SUITE.replace("kind = \"suite\"", "kind = \"mystery\"");
        assert!(RunConfig::from_toml_str(&broken).is_err());
    }

    #[test]
    fn rejects_empty_checkout_command() {
        let broken = SUITE.replace(
            "command = [\"defects4j\", \"checkout\", \"-p\", \"{project}\", \"-v\", \"{bug_number}b\", \"-w\", \"{dir}\"]",
            "command = []",
        );
        let err = RunConfig::from_toml_str(&broken).unwrap_err();
        assert!(err.to_string().contains("checkout.command"));
    }

    #[test]
    fn rejects_summary_pattern_without_group() {
        let broken = SUITE.replace(
            "clean = [\"target/classes\", \"build\"]",
            "clean = []\npattern = \"Failing tests\"",
        );
        assert!(RunConfig::from_toml_str(&broken).is_err());
    }

    #[test]
    fn placeholders_expand_every_field() {
        let vars = Placeholders::new(Path::new("/w/0/Chart_4"), &BugId::new("Chart 4"), "");
        assert_eq!(
            vars.expand_all(&["-p".into(), "{project}".into(), "{bug_number}b".into(), "{dir}".into()]),
            vec!["-p", "Chart", "4b", "/w/0/Chart_4"]
        );
        assert_eq!(vars.expand("{bug}"), "Chart 4");
    }

    #[test]
    fn overrides_scope_to_dataset() {
        let mut config = RunConfig::from_toml_str(SUITE).unwrap();
        let id = BugId::new("Gson 14");
        assert_eq!(config.overrides_for(&id).count(), 1);
        config.overrides[0].dataset = Some("bugsinpy".to_string());
        assert_eq!(config.overrides_for(&id).count(), 0);
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, SUITE).unwrap();
        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.paths.bugs, dir.path().join("bugs.jsonl"));
        assert_eq!(config.paths.checkpoints, dir.path().join("checkpoints"));
    }

    #[test]
    fn parses_io_runner() {
        let io = r#"
[paths]
bugs = "b.jsonl"
candidates = "c.jsonl"
checkpoints = "cp"
aggregate = "out.jsonl"

[checkout]
kind = "copy"
source = "/data/jsbugs/{bug}"

[runner]
kind = "io"

[runner.io]
run = ["node", "buggy.js"]
nonzero_exit = "uncompilable"
compare = "float:1e-10"
"#;
        let config = RunConfig::from_toml_str(io).unwrap();
        let io = config.runner.io.unwrap();
        assert_eq!(io.nonzero_exit, NonZeroExit::Uncompilable);
        assert_eq!(io.compare, Comparator::Float { tolerance: 1e-10 });
        assert_eq!(io.tests_dir, "{dir}/tests");
        assert_eq!(io.max_output_bytes, DEFAULT_MAX_OUTPUT_BYTES);
    }

    #[test]
    fn demo_configs_parse() {
        let d4j = RunConfig::from_toml_str(include_str!("../demos/defects4j.toml")).unwrap();
        assert_eq!(d4j.toolchain.len(), 2);
        assert_eq!(d4j.overrides_for(&BugId::new("Math 73")).count(), 1);
        let js = RunConfig::from_toml_str(include_str!("../demos/quixbugs-js.toml")).unwrap();
        assert_eq!(js.runner.kind, RunnerKind::Io);
        assert_eq!(BugId::new("p02386-91883").project(&js.run.project_separator), "p02386");
        assert_eq!(js.engine_options().transform, CandidateTransform::Verbatim);
        let py = RunConfig::from_toml_str(include_str!("../demos/bugsinpy.toml")).unwrap();
        assert_eq!(py.engine_options().transform, CandidateTransform::PythonReflow);
        assert_eq!(py.runner.suite.unwrap().parser, ParserKind::Pytest);
    }
}
