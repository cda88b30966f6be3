use crate::config::Placeholders;
use crate::util::{run_command_with_limits, tail_chars};
use anyhow::{anyhow, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const OUTPUT_TAIL_MAX_CHARS: usize = 8_000;

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
    pub stdin: Option<PathBuf>,
    pub max_stdout_bytes: usize,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, cwd: impl AsRef<Path>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.as_ref().to_path_buf(),
            timeout: Duration::from_secs(600),
            env: Vec::new(),
            stdin: None,
            max_stdout_bytes: usize::MAX,
        }
    }

    /// Build from a `[program, args...]` template with placeholders expanded.
    pub fn from_template(
        name: impl Into<String>,
        cwd: impl AsRef<Path>,
        template: &[String],
        vars: &Placeholders,
    ) -> Result<Self> {
        let mut expanded = vars.expand_all(template).into_iter();
        let program = expanded
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| anyhow!("Command template is empty"))?;
        let mut spec = Self::new(name, cwd, program);
        spec.args = expanded.collect();
        Ok(spec)
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout_secs(self, secs: u64) -> Self {
        self.timeout(Duration::from_secs(secs))
    }

    pub fn with_env_overrides<'a>(
        mut self,
        env: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Self {
        self.env
            .extend(env.into_iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn stdin_file(mut self, path: impl AsRef<Path>) -> Self {
        self.stdin = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn max_stdout_bytes(mut self, limit: usize) -> Self {
        self.max_stdout_bytes = limit;
        self
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub name: String,
    pub command: String,
    pub duration_ms: u64,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr_tail: String,
    /// Set when the process could not be started at all.
    pub note: Option<String>,
}

impl CommandOutcome {
    pub fn stdout_tail(&self) -> String {
        tail_chars(&self.stdout, OUTPUT_TAIL_MAX_CHARS)
    }
}

pub fn run_command(spec: &CommandSpec) -> CommandOutcome {
    let start = Instant::now();
    let command_label = spec.label();
    let failed_to_start = |note: String| CommandOutcome {
        name: spec.name.clone(),
        command: command_label.clone(),
        duration_ms: start.elapsed().as_millis() as u64,
        success: false,
        exit_code: None,
        timed_out: false,
        stdout: String::new(),
        stdout_truncated: false,
        stderr_tail: String::new(),
        note: Some(note),
    };

    let mut command = Command::new(&spec.program);
    command.current_dir(&spec.cwd).args(&spec.args);
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    match spec.stdin.as_ref() {
        Some(path) => match File::open(path) {
            Ok(file) => {
                command.stdin(Stdio::from(file));
            }
            Err(e) => {
                return failed_to_start(format!(
                    "Failed to open stdin file '{}': {}",
                    path.display(),
                    e
                ))
            }
        },
        None => {
            command.stdin(Stdio::null());
        }
    }

    match run_command_with_limits(&mut command, spec.timeout, spec.max_stdout_bytes) {
        Ok(result) => CommandOutcome {
            name: spec.name.clone(),
            command: command_label.clone(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: result.success(),
            exit_code: result.exit_code(),
            timed_out: result.timed_out,
            stdout_truncated: result.stdout_truncated,
            stderr_tail: tail_chars(&result.stderr, OUTPUT_TAIL_MAX_CHARS),
            stdout: result.stdout,
            note: None,
        },
        Err(error) => failed_to_start(error),
    }
}
