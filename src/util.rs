use std::io::{BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Time allowed after the deadline for pipes of a killed group to close.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Keep only the last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect::<String>()
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Set when stdout exceeded the capture limit and the remainder was discarded.
    pub stdout_truncated: bool,
}

impl CommandRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

/// Run `command` to completion or until `timeout` elapses.
///
/// The child is started in its own process group so that a timeout kills every
/// descendant (compilers, JVMs, test forks), not just the direct child. The
/// group is also killed after a normal exit, and output collection shares the
/// same deadline: a descendant that escaped the group and still holds a pipe
/// makes the run time out instead of blocking. At most `max_stdout_bytes` of
/// stdout are kept; the rest is drained and dropped so the child never blocks
/// on a full pipe.
pub fn run_command_with_limits(
    command: &mut Command,
    timeout: Duration,
    max_stdout_bytes: usize,
) -> Result<CommandRunResult, String> {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        command.process_group(0);
    }

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;

    let (stdout_tx, stdout_rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = stdout_tx.send(read_capped(stdout, max_stdout_bytes));
    });
    let (stderr_tx, stderr_rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(stderr);
        let _ = reader.read_to_end(&mut buf);
        let _ = stderr_tx.send(buf);
    });

    let start = Instant::now();
    let deadline = start + timeout;
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                kill_process_group(&child);
                break Some(status);
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    timed_out = true;
                    kill_process_tree(&mut child);
                    match child.wait() {
                        Ok(status) => break Some(status),
                        Err(_) => break None,
                    }
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                kill_process_tree(&mut child);
                return Err(format!("Failed to wait for command: {}", e));
            }
        }
    };

    let drain_until = deadline.max(Instant::now()) + PIPE_DRAIN_GRACE;
    let (stdout_bytes, stdout_truncated) = match recv_until(&stdout_rx, drain_until) {
        Some(captured) => captured,
        None => {
            timed_out = true;
            (Vec::new(), false)
        }
    };
    let stderr_bytes = recv_until(&stderr_rx, drain_until).unwrap_or_else(|| {
        timed_out = true;
        Vec::new()
    });

    Ok(CommandRunResult {
        status,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
        stdout_truncated,
    })
}

/// `None` when the reader is still blocked at `until`.
fn recv_until<T: Default>(rx: &Receiver<T>, until: Instant) -> Option<T> {
    match rx.recv_timeout(until.saturating_duration_since(Instant::now())) {
        Ok(value) => Some(value),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(T::default()),
    }
}

fn read_capped(stream: impl Read, limit: usize) -> (Vec<u8>, bool) {
    let mut reader = BufReader::new(stream);
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    (kept, truncated)
}

/// SIGKILL whatever is left in the child's process group.
fn kill_process_group(child: &Child) {
    #[cfg(unix)]
    {
        if let Ok(pid) = i32::try_from(child.id()) {
            unsafe {
                let _ = libc::killpg(pid, libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = child;
}

/// Kill the child together with its process group.
fn kill_process_tree(child: &mut Child) {
    kill_process_group(child);
    let _ = child.kill();
}

/// FNV-1a 64-bit; stable across runs and platforms.
pub fn stable_hash(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Eight hex digits identifying `text`, for file-name disambiguation.
pub fn short_hash(text: &str) -> String {
    format!("{:016x}", stable_hash(text.as_bytes()))[..8].to_string()
}

/// Collapse every whitespace run to a single space and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
