//! Working-copy creation for a bug (`ProjectLayout`).

use crate::config::{CheckoutConfig, CheckoutKind, Placeholders};
use crate::lab::runner::{run_command, CommandSpec};
use crate::model::{Bug, Hunk};
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

/// Produces a buggy working copy and maps hunk paths into it.
pub trait ProjectLayout: Send + Sync {
    fn checkout(&self, bug: &Bug, target: &Path) -> Result<()>;

    /// Hunks with `source_path` rewritten relative to the working copy root.
    fn resolve_hunks(&self, hunks: &[Hunk]) -> Vec<Hunk>;
}

pub fn build_layout(config: &CheckoutConfig, separator: &str) -> Result<Box<dyn ProjectLayout>> {
    let common = LayoutCommon {
        stale_locks: config.stale_locks.clone(),
        source_root: config.source_root.clone(),
        separator: separator.to_string(),
    };
    Ok(match config.kind {
        CheckoutKind::Command => {
            if config.command.is_empty() {
                return Err(anyhow!("checkout.command must not be empty"));
            }
            Box::new(CommandCheckout {
                command: config.command.clone(),
                timeout: Duration::from_secs(config.timeout_secs),
                common,
            })
        }
        CheckoutKind::Copy => {
            let source = config
                .source
                .clone()
                .ok_or_else(|| anyhow!("checkout.source is required for kind = \"copy\""))?;
            Box::new(CopyCheckout { source, common })
        }
    })
}

#[derive(Debug, Clone)]
struct LayoutCommon {
    stale_locks: Vec<String>,
    source_root: Option<String>,
    separator: String,
}

impl LayoutCommon {
    fn vars(&self, bug: &Bug, target: &Path) -> Placeholders {
        Placeholders::new(target, &bug.id, &self.separator)
    }

    /// Remove leftover lock files (e.g. `.git/index.lock`) from an interrupted run.
    fn clear_stale_locks(&self, vars: &Placeholders, target: &Path) -> Result<()> {
        for lock in &self.stale_locks {
            let expanded = PathBuf::from(vars.expand(lock));
            let path = if expanded.is_absolute() {
                expanded
            } else {
                target.join(expanded)
            };
            if path.is_file() {
                std::fs::remove_file(&path).with_context(|| {
                    format!("Failed to remove stale lock '{}'", path.display())
                })?;
                tracing::debug!(lock = %path.display(), "removed stale lock");
            }
        }
        Ok(())
    }

    fn resolve_hunks(&self, hunks: &[Hunk]) -> Vec<Hunk> {
        let Some(root) = self.source_root.as_deref().filter(|r| !r.is_empty()) else {
            return hunks.to_vec();
        };
        hunks
            .iter()
            .map(|hunk| Hunk {
                source_path: Path::new(root)
                    .join(&hunk.source_path)
                    .to_string_lossy()
                    .into_owned(),
                ..hunk.clone()
            })
            .collect()
    }
}

/// Runs an external checkout tool, e.g. a benchmark's `checkout` subcommand.
pub struct CommandCheckout {
    command: Vec<String>,
    timeout: Duration,
    common: LayoutCommon,
}

impl ProjectLayout for CommandCheckout {
    fn checkout(&self, bug: &Bug, target: &Path) -> Result<()> {
        let vars = self.common.vars(bug, target);
        let cwd = target.parent().unwrap_or(target);
        let spec = CommandSpec::from_template("checkout", cwd, &self.command, &vars)?
            .timeout(self.timeout);
        let outcome = run_command(&spec);
        if !outcome.success {
            return Err(anyhow!(
                "Checkout of '{}' failed ({}){}:\n{}",
                bug.id,
                outcome.command,
                if outcome.timed_out { " after timeout" } else { "" },
                outcome.note.unwrap_or(outcome.stderr_tail)
            ));
        }
        if !target.is_dir() {
            return Err(anyhow!(
                "Checkout of '{}' did not create '{}'",
                bug.id,
                target.display()
            ));
        }
        self.common.clear_stale_locks(&vars, target)
    }

    fn resolve_hunks(&self, hunks: &[Hunk]) -> Vec<Hunk> {
        self.common.resolve_hunks(hunks)
    }
}

/// Copies a per-bug directory tree, skipping dot-files.
pub struct CopyCheckout {
    source: String,
    common: LayoutCommon,
}

impl ProjectLayout for CopyCheckout {
    fn checkout(&self, bug: &Bug, target: &Path) -> Result<()> {
        let vars = self.common.vars(bug, target);
        let source = PathBuf::from(vars.expand(&self.source));
        if !source.is_dir() {
            return Err(anyhow!(
                "Source directory '{}' for '{}' does not exist",
                source.display(),
                bug.id
            ));
        }
        copy_tree(&source, target)?;
        self.common.clear_stale_locks(&vars, target)
    }

    fn resolve_hunks(&self, hunks: &[Hunk]) -> Vec<Hunk> {
        self.common.resolve_hunks(hunks)
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

pub fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    std::fs::create_dir_all(target)
        .with_context(|| format!("Failed to create '{}'", target.display()))?;
    for entry in WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
    {
        let entry =
            entry.with_context(|| format!("Failed to walk source tree '{}'", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("Unexpected path '{}'", entry.path().display()))?;
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)
                .with_context(|| format!("Failed to create '{}'", destination.display()))?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &destination).with_context(|| {
                format!(
                    "Failed to copy '{}' to '{}'",
                    entry.path().display(),
                    destination.display()
                )
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckoutConfig;
    use crate::model::BugId;
    use tempfile::tempdir;

    fn bug(id: &str) -> Bug {
        Bug {
            id: BugId::new(id),
            hunks: vec![Hunk {
                index: 0,
                source_path: "buggy.js".to_string(),
                removed_line_start: 1,
                removed_line_count: 1,
                added_text: "x".to_string(),
                removed_text: None,
            }],
        }
    }

    fn copy_config(source: &str) -> CheckoutConfig {
        CheckoutConfig {
            kind: CheckoutKind::Copy,
            command: Vec::new(),
            source: Some(source.to_string()),
            stale_locks: vec!["index.lock".to_string()],
            source_root: None,
            timeout_secs: 30,
        }
    }

    #[test]
    fn copy_checkout_skips_dot_files() {
        let data = tempdir().unwrap();
        let bug_dir = data.path().join("p02386-91883");
        std::fs::create_dir_all(bug_dir.join(".cache")).unwrap();
        std::fs::create_dir_all(bug_dir.join("tests")).unwrap();
        std::fs::write(bug_dir.join("buggy.js"), "console.log(1)\n").unwrap();
        std::fs::write(bug_dir.join("tests/input1"), "1\n").unwrap();
        std::fs::write(bug_dir.join(".cache/blob"), "x").unwrap();
        std::fs::write(bug_dir.join(".hidden"), "x").unwrap();

        let template = format!("{}/{{bug}}", data.path().display());
        let layout = build_layout(&copy_config(&template), "-").unwrap();
        let work = tempdir().unwrap();
        let target = work.path().join("copy");
        layout.checkout(&bug("p02386-91883"), &target).unwrap();

        assert!(target.join("buggy.js").is_file());
        assert!(target.join("tests/input1").is_file());
        assert!(!target.join(".cache").exists());
        assert!(!target.join(".hidden").exists());
    }

    #[test]
    fn copy_checkout_removes_stale_locks() {
        let data = tempdir().unwrap();
        std::fs::write(data.path().join("buggy.js"), "x\n").unwrap();
        std::fs::write(data.path().join("index.lock"), "").unwrap();
        let layout = build_layout(&copy_config(&data.path().to_string_lossy()), "").unwrap();
        let work = tempdir().unwrap();
        let target = work.path().join("copy");
        layout.checkout(&bug("b"), &target).unwrap();
        assert!(!target.join("index.lock").exists());
    }

    #[test]
    fn missing_copy_source_is_an_error() {
        let layout = build_layout(&copy_config("/nonexistent/patchlab/{bug}"), "").unwrap();
        let work = tempdir().unwrap();
        let err = layout.checkout(&bug("b"), &work.path().join("c")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn source_root_prefixes_hunk_paths() {
        let mut config = copy_config("/x");
        config.source_root = Some("src/main/java".to_string());
        let layout = build_layout(&config, "").unwrap();
        let hunks = layout.resolve_hunks(&bug("b").hunks);
        assert_eq!(hunks[0].source_path, "src/main/java/buggy.js");
    }

    #[cfg(unix)]
    #[test]
    fn command_checkout_runs_template_in_worker_dir() {
        let work = tempdir().unwrap();
        let target = work.path().join("Lang_1");
        let config = CheckoutConfig {
            kind: CheckoutKind::Command,
            command: vec![
                "sh".into(),
                "-c".into(),
                "mkdir -p {dir} && echo '{project}/{bug_number}' > {dir}/id.txt".into(),
            ],
            source: None,
            stale_locks: Vec::new(),
            source_root: None,
            timeout_secs: 30,
        };
        let layout = build_layout(&config, "").unwrap();
        layout.checkout(&bug("Lang 1"), &target).unwrap();
        let id = std::fs::read_to_string(target.join("id.txt")).unwrap();
        assert_eq!(id.trim(), "Lang/1");
    }

    #[cfg(unix)]
    #[test]
    fn command_checkout_removes_locks_left_in_checked_out_repo() {
        let work = tempdir().unwrap();
        let target = work.path().join("Chart_4");
        let config = CheckoutConfig {
            kind: CheckoutKind::Command,
            command: vec![
                "sh".into(),
                "-c".into(),
                "mkdir -p {dir}/.git && touch {dir}/.git/index.lock {dir}/.git/HEAD".into(),
            ],
            source: None,
            stale_locks: vec![".git/index.lock".into()],
            source_root: None,
            timeout_secs: 30,
        };
        let layout = build_layout(&config, "").unwrap();
        layout.checkout(&bug("Chart 4"), &target).unwrap();
        assert!(!target.join(".git/index.lock").exists());
        assert!(target.join(".git/HEAD").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn failing_checkout_command_is_an_error() {
        let work = tempdir().unwrap();
        let config = CheckoutConfig {
            kind: CheckoutKind::Command,
            command: vec!["sh".into(), "-c".into(), "echo nope 1>&2; exit 2".into()],
            source: None,
            stale_locks: Vec::new(),
            source_root: None,
            timeout_secs: 30,
        };
        let layout = build_layout(&config, "").unwrap();
        let err = layout
            .checkout(&bug("Lang 1"), &work.path().join("x"))
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
