use crate::model::BugId;
use crate::util::short_hash;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Per-bug scratch directory inside a worker's private area.
///
/// Layout: `<work_root>/worker-<index>/<bug>`. The directory is removed when the
/// session is dropped, whether validation succeeded or not.
#[derive(Debug)]
pub struct SandboxSession {
    path: PathBuf,
}

impl SandboxSession {
    pub fn create(work_root: &Path, worker: usize, bug: &BugId) -> Result<Self> {
        let worker_root = work_root.join(format!("worker-{}", worker));
        let path = worker_root.join(file_stem_for(bug));

        std::fs::create_dir_all(&worker_root).with_context(|| {
            format!(
                "Failed to create worker directory '{}'",
                worker_root.display()
            )
        })?;

        if path.exists() {
            std::fs::remove_dir_all(&path).with_context(|| {
                format!("Failed to clear stale bug directory '{}'", path.display())
            })?;
        }

        Ok(Self { path })
    }

    /// Directory the working copy is checked out into. Not created yet, so
    /// checkout tools that insist on a fresh target can create it themselves.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cleanup(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_dir_all(&self.path).with_context(|| {
                format!("Failed to remove bug directory '{}'", self.path.display())
            })?;
        }
        Ok(())
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        if let Err(err) = self.cleanup() {
            tracing::warn!(path = %self.path.display(), "{err:#}");
        }
    }
}

/// Filesystem-safe, collision-free name for a bug id.
///
/// Ids that are already safe map to themselves; others get a hash suffix so
/// `"Chart 4"` and `"Chart_4"` never share a file.
pub fn file_stem_for(bug: &BugId) -> String {
    let cleaned = sanitize_component(bug.as_str());
    if cleaned == bug.as_str() {
        cleaned
    } else {
        format!("{}-{}", cleaned, short_hash(bug.as_str()))
    }
}

pub fn sanitize_component(input: &str) -> String {
    let cleaned = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "bug".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sandbox_lifecycle_creates_and_cleans_bug_dir() {
        let root = tempdir().unwrap();
        let bug = BugId::new("Chart 4");
        let path = {
            let session = SandboxSession::create(root.path(), 3, &bug).unwrap();
            std::fs::create_dir_all(session.path().join("src")).unwrap();
            std::fs::write(session.path().join("src/A.java"), "class A {}").unwrap();
            assert!(session.path().starts_with(root.path().join("worker-3")));
            session.path().to_path_buf()
        };
        assert!(!path.exists());
        assert!(root.path().join("worker-3").exists());
    }

    #[test]
    fn create_clears_leftovers_from_a_crashed_run() {
        let root = tempdir().unwrap();
        let bug = BugId::new("Lang-1");
        let stale = root.path().join("worker-0").join("Lang-1");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("junk"), "x").unwrap();

        let session = SandboxSession::create(root.path(), 0, &bug).unwrap();
        assert_eq!(session.path(), stale);
        assert!(!stale.exists());
    }

    #[test]
    fn file_stems_do_not_collide() {
        let a = file_stem_for(&BugId::new("Chart 4"));
        let b = file_stem_for(&BugId::new("Chart_4"));
        assert_ne!(a, b);
        assert_eq!(b, "Chart_4");
        assert!(a.starts_with("Chart_4-"));
        assert_eq!(sanitize_component("../.."), "_");
        assert_eq!(sanitize_component("..."), "bug");
    }
}
