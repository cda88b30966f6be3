//! Per-bug checkpoint files.
//!
//! One JSON file per bug, written once through a temp file and a rename. A file's
//! existence marks its bug as done, which is the only resume mechanism.

use crate::lab::sandbox::file_stem_for;
use crate::model::{BugId, CheckpointRecord};
use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const LOCK_FILE: &str = ".lock";
const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;
const CHECKPOINT_EXT: &str = "json";

struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// A checkpoint directory, locked for the lifetime of the value.
pub struct CheckpointStore {
    dir: PathBuf,
    _lock: StoreLock,
}

impl CheckpointStore {
    /// Open for a validation batch. Holds an exclusive lock so two batches
    /// never share one directory.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create checkpoint dir '{}'", dir.display()))?;
        let lock = lock_dir(dir, true)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
        })
    }

    /// Open an existing directory for reading only.
    pub fn open_shared(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(anyhow!("Checkpoint dir '{}' does not exist", dir.display()));
        }
        let lock = lock_dir(dir, false)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, bug: &BugId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", file_stem_for(bug), CHECKPOINT_EXT))
    }

    pub fn exists(&self, bug: &BugId) -> bool {
        self.path_for(bug).is_file()
    }

    /// Persist `record`. Returns `false` without touching anything when the bug
    /// already has a checkpoint.
    pub fn write(&self, record: &CheckpointRecord) -> Result<bool> {
        let path = self.path_for(&record.bug_id);
        if path.exists() {
            debug!(bug = %record.bug_id, "checkpoint already present");
            return Ok(false);
        }
        let mut content = serde_json::to_string(record)
            .with_context(|| format!("Failed to serialize checkpoint for '{}'", record.bug_id))?;
        content.push('\n');
        write_atomic(&path, content.as_bytes())
            .with_context(|| format!("Failed to write checkpoint '{}'", path.display()))?;
        Ok(true)
    }

    /// Every readable checkpoint, sorted by bug id. Corrupt files are logged and
    /// left in place.
    pub fn read_all(&self) -> Result<Vec<CheckpointRecord>> {
        let mut records = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list '{}'", self.dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXT) || !path.is_file() {
                continue;
            }
            match read_record(&path) {
                Ok(record) => records.push(record),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable checkpoint"),
            }
        }
        records.sort_by(|a, b| a.bug_id.cmp(&b.bug_id));
        Ok(records)
    }
}

fn read_record(path: &Path) -> Result<CheckpointRecord> {
    let content = fs::read_to_string(path)?;
    let record = serde_json::from_str(content.trim())?;
    Ok(record)
}

fn lock_dir(dir: &Path, exclusive: bool) -> Result<StoreLock> {
    let lock_path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("Failed to open '{}'", lock_path.display()))?;

    let start = Instant::now();
    loop {
        let result = if exclusive {
            FileExt::try_lock_exclusive(&file)
        } else {
            FileExt::try_lock_shared(&file)
        };
        match result {
            Ok(()) => return Ok(StoreLock { file }),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                    return Err(anyhow!(
                        "Checkpoint dir '{}' is in use by another run",
                        dir.display()
                    ));
                }
                std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Write through a uniquely named temp file in the same directory, then rename.
fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid checkpoint path '{}'", path.display()))?;
    let tmp_path = path.with_file_name(format!(".{}.tmp-{}", name, uuid::Uuid::new_v4()));

    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}
