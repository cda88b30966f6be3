//! Batch dispatch: project-disjoint partitions run one after another, bugs
//! inside a partition run in parallel on a bounded worker pool.

use crate::checkpoint::CheckpointStore;
use crate::config::RunConfig;
use crate::dataset::overrides::apply_overrides;
use crate::dataset::CandidateStore;
use crate::engine::verdict::Verdict;
use crate::engine::Validator;
use crate::lab::checkout::ProjectLayout;
use crate::lab::sandbox::SandboxSession;
use crate::model::{Bug, BugId};
use crate::runner::TestRunner;
use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use rayon::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Started { bug: BugId, worker: usize },
    /// Already checkpointed, or nothing to try.
    Skipped { bug: BugId, reason: &'static str },
    Finished {
        bug: BugId,
        worker: usize,
        verdict: Option<Verdict>,
    },
    /// The bug gets no checkpoint; the batch continues.
    Failed {
        bug: BugId,
        worker: usize,
        error: String,
    },
}

#[derive(Debug, Default)]
struct Counters {
    skipped: AtomicUsize,
    finished: AtomicUsize,
    plausible: AtomicUsize,
    failed: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub partitions: usize,
    pub skipped: usize,
    pub finished: usize,
    pub plausible: usize,
    pub failed: usize,
}

/// Round-robin over project groups: partition `k` holds the `k`-th bug of every
/// project that has one. No partition contains two bugs of one project.
pub fn partition_by_project<'a>(bugs: &[&'a Bug], separator: &str) -> Vec<Vec<&'a Bug>> {
    let mut groups: IndexMap<&str, Vec<&'a Bug>> = IndexMap::new();
    for bug in bugs {
        groups.entry(bug.id.project(separator)).or_default().push(bug);
    }
    let depth = groups.values().map(Vec::len).max().unwrap_or(0);
    (0..depth)
        .map(|k| groups.values().filter_map(|g| g.get(k).copied()).collect())
        .collect()
}

pub struct Dispatcher<'a> {
    pub config: &'a RunConfig,
    pub layout: &'a dyn ProjectLayout,
    pub runner: &'a dyn TestRunner,
    pub candidates: &'a CandidateStore,
    pub store: &'a CheckpointStore,
}

impl Dispatcher<'_> {
    pub fn run(
        &self,
        bugs: &IndexMap<BugId, Bug>,
        progress: &(dyn Fn(&ProgressEvent) + Sync),
    ) -> Result<DispatchStats> {
        let counters = Counters::default();

        let mut pending = Vec::new();
        for bug in bugs.values() {
            if self.store.exists(&bug.id) {
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                progress(&ProgressEvent::Skipped {
                    bug: bug.id.clone(),
                    reason: "checkpoint exists",
                });
            } else if !self.candidates.contains_bug(&bug.id) {
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                progress(&ProgressEvent::Skipped {
                    bug: bug.id.clone(),
                    reason: "no candidates",
                });
            } else {
                pending.push(bug);
            }
        }

        let partitions = partition_by_project(&pending, &self.config.run.project_separator);
        let jobs = self.config.run.jobs.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("patchlab-worker-{i}"))
            .build()
            .context("Failed to start worker pool")?;
        let work_root = self.config.work_root();
        info!(
            bugs = pending.len(),
            partitions = partitions.len(),
            jobs,
            work_root = %work_root.display(),
            "dispatching"
        );

        for (index, partition) in partitions.iter().enumerate() {
            info!(partition = index, bugs = partition.len(), "partition started");
            pool.install(|| {
                partition.par_iter().for_each(|bug| {
                    let worker = rayon::current_thread_index().unwrap_or(0);
                    self.run_one(bug, worker, &work_root, &counters, progress);
                })
            });
        }

        Ok(DispatchStats {
            partitions: partitions.len(),
            skipped: counters.skipped.into_inner(),
            finished: counters.finished.into_inner(),
            plausible: counters.plausible.into_inner(),
            failed: counters.failed.into_inner(),
        })
    }

    fn run_one(
        &self,
        bug: &Bug,
        worker: usize,
        work_root: &std::path::Path,
        counters: &Counters,
        progress: &(dyn Fn(&ProgressEvent) + Sync),
    ) {
        progress(&ProgressEvent::Started {
            bug: bug.id.clone(),
            worker,
        });
        let result = catch_unwind(AssertUnwindSafe(|| self.validate(bug, worker, work_root)))
            .unwrap_or_else(|payload| Err(anyhow!("worker panicked: {}", panic_message(&payload))));

        match result {
            Ok(verdict) => {
                counters.finished.fetch_add(1, Ordering::Relaxed);
                if verdict.is_some_and(Verdict::is_plausible) {
                    counters.plausible.fetch_add(1, Ordering::Relaxed);
                }
                progress(&ProgressEvent::Finished {
                    bug: bug.id.clone(),
                    worker,
                    verdict,
                });
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(bug = %bug.id, worker, "{err:#}");
                progress(&ProgressEvent::Failed {
                    bug: bug.id.clone(),
                    worker,
                    error: format!("{err:#}"),
                });
            }
        }
    }

    fn validate(&self, bug: &Bug, worker: usize, work_root: &std::path::Path) -> Result<Option<Verdict>> {
        let (bug, hints) = apply_overrides(bug, self.config.overrides_for(&bug.id))?;
        let sandbox = SandboxSession::create(work_root, worker, &bug.id)?;
        let validator = Validator {
            layout: self.layout,
            runner: self.runner,
            candidates: self.candidates,
            options: self.config.engine_options(),
        };
        let record = validator.validate_bug(&bug, &hints, sandbox.path())?;
        self.store.write(&record)?;
        Ok(record.winner.map(|w| w.verdict))
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::checkout::build_layout;
    use crate::model::{Candidate, Hunk};
    use crate::runner::{RunnerHints, TestSession};
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn bug(id: &str) -> Bug {
        Bug {
            id: BugId::new(id),
            hunks: vec![Hunk {
                index: 0,
                source_path: "Main.java".into(),
                removed_line_start: 1,
                removed_line_count: 1,
                added_text: "ok();".into(),
                removed_text: Some("bad();".into()),
            }],
        }
    }

    #[test]
    fn partitions_never_share_a_project() {
        let bugs: Vec<Bug> = ["Chart 1", "Chart 2", "Lang 1", "Chart 3", "Math 1", "Lang 2"]
            .into_iter()
            .map(bug)
            .collect();
        let refs: Vec<&Bug> = bugs.iter().collect();
        let partitions = partition_by_project(&refs, "");
        let ids: Vec<Vec<&str>> = partitions
            .iter()
            .map(|p| p.iter().map(|b| b.id.as_str()).collect())
            .collect();
        assert_eq!(
            ids,
            vec![
                vec!["Chart 1", "Lang 1", "Math 1"],
                vec!["Chart 2", "Lang 2"],
                vec!["Chart 3"],
            ]
        );
    }

    /// Passes once `bad()` is gone; counts invocations and optionally panics.
    struct FileRunner {
        calls: Mutex<Vec<String>>,
        panic_on: Option<&'static str>,
    }

    struct FileSession {
        root: std::path::PathBuf,
    }

    impl TestRunner for FileRunner {
        fn name(&self) -> &'static str {
            "file"
        }

        fn prepare(&self, bug: &BugId, root: &Path, _hints: &RunnerHints) -> Result<Box<dyn TestSession>> {
            self.calls.lock().unwrap().push(bug.to_string());
            if self.panic_on == Some(bug.as_str()) {
                panic!("runner blew up");
            }
            Ok(Box::new(FileSession {
                root: root.to_path_buf(),
            }))
        }
    }

    impl TestSession for FileSession {
        fn run(&mut self, _timeout: Duration) -> Verdict {
            let text = std::fs::read_to_string(self.root.join("Main.java")).unwrap_or_default();
            Verdict::compilable(text.matches("bad()").count() as u32)
        }
    }

    struct Fixture {
        _data: TempDir,
        work: TempDir,
        config: RunConfig,
        bugs: IndexMap<BugId, Bug>,
        candidates: CandidateStore,
    }

    fn fixture(ids: &[&str]) -> Fixture {
        let data = tempfile::tempdir().unwrap();
        std::fs::write(data.path().join("Main.java"), "bad();\n").unwrap();
        let work = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
[paths]
bugs = "bugs.jsonl"
candidates = "candidates.jsonl"
checkpoints = "{ck}"
work_root = "{work}"
aggregate = "all.jsonl"

[run]
jobs = 2

[checkout]
kind = "copy"
source = "{src}"

[runner]
kind = "suite"

[runner.suite]
test = ["true"]
"#,
            ck = work.path().join("ck").display(),
            work = work.path().join("w").display(),
            src = data.path().display(),
        );
        let config = RunConfig::from_toml_str(&toml).unwrap();
        let mut bugs = IndexMap::new();
        let mut candidates = CandidateStore::default();
        for id in ids {
            let b = bug(id);
            candidates.insert(
                b.id.clone(),
                0,
                vec![Candidate {
                    text: "ok();".into(),
                    rank: 0,
                    score: 0.0,
                    exact_match: true,
                    same_as_source: false,
                    origin: None,
                }],
            );
            bugs.insert(b.id.clone(), b);
        }
        Fixture {
            _data: data,
            work,
            config,
            bugs,
            candidates,
        }
    }

    fn dispatch(f: &Fixture, runner: &FileRunner, events: &Mutex<Vec<ProgressEvent>>) -> DispatchStats {
        let layout = build_layout(&f.config.checkout, "").unwrap();
        let store = CheckpointStore::open(&f.config.paths.checkpoints).unwrap();
        let dispatcher = Dispatcher {
            config: &f.config,
            layout: layout.as_ref(),
            runner,
            candidates: &f.candidates,
            store: &store,
        };
        dispatcher
            .run(&f.bugs, &|event| events.lock().unwrap().push(event.clone()))
            .unwrap()
    }

    #[test]
    fn validates_every_bug_and_cleans_work_dirs() {
        let f = fixture(&["Chart 1", "Chart 2", "Lang 1"]);
        let runner = FileRunner {
            calls: Mutex::new(Vec::new()),
            panic_on: None,
        };
        let events = Mutex::new(Vec::new());
        let stats = dispatch(&f, &runner, &events);

        assert_eq!(stats.partitions, 2);
        assert_eq!(stats.finished, 3);
        assert_eq!(stats.plausible, 3);
        let store = CheckpointStore::open_shared(&f.config.paths.checkpoints).unwrap();
        assert_eq!(store.read_all().unwrap().len(), 3);

        // per-bug directories are gone, worker directories remain
        for entry in std::fs::read_dir(f.work.path().join("w")).unwrap() {
            let worker = entry.unwrap().path();
            assert_eq!(std::fs::read_dir(&worker).unwrap().count(), 0);
        }
    }

    #[test]
    fn existing_checkpoint_is_never_revalidated() {
        let f = fixture(&["Chart 1", "Lang 1"]);
        let first = FileRunner {
            calls: Mutex::new(Vec::new()),
            panic_on: None,
        };
        dispatch(&f, &first, &Mutex::new(Vec::new()));
        let path = {
            let store = CheckpointStore::open_shared(&f.config.paths.checkpoints).unwrap();
            store.path_for(&BugId::new("Chart 1"))
        };
        let before = std::fs::read(&path).unwrap();

        let second = FileRunner {
            calls: Mutex::new(Vec::new()),
            panic_on: None,
        };
        let events = Mutex::new(Vec::new());
        let stats = dispatch(&f, &second, &events);
        assert!(second.calls.lock().unwrap().is_empty());
        assert_eq!(stats.skipped, 2);
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .all(|e| matches!(e, ProgressEvent::Skipped { .. })));
    }

    #[test]
    fn panicking_bug_does_not_stop_the_batch() {
        let f = fixture(&["Chart 1", "Lang 1"]);
        let runner = FileRunner {
            calls: Mutex::new(Vec::new()),
            panic_on: Some("Chart 1"),
        };
        let events = Mutex::new(Vec::new());
        let stats = dispatch(&f, &runner, &events);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.finished, 1);

        let store = CheckpointStore::open_shared(&f.config.paths.checkpoints).unwrap();
        assert!(!store.exists(&BugId::new("Chart 1")));
        assert!(store.exists(&BugId::new("Lang 1")));
        assert!(events.lock().unwrap().iter().any(|e| matches!(
            e,
            ProgressEvent::Failed { bug, error, .. }
                if bug.as_str() == "Chart 1" && error.contains("runner blew up")
        )));
    }

    #[test]
    fn bugs_without_candidates_are_skipped() {
        let mut f = fixture(&["Chart 1"]);
        let extra = bug("Time 3");
        f.bugs.insert(extra.id.clone(), extra);
        let runner = FileRunner {
            calls: Mutex::new(Vec::new()),
            panic_on: None,
        };
        let events = Mutex::new(Vec::new());
        let stats = dispatch(&f, &runner, &events);
        assert_eq!(stats.skipped, 1);
        assert_eq!(*runner.calls.lock().unwrap(), vec!["Chart 1".to_string()]);
        assert!(events.lock().unwrap().contains(&ProgressEvent::Skipped {
            bug: BugId::new("Time 3"),
            reason: "no candidates",
        }));
    }
}
