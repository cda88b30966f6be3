//! Patch validation engine.
//!
//! [`Validator::validate_bug`] checks a bug out, captures pristine sources, and
//! hands a [`TrialRunner`] to the single- or multi-hunk search. The search code
//! only sees selections and verdicts, never the filesystem.

pub mod multi;
pub mod single;
pub mod verdict;


use crate::apply::PristineSources;
use crate::dataset::CandidateStore;
use crate::lab::checkout::ProjectLayout;
use crate::model::{
    AttemptRecord, Assignment, Bug, Candidate, CheckpointRecord, Hunk, HunkChoice, SearchMode,
};
use crate::reflow::CandidateTransform;
use crate::runner::{RunnerHints, TestRunner, TestSession};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use verdict::Verdict;

/// How the multi-hunk search decides a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchStrategy {
    /// Fix the first candidate that lowers the failed count.
    #[default]
    FirstImprovement,
    /// Try every candidate and fix the lowest count; ties go to the better rank.
    BestImprovement,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub strategy: SearchStrategy,
    pub joint_prepass: bool,
    pub timeout: Duration,
    pub transform: CandidateTransform,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            strategy: SearchStrategy::default(),
            joint_prepass: false,
            timeout: Duration::from_secs(300),
            transform: CandidateTransform::default(),
        }
    }
}

/// What goes into one hunk for a trial, aligned with the bug's hunk list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Selection<'a> {
    Original,
    Candidate(&'a Candidate),
}

/// Applies a full selection and reports the resulting verdict.
pub trait TrialRunner {
    fn run_trial(&mut self, selection: &[Selection<'_>]) -> Result<Verdict>;
}

/// Result of a search before it is stamped into a checkpoint record.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub winner: Option<Assignment>,
    pub attempts: Vec<AttemptRecord>,
    pub trace: Vec<Option<u32>>,
    pub note: Option<String>,
}

pub(crate) fn timed_trial(
    trials: &mut dyn TrialRunner,
    selection: &[Selection<'_>],
) -> Result<(Verdict, u64)> {
    let start = Instant::now();
    let verdict = trials.run_trial(selection)?;
    Ok((verdict, start.elapsed().as_millis() as u64))
}

pub(crate) fn choices_for(hunks: &[Hunk], selection: &[Selection<'_>]) -> Vec<HunkChoice> {
    hunks
        .iter()
        .zip(selection)
        .map(|(hunk, sel)| match sel {
            Selection::Original => HunkChoice::original(hunk),
            Selection::Candidate(candidate) => HunkChoice::from_candidate(hunk.index, candidate),
        })
        .collect()
}

/// Candidates worth attempting for a hunk, in rank order.
pub(crate) fn attemptable(candidates: &[Candidate]) -> Vec<&Candidate> {
    candidates.iter().filter(|c| !c.same_as_source).collect()
}

/// A checked-out project whose touched files are rewritten for every trial.
pub struct WorkingCopy<'a> {
    hunks: &'a [Hunk],
    pristine: PristineSources,
    session: Box<dyn TestSession>,
    timeout: Duration,
    transform: CandidateTransform,
}

impl<'a> WorkingCopy<'a> {
    pub fn new(
        root: &Path,
        hunks: &'a [Hunk],
        session: Box<dyn TestSession>,
        options: &EngineOptions,
    ) -> Result<Self> {
        let pristine = PristineSources::capture(root, hunks)?;
        Ok(Self {
            hunks,
            pristine,
            session,
            timeout: options.timeout,
            transform: options.transform,
        })
    }
}

impl TrialRunner for WorkingCopy<'_> {
    fn run_trial(&mut self, selection: &[Selection<'_>]) -> Result<Verdict> {
        let edits: Vec<(&Hunk, &str)> = self
            .hunks
            .iter()
            .zip(selection)
            .filter_map(|(hunk, sel)| match sel {
                Selection::Original => None,
                Selection::Candidate(c) => Some((hunk, c.text.as_str())),
            })
            .collect();
        self.pristine.materialize(&edits, self.transform)?;
        Ok(self.session.run(self.timeout))
    }
}

/// Runs one bug end to end: checkout, search, record.
pub struct Validator<'a> {
    pub layout: &'a dyn ProjectLayout,
    pub runner: &'a dyn TestRunner,
    pub candidates: &'a CandidateStore,
    pub options: EngineOptions,
}

impl Validator<'_> {
    /// Validate `bug` inside `work_dir`, which must not exist yet.
    pub fn validate_bug(&self, bug: &Bug, hints: &RunnerHints, work_dir: &Path) -> Result<CheckpointRecord> {
        if bug.hunks.is_empty() {
            return Err(anyhow!("Bug '{}' has no hunks", bug.id));
        }
        let started_at = Utc::now();
        let clock = Instant::now();

        self.layout
            .checkout(bug, work_dir)
            .with_context(|| format!("Checkout failed for '{}'", bug.id))?;
        let hunks = self.layout.resolve_hunks(&bug.hunks);
        let session = self
            .runner
            .prepare(&bug.id, work_dir, hints)
            .with_context(|| format!("Test runner setup failed for '{}'", bug.id))?;
        let mut working = WorkingCopy::new(work_dir, &hunks, session, &self.options)?;

        let lists: Vec<&[Candidate]> = hunks
            .iter()
            .map(|h| self.candidates.for_hunk(&bug.id, h.index))
            .collect();

        let (mode, outcome) = if !bug.is_multi_hunk() {
            debug!(bug = %bug.id, candidates = lists[0].len(), "single-hunk validation");
            (
                SearchMode::Single,
                single::validate_single(&hunks[0], lists[0], &mut working)?,
            )
        } else {
            debug!(bug = %bug.id, hunks = hunks.len(), "multi-hunk search");
            (
                SearchMode::Multi,
                multi::search(&hunks, &lists, &self.options, &mut working)?,
            )
        };

        let record = CheckpointRecord {
            bug_id: bug.id.clone(),
            mode,
            runner: self.runner.name().to_string(),
            exact_match: outcome.attempts.iter().any(|a| a.exact_match),
            winner: outcome.winner,
            attempts: outcome.attempts,
            trace: outcome.trace,
            validation_ms: clock.elapsed().as_millis() as u64,
            note: outcome.note,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            bug = %record.bug_id,
            attempts = record.attempts.len(),
            verdict = %record
                .winner
                .as_ref()
                .map(|w| w.verdict.to_string())
                .unwrap_or_else(|| "none".to_string()),
            "bug validated"
        );
        Ok(record)
    }
}
