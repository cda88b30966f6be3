//! Core data model: bugs, hunks, candidates and the persisted per-bug outcome.

use crate::engine::verdict::Verdict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque benchmark-unique bug identifier, e.g. `"Chart 4"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BugId(String);

impl BugId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Owning project: the part before the first `separator`, or the whole id.
    ///
    /// An empty separator means "any whitespace".
    pub fn project(&self, separator: &str) -> &str {
        let head = if separator.is_empty() {
            self.0.split_whitespace().next()
        } else {
            self.0.split(separator).next()
        };
        match head {
            Some(head) if !head.is_empty() => head,
            _ => &self.0,
        }
    }

    /// Part after the project, used for `{bug_number}` template substitution.
    pub fn number(&self, separator: &str) -> &str {
        let project = self.project(separator);
        let rest = &self.0[project.len()..];
        if separator.is_empty() {
            rest.trim_start()
        } else {
            rest.strip_prefix(separator).unwrap_or(rest)
        }
    }
}

impl fmt::Display for BugId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BugId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One contiguous edit location of a bug's known fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    /// Position of the hunk in the bug's original diff; candidates are keyed by it.
    pub index: usize,
    pub source_path: String,
    /// 1-based first removed line; for pure insertions the line after which text goes.
    pub removed_line_start: usize,
    pub removed_line_count: usize,
    /// Known fix text. Only its indentation is used when applying candidates.
    pub added_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_text: Option<String>,
}

impl Hunk {
    /// Leading whitespace of the first non-blank line of the known fix.
    pub fn indent(&self) -> &str {
        let Some(line) = self.added_text.lines().find(|l| !l.trim().is_empty()) else {
            return "";
        };
        let width = line.len() - line.trim_start_matches([' ', '\t']).len();
        &line[..width]
    }

    pub fn original_text(&self) -> &str {
        self.removed_text.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bug {
    pub id: BugId,
    pub hunks: Vec<Hunk>,
}

impl Bug {
    pub fn is_multi_hunk(&self) -> bool {
        self.hunks.len() > 1
    }
}

/// A ranked candidate replacement for exactly one `(bug, hunk)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub text: String,
    pub rank: u32,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub exact_match: bool,
    #[serde(default)]
    pub same_as_source: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// How one hunk is resolved inside an assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HunkChoice {
    Candidate {
        hunk: usize,
        rank: u32,
        score: f64,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
        exact_match: bool,
    },
    /// The hunk keeps its original source text.
    Original { hunk: usize, text: String },
}

impl HunkChoice {
    pub fn from_candidate(hunk: usize, candidate: &Candidate) -> Self {
        Self::Candidate {
            hunk,
            rank: candidate.rank,
            score: candidate.score,
            text: candidate.text.clone(),
            origin: candidate.origin.clone(),
            exact_match: candidate.exact_match,
        }
    }

    pub fn original(hunk: &Hunk) -> Self {
        Self::Original {
            hunk: hunk.index,
            text: hunk.original_text().to_string(),
        }
    }

    pub fn rank(&self) -> Option<u32> {
        match self {
            Self::Candidate { rank, .. } => Some(*rank),
            Self::Original { .. } => None,
        }
    }

    pub fn is_original(&self) -> bool {
        matches!(self, Self::Original { .. })
    }
}

/// A complete per-hunk resolution with the verdict it achieved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub choices: Vec<HunkChoice>,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Single,
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    /// Unpatched project, multi-hunk only.
    Baseline,
    /// Uniform text across every hunk.
    Joint,
    Candidate,
}

/// Outcome of one apply-build-test cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub phase: AttemptPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hunk: Option<usize>,
    /// Candidate rank; summed rank for joint attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    pub verdict: Verdict,
    pub exact_match: bool,
    pub duration_ms: u64,
}

/// Persisted outcome for one bug. Written once; its existence marks the bug done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub bug_id: BugId,
    pub mode: SearchMode,
    pub runner: String,
    #[serde(default)]
    pub winner: Option<Assignment>,
    pub attempts: Vec<AttemptRecord>,
    /// Running failed count after the baseline and after each decided hunk.
    /// `None` stands for "not measurable".
    #[serde(default)]
    pub trace: Vec<Option<u32>>,
    pub exact_match: bool,
    pub validation_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn is_plausible(&self) -> bool {
        self.winner
            .as_ref()
            .is_some_and(|winner| winner.verdict == Verdict::Plausible)
    }
}
