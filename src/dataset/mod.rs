//! Bug metadata and candidate loading.

pub mod overrides;
pub mod prepare;

use crate::model::{Bug, BugId, Candidate, Hunk};
use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Text fields arrive either as one string or as a list of lines.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TextField {
    Text(String),
    Lines(Vec<String>),
}

impl TextField {
    fn into_text(self) -> String {
        match self {
            TextField::Text(text) => text,
            TextField::Lines(lines) => lines.join("\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawHunk {
    source_path: String,
    removed_line_numbers_range: (usize, usize),
    #[serde(default)]
    added_lines: Option<TextField>,
    #[serde(default)]
    removed_lines: Option<TextField>,
}

impl RawHunk {
    fn into_hunk(self, index: usize) -> Hunk {
        let (start, count) = self.removed_line_numbers_range;
        Hunk {
            index,
            source_path: self.source_path,
            removed_line_start: start,
            removed_line_count: count,
            added_text: self.added_lines.map(TextField::into_text).unwrap_or_default(),
            removed_text: self.removed_lines.map(TextField::into_text),
        }
    }
}

/// Read `{ "<bug id>": [hunk, ...] }` lines; a later line replaces an earlier one
/// for the same id while keeping the id's first position.
pub fn load_bugs(path: &Path) -> Result<IndexMap<BugId, Bug>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open bug metadata '{}'", path.display()))?;
    parse_bugs(BufReader::new(file), path)
}

fn parse_bugs(reader: impl BufRead, origin: &Path) -> Result<IndexMap<BugId, Bug>> {
    let mut bugs: IndexMap<BugId, Bug> = IndexMap::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read '{}'", origin.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: IndexMap<String, Vec<RawHunk>> =
            serde_json::from_str(&line).with_context(|| {
                format!("Invalid bug record at {}:{}", origin.display(), line_no + 1)
            })?;
        for (id, raw_hunks) in entry {
            if raw_hunks.is_empty() {
                return Err(anyhow!(
                    "Bug '{}' at {}:{} has no hunks",
                    id,
                    origin.display(),
                    line_no + 1
                ));
            }
            let id = BugId::new(id);
            let hunks = raw_hunks
                .into_iter()
                .enumerate()
                .map(|(index, raw)| raw.into_hunk(index))
                .collect();
            bugs.insert(id.clone(), Bug { id, hunks });
        }
    }
    Ok(bugs)
}

/// One line of the candidate file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateLine {
    pub bugid: BugId,
    pub hunk: usize,
    pub candidates: Vec<Candidate>,
}

/// Immutable ranked candidates per `(bug, hunk)`.
#[derive(Debug, Clone, Default)]
pub struct CandidateStore {
    entries: HashMap<BugId, HashMap<usize, Vec<Candidate>>>,
}

impl CandidateStore {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open candidates '{}'", path.display()))?;
        let reader = BufReader::new(file);
        let mut store = CandidateStore::default();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read '{}'", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: CandidateLine = serde_json::from_str(&line).with_context(|| {
                format!("Invalid candidate record at {}:{}", path.display(), line_no + 1)
            })?;
            store.insert(entry.bugid, entry.hunk, entry.candidates);
        }
        Ok(store)
    }

    /// Replace the list for `(bug, hunk)`, ordered by rank ascending then score
    /// descending. The sort is stable, so equal keys keep input order.
    pub fn insert(&mut self, bug: BugId, hunk: usize, mut candidates: Vec<Candidate>) {
        candidates.sort_by(|a, b| {
            a.rank
                .cmp(&b.rank)
                .then_with(|| b.score.total_cmp(&a.score))
        });
        self.entries.entry(bug).or_default().insert(hunk, candidates);
    }

    pub fn for_hunk(&self, bug: &BugId, hunk: usize) -> &[Candidate] {
        self.entries
            .get(bug)
            .and_then(|hunks| hunks.get(&hunk))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains_bug(&self, bug: &BugId) -> bool {
        self.entries.contains_key(bug)
    }

    pub fn truncate_each(&mut self, max: usize) {
        for hunks in self.entries.values_mut() {
            for list in hunks.values_mut() {
                list.truncate(max);
            }
        }
    }

    pub fn bug_count(&self) -> usize {
        self.entries.len()
    }
}
