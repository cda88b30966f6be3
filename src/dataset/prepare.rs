//! Candidate preparation: rank, normalize, deduplicate and annotate raw model output.

use super::CandidateLine;
use crate::model::{Bug, BugId, Candidate};
use crate::util::normalize_whitespace;
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::warn;

pub const MANUAL_ORIGIN: &str = "manual";

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

/// One raw generation row, in model output order.
#[derive(Debug, Clone, Deserialize)]
struct RawGeneration {
    bugid: BugId,
    hunk: usize,
    #[serde(default, alias = "checkpoint")]
    origin: Option<String>,
    #[serde(alias = "decoded_sequences")]
    text: OneOrMany<String>,
    #[serde(default, alias = "sequences_scores")]
    score: Option<OneOrMany<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
struct RankedText {
    text: String,
    normalized: String,
    rank: u32,
    score: f64,
    origin: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrepareStats {
    pub rows: usize,
    pub hunks: usize,
    pub same_as_source: usize,
    pub duplicates: usize,
    pub empty_added: usize,
    pub exact_matches: usize,
    pub unknown_bugs: usize,
}

/// Read raw rows from `input` and write prepared candidate lines to `output`.
pub fn prepare_file(
    bugs: &IndexMap<BugId, Bug>,
    input: &Path,
    output: &Path,
    max_per_hunk: Option<usize>,
) -> Result<PrepareStats> {
    let file =
        File::open(input).with_context(|| format!("Failed to open generations '{}'", input.display()))?;
    let mut rows = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read '{}'", input.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let row: RawGeneration = serde_json::from_str(&line).with_context(|| {
            format!("Invalid generation row at {}:{}", input.display(), line_no + 1)
        })?;
        rows.push(row);
    }

    let (lines, stats) = prepare_rows(bugs, rows, max_per_hunk);

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }
    let out = File::create(output)
        .with_context(|| format!("Failed to create candidates '{}'", output.display()))?;
    let mut writer = BufWriter::new(out);
    for line in &lines {
        serde_json::to_writer(&mut writer, line)?;
        writeln!(writer)?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write candidates '{}'", output.display()))?;
    Ok(stats)
}

fn prepare_rows(
    bugs: &IndexMap<BugId, Bug>,
    rows: Vec<RawGeneration>,
    max_per_hunk: Option<usize>,
) -> (Vec<CandidateLine>, PrepareStats) {
    let mut stats = PrepareStats::default();
    let mut groups: HashMap<(BugId, usize), Vec<RankedText>> = HashMap::new();
    let mut next_rank: HashMap<(BugId, usize, Option<String>), u32> = HashMap::new();
    let mut unknown: HashSet<BugId> = HashSet::new();

    for row in rows {
        if !bugs.contains_key(&row.bugid) {
            if unknown.insert(row.bugid.clone()) {
                warn!(bug = %row.bugid, "generations for unknown bug, skipping");
            }
            continue;
        }
        let texts = row.text.into_vec();
        let scores = row.score.map(OneOrMany::into_vec).unwrap_or_default();
        for (i, text) in texts.into_iter().enumerate() {
            stats.rows += 1;
            let counter = next_rank
                .entry((row.bugid.clone(), row.hunk, row.origin.clone()))
                .or_insert(0);
            let text = text.trim().to_string();
            let normalized = normalize_whitespace(&text);
            let (rank, score) = if normalized.is_empty() {
                (0, 0.0)
            } else {
                (*counter, scores.get(i).copied().unwrap_or(0.0))
            };
            *counter += 1;
            groups
                .entry((row.bugid.clone(), row.hunk))
                .or_default()
                .push(RankedText {
                    text,
                    normalized,
                    rank,
                    score,
                    origin: row.origin.clone(),
                });
        }
    }
    stats.unknown_bugs = unknown.len();

    let mut lines = Vec::new();
    for (bug_id, bug) in bugs {
        for hunk in &bug.hunks {
            let Some(mut ranked) = groups.remove(&(bug_id.clone(), hunk.index)) else {
                continue;
            };
            stats.hunks += 1;
            ranked.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| b.score.total_cmp(&a.score)));

            let source = normalize_whitespace(hunk.original_text());
            let target = normalize_whitespace(&hunk.added_text);

            let before = ranked.len();
            ranked.retain(|c| c.normalized != source);
            stats.same_as_source += before - ranked.len();

            let mut seen = HashSet::new();
            let before = ranked.len();
            ranked.retain(|c| seen.insert(c.normalized.clone()));
            stats.duplicates += before - ranked.len();

            let mut candidates: Vec<Candidate> = Vec::with_capacity(ranked.len() + 1);
            if !source.is_empty() && !seen.contains("") {
                stats.empty_added += 1;
                candidates.push(Candidate {
                    text: String::new(),
                    rank: 0,
                    score: 0.0,
                    exact_match: target.is_empty(),
                    same_as_source: false,
                    origin: Some(MANUAL_ORIGIN.to_string()),
                });
            }
            candidates.extend(ranked.into_iter().map(|c| Candidate {
                exact_match: c.normalized == target,
                text: c.text,
                rank: c.rank,
                score: c.score,
                same_as_source: false,
                origin: c.origin,
            }));
            if let Some(max) = max_per_hunk {
                candidates.truncate(max);
            }
            stats.exact_matches += candidates.iter().filter(|c| c.exact_match).count();

            lines.push(CandidateLine {
                bugid: bug_id.clone(),
                hunk: hunk.index,
                candidates,
            });
        }
    }
    (lines, stats)
}
