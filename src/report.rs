//! Aggregation of per-bug checkpoints into one JSON-lines file and a summary.

use crate::checkpoint::CheckpointStore;
use crate::model::{BugId, CheckpointRecord, SearchMode};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeSummary {
    pub bugs: usize,
    pub plausible: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_bugs: usize,
    pub plausible_bugs: usize,
    pub plausible_fraction: f64,
    pub single_hunk: ModeSummary,
    pub multi_hunk: ModeSummary,
    /// Multi-hunk bugs whose search lowered the failed count without solving them.
    pub improved_bugs: usize,
    /// Bugs where some attempted candidate matched the known fix.
    pub exact_match_bugs: usize,
    /// Plausible bugs whose winning assignment is the known fix on every hunk.
    pub plausible_exact_bugs: usize,
    pub attempts_by_verdict: BTreeMap<String, usize>,
    pub total_attempts: usize,
    pub total_validation_ms: u64,
    /// Expected bugs without a checkpoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<BugId>,
}

impl Summary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a CheckpointRecord>) -> Self {
        let mut summary = Summary::default();
        for record in records {
            summary.total_bugs += 1;
            let plausible = record.is_plausible();
            let mode = match record.mode {
                SearchMode::Single => &mut summary.single_hunk,
                SearchMode::Multi => &mut summary.multi_hunk,
            };
            mode.bugs += 1;
            if plausible {
                summary.plausible_bugs += 1;
                mode.plausible += 1;
            } else if is_improved(record) {
                summary.improved_bugs += 1;
            }
            if record.exact_match {
                summary.exact_match_bugs += 1;
            }
            if plausible && winner_is_exact(record) {
                summary.plausible_exact_bugs += 1;
            }
            for attempt in &record.attempts {
                *summary
                    .attempts_by_verdict
                    .entry(attempt.verdict.label().to_string())
                    .or_insert(0) += 1;
            }
            summary.total_attempts += record.attempts.len();
            summary.total_validation_ms += record.validation_ms;
        }
        summary.plausible_fraction = ratio(summary.plausible_bugs, summary.total_bugs);
        summary
    }

    /// Human-readable lines for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Plausible: {}/{} ({:.1}%)\n",
            self.plausible_bugs,
            self.total_bugs,
            self.plausible_fraction * 100.0
        ));
        out.push_str(&format!(
            "  single-hunk: {}/{}  multi-hunk: {}/{}  improved: {}\n",
            self.single_hunk.plausible,
            self.single_hunk.bugs,
            self.multi_hunk.plausible,
            self.multi_hunk.bugs,
            self.improved_bugs
        ));
        out.push_str(&format!(
            "  exact match attempted: {}  plausible and exact: {}\n",
            self.exact_match_bugs, self.plausible_exact_bugs
        ));
        let verdicts = self
            .attempts_by_verdict
            .iter()
            .map(|(label, count)| format!("{label}={count}"))
            .collect::<Vec<_>>()
            .join(" ");
        out.push_str(&format!("  attempts: {} ({})\n", self.total_attempts, verdicts));
        if !self.missing.is_empty() {
            out.push_str(&format!("  missing checkpoints: {}\n", self.missing.len()));
        }
        out
    }
}

fn is_improved(record: &CheckpointRecord) -> bool {
    let (Some(first), Some(last)) = (record.trace.first(), record.trace.last()) else {
        return false;
    };
    match (first, last) {
        (Some(baseline), Some(reached)) => reached < baseline,
        (None, Some(_)) => true,
        _ => false,
    }
}

fn winner_is_exact(record: &CheckpointRecord) -> bool {
    record.winner.as_ref().is_some_and(|winner| {
        winner.choices.iter().all(|choice| {
            matches!(
                choice,
                crate::model::HunkChoice::Candidate {
                    exact_match: true,
                    ..
                }
            )
        })
    })
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

pub fn summary_path(aggregate: &Path) -> PathBuf {
    let mut name = aggregate
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".summary.json");
    aggregate.with_file_name(name)
}

/// Concatenate every checkpoint into `output` and write the summary beside it.
///
/// `expected`, when given, lists the bugs of the run; those without a
/// checkpoint are reported as missing.
pub fn aggregate(
    store: &CheckpointStore,
    output: &Path,
    expected: Option<&[BugId]>,
) -> Result<Summary> {
    let records = store.read_all()?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }
    let file = File::create(output)
        .with_context(|| format!("Failed to create aggregate '{}'", output.display()))?;
    let mut writer = BufWriter::new(file);
    for record in &records {
        serde_json::to_writer(&mut writer, record)?;
        writeln!(writer)?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write aggregate '{}'", output.display()))?;

    let mut summary = Summary::from_records(&records);
    if let Some(expected) = expected {
        let seen: HashSet<&BugId> = records.iter().map(|r| &r.bug_id).collect();
        summary.missing = expected
            .iter()
            .filter(|id| !seen.contains(id))
            .cloned()
            .collect();
    }

    let summary_file = summary_path(output);
    let content = serde_json::to_string_pretty(&summary)?;
    std::fs::write(&summary_file, content)
        .with_context(|| format!("Failed to write summary '{}'", summary_file.display()))?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::verdict::Verdict;
    use crate::model::{AttemptPhase, AttemptRecord, Assignment, HunkChoice};
    use chrono::Utc;
    use tempfile::tempdir;

    fn attempt(verdict: Verdict) -> AttemptRecord {
        AttemptRecord {
            phase: AttemptPhase::Candidate,
            hunk: Some(0),
            rank: Some(0),
            verdict,
            exact_match: false,
            duration_ms: 10,
        }
    }

    fn record(id: &str, mode: SearchMode, winner: Option<Verdict>, trace: Vec<Option<u32>>) -> CheckpointRecord {
        CheckpointRecord {
            bug_id: BugId::new(id),
            mode,
            runner: "suite".into(),
            winner: winner.map(|verdict| Assignment {
                choices: vec![HunkChoice::Candidate {
                    hunk: 0,
                    rank: 0,
                    score: -0.1,
                    text: "return 1;".into(),
                    origin: None,
                    exact_match: verdict.is_plausible(),
                }],
                verdict,
            }),
            attempts: vec![attempt(Verdict::Uncompilable), attempt(winner.unwrap_or(Verdict::Timeout))],
            trace,
            exact_match: winner.is_some_and(Verdict::is_plausible),
            validation_ms: 100,
            note: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn summary_counts_modes_and_verdicts() {
        let records = vec![
            record("A 1", SearchMode::Single, Some(Verdict::Plausible), vec![]),
            record("A 2", SearchMode::Single, None, vec![]),
            record(
                "B 1",
                SearchMode::Multi,
                Some(Verdict::compilable(1)),
                vec![Some(3), Some(1), Some(1)],
            ),
            record(
                "B 2",
                SearchMode::Multi,
                Some(Verdict::Plausible),
                vec![Some(2), Some(0)],
            ),
        ];
        let summary = Summary::from_records(&records);
        assert_eq!(summary.total_bugs, 4);
        assert_eq!(summary.plausible_bugs, 2);
        assert!((summary.plausible_fraction - 0.5).abs() < f64::EPSILON);
        assert_eq!(summary.single_hunk, ModeSummary { bugs: 2, plausible: 1 });
        assert_eq!(summary.multi_hunk, ModeSummary { bugs: 2, plausible: 1 });
        assert_eq!(summary.improved_bugs, 1);
        assert_eq!(summary.plausible_exact_bugs, 2);
        assert_eq!(summary.attempts_by_verdict["uncompilable"], 4);
        assert_eq!(summary.attempts_by_verdict["plausible"], 2);
        assert_eq!(summary.attempts_by_verdict["timeout"], 1);
        assert_eq!(summary.total_attempts, 8);
        assert!(summary.render().contains("Plausible: 2/4 (50.0%)"));
    }

    #[test]
    fn empty_run_has_zero_fraction() {
        let summary = Summary::from_records(&Vec::<CheckpointRecord>::new());
        assert_eq!(summary.plausible_fraction, 0.0);
    }

    #[test]
    fn aggregate_writes_jsonl_and_summary() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(&dir.path().join("ck")).unwrap();
        store
            .write(&record("A 1", SearchMode::Single, Some(Verdict::Plausible), vec![]))
            .unwrap();
        store
            .write(&record("A 2", SearchMode::Single, None, vec![]))
            .unwrap();

        let output = dir.path().join("out/all.jsonl");
        let expected = vec![BugId::new("A 1"), BugId::new("A 2"), BugId::new("A 3")];
        let summary = aggregate(&store, &output, Some(&expected)).unwrap();

        let lines = std::fs::read_to_string(&output).unwrap();
        assert_eq!(lines.lines().count(), 2);
        assert_eq!(summary.missing, vec![BugId::new("A 3")]);

        let written: Summary =
            serde_json::from_str(&std::fs::read_to_string(summary_path(&output)).unwrap()).unwrap();
        assert_eq!(written, summary);
        assert!(summary_path(&output).ends_with("all.jsonl.summary.json"));
    }
}
