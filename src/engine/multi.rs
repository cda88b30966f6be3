//! Greedy position-by-position search over per-hunk candidate lists.

use super::verdict::{RunningCount, Verdict};
use super::{
    attemptable, choices_for, timed_trial, EngineOptions, SearchOutcome, SearchStrategy,
    Selection, TrialRunner,
};
use crate::model::{AttemptPhase, AttemptRecord, Assignment, Candidate, Hunk};
use crate::util::normalize_whitespace;
use anyhow::Result;
use indexmap::IndexMap;
use tracing::debug;

/// Search for a per-hunk assignment that lowers the failed-test count.
///
/// The baseline (every hunk original) sets the running count. Position `i` is
/// then tried with earlier positions fixed and later ones original; only a
/// strictly lower `Compilable` count or a `Plausible` result moves the search
/// forward. A position with no improving candidate keeps its original source.
pub fn search(
    hunks: &[Hunk],
    lists: &[&[Candidate]],
    options: &EngineOptions,
    trials: &mut dyn TrialRunner,
) -> Result<SearchOutcome> {
    let mut outcome = SearchOutcome::default();
    let mut fixed: Vec<Selection<'_>> = vec![Selection::Original; hunks.len()];

    let (baseline, duration_ms) = timed_trial(trials, &fixed)?;
    outcome.attempts.push(AttemptRecord {
        phase: AttemptPhase::Baseline,
        hunk: None,
        rank: None,
        verdict: baseline,
        exact_match: false,
        duration_ms,
    });
    let mut running = RunningCount::from_baseline(baseline);
    outcome.trace.push(running.as_option());
    debug!(%baseline, "multi-hunk baseline");

    if baseline.is_plausible() {
        outcome.note = Some("baseline passes without any patch".to_string());
        return Ok(outcome);
    }

    if options.joint_prepass {
        if let Some(winner) = joint_prepass(hunks, lists, trials, &mut outcome)? {
            outcome.winner = Some(winner);
            return Ok(outcome);
        }
    }

    let mut improved_any = false;
    for (i, hunk) in hunks.iter().enumerate() {
        if running.is_solved() {
            break;
        }
        let mut best: Option<(&Candidate, u32)> = None;

        for candidate in attemptable(lists[i]) {
            let mut selection = fixed.clone();
            selection[i] = Selection::Candidate(candidate);
            let (verdict, duration_ms) = timed_trial(trials, &selection)?;
            debug!(hunk = hunk.index, rank = candidate.rank, %verdict, "multi-hunk attempt");
            outcome.attempts.push(AttemptRecord {
                phase: AttemptPhase::Candidate,
                hunk: Some(hunk.index),
                rank: Some(candidate.rank),
                verdict,
                exact_match: candidate.exact_match,
                duration_ms,
            });

            if verdict.is_plausible() {
                outcome.trace.push(Some(0));
                outcome.winner = Some(Assignment {
                    choices: choices_for(hunks, &selection),
                    verdict,
                });
                return Ok(outcome);
            }

            let bar = match best {
                Some((_, count)) => RunningCount::Failed(count),
                None => running,
            };
            if let Some(count) = bar.improved_by(verdict) {
                best = Some((candidate, count));
                if options.strategy == SearchStrategy::FirstImprovement {
                    break;
                }
            }
        }

        if let Some((candidate, count)) = best {
            fixed[i] = Selection::Candidate(candidate);
            running = RunningCount::Failed(count);
            improved_any = true;
        }
        outcome.trace.push(running.as_option());
    }

    outcome.winner = Some(if improved_any {
        let failed = running.as_option().unwrap_or_default();
        Assignment {
            choices: choices_for(hunks, &fixed),
            verdict: Verdict::compilable(failed),
        }
    } else {
        outcome.note = Some("no candidate improved on the baseline".to_string());
        Assignment {
            choices: choices_for(hunks, &fixed),
            verdict: baseline,
        }
    });
    Ok(outcome)
}

/// Uniform text applied to every hunk, with its per-hunk candidates.
struct JointCandidate<'a> {
    per_hunk: Vec<&'a Candidate>,
    rank_sum: u32,
    max_score: f64,
}

/// Texts present (after whitespace normalization) in every hunk's list,
/// ordered by summed rank ascending then best score descending.
fn joint_candidates<'a>(lists: &[&'a [Candidate]]) -> Vec<JointCandidate<'a>> {
    let per_hunk: Vec<IndexMap<String, &'a Candidate>> = lists
        .iter()
        .copied()
        .map(|list| {
            let mut by_text = IndexMap::new();
            for candidate in attemptable(list) {
                by_text
                    .entry(normalize_whitespace(&candidate.text))
                    .or_insert(candidate);
            }
            by_text
        })
        .collect();
    let Some((first, rest)) = per_hunk.split_first() else {
        return Vec::new();
    };

    let mut joint: Vec<JointCandidate<'a>> = first
        .iter()
        .filter_map(|(text, candidate)| {
            let mut chosen = vec![*candidate];
            for other in rest {
                chosen.push(*other.get(text)?);
            }
            Some(JointCandidate {
                rank_sum: chosen.iter().map(|c| c.rank).sum(),
                max_score: chosen
                    .iter()
                    .map(|c| c.score)
                    .fold(f64::NEG_INFINITY, f64::max),
                per_hunk: chosen,
            })
        })
        .collect();
    joint.sort_by(|a, b| {
        a.rank_sum
            .cmp(&b.rank_sum)
            .then_with(|| b.max_score.total_cmp(&a.max_score))
    });
    joint
}

fn joint_prepass(
    hunks: &[Hunk],
    lists: &[&[Candidate]],
    trials: &mut dyn TrialRunner,
    outcome: &mut SearchOutcome,
) -> Result<Option<Assignment>> {
    for joint in joint_candidates(lists) {
        let selection: Vec<Selection<'_>> = joint
            .per_hunk
            .iter()
            .map(|c| Selection::Candidate(*c))
            .collect();
        let (verdict, duration_ms) = timed_trial(trials, &selection)?;
        debug!(rank_sum = joint.rank_sum, %verdict, "joint attempt");
        outcome.attempts.push(AttemptRecord {
            phase: AttemptPhase::Joint,
            hunk: None,
            rank: Some(joint.rank_sum),
            verdict,
            exact_match: joint.per_hunk.iter().all(|c| c.exact_match),
            duration_ms,
        });
        if verdict.is_plausible() {
            outcome.trace.push(Some(0));
            return Ok(Some(Assignment {
                choices: choices_for(hunks, &selection),
                verdict,
            }));
        }
    }
    Ok(None)
}
