use super::{attemptable, choices_for, timed_trial, SearchOutcome, Selection, TrialRunner};
use crate::model::{AttemptPhase, AttemptRecord, Assignment, Candidate, Hunk};
use anyhow::Result;
use tracing::debug;

/// Try candidates in rank order against the pristine file; stop at the first
/// `Plausible`. Verdicts of every attempted candidate are kept either way.
pub fn validate_single(
    hunk: &Hunk,
    candidates: &[Candidate],
    trials: &mut dyn TrialRunner,
) -> Result<SearchOutcome> {
    let mut outcome = SearchOutcome::default();
    let candidates = attemptable(candidates);
    if candidates.is_empty() {
        outcome.note = Some("no candidates".to_string());
        return Ok(outcome);
    }

    for candidate in candidates {
        let selection = [Selection::Candidate(candidate)];
        let (verdict, duration_ms) = timed_trial(trials, &selection)?;
        debug!(hunk = hunk.index, rank = candidate.rank, %verdict, "single-hunk attempt");
        outcome.attempts.push(AttemptRecord {
            phase: AttemptPhase::Candidate,
            hunk: Some(hunk.index),
            rank: Some(candidate.rank),
            verdict,
            exact_match: candidate.exact_match,
            duration_ms,
        });
        if verdict.is_plausible() {
            outcome.winner = Some(Assignment {
                choices: choices_for(std::slice::from_ref(hunk), &selection),
                verdict,
            });
            break;
        }
    }
    Ok(outcome)
}
