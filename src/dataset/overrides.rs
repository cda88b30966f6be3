//! Per-bug fixups from the `[[overrides]]` table.

use crate::config::BugOverride;
use crate::model::Bug;
use crate::runner::RunnerHints;
use anyhow::{anyhow, Result};

/// Apply every matching override to `bug`.
///
/// A `hunks` subset keeps the listed original hunk indices in the listed order.
/// Hunks keep their original `index`, so candidate lookup is unaffected.
pub fn apply_overrides<'a>(
    bug: &Bug,
    overrides: impl IntoIterator<Item = &'a BugOverride>,
) -> Result<(Bug, RunnerHints)> {
    let mut bug = bug.clone();
    let mut hints = RunnerHints::default();

    for entry in overrides {
        for (key, start) in &entry.line_start {
            let index: usize = key
                .parse()
                .map_err(|_| anyhow!("Override line_start key '{}' is not a hunk index", key))?;
            let hunk = bug
                .hunks
                .iter_mut()
                .find(|h| h.index == index)
                .ok_or_else(|| anyhow!("Override for '{}' names missing hunk {}", bug.id, index))?;
            hunk.removed_line_start = *start;
        }

        if let Some(subset) = entry.hunks.as_ref() {
            let mut selected = Vec::with_capacity(subset.len());
            for index in subset {
                let hunk = bug
                    .hunks
                    .iter()
                    .find(|h| h.index == *index)
                    .ok_or_else(|| {
                        anyhow!("Override for '{}' selects missing hunk {}", bug.id, index)
                    })?;
                selected.push(hunk.clone());
            }
            bug.hunks = selected;
        }

        hints.flaky.extend(entry.flaky.iter().cloned());
        if entry.compare.is_some() {
            hints.compare = entry.compare;
        }
    }

    Ok((bug, hints))
}
