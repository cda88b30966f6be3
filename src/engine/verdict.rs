use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal classification of one apply-build-test attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    Uncompilable,
    Timeout,
    /// Built and ran with `failed > 0` mismatching tests.
    Compilable { failed: u32 },
    Plausible,
}

impl Verdict {
    /// Classify a measured failure count; zero failures is `Plausible`.
    pub fn compilable(failed: u32) -> Self {
        if failed == 0 {
            Self::Plausible
        } else {
            Self::Compilable { failed }
        }
    }

    pub fn is_plausible(self) -> bool {
        self == Self::Plausible
    }

    /// Failed-test count when one was measured.
    pub fn failed_count(self) -> Option<u32> {
        match self {
            Self::Compilable { failed } => Some(failed),
            Self::Plausible => Some(0),
            Self::Uncompilable | Self::Timeout => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Uncompilable => "uncompilable",
            Self::Timeout => "timeout",
            Self::Compilable { .. } => "compilable",
            Self::Plausible => "plausible",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compilable { failed } => write!(f, "compilable({failed})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Best failed count reached so far by the multi-hunk search.
///
/// `Unmeasured` compares above every count, so any compilable attempt improves on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningCount {
    Unmeasured,
    Failed(u32),
}

impl RunningCount {
    pub fn from_baseline(verdict: Verdict) -> Self {
        match verdict.failed_count() {
            Some(n) => Self::Failed(n),
            None => Self::Unmeasured,
        }
    }

    /// The improved count when `verdict` is a strictly lower compilable result.
    ///
    /// `Uncompilable` and `Timeout` never improve.
    pub fn improved_by(self, verdict: Verdict) -> Option<u32> {
        let Verdict::Compilable { failed } = verdict else {
            return None;
        };
        match self {
            Self::Unmeasured => Some(failed),
            Self::Failed(current) if failed < current => Some(failed),
            Self::Failed(_) => None,
        }
    }

    pub fn is_solved(self) -> bool {
        self == Self::Failed(0)
    }

    pub fn as_option(self) -> Option<u32> {
        match self {
            Self::Unmeasured => None,
            Self::Failed(n) => Some(n),
        }
    }
}
