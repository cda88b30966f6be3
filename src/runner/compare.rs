use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How program output is matched against the expected output.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Comparator {
    /// Equality after trimming surrounding whitespace.
    #[default]
    Exact,
    /// Like `Exact`, but integer-only lines compare by value (`+05` == `5`).
    Integers,
    /// Line-wise floats within an absolute tolerance.
    Float { tolerance: f64 },
}

impl Comparator {
    pub fn matches(&self, actual: &str, expected: &str) -> bool {
        let actual = actual.trim();
        let expected = expected.trim();
        match self {
            Comparator::Exact => actual == expected,
            Comparator::Integers => {
                canonical_integer_lines(actual) == canonical_integer_lines(expected)
            }
            Comparator::Float { tolerance } => floats_close(actual, expected, *tolerance),
        }
    }
}

fn canonical_integer_lines(text: &str) -> Vec<String> {
    text.lines().map(canonical_integer).collect()
}

fn canonical_integer(line: &str) -> String {
    let (negative, digits) = match line.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, line.strip_prefix('+').unwrap_or(line)),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return line.to_string();
    }
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else if negative {
        format!("-{trimmed}")
    } else {
        trimmed.to_string()
    }
}

fn floats_close(actual: &str, expected: &str, tolerance: f64) -> bool {
    let parse = |text: &str| -> Option<Vec<f64>> {
        text.lines().map(|l| l.trim().parse::<f64>().ok()).collect()
    };
    let (Some(actual), Some(expected)) = (parse(actual), parse(expected)) else {
        return false;
    };
    actual.len() == expected.len()
        && actual
            .iter()
            .zip(&expected)
            .all(|(a, e)| (a - e).abs() <= tolerance)
}

impl FromStr for Comparator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "exact" => Ok(Comparator::Exact),
            "integers" => Ok(Comparator::Integers),
            other => {
                let Some(tol) = other.strip_prefix("float:") else {
                    return Err(format!(
                        "Unknown comparator '{}' (expected exact, integers or float:<tol>)",
                        other
                    ));
                };
                let tolerance = tol
                    .parse::<f64>()
                    .map_err(|_| format!("Invalid float tolerance '{}'", tol))?;
                if !tolerance.is_finite() || tolerance < 0.0 {
                    return Err(format!("Float tolerance must be finite and >= 0, got {}", tol));
                }
                Ok(Comparator::Float { tolerance })
            }
        }
    }
}

impl TryFrom<String> for Comparator {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Comparator> for String {
    fn from(value: Comparator) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparator::Exact => f.write_str("exact"),
            Comparator::Integers => f.write_str("integers"),
            Comparator::Float { tolerance } => write!(f, "float:{tolerance:e}"),
        }
    }
}
