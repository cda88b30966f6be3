//! Candidate text repair before insertion.
//!
//! Some benchmarks store candidates flattened to one line (`if x: return y`).
//! [`CandidateTransform::PythonReflow`] splits such a line back into logical
//! statements and re-indents block bodies, working on token spans so every
//! emitted line is an untouched slice of the candidate.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

const INDENT_UNIT: &str = "    ";
const MAX_NESTING: usize = 20;

const BLOCK_START: &[&str] = &[
    "if", "for", "while", "def", "class", "with", "try", "except", "elif", "else", "finally",
    "match", "case",
];

const DEDENT_FIRST: &[&str] = &["elif", "else", "except", "finally"];

const STATEMENT_START: &[&str] = &[
    "if", "for", "while", "def", "class", "with", "try", "except", "elif", "else", "finally",
    "print", "return", "raise", "break", "continue", "pass", "import", "from", "assert", "del",
    "global", "nonlocal",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateTransform {
    /// Insert candidate text as is.
    #[default]
    Verbatim,
    /// Re-split one-line Python candidates into indented statements.
    PythonReflow,
}

impl CandidateTransform {
    pub fn apply(self, text: &str) -> Cow<'_, str> {
        match self {
            CandidateTransform::Verbatim => Cow::Borrowed(text),
            CandidateTransform::PythonReflow => reflow_python(text),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Name,
    Number,
    Str,
    Op,
    Comment,
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    kind: Kind,
    text: &'a str,
    start: usize,
    end: usize,
}

impl Token<'_> {
    fn is_op(&self, op: &str) -> bool {
        self.kind == Kind::Op && self.text == op
    }

    fn is_word(&self, words: &[&str]) -> bool {
        self.kind == Kind::Name && words.contains(&self.text)
    }
}

/// Multi-line or unsplittable text comes back borrowed.
pub fn reflow_python(text: &str) -> Cow<'_, str> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.contains('\n') {
        return Cow::Borrowed(text);
    }
    let Some(tokens) = tokenize(trimmed) else {
        return Cow::Borrowed(text);
    };
    let lines = split_statements(trimmed, &tokens);
    if lines.len() < 2 {
        return Cow::Borrowed(text);
    }
    Cow::Owned(
        lines
            .iter()
            .map(|(depth, line)| format!("{}{}", INDENT_UNIT.repeat(*depth), line))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

fn split_statements<'a>(src: &'a str, tokens: &[Token<'a>]) -> Vec<(usize, &'a str)> {
    let mut lines = Vec::new();
    let mut indent = 0usize;
    let mut nesting = 0usize;
    let mut stmt = 0usize;

    for (i, token) in tokens.iter().enumerate() {
        if token.kind == Kind::Op {
            match token.text {
                "(" | "[" | "{" => nesting += 1,
                ")" | "]" | "}" => nesting = nesting.saturating_sub(1),
                _ => {}
            }
        }

        let mut split = false;
        let mut header = false;
        if nesting == 0 {
            if token.is_op(":") && tokens[stmt].is_word(BLOCK_START) {
                split = true;
                header = true;
            } else if token.is_op(";") {
                split = true;
            } else if let Some(next) = tokens.get(i + 1) {
                split = starts_new_statement(tokens, stmt, i, next);
            }
        }

        if split || i + 1 == tokens.len() {
            let line = src[tokens[stmt].start..token.end].trim();
            let line = line.strip_suffix(';').unwrap_or(line).trim_end();
            if tokens[stmt].is_word(DEDENT_FIRST) {
                indent = indent.saturating_sub(1);
            }
            if !line.is_empty() {
                lines.push((indent, line));
            }
            if header {
                indent += 1;
            } else {
                indent = indent.saturating_sub(1);
            }
            stmt = i + 1;
        }
    }
    lines
}

/// Whether a statement keyword at `i + 1` begins a new logical line.
fn starts_new_statement(tokens: &[Token<'_>], stmt: usize, i: usize, next: &Token<'_>) -> bool {
    if !next.is_word(STATEMENT_START) {
        return false;
    }
    let current = &tokens[i];
    if current.is_op(".") || current.is_word(&["def", "class"]) {
        return false;
    }
    match next.text {
        "if" => !ternary_ahead(&tokens[i + 2..]),
        "else" => tokens.get(i + 2).is_some_and(|t| t.is_op(":")),
        "import" => !tokens[stmt].is_word(&["from"]),
        "from" => !tokens[stmt].is_word(&["raise"]) && !current.is_word(&["yield"]),
        _ => true,
    }
}

/// An `else` before the next block colon means `x if c else y`.
fn ternary_ahead(rest: &[Token<'_>]) -> bool {
    for token in rest {
        if token.is_op(":") {
            return false;
        }
        if token.is_word(&["else"]) {
            return true;
        }
    }
    false
}

/// `None` when the text does not look like Python (stray `?`, runaway nesting).
fn tokenize(src: &str) -> Option<Vec<Token<'_>>> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut pos = 0usize;

    while pos < src.len() {
        let Some(c) = src[pos..].chars().next() else {
            break;
        };
        let start = pos;
        let (kind, end) = if c.is_whitespace() {
            pos += c.len_utf8();
            continue;
        } else if c == '#' {
            (Kind::Comment, src.len())
        } else if c == '"' || c == '\'' {
            (Kind::Str, scan_string(bytes, pos))
        } else if c.is_alphabetic() || c == '_' {
            let word_end = scan_while(src, pos, |ch| ch.is_alphanumeric() || ch == '_');
            let prefix = src[pos..word_end].to_ascii_lowercase();
            let quoted = matches!(bytes.get(word_end), Some(b'"' | b'\''));
            if quoted && matches!(prefix.as_str(), "r" | "b" | "u" | "f" | "rb" | "br" | "fr" | "rf") {
                (Kind::Str, scan_string(bytes, word_end))
            } else {
                (Kind::Name, word_end)
            }
        } else if c.is_ascii_digit()
            || (c == '.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit))
        {
            (
                Kind::Number,
                scan_while(src, pos, |ch| ch.is_alphanumeric() || ch == '.' || ch == '_'),
            )
        } else if c == '?' {
            return None;
        } else if c == ':' && bytes.get(pos + 1) == Some(&b'=') {
            (Kind::Op, pos + 2)
        } else {
            match c {
                '(' | '[' | '{' => {
                    depth += 1;
                    if depth > MAX_NESTING {
                        return None;
                    }
                }
                ')' | ']' | '}' => depth = depth.saturating_sub(1),
                _ => {}
            }
            (Kind::Op, pos + c.len_utf8())
        };
        tokens.push(Token {
            kind,
            text: &src[start..end],
            start,
            end,
        });
        pos = end;
    }
    Some(tokens)
}

fn scan_while(src: &str, start: usize, keep: impl Fn(char) -> bool) -> usize {
    src[start..]
        .char_indices()
        .find(|(_, ch)| !keep(*ch))
        .map(|(offset, _)| start + offset)
        .unwrap_or(src.len())
}

/// End of the string literal opening at `start`; unterminated runs to the end.
fn scan_string(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let triple = bytes.get(start + 1) == Some(&quote) && bytes.get(start + 2) == Some(&quote);
    let mut pos = start + if triple { 3 } else { 1 };
    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' => pos += 2,
            b if b == quote => {
                if !triple {
                    return pos + 1;
                }
                if bytes.get(pos + 1) == Some(&quote) && bytes.get(pos + 2) == Some(&quote) {
                    return pos + 3;
                }
                pos += 1;
            }
            _ => pos += 1,
        }
    }
    bytes.len()
}
