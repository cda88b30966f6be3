//! Patch applier
//!
//! Rewrites source files of a working copy for a set of hunk edits. Every rewrite
//! starts from the pristine bytes captured when the working copy was created, so
//! attempts never see each other's edits.

use crate::model::Hunk;
use crate::reflow::CandidateTransform;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    /// Single-byte text; every byte maps to the code point of the same value.
    Latin1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
}

impl LineEnding {
    fn as_str(self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

/// Decoded source file, split into lines without terminators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceText {
    pub encoding: Encoding,
    pub line_ending: LineEnding,
    pub trailing_newline: bool,
    pub lines: Vec<String>,
}

impl SourceText {
    pub fn decode(bytes: &[u8]) -> Self {
        let (text, encoding) = match std::str::from_utf8(bytes) {
            Ok(text) => (text.to_string(), Encoding::Utf8),
            Err(_) => (bytes.iter().map(|&b| b as char).collect(), Encoding::Latin1),
        };
        let line_ending = if text.contains("\r\n") {
            LineEnding::CrLf
        } else {
            LineEnding::Lf
        };
        let unified = text.replace("\r\n", "\n");
        let trailing_newline = unified.ends_with('\n');
        let body = unified.strip_suffix('\n').unwrap_or(&unified);
        let lines = if unified.is_empty() {
            Vec::new()
        } else {
            body.split('\n').map(str::to_string).collect()
        };
        Self {
            encoding,
            line_ending,
            trailing_newline,
            lines,
        }
    }

    /// Serialize with the original line ending and encoding.
    ///
    /// Latin-1 files containing characters above U+00FF are written as UTF-8.
    pub fn encode(&self) -> Vec<u8> {
        let mut text = self.lines.join(self.line_ending.as_str());
        if self.trailing_newline && !self.lines.is_empty() {
            text.push_str(self.line_ending.as_str());
        }
        match self.encoding {
            Encoding::Utf8 => text.into_bytes(),
            Encoding::Latin1 => {
                if text.chars().all(|c| (c as u32) <= 0xFF) {
                    text.chars().map(|c| c as u8).collect()
                } else {
                    text.into_bytes()
                }
            }
        }
    }
}

/// One textual replacement inside a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    /// 1-based start line; for insertions the 0-based insertion index.
    pub line_start: usize,
    pub line_count: usize,
    pub text: String,
    pub indent: String,
}

impl Edit {
    pub fn for_hunk(hunk: &Hunk, text: &str, transform: CandidateTransform) -> Self {
        Self {
            line_start: hunk.removed_line_start,
            line_count: hunk.removed_line_count,
            text: transform.apply(text).into_owned(),
            indent: hunk.indent().to_string(),
        }
    }

    fn replacement_lines(&self) -> Vec<String> {
        indent_lines(&self.text, &self.indent)
    }
}

/// Prefix every non-blank line with `indent`. Empty text yields no lines.
pub fn indent_lines(text: &str, indent: &str) -> Vec<String> {
    let unified = text.replace("\r\n", "\n");
    let body = unified.trim_end_matches('\n');
    if body.is_empty() {
        return Vec::new();
    }
    body.split('\n')
        .map(|line| {
            if line.trim().is_empty() {
                line.to_string()
            } else {
                format!("{indent}{line}")
            }
        })
        .collect()
}

/// Apply `edits` to `lines`, highest start line first so earlier edits keep
/// their line numbers; on a shared start line replacements go before
/// insertions. Ranges past the end of the file are clamped.
pub fn apply_edits(lines: &mut Vec<String>, edits: &[Edit]) {
    let mut ordered: Vec<&Edit> = edits.iter().collect();
    ordered.sort_by(|a, b| {
        b.line_start
            .cmp(&a.line_start)
            .then_with(|| (a.line_count == 0).cmp(&(b.line_count == 0)))
    });

    for edit in ordered {
        let replacement = edit.replacement_lines();
        let len = lines.len();
        let range = if edit.line_count == 0 {
            let at = edit.line_start.min(len);
            at..at
        } else {
            let lo = edit.line_start.saturating_sub(1).min(len);
            let hi = (lo + edit.line_count).min(len);
            lo..hi
        };
        lines.splice(range, replacement);
    }
}

/// Apply several edits to a pristine file image and return the new bytes.
pub fn apply_all(pristine: &[u8], edits: &[Edit]) -> Vec<u8> {
    let mut source = SourceText::decode(pristine);
    apply_edits(&mut source.lines, edits);
    source.encode()
}

/// Pristine bytes of every file a bug touches, captured once per working copy.
#[derive(Debug, Clone, Default)]
pub struct PristineSources {
    root: PathBuf,
    files: BTreeMap<String, Vec<u8>>,
}

impl PristineSources {
    pub fn capture(root: &Path, hunks: &[Hunk]) -> Result<Self> {
        let mut files = BTreeMap::new();
        for hunk in hunks {
            if files.contains_key(&hunk.source_path) {
                continue;
            }
            let path = root.join(&hunk.source_path);
            let bytes = fs::read(&path)
                .with_context(|| format!("Failed to read source file '{}'", path.display()))?;
            files.insert(hunk.source_path.clone(), bytes);
        }
        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    /// Rewrite every touched file: pristine text plus the given edits.
    ///
    /// Files without edits are restored to their pristine content.
    pub fn materialize(&self, edits: &[(&Hunk, &str)], transform: CandidateTransform) -> Result<()> {
        let mut by_file: HashMap<&str, Vec<Edit>> = HashMap::new();
        for (hunk, text) in edits {
            by_file
                .entry(hunk.source_path.as_str())
                .or_default()
                .push(Edit::for_hunk(hunk, text, transform));
        }

        for (source_path, pristine) in &self.files {
            let path = self.root.join(source_path);
            let bytes = match by_file.get(source_path.as_str()) {
                Some(file_edits) => apply_all(pristine, file_edits),
                None => pristine.clone(),
            };
            fs::write(&path, bytes)
                .with_context(|| format!("Failed to write patched file '{}'", path.display()))?;
        }
        Ok(())
    }
}
