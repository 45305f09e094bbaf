//! Turns logical text into replacement directives.

use std::collections::HashSet;
use std::fmt;

use promptslot_contracts::{fingerprint_text, normalize_content, ContentKey, SavedTagRegistry};
use regex::Regex;

/// A delimiter-bounded region to delete and replace with a widget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub full_match_text: String,
    pub inner_content: String,
    pub start_index: usize,
    pub end_index: usize,
}

/// A zero-width insertion point for a saved tag not present in the subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedMatch {
    pub content: String,
    pub raw: String,
    pub insert_position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchDirective {
    Pattern(PatternMatch),
    Saved(SavedMatch),
}

impl MatchDirective {
    pub fn content(&self) -> &str {
        match self {
            MatchDirective::Pattern(found) => &found.inner_content,
            MatchDirective::Saved(found) => &found.content,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanConfigError {
    EmptyStartDelimiter,
    EmptyEndDelimiter,
    InvalidPattern(String),
}

impl fmt::Display for ScanConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanConfigError::EmptyStartDelimiter => f.write_str("start delimiter is empty"),
            ScanConfigError::EmptyEndDelimiter => f.write_str("end delimiter is empty"),
            ScanConfigError::InvalidPattern(err) => write!(f, "delimiter pattern: {err}"),
        }
    }
}

impl std::error::Error for ScanConfigError {}

/// A validated delimiter pair. Empty delimiters are refused outright: they would
/// match everywhere.
#[derive(Debug, Clone)]
pub struct Delimiters {
    start: String,
    end: String,
    pattern: Regex,
}

impl Delimiters {
    pub fn new(start: &str, end: &str) -> Result<Self, ScanConfigError> {
        if start.is_empty() {
            return Err(ScanConfigError::EmptyStartDelimiter);
        }
        if end.is_empty() {
            return Err(ScanConfigError::EmptyEndDelimiter);
        }
        let source = format!("(?s){}(.*?){}", regex::escape(start), regex::escape(end));
        let pattern =
            Regex::new(&source).map_err(|err| ScanConfigError::InvalidPattern(err.to_string()))?;
        Ok(Self {
            start: start.to_string(),
            end: end.to_string(),
            pattern,
        })
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn end(&self) -> &str {
        &self.end
    }

    pub fn normalize(&self, raw: &str) -> String {
        normalize_content(raw, &self.start, &self.end)
    }

    /// Non-overlapping, non-greedy matches, left to right.
    pub fn find_all(&self, text: &str) -> Vec<PatternMatch> {
        self.pattern
            .captures_iter(text)
            .filter_map(|captures| {
                let full = captures.get(0)?;
                let inner = captures.get(1)?;
                Some(PatternMatch {
                    full_match_text: full.as_str().to_string(),
                    inner_content: self.normalize(inner.as_str()),
                    start_index: full.start(),
                    end_index: full.end(),
                })
            })
            .collect()
    }
}

/// Resolves saved tags filed under `text`'s fingerprint.
///
/// A record is skipped when `has_live` reports a widget for its key, when its raw
/// text still appears verbatim (a delimiter match will produce it), or when its
/// position lies past the end of `text`. At most one directive per key.
pub fn find_saved_matches(
    text: &str,
    registry: &SavedTagRegistry,
    fingerprint_width: usize,
    has_live: impl Fn(&ContentKey) -> bool,
) -> Vec<SavedMatch> {
    let fingerprint = fingerprint_text(text, fingerprint_width);
    let mut seen: HashSet<ContentKey> = HashSet::new();
    let mut out = Vec::new();
    for record in registry.candidates(&fingerprint) {
        let key = record.content_key();
        if seen.contains(&key) || has_live(&key) {
            continue;
        }
        if !record.raw.is_empty() && text.contains(&record.raw) {
            continue;
        }
        if record.insert_position > text.len() {
            continue;
        }
        seen.insert(key);
        out.push(SavedMatch {
            content: record.content.clone(),
            raw: record.raw.clone(),
            insert_position: record.insert_position,
        });
    }
    out
}

/// Orders directives for application: pattern matches by descending start, then
/// saved matches by descending insert position, so no edit shifts an offset that
/// is still waiting to be applied.
pub fn order_for_application(
    mut patterns: Vec<PatternMatch>,
    mut saved: Vec<SavedMatch>,
) -> Vec<MatchDirective> {
    patterns.sort_by(|a, b| b.start_index.cmp(&a.start_index));
    saved.sort_by(|a, b| b.insert_position.cmp(&a.insert_position));
    patterns
        .into_iter()
        .map(MatchDirective::Pattern)
        .chain(saved.into_iter().map(MatchDirective::Saved))
        .collect()
}

/// The unified directive list for one subtree's logical text. Saved tags whose key
/// a pattern match in the same text already produces are left out.
pub fn directives(
    text: &str,
    delimiters: &Delimiters,
    registry: &SavedTagRegistry,
    fingerprint_width: usize,
    has_live: impl Fn(&ContentKey) -> bool,
) -> Vec<MatchDirective> {
    let patterns = delimiters.find_all(text);
    let pattern_keys: HashSet<ContentKey> = patterns
        .iter()
        .map(|found| ContentKey::derive(&found.inner_content))
        .collect();
    let saved = find_saved_matches(text, registry, fingerprint_width, |key| {
        pattern_keys.contains(key) || has_live(key)
    });
    order_for_application(patterns, saved)
}
