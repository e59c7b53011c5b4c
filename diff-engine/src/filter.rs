//! Regex text filters applied before comparison.
//!
//! A filter removes text that should not count as a difference, such as
//! comments or whitespace. When the pattern has capture groups only the
//! groups that took part in a match are removed, otherwise the whole match.
//! Filters must never add or remove line breaks; a chain that does is
//! reported as [`EngineError::FilterChangedLineCount`].

use regex::{Regex, RegexBuilder};

use crate::buffer::count_line_breaks;
use crate::error::{EngineError, Result};

/// One named, compiled filter.
#[derive(Debug, Clone)]
pub struct FilterRule {
    pub name: String,
    pub active: bool,
    regex: Regex,
}

impl FilterRule {
    /// Compile `pattern` in multi-line mode, so `^` and `$` anchor at line
    /// boundaries inside a block of text.
    pub fn new(name: impl Into<String>, pattern: &str, active: bool) -> Result<Self> {
        let name = name.into();
        let regex = RegexBuilder::new(pattern)
            .multi_line(true)
            .build()
            .map_err(|source| EngineError::InvalidFilter {
                name: name.clone(),
                source,
            })?;
        Ok(Self { name, active, regex })
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    /// Byte spans this rule strips from `text`. Empty spans are skipped.
    fn spans(&self, text: &str, out: &mut Vec<(usize, usize)>) {
        if self.regex.captures_len() == 1 {
            out.extend(
                self.regex
                    .find_iter(text)
                    .map(|m| (m.start(), m.end()))
                    .filter(|(start, end)| start != end),
            );
            return;
        }
        for caps in self.regex.captures_iter(text) {
            out.extend(
                caps.iter()
                    .skip(1)
                    .flatten()
                    .map(|m| (m.start(), m.end()))
                    .filter(|(start, end)| start != end),
            );
        }
    }
}

/// Merge overlapping or touching `[start, end)` intervals.
pub fn merge_intervals(mut intervals: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    intervals.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(intervals.len());
    for (start, end) in intervals {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// An ordered set of filters; only active ones are applied.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    rules: Vec<FilterRule>,
}

impl FilterChain {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self { rules }
    }

    /// Compile `(name, pattern, active)` triples.
    pub fn compile<'a>(specs: impl IntoIterator<Item = (&'a str, &'a str, bool)>) -> Result<Self> {
        let rules = specs
            .into_iter()
            .map(|(name, pattern, active)| FilterRule::new(name, pattern, active))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn is_active(&self) -> bool {
        self.rules.iter().any(|r| r.active)
    }

    /// Byte ranges all active filters would strip, merged.
    pub fn stripped_ranges(&self, text: &str) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        for rule in self.rules.iter().filter(|r| r.active) {
            rule.spans(text, &mut spans);
        }
        merge_intervals(spans)
    }

    /// Filter `text`. Fails if the result has a different number of line
    /// breaks than the input.
    pub fn apply(&self, text: &str) -> Result<String> {
        if !self.is_active() {
            return Ok(text.to_string());
        }

        let mut result = String::with_capacity(text.len());
        let mut offset = 0;
        for (start, end) in self.stripped_ranges(text) {
            result.push_str(&text[offset..start]);
            offset = end;
        }
        result.push_str(&text[offset..]);

        let before = count_line_breaks(text);
        let after = count_line_breaks(&result);
        if before != after {
            return Err(EngineError::FilterChangedLineCount { before, after });
        }
        Ok(result)
    }
}
