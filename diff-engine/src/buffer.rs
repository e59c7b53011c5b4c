//! Text buffers and the lazy line view the differ compares.
//!
//! Line semantics follow a text widget rather than `str::lines`: a buffer
//! with `n` line terminators has `n + 1` lines, so `"a\n"` is the two lines
//! `"a"` and `""`. Recognised terminators are `\n`, `\r\n`, `\r` and U+2029.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::filter::FilterChain;

/// Line terminator style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Newline {
    #[default]
    Lf,
    CrLf,
    Cr,
}

impl Newline {
    pub fn as_str(self) -> &'static str {
        match self {
            Newline::Lf => "\n",
            Newline::CrLf => "\r\n",
            Newline::Cr => "\r",
        }
    }

    /// The style of the first terminator in `text`, if there is one.
    pub fn detect(text: &str) -> Option<Self> {
        let pos = text.find(['\n', '\r'])?;
        let rest = &text.as_bytes()[pos..];
        Some(match rest {
            [b'\r', b'\n', ..] => Newline::CrLf,
            [b'\r', ..] => Newline::Cr,
            _ => Newline::Lf,
        })
    }
}

impl fmt::Display for Newline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Newline::Lf => "lf",
            Newline::CrLf => "crlf",
            Newline::Cr => "cr",
        })
    }
}

/// Byte offsets where each line after the first starts.
fn line_breaks(text: &str) -> impl Iterator<Item = usize> + '_ {
    let bytes = text.as_bytes();
    text.char_indices().filter_map(move |(i, ch)| match ch {
        '\n' => Some(i + 1),
        '\r' if bytes.get(i + 1) != Some(&b'\n') => Some(i + 1),
        '\u{2029}' => Some(i + ch.len_utf8()),
        _ => None,
    })
}

/// Split text into buffer lines, dropping the terminators.
///
/// Other Unicode separators (U+2028, form feed, NEL) are not line breaks
/// here, so filtered text always splits like the buffer it came from.
pub fn split_buffer_lines(text: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut start = 0;
    for next in line_breaks(text) {
        lines.push(strip_terminator(&text[start..next]));
        start = next;
    }
    lines.push(&text[start..]);
    lines
}

fn strip_terminator(line: &str) -> &str {
    line.strip_suffix("\r\n")
        .or_else(|| line.strip_suffix('\n'))
        .or_else(|| line.strip_suffix('\r'))
        .or_else(|| line.strip_suffix('\u{2029}'))
        .unwrap_or(line)
}

/// Count of buffer line terminators in `text`.
pub fn count_line_breaks(text: &str) -> usize {
    line_breaks(text).count()
}

/// Read access to a line-addressed text store.
pub trait TextSource {
    fn line_count(&self) -> usize;

    /// Text from the start of `start` to the start of `end`, terminators
    /// included. `end >= line_count()` reads to the end of the buffer.
    fn text_between(&self, start: usize, end: usize) -> &str;
}

/// Lines touched by a buffer edit, as needed by [`crate::Differ::apply_edit`]
/// and [`BufferLines::invalidate`].
///
/// Old lines `start_line..=old_end_line` became new lines
/// `start_line..=new_end_line()`. The old end is recorded separately
/// because terminators can merge or split at the edit boundaries (deleting
/// the `\n` of `\r\n` leaves a lone `\r` that still breaks the line), so
/// the line delta alone does not say how many old lines were covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferEdit {
    pub start_line: usize,
    pub old_end_line: usize,
    pub line_delta: isize,
}

impl BufferEdit {
    /// Last line of the edited region after the edit.
    pub fn new_end_line(&self) -> usize {
        shift_end(self.old_end_line, self.line_delta)
    }
}

/// A plain in-memory text buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBuffer {
    text: String,
    line_starts: Vec<usize>,
}

impl TextBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        let mut buffer = Self {
            text: text.into(),
            line_starts: Vec::new(),
        };
        buffer.index_lines();
        buffer
    }

    fn index_lines(&mut self) {
        self.line_starts.clear();
        self.line_starts.push(0);
        self.line_starts.extend(line_breaks(&self.text));
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Detected newline style, `\n` for buffers without any terminator.
    pub fn newline(&self) -> Newline {
        Newline::detect(&self.text).unwrap_or_default()
    }

    pub fn ends_with_newline(&self) -> bool {
        self.line_starts.last().is_some_and(|&start| start == self.text.len() && start > 0)
    }

    /// Byte offset of the start of `line`; `line_count()` maps to the end.
    pub fn line_offset(&self, line: usize) -> usize {
        self.line_starts.get(line).copied().unwrap_or(self.text.len())
    }

    /// Line containing the byte `offset`.
    pub fn line_at_offset(&self, offset: usize) -> usize {
        self.line_starts.partition_point(|&start| start <= offset).saturating_sub(1)
    }

    /// Text of one line without its terminator.
    pub fn line(&self, line: usize) -> &str {
        strip_terminator(self.text_between(line, line + 1))
    }

    pub fn insert(&mut self, offset: usize, text: &str) -> BufferEdit {
        assert!(self.text.is_char_boundary(offset), "insert offset {offset} splits a character");
        let start_line = self.edit_start_line(offset);
        let old_end_line = self.line_at_offset(offset);
        let before = self.line_count();
        self.text.insert_str(offset, text);
        self.index_lines();
        BufferEdit {
            start_line,
            old_end_line,
            line_delta: self.line_count() as isize - before as isize,
        }
    }

    /// Remove `[start, end)`, returning the removed text.
    pub fn delete(&mut self, start: usize, end: usize) -> (String, BufferEdit) {
        assert!(start <= end && end <= self.text.len(), "invalid delete range {start}..{end}");
        assert!(
            self.text.is_char_boundary(start) && self.text.is_char_boundary(end),
            "delete range {start}..{end} splits a character"
        );
        let start_line = self.edit_start_line(start);
        let old_end_line = self.line_at_offset(end);
        let before = self.line_count();
        let removed: String = self.text.drain(start..end).collect();
        self.index_lines();
        let edit = BufferEdit {
            start_line,
            old_end_line,
            line_delta: self.line_count() as isize - before as isize,
        };
        (removed, edit)
    }

    /// First line an edit at `offset` can change. Text arriving right after
    /// a `\r` may join it into `\r\n`, which rewrites the line it ends.
    fn edit_start_line(&self, offset: usize) -> usize {
        if offset > 0 && self.text.as_bytes()[offset - 1] == b'\r' {
            self.line_at_offset(offset - 1)
        } else {
            self.line_at_offset(offset)
        }
    }
}

impl TextSource for TextBuffer {
    fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    fn text_between(&self, start: usize, end: usize) -> &str {
        let lo = self.line_offset(start);
        let hi = self.line_offset(end).max(lo);
        &self.text[lo..hi]
    }
}

impl fmt::Display for TextBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Lazily materialised, filtered lines of one buffer.
///
/// The cache holds one slot per buffer line; edits punch `None` holes into
/// it and holes are filled on access by reading the whole run of missing
/// lines from the source and passing it through the filter chain.
#[derive(Debug, Default)]
pub struct BufferLines {
    cache: Vec<Option<String>>,
    filters: FilterChain,
    filter_error: Option<EngineError>,
}

impl BufferLines {
    pub fn new(source: &impl TextSource, filters: FilterChain) -> Self {
        Self {
            cache: vec![None; source.line_count()],
            filters,
            filter_error: None,
        }
    }

    pub fn line_count(&self) -> usize {
        self.cache.len()
    }

    /// Replace the filter chain and drop every cached line.
    pub fn set_filters(&mut self, filters: FilterChain) {
        self.filters = filters;
        self.filter_error = None;
        self.cache.iter_mut().for_each(|line| *line = None);
    }

    /// The filter violation seen so far for this document, if any.
    pub fn filter_error(&self) -> Option<&EngineError> {
        self.filter_error.as_ref()
    }

    /// Drop cached lines touched by `edit`. Inserted lines become holes.
    pub fn invalidate(&mut self, edit: BufferEdit) {
        let start = edit.start_line.min(self.cache.len());
        let replace_end = (edit.old_end_line + 1).clamp(start, self.cache.len());
        let holes = (edit.new_end_line() + 1).saturating_sub(start);
        self.cache.splice(start..replace_end, std::iter::repeat(None).take(holes));
    }

    fn materialise(&mut self, source: &impl TextSource, lo: usize, hi: usize) {
        debug_assert_eq!(self.cache.len(), source.line_count(), "line cache out of sync with buffer");
        let mut run_start = lo;
        while run_start < hi {
            if self.cache[run_start].is_some() {
                run_start += 1;
                continue;
            }
            let mut run_end = run_start;
            while run_end < hi && self.cache[run_end].is_none() {
                run_end += 1;
            }
            self.fill(source, run_start, run_end);
            run_start = run_end;
        }
    }

    fn fill(&mut self, source: &impl TextSource, lo: usize, hi: usize) {
        let raw = source.text_between(lo, hi);
        let filtered = match self.filters.apply(raw) {
            Ok(text) => text,
            Err(err) => {
                if self.filter_error.is_none() {
                    tracing::warn!(error = %err, "text filter changed line count; comparing unfiltered text");
                    self.filter_error = Some(err);
                }
                raw.to_string()
            }
        };

        let mut lines = split_buffer_lines(&filtered);
        if hi < source.line_count() {
            // Text stops at the start of `hi`, leaving an empty tail piece.
            lines.pop();
        }
        debug_assert_eq!(lines.len(), hi - lo);
        for (slot, line) in self.cache[lo..hi].iter_mut().zip(lines) {
            *slot = Some(line.to_string());
        }
    }

    /// One filtered line.
    pub fn get(&mut self, source: &impl TextSource, line: usize) -> &str {
        assert!(line < self.cache.len(), "line {line} out of range");
        self.materialise(source, line, line + 1);
        self.cache[line].as_deref().unwrap_or_default()
    }

    /// Filtered lines `[lo, hi)`, with `hi` clamped to the line count. The
    /// result always holds exactly `hi - lo` entries.
    pub fn slice(&mut self, source: &impl TextSource, lo: usize, hi: usize) -> Vec<&str> {
        let hi = hi.min(self.cache.len());
        let lo = lo.min(hi);
        self.materialise(source, lo, hi);
        self.cache[lo..hi]
            .iter()
            .map(|line| line.as_deref().unwrap_or_default())
            .collect()
    }

    /// Every line, ready to hand to the differ.
    pub fn lines(&mut self, source: &impl TextSource) -> Vec<&str> {
        self.slice(source, 0, self.cache.len())
    }
}

fn shift_end(value: usize, by: isize) -> usize {
    value.checked_add_signed(by).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterRule;
    use proptest::prelude::*;

    #[test]
    fn test_split_buffer_lines() {
        assert_eq!(split_buffer_lines("a\nb"), vec!["a", "b"]);
        assert_eq!(split_buffer_lines("a\r\nb\r\n"), vec!["a", "b", ""]);
        assert_eq!(split_buffer_lines("a\rb\u{2029}c"), vec!["a", "b", "c"]);
        assert_eq!(split_buffer_lines(""), vec![""]);
        // Separators the buffer does not break on stay inside the line.
        assert_eq!(split_buffer_lines("a\u{2028}b\x0cc\u{85}d"), vec!["a\u{2028}b\x0cc\u{85}d"]);
    }

    #[test]
    fn test_newline_detect() {
        assert_eq!(Newline::detect("a\r\nb\n"), Some(Newline::CrLf));
        assert_eq!(Newline::detect("a\rb"), Some(Newline::Cr));
        assert_eq!(Newline::detect("a\nb"), Some(Newline::Lf));
        assert_eq!(Newline::detect("ab"), None);
        assert_eq!(TextBuffer::new("x").newline(), Newline::Lf);
    }

    #[test]
    fn test_buffer_line_model() {
        let buffer = TextBuffer::new("one\ntwo\n");
        assert_eq!(buffer.line_count(), 3);
        assert_eq!(buffer.line(0), "one");
        assert_eq!(buffer.line(2), "");
        assert!(buffer.ends_with_newline());
        assert_eq!(buffer.line_at_offset(4), 1);
        assert_eq!(buffer.text_between(1, 5), "two\n");
        assert!(!TextBuffer::new("").ends_with_newline());
    }

    #[test]
    fn test_buffer_edits_report_line_delta() {
        let mut buffer = TextBuffer::new("a\nb\nc");
        let edit = buffer.insert(2, "x\ny\n");
        assert_eq!(edit, BufferEdit { start_line: 1, old_end_line: 1, line_delta: 2 });
        assert_eq!(edit.new_end_line(), 3);
        assert_eq!(buffer.text(), "a\nx\ny\nb\nc");

        let (removed, edit) = buffer.delete(0, 4);
        assert_eq!(removed, "a\nx\n");
        assert_eq!(edit, BufferEdit { start_line: 0, old_end_line: 2, line_delta: -2 });
        assert_eq!(edit.new_end_line(), 0);
        assert_eq!(buffer.line_count(), 3);

        let edit = buffer.insert(1, "Z");
        assert_eq!(edit, BufferEdit { start_line: 0, old_end_line: 0, line_delta: 0 });
    }

    #[test]
    fn test_delete_splitting_crlf_covers_every_old_line() {
        let mut buffer = TextBuffer::new("\r\r\n\na");
        let mut lines = BufferLines::new(&buffer, FilterChain::default());
        assert_eq!(lines.lines(&buffer), vec!["", "", "", "a"]);

        let (removed, edit) = buffer.delete(2, 5);
        assert_eq!(removed, "\n\na");
        assert_eq!(edit, BufferEdit { start_line: 1, old_end_line: 3, line_delta: -1 });
        lines.invalidate(edit);
        assert_eq!(lines.lines(&buffer), vec!["", "", ""]);
    }

    #[test]
    fn test_insert_after_cr_joins_terminator() {
        let mut buffer = TextBuffer::new("a\rx\rb");
        let mut lines = BufferLines::new(&buffer, FilterChain::default());
        assert_eq!(lines.lines(&buffer), vec!["a", "x", "b"]);

        // "\r" + "\n" becomes one terminator, so line 1 ends differently.
        let edit = buffer.insert(2, "\n");
        assert_eq!(edit.start_line, 0);
        lines.invalidate(edit);
        assert_eq!(lines.lines(&buffer), split_buffer_lines(buffer.text()));

        let (_, edit) = buffer.delete(3, 4);
        lines.invalidate(edit);
        assert_eq!(lines.lines(&buffer), vec!["a", "", "b"]);
    }

    #[test]
    fn test_lines_slice_lengths() {
        let buffer = TextBuffer::new("a\nb\nc");
        let mut lines = BufferLines::new(&buffer, FilterChain::default());
        assert_eq!(lines.slice(&buffer, 0, 3), vec!["a", "b", "c"]);
        assert_eq!(lines.slice(&buffer, 1, 10), vec!["b", "c"]);
        assert_eq!(lines.get(&buffer, 1), "b");

        let buffer = TextBuffer::new("a\nb\n");
        let mut lines = BufferLines::new(&buffer, FilterChain::default());
        // The unterminated empty last line is part of the view.
        assert_eq!(lines.lines(&buffer), vec!["a", "b", ""]);
    }

    #[test]
    fn test_invalidate_after_insert_and_delete() {
        let mut buffer = TextBuffer::new("a\nb\nc");
        let mut lines = BufferLines::new(&buffer, FilterChain::default());
        assert_eq!(lines.lines(&buffer).len(), 3);

        let edit = buffer.insert(2, "x\ny\n");
        lines.invalidate(edit);
        assert_eq!(lines.line_count(), 5);
        assert_eq!(lines.lines(&buffer), vec!["a", "x", "y", "b", "c"]);

        let (_, edit) = buffer.delete(2, 6);
        lines.invalidate(edit);
        assert_eq!(lines.lines(&buffer), vec!["a", "b", "c"]);

        let edit = buffer.insert(buffer.len(), "!");
        lines.invalidate(edit);
        assert_eq!(lines.lines(&buffer), vec!["a", "b", "c!"]);
    }

    #[test]
    fn test_filters_applied_to_lines() {
        let buffer = TextBuffer::new("x = 1 # one\ny = 2\n");
        let chain = FilterChain::new(vec![FilterRule::new("comment", "#.*", true).unwrap()]);
        let mut lines = BufferLines::new(&buffer, chain);
        assert_eq!(lines.lines(&buffer), vec!["x = 1 ", "y = 2", ""]);
        assert!(lines.filter_error().is_none());
    }

    #[test]
    fn test_line_changing_filter_falls_back() {
        let buffer = TextBuffer::new("a\nb");
        let chain = FilterChain::new(vec![FilterRule::new("eat newline", r"a\n", true).unwrap()]);
        let mut lines = BufferLines::new(&buffer, chain);
        assert_eq!(lines.lines(&buffer), vec!["a", "b"]);
        assert!(matches!(
            lines.filter_error(),
            Some(EngineError::FilterChangedLineCount { .. })
        ));
    }

    #[derive(Debug, Clone)]
    enum Edit {
        Insert(usize, String),
        Delete(usize, usize),
    }

    fn edit_strategy() -> impl Strategy<Value = Edit> {
        prop_oneof![
            (any::<usize>(), "[ab\r\n]{1,4}").prop_map(|(at, text)| Edit::Insert(at, text)),
            (any::<usize>(), 0usize..6).prop_map(|(at, len)| Edit::Delete(at, len)),
        ]
    }

    proptest! {
        #[test]
        fn test_line_cache_tracks_random_edits(
            initial in "[ab\r\n]{0,12}",
            edits in prop::collection::vec(edit_strategy(), 1..10),
        ) {
            let mut buffer = TextBuffer::new(initial);
            let mut lines = BufferLines::new(&buffer, FilterChain::default());
            prop_assert_eq!(lines.lines(&buffer), split_buffer_lines(buffer.text()));

            for edit in edits {
                let edit = match edit {
                    Edit::Insert(at, text) => buffer.insert(at % (buffer.len() + 1), &text),
                    Edit::Delete(at, len) => {
                        let start = at % (buffer.len() + 1);
                        let end = (start + len).min(buffer.len());
                        buffer.delete(start, end).1
                    }
                };
                lines.invalidate(edit);
                prop_assert_eq!(lines.line_count(), buffer.line_count());
                prop_assert_eq!(lines.lines(&buffer), split_buffer_lines(buffer.text()));
            }
        }
    }
}
