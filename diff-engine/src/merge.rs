//! Three-way auto-merge and two-way pull.
//!
//! [`AutoMergeDiffer`] is a [`Differ`] whose conflict groups get a second
//! look: when both sides changed the same region in ways that can still be
//! lined up, the conflict is split into smaller coherent and conflicting
//! pieces. [`Merger`] walks the resulting chunks to produce merged text.

use std::borrow::Cow;
use std::ops::{Deref, DerefMut};

use crate::buffer::{BufferEdit, Newline};
use crate::differ::{coherent_merge, ChunkChanges, Differ, GroupMerge, SetSequences};
use crate::matcher::{MyersMatcher, SequenceMatcher};
use crate::types::{DiffChunk, MergedChunk, Progress, Tag, Token};

/// Group resolution that retries conflicts with alignment heuristics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtendedMerge {
    pub enabled: bool,
}

impl GroupMerge for ExtendedMerge {
    fn merge_group<T: Token>(
        &self,
        using: &[Vec<DiffChunk>; 2],
        texts: &[&[T]],
        out: &mut Vec<MergedChunk>,
    ) {
        let merged = coherent_merge(using, texts);
        let (Some(left), Some(right)) = (merged.left, merged.right) else {
            out.push(merged);
            return;
        };
        if !self.enabled || left.tag != Tag::Conflict {
            out.push(merged);
            return;
        }
        if align_equal_lengths(left, right, texts, out) {
            return;
        }
        if using.iter().flatten().all(|c| c.tag == Tag::Delete) {
            align_deletions(using, out);
            return;
        }
        out.push(merged);
    }
}

/// Split a conflict whose outer sides can be matched against each other
/// line for line. Returns false when the heuristic does not apply.
fn align_equal_lengths<T: Token>(
    left: DiffChunk,
    right: DiffChunk,
    texts: &[&[T]],
    out: &mut Vec<MergedChunk>,
) -> bool {
    let (l0, h0) = (left.start_b, left.end_b);
    let (l1, h1) = (left.start_a, left.end_a);
    let (l2, h2) = (right.start_b, right.end_b);
    let (len0, len1, len2) = (h0 - l0, h1 - l1, h2 - l2);

    if len0 == 0 || len2 == 0 || !(len0 == len1 || len2 == len1 || len1 == 0) {
        return false;
    }

    let mut matcher = MyersMatcher::new(&texts[0][l0..h0], &texts[2][l2..h2]);
    for sub in matcher.opcodes() {
        let (s1, e1) = if len0 == len1 {
            (l1 + sub.start_a, l1 + sub.end_a)
        } else if len2 == len1 {
            (l1 + sub.start_b, l1 + sub.end_b)
        } else {
            (l1, l1)
        };
        let tag = if sub.tag == Tag::Equal {
            Tag::Replace
        } else {
            Tag::Conflict
        };
        out.push(MergedChunk::both(
            DiffChunk::new(tag, s1, e1, l0 + sub.start_a, l0 + sub.end_a),
            DiffChunk::new(tag, s1, e1, l2 + sub.start_b, l2 + sub.end_b),
        ));
    }
    true
}

/// Interleave two lists of deletions. Ranges both sides delete become
/// `delete` pairs; ranges only one side deletes become `conflict` pairs.
fn align_deletions(using: &[Vec<DiffChunk>; 2], out: &mut Vec<MergedChunk>) {
    let mut queues = [using[0].iter().copied(), using[1].iter().copied()];
    let mut current: [Option<DiffChunk>; 2] = [queues[0].next(), queues[1].next()];
    let (Some(first0), Some(first1)) = (current[0], current[1]) else {
        return;
    };
    let mut pos = [first0.start_a, first1.start_a];
    // Outer pane position just after each side's latest deletion.
    let mut end = [first0.end_b, first1.end_b];

    loop {
        let (Some(seq0), Some(seq1)) = (current[0], current[1]) else {
            break;
        };
        let high_start = pos[0].max(pos[1]);
        if pos[0] != pos[1] {
            // Only the later-starting side still has these lines, right
            // before its own deletion.
            let low = pos[0].min(pos[1]);
            let kept0 = high_start - pos[1];
            let kept1 = high_start - pos[0];
            out.push(MergedChunk::both(
                DiffChunk::new(Tag::Conflict, low, high_start, seq0.start_b.saturating_sub(kept0), seq0.start_b),
                DiffChunk::new(Tag::Conflict, low, high_start, seq1.start_b.saturating_sub(kept1), seq1.start_b),
            ));
        }

        let low_end = seq0.end_a.min(seq1.end_a);
        if high_start < low_end {
            out.push(MergedChunk::both(
                DiffChunk::new(Tag::Delete, high_start, low_end, seq0.start_b, seq0.end_b),
                DiffChunk::new(Tag::Delete, high_start, low_end, seq1.start_b, seq1.end_b),
            ));
        }

        pos = [low_end, low_end];
        for side in 0..2 {
            let Some(chunk) = current[side] else { continue };
            if chunk.end_a <= low_end {
                end[side] = chunk.end_b;
                current[side] = queues[side].next();
                if let Some(next) = current[side] {
                    pos[side] = next.start_a;
                }
            }
        }
    }

    // Whatever one side still deletes, the other side keeps.
    for side in 0..2 {
        let other = 1 - side;
        while let Some(chunk) = current[side] {
            let lo = pos[side].max(chunk.start_a);
            let own = DiffChunk::new(Tag::Conflict, lo, chunk.end_a, chunk.start_b, chunk.end_b);
            let kept = DiffChunk::new(Tag::Conflict, lo, chunk.end_a, end[other], end[other] + chunk.end_a - lo);
            out.push(if side == 0 {
                MergedChunk::both(own, kept)
            } else {
                MergedChunk::both(kept, own)
            });
            current[side] = queues[side].next();
            if let Some(next) = current[side] {
                pos[side] = next.start_a;
            }
        }
    }
}

/// A [`Differ`] with extended auto-merge and tracking of unresolved
/// conflict marker lines in pane 1.
#[derive(Debug)]
pub struct AutoMergeDiffer {
    differ: Differ<ExtendedMerge>,
    unresolved: Vec<usize>,
}

impl Default for AutoMergeDiffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for AutoMergeDiffer {
    type Target = Differ<ExtendedMerge>;

    fn deref(&self) -> &Self::Target {
        &self.differ
    }
}

impl DerefMut for AutoMergeDiffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.differ
    }
}

impl AutoMergeDiffer {
    /// Extended auto-merge starts disabled, giving plain differ results.
    pub fn new() -> Self {
        Self {
            differ: Differ::with_merge(ExtendedMerge::default()),
            unresolved: Vec::new(),
        }
    }

    pub fn set_auto_merge(&mut self, enabled: bool) {
        self.differ.merge_strategy_mut().enabled = enabled;
    }

    pub fn auto_merge(&self) -> bool {
        self.differ.merge_strategy().enabled
    }

    /// Pane 1 lines holding conflict markers, ascending.
    pub fn unresolved(&self) -> &[usize] {
        &self.unresolved
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved.len()
    }

    pub fn set_unresolved(&mut self, lines: Vec<usize>) {
        self.unresolved = lines;
    }

    /// Like [`Differ::change_sequence`], also moving or dropping marker
    /// lines affected by an edit to pane 1.
    pub fn change_sequence<T: Token>(
        &mut self,
        pane: usize,
        start: usize,
        size_change: isize,
        texts: &[&[T]],
    ) -> ChunkChanges {
        if pane == 1 {
            self.shift_unresolved(start, size_change);
        }
        self.differ.change_sequence(pane, start, size_change, texts)
    }

    /// Like [`Differ::apply_edit`], also moving or dropping marker lines
    /// affected by an edit to pane 1.
    pub fn apply_edit<T: Token>(&mut self, pane: usize, edit: BufferEdit, texts: &[&[T]]) -> ChunkChanges {
        if pane == 1 {
            self.shift_unresolved(edit.start_line, edit.line_delta);
        }
        self.differ.apply_edit(pane, edit, texts)
    }

    fn shift_unresolved(&mut self, start: usize, size_change: isize) {
        let lo = self.unresolved.partition_point(|&line| line < start);
        if lo == self.unresolved.len() {
            return;
        }
        let mut hi = lo;
        if size_change < 0 {
            let deleted_end = start + size_change.unsigned_abs();
            hi += self.unresolved[lo..].partition_point(|&line| line < deleted_end);
        } else if size_change == 0 && self.unresolved[lo] == start {
            hi += 1;
        }
        for line in &mut self.unresolved[hi..] {
            *line = line.saturating_add_signed(size_change);
        }
        self.unresolved.drain(lo..hi);
    }
}

/// Formatting of merge output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOptions {
    /// Prefix marking each unresolved line.
    pub marker: String,
    /// Joins output lines.
    pub newline: Newline,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            marker: "(??)".to_string(),
            newline: Newline::Lf,
        }
    }
}

/// Merged text plus the output lines holding conflict markers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutput {
    pub text: String,
    pub unresolved: Vec<usize>,
}

impl MergeOutput {
    pub fn has_conflicts(&self) -> bool {
        !self.unresolved.is_empty()
    }
}

/// Produces merged text from an auto-merged comparison.
#[derive(Debug)]
pub struct Merger {
    differ: AutoMergeDiffer,
    options: MergeOptions,
}

impl Default for Merger {
    fn default() -> Self {
        Self::new(MergeOptions::default())
    }
}

impl Merger {
    pub fn new(options: MergeOptions) -> Self {
        let mut differ = AutoMergeDiffer::new();
        differ.set_auto_merge(true);
        Self { differ, options }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    pub fn differ(&self) -> &AutoMergeDiffer {
        &self.differ
    }

    pub fn differ_mut(&mut self) -> &mut AutoMergeDiffer {
        &mut self.differ
    }

    pub fn unresolved(&self) -> &[usize] {
        self.differ.unresolved()
    }

    /// Compare the texts to merge. Must be driven to completion before
    /// producing output.
    pub fn initialize<'s, T: Token + 's>(&mut self, texts: &'s [&'s [T]]) -> SetSequences<'_, 's, T, ExtendedMerge> {
        self.differ.set_sequences(texts)
    }

    /// Merge panes 0 and 2 into pane 1, one chunk per step. `texts` must
    /// be the texts given to [`Merger::initialize`].
    pub fn merge_3_files<'m, 's, T: AsRef<str>>(
        &'m mut self,
        texts: &'s [&'s [T]],
        mark_conflicts: bool,
    ) -> ThreeWayMerge<'m, 's, T> {
        assert_eq!(texts.len(), 3, "three-way merge needs three texts");
        ThreeWayMerge {
            merger: self,
            texts,
            mark_conflicts,
            next: 0,
            lastline: 0,
            mergedline: 0,
            lines: Vec::new(),
            unresolved: Vec::new(),
            output: None,
        }
    }

    /// Apply every non-conflicting change from `from_pane` to `to_pane`,
    /// one chunk per step. Conflicts keep the destination text.
    pub fn merge_2_files<'m, 's, T: AsRef<str>>(
        &'m mut self,
        texts: &'s [&'s [T]],
        from_pane: usize,
        to_pane: usize,
    ) -> TwoWayMerge<'m, 's, T> {
        let changes = self.differ.pair_changes(to_pane, from_pane, None);
        TwoWayMerge {
            merger: self,
            from: texts[from_pane],
            to: texts[to_pane],
            changes,
            next: 0,
            lastline: 0,
            lines: Vec::new(),
            output: None,
        }
    }
}

/// Emit the outer-pane payload of `change` and return the number of pane
/// lines (on its `a` side) it replaces.
fn apply_change<'s, T: AsRef<str>>(text: &'s [T], change: &DiffChunk, out: &mut Vec<Cow<'s, str>>) -> usize {
    match change.tag {
        Tag::Insert => {
            out.extend(text[change.start_b..change.end_b].iter().map(|l| Cow::Borrowed(l.as_ref())));
            0
        }
        Tag::Replace => {
            out.extend(text[change.start_b..change.end_b].iter().map(|l| Cow::Borrowed(l.as_ref())));
            change.len_a()
        }
        _ => change.len_a(),
    }
}

fn join_lines(lines: &[Cow<'_, str>], newline: Newline) -> String {
    lines.join(newline.as_str())
}

/// Resumable three-way merge returned by [`Merger::merge_3_files`].
pub struct ThreeWayMerge<'m, 's, T> {
    merger: &'m mut Merger,
    texts: &'s [&'s [T]],
    mark_conflicts: bool,
    next: usize,
    lastline: usize,
    mergedline: usize,
    lines: Vec<Cow<'s, str>>,
    unresolved: Vec<usize>,
    output: Option<MergeOutput>,
}

impl<'s, T: AsRef<str>> ThreeWayMerge<'_, 's, T> {
    pub fn step(&mut self) -> Progress {
        if self.output.is_some() {
            return Progress::Done;
        }
        let base = self.texts[1];
        let Some(&change) = self.merger.differ.merge_cache().get(self.next) else {
            self.lines
                .extend(base[self.lastline..].iter().map(|l| Cow::Borrowed(l.as_ref())));
            let text = join_lines(&self.lines, self.merger.options.newline);
            let unresolved = std::mem::take(&mut self.unresolved);
            self.merger.differ.set_unresolved(unresolved.clone());
            tracing::debug!(
                chunks = self.next,
                unresolved = unresolved.len(),
                "three-way merge finished"
            );
            self.output = Some(MergeOutput { text, unresolved });
            return Progress::Done;
        };
        self.next += 1;

        let mut low_mark = self.lastline;
        if let Some(left) = change.left {
            low_mark = left.start_a;
        }
        if let Some(right) = change.right {
            low_mark = low_mark.max(right.start_a);
        }
        self.lines
            .extend(base[self.lastline..low_mark].iter().map(|l| Cow::Borrowed(l.as_ref())));
        self.mergedline += low_mark - self.lastline;
        self.lastline = low_mark;

        match (change.left, change.right) {
            (Some(left), Some(right)) if left.tag == Tag::Conflict => {
                if self.mark_conflicts {
                    let high_mark = left.end_a.max(right.end_a);
                    let marker = &self.merger.options.marker;
                    if low_mark < high_mark {
                        for line in &base[low_mark..high_mark] {
                            self.lines.push(Cow::Owned(format!("{marker}{}", line.as_ref())));
                            self.unresolved.push(self.mergedline);
                            self.mergedline += 1;
                        }
                    } else {
                        self.lines.push(Cow::Owned(marker.clone()));
                        self.unresolved.push(self.mergedline);
                        self.mergedline += 1;
                    }
                    self.lastline = high_mark;
                }
            }
            (Some(left), _) => {
                self.lastline += apply_change(self.texts[0], &left, &mut self.lines);
                self.mergedline += left.len_b();
            }
            (None, Some(right)) => {
                self.lastline += apply_change(self.texts[2], &right, &mut self.lines);
                self.mergedline += right.len_b();
            }
            (None, None) => {}
        }
        Progress::Yield
    }

    pub fn run(mut self) -> MergeOutput {
        while !self.step().is_done() {}
        self.output.unwrap_or_default()
    }
}

/// Resumable two-way pull returned by [`Merger::merge_2_files`].
pub struct TwoWayMerge<'m, 's, T> {
    merger: &'m mut Merger,
    from: &'s [T],
    to: &'s [T],
    changes: Vec<DiffChunk>,
    next: usize,
    lastline: usize,
    lines: Vec<Cow<'s, str>>,
    output: Option<MergeOutput>,
}

impl<'s, T: AsRef<str>> TwoWayMerge<'_, 's, T> {
    pub fn step(&mut self) -> Progress {
        if self.output.is_some() {
            return Progress::Done;
        }
        let Some(&change) = self.changes.get(self.next) else {
            self.lines
                .extend(self.to[self.lastline..].iter().map(|l| Cow::Borrowed(l.as_ref())));
            let text = join_lines(&self.lines, self.merger.options.newline);
            self.merger.differ.set_unresolved(Vec::new());
            self.output = Some(MergeOutput {
                text,
                unresolved: Vec::new(),
            });
            return Progress::Done;
        };
        self.next += 1;

        // Conflicts keep the destination, so copy through their end.
        let low_mark = if change.tag == Tag::Conflict {
            change.end_a
        } else {
            change.start_a
        };
        self.lines
            .extend(self.to[self.lastline..low_mark].iter().map(|l| Cow::Borrowed(l.as_ref())));
        self.lastline = low_mark;
        if change.tag != Tag::Conflict {
            self.lastline += apply_change(self.from, &change, &mut self.lines);
        }
        Progress::Yield
    }

    pub fn run(mut self) -> MergeOutput {
        while !self.step().is_done() {}
        self.output.unwrap_or_default()
    }
}
