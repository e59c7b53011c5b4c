//! Incrementally maintained two- and three-way chunk model.
//!
//! Internally the differ stores two opcode lists, pane 1 → pane 0 and
//! pane 1 → pane 2, both with pane 1 (the pivot) on the `a` side. From them
//! it derives:
//!
//! - the *merge cache*, a flat list of [`MergedChunk`]s in pane 1 order;
//! - the conflict index;
//! - a per-pane *line cache* answering "which chunk is at this line, and
//!   which are the previous and next ones" in O(1);
//! - a mergeability summary per pane.
//!
//! Edits are applied with [`Differ::change_sequence`] (or
//! [`Differ::apply_edit`] for a [`BufferEdit`]), which re-diffs only
//! the window between the chunks neighbouring the edit and reports what
//! changed through [`ChunkChanges`].

use std::collections::{HashSet, VecDeque};
use std::fmt;

use crate::buffer::BufferEdit;
use crate::matcher::{diff_opcodes, MyersMatcher, SequenceMatcher, SyncPointMatcher};
use crate::scheduler::{Task, TaskStep};
use crate::types::{DiffChunk, MergedChunk, Progress, Tag, Token};

/// Chunk indices around a line: the chunk containing it, if any, and the
/// nearest changed chunks before and after it on that pane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkLocation {
    pub current: Option<usize>,
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

impl ChunkLocation {
    pub fn new(current: Option<usize>, prev: Option<usize>, next: Option<usize>) -> Self {
        Self { current, prev, next }
    }
}

/// Delta emitted after every rebuild of the merge cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkChanges {
    /// Chunks present before the change but not after.
    pub removed: HashSet<MergedChunk>,
    /// Chunks present only after the change.
    pub added: HashSet<MergedChunk>,
    /// The surviving chunk that contained the edit site.
    pub modified: Option<MergedChunk>,
}

impl ChunkChanges {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty() && self.modified.is_none()
    }
}

/// Receiver of `diffs-changed` notifications.
pub trait DiffsChangedSink {
    fn diffs_changed(&mut self, changes: &ChunkChanges);
}

impl<F: FnMut(&ChunkChanges)> DiffsChangedSink for F {
    fn diffs_changed(&mut self, changes: &ChunkChanges) {
        self(changes)
    }
}

/// Resolution of a group of overlapping changes from both opcode lists.
///
/// `using[0]` holds the pane 1 → pane 0 opcodes of the group and `using[1]`
/// the pane 1 → pane 2 ones; both are non-empty and ascending.
pub trait GroupMerge {
    fn merge_group<T: Token>(
        &self,
        using: &[Vec<DiffChunk>; 2],
        texts: &[&[T]],
        out: &mut Vec<MergedChunk>,
    );
}

/// Treats a two-sided group as coherent when both outer panes end up with
/// identical text, and as a conflict otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoherentMerge;

impl GroupMerge for CoherentMerge {
    fn merge_group<T: Token>(
        &self,
        using: &[Vec<DiffChunk>; 2],
        texts: &[&[T]],
        out: &mut Vec<MergedChunk>,
    ) {
        out.push(coherent_merge(using, texts));
    }
}

/// Pane windows `(l0, h0, l1, h1, l2, h2)` covered by a two-sided group.
fn merge_blocks(using: &[Vec<DiffChunk>; 2]) -> [usize; 6] {
    let (Some(first0), Some(first1), Some(last0), Some(last1)) = (
        using[0].first(),
        using[1].first(),
        using[0].last(),
        using[1].last(),
    ) else {
        panic!("merge group must hold opcodes from both sides");
    };
    let lowc = first0.start_a.min(first1.start_a);
    let highc = last0.end_a.max(last1.end_a);

    let low = |d: &DiffChunk| d.start_b.saturating_sub(d.start_a - lowc);
    let high = |d: &DiffChunk| d.end_b + (highc - d.end_a);
    [
        low(first0),
        high(last0),
        lowc,
        highc,
        low(first1),
        high(last1),
    ]
}

pub(crate) fn coherent_merge<T: Token>(using: &[Vec<DiffChunk>; 2], texts: &[&[T]]) -> MergedChunk {
    let [l0, h0, l1, h1, l2, h2] = merge_blocks(using);
    let tag = if h0 - l0 == h2 - l2 && texts[0][l0..h0] == texts[2][l2..h2] {
        if l1 != h1 && l0 == h0 {
            Tag::Delete
        } else if l1 != h1 {
            Tag::Replace
        } else {
            Tag::Insert
        }
    } else {
        Tag::Conflict
    };
    MergedChunk::both(
        DiffChunk::new(tag, l1, h1, l0, h0),
        DiffChunk::new(tag, l1, h1, l2, h2),
    )
}

/// Shave blank lines off both ends of each side of a chunk. Returns `None`
/// when nothing but blank lines remain.
fn consume_blank_lines<T: Token>(
    chunk: DiffChunk,
    texts: &[&[T]],
    pane_a: usize,
    pane_b: usize,
) -> Option<DiffChunk> {
    fn trim<T: Token>(text: &[T], mut lo: usize, mut hi: usize) -> (usize, usize) {
        while lo < hi && text[lo].is_blank() {
            lo += 1;
        }
        while lo < hi && text[hi - 1].is_blank() {
            hi -= 1;
        }
        (lo, hi)
    }

    let (c1, c2) = trim(texts[pane_a], chunk.start_a, chunk.end_a);
    let (c3, c4) = trim(texts[pane_b], chunk.start_b, chunk.end_b);
    if c1 == c2 && c3 == c4 {
        return None;
    }
    let tag = match chunk.tag {
        Tag::Replace if c1 == c2 => Tag::Insert,
        Tag::Replace if c3 == c4 => Tag::Delete,
        tag => tag,
    };
    Some(DiffChunk::new(tag, c1, c2, c3, c4))
}

/// Apply a signed offset to a line index. Going negative is a caller bug.
fn shift(value: usize, by: isize) -> usize {
    value
        .checked_add_signed(by)
        .unwrap_or_else(|| panic!("line index {value} shifted by {by} went negative"))
}

/// Shift the parts of a chunk lying after `start` by `by_a` / `by_b`.
fn offset_after(chunk: Option<DiffChunk>, start: usize, by_a: isize, by_b: isize) -> Option<DiffChunk> {
    chunk.map(|c| {
        let move_a = |v: usize| if v > start { shift(v, by_a) } else { v };
        let move_b = |v: usize| if v > start { shift(v, by_b) } else { v };
        DiffChunk::new(c.tag, move_a(c.start_a), move_a(c.end_a), move_b(c.start_b), move_b(c.end_b))
    })
}

/// Holds the diff state for one comparison of up to three sequences.
pub struct Differ<M = CoherentMerge> {
    num_sequences: usize,
    seqlength: [usize; 3],
    diffs: [Vec<DiffChunk>; 2],
    syncpoints: [Vec<(usize, usize)>; 2],
    conflicts: Vec<usize>,
    merge_cache: Vec<MergedChunk>,
    old_merge_cache: HashSet<MergedChunk>,
    changed_chunk: Option<MergedChunk>,
    line_cache: [Vec<ChunkLocation>; 3],
    ignore_blanks: bool,
    initialised: bool,
    mergeable: [bool; 4],
    merge: M,
    sinks: Vec<Box<dyn DiffsChangedSink>>,
}

impl Default for Differ<CoherentMerge> {
    fn default() -> Self {
        Self::new()
    }
}

impl Differ<CoherentMerge> {
    pub fn new() -> Self {
        Self::with_merge(CoherentMerge)
    }
}

impl<M> fmt::Debug for Differ<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Differ")
            .field("num_sequences", &self.num_sequences)
            .field("seqlength", &self.seqlength)
            .field("diffs", &self.diffs)
            .field("merge_cache", &self.merge_cache)
            .field("conflicts", &self.conflicts)
            .field("initialised", &self.initialised)
            .finish_non_exhaustive()
    }
}

impl<M: GroupMerge> Differ<M> {
    /// An empty differ resolving two-sided groups with `merge`.
    pub fn with_merge(merge: M) -> Self {
        Self {
            num_sequences: 0,
            seqlength: [0; 3],
            diffs: [Vec::new(), Vec::new()],
            syncpoints: [Vec::new(), Vec::new()],
            conflicts: Vec::new(),
            merge_cache: Vec::new(),
            old_merge_cache: HashSet::new(),
            changed_chunk: None,
            line_cache: Default::default(),
            ignore_blanks: false,
            initialised: false,
            mergeable: [false; 4],
            merge,
            sinks: Vec::new(),
        }
    }

    pub fn merge_strategy(&self) -> &M {
        &self.merge
    }

    pub fn merge_strategy_mut(&mut self) -> &mut M {
        &mut self.merge
    }

    /// Register a receiver for `diffs-changed` notifications.
    pub fn connect(&mut self, sink: impl DiffsChangedSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    /// Takes effect on the next rebuild of the merge cache.
    pub fn set_ignore_blanks(&mut self, ignore: bool) {
        self.ignore_blanks = ignore;
    }

    pub fn ignore_blanks(&self) -> bool {
        self.ignore_blanks
    }

    /// Alignment points for one pair, as `(pane 1 line, outer pane line)`.
    /// Pair 0 is pane 1 ↔ pane 0, pair 1 is pane 1 ↔ pane 2. Used by the
    /// next [`Differ::set_sequences`].
    pub fn set_sync_points(&mut self, pair: usize, points: Vec<(usize, usize)>) {
        assert!(pair < 2, "invalid sync point pair {pair}");
        self.syncpoints[pair] = points;
    }

    pub fn clear_sync_points(&mut self) {
        self.syncpoints = [Vec::new(), Vec::new()];
    }

    pub fn num_sequences(&self) -> usize {
        self.num_sequences
    }

    pub fn seqlength(&self, pane: usize) -> usize {
        self.seqlength[pane]
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    /// The raw opcode list for pair 0 (pane 1 → 0) or pair 1 (pane 1 → 2).
    pub fn diffs(&self, pair: usize) -> &[DiffChunk] {
        &self.diffs[pair]
    }

    pub fn merge_cache(&self) -> &[MergedChunk] {
        &self.merge_cache
    }

    pub fn conflicts(&self) -> &[usize] {
        &self.conflicts
    }

    pub fn diff_count(&self) -> usize {
        self.merge_cache.len()
    }

    pub fn all_changes(&self) -> impl Iterator<Item = &MergedChunk> {
        self.merge_cache.iter()
    }

    /// Start a comparison of 1 to 3 sequences. The returned task must be
    /// driven to completion before the differ is queried.
    pub fn set_sequences<'d, 's, T: Token>(
        &'d mut self,
        sequences: &'s [&'s [T]],
    ) -> SetSequences<'d, 's, T, M> {
        assert!(sequences.len() <= 3, "at most three sequences can be compared");
        self.old_merge_cache = self.merge_cache.iter().copied().collect();
        self.changed_chunk = None;
        self.diffs = [Vec::new(), Vec::new()];
        self.num_sequences = sequences.len();
        self.seqlength = [0; 3];
        for (len, seq) in self.seqlength.iter_mut().zip(sequences) {
            *len = seq.len();
        }
        self.initialised = false;

        SetSequences {
            differ: self,
            sequences,
            pair: 0,
            matcher: None,
            changes: None,
        }
    }

    /// Reset to an initialised-but-empty state.
    pub fn clear(&mut self) -> ChunkChanges {
        self.old_merge_cache = self.merge_cache.iter().copied().collect();
        self.changed_chunk = None;
        self.diffs = [Vec::new(), Vec::new()];
        self.seqlength = [0; 3];
        self.initialised = false;
        let empty: [&[String]; 3] = [&[], &[], &[]];
        self.update_merge_cache(&empty[..self.num_sequences])
    }

    /// Notify the differ of an edit to `pane`.
    ///
    /// `start` is the first affected line before the edit, `size_change` the
    /// signed change in line count and `texts` the sequences after the edit.
    pub fn change_sequence<T: Token>(
        &mut self,
        pane: usize,
        start: usize,
        size_change: isize,
        texts: &[&[T]],
    ) -> ChunkChanges {
        let old_end = start + size_change.min(0).unsigned_abs();
        self.change_lines(pane, start, old_end, size_change, texts)
    }

    /// Notify the differ of a buffer edit whose touched lines are known
    /// exactly, such as one reported by [`crate::TextBuffer`].
    pub fn apply_edit<T: Token>(&mut self, pane: usize, edit: BufferEdit, texts: &[&[T]]) -> ChunkChanges {
        let old_end = edit.old_end_line.max(edit.start_line + edit.line_delta.min(0).unsigned_abs());
        self.change_lines(pane, edit.start_line, old_end, edit.line_delta, texts)
    }

    /// Old lines `start..=old_end` of `pane` were replaced, changing its
    /// length by `size_change`.
    fn change_lines<T: Token>(
        &mut self,
        pane: usize,
        start: usize,
        old_end: usize,
        size_change: isize,
        texts: &[&[T]],
    ) -> ChunkChanges {
        assert!(pane < 3, "invalid pane index {pane}");
        assert!(
            pane < self.num_sequences,
            "pane {pane} is not part of a {}-way comparison",
            self.num_sequences
        );
        assert_eq!(texts.len(), self.num_sequences, "one text per compared sequence");

        if pane == 0 || pane == 1 {
            self.change_pair(0, pane, start, old_end, size_change, texts);
        }
        if pane == 2 || (pane == 1 && self.num_sequences == 3) {
            self.change_pair(1, pane, start, old_end, size_change, texts);
        }
        self.seqlength[pane] = shift(self.seqlength[pane], size_change);

        // Predict the chunk set assuming no cascading changes, remembering
        // the chunk that contained the edit.
        self.old_merge_cache.clear();
        self.changed_chunk = None;
        for merged in &self.merge_cache {
            let (mut left, mut right) = (merged.left, merged.right);
            let touched = match pane {
                0 => {
                    let hit = left.is_some_and(|c| c.start_b <= start && start < c.end_b);
                    left = offset_after(left, start, 0, size_change);
                    hit
                }
                2 => {
                    let hit = right.is_some_and(|c| c.start_b <= start && start < c.end_b);
                    right = offset_after(right, start, 0, size_change);
                    hit
                }
                _ => {
                    let hit = left.is_some_and(|c| c.start_a <= start && start < c.end_a);
                    left = offset_after(left, start, size_change, 0);
                    if self.num_sequences == 3 {
                        right = offset_after(right, start, size_change, 0);
                    }
                    hit
                }
            };
            let shifted = MergedChunk::new(left, right);
            if touched && self.changed_chunk.is_none() {
                self.changed_chunk = Some(shifted);
            }
            self.old_merge_cache.insert(shifted);
        }

        self.update_merge_cache(texts)
    }

    /// Re-diff the window of one opcode list around an edit.
    fn change_pair<T: Token>(
        &mut self,
        which: usize,
        pane: usize,
        start: usize,
        old_end: usize,
        size_change: isize,
        texts: &[&[T]],
    ) {
        let outer = which * 2;
        let mut lines_added = [0isize; 3];
        lines_added[pane] = size_change;

        let diffs = &self.diffs[which];
        let mut loidx = locate_in_diffs(diffs, pane, start);
        let mut hiidx = if old_end > start {
            locate_in_diffs(diffs, pane, old_end)
        } else {
            loidx
        };

        let lorange = if loidx > 0 {
            loidx -= 1;
            (diffs[loidx].start_b, diffs[loidx].start_a)
        } else {
            (0, 0)
        };
        let hirange = if hiidx < diffs.len() {
            hiidx += 1;
            (diffs[hiidx - 1].end_b, diffs[hiidx - 1].end_a)
        } else {
            (self.seqlength[outer], self.seqlength[1])
        };

        let rangex = (lorange.0, shift(hirange.0, lines_added[outer]));
        let range1 = (lorange.1, shift(hirange.1, lines_added[1]));
        assert!(
            rangex.0 <= rangex.1 && range1.0 <= range1.1,
            "inconsistent edit window {rangex:?} / {range1:?}"
        );

        let linesx = &texts[outer][rangex.0..rangex.1];
        let lines1 = &texts[1][range1.0..range1.1];
        let newdiffs: Vec<DiffChunk> = diff_opcodes(lines1, linesx)
            .into_iter()
            .map(|c| c.offset(range1.0, rangex.0))
            .collect();

        tracing::debug!(
            pair = which,
            pane,
            start,
            size_change,
            window = ?range1,
            replaced = hiidx - loidx,
            new = newdiffs.len(),
            "re-diffed edit window"
        );

        let diffs = &mut self.diffs[which];
        for c in &mut diffs[hiidx..] {
            *c = DiffChunk::new(
                c.tag,
                shift(c.start_a, lines_added[1]),
                shift(c.end_a, lines_added[1]),
                shift(c.start_b, lines_added[outer]),
                shift(c.end_b, lines_added[outer]),
            );
        }
        diffs.splice(loidx..hiidx, newdiffs);
    }

    fn update_merge_cache<T: Token>(&mut self, texts: &[&[T]]) -> ChunkChanges {
        let mut cache = if self.num_sequences == 3 {
            self.merge_diffs(texts)
        } else {
            self.diffs[0].iter().copied().map(MergedChunk::left).collect()
        };

        if self.ignore_blanks {
            // Tags of conflicts are left alone; only the ranges shrink.
            cache = cache
                .into_iter()
                .filter_map(|merged| {
                    let left = merged.left.and_then(|c| consume_blank_lines(c, texts, 1, 0));
                    let right = merged.right.and_then(|c| consume_blank_lines(c, texts, 1, 2));
                    let merged = MergedChunk::new(left, right);
                    (!merged.is_empty()).then_some(merged)
                })
                .collect();
        }
        self.merge_cache = cache;

        let current: HashSet<MergedChunk> = self.merge_cache.iter().copied().collect();
        let removed: HashSet<MergedChunk> =
            self.old_merge_cache.difference(&current).copied().collect();
        let added: HashSet<MergedChunk> =
            current.difference(&self.old_merge_cache).copied().collect();
        let modified = self.changed_chunk.filter(|c| !removed.contains(c));
        let changes = ChunkChanges {
            removed,
            added,
            modified,
        };

        let mut mergeable = [false, false];
        for merged in &self.merge_cache {
            mergeable[0] |= merged.left.is_some_and(|c| c.tag != Tag::Conflict);
            mergeable[1] |= merged.right.is_some_and(|c| c.tag != Tag::Conflict);
            if mergeable[0] && mergeable[1] {
                break;
            }
        }
        self.mergeable = [false, mergeable[0], mergeable[1], false];

        self.conflicts = self
            .merge_cache
            .iter()
            .enumerate()
            .filter(|(_, merged)| merged.is_conflict())
            .map(|(i, _)| i)
            .collect();

        self.update_line_cache();

        tracing::debug!(
            chunks = self.merge_cache.len(),
            conflicts = self.conflicts.len(),
            added = changes.added.len(),
            removed = changes.removed.len(),
            "merge cache rebuilt"
        );
        for sink in &mut self.sinks {
            sink.diffs_changed(&changes);
        }
        changes
    }

    /// Walk both opcode lists in pane 1 order, grouping overlapping changes.
    fn merge_diffs<T: Token>(&self, texts: &[&[T]]) -> Vec<MergedChunk> {
        let mut seqs = [
            VecDeque::from(self.diffs[0].clone()),
            VecDeque::from(self.diffs[1].clone()),
        ];
        let mut out = Vec::new();

        loop {
            let mut high_seq = match (seqs[0].front(), seqs[1].front()) {
                (None, None) => break,
                (None, Some(_)) => 1,
                (Some(_), None) => 0,
                (Some(c0), Some(c1)) => {
                    if c0.start_a == c1.start_a && c0.tag == Tag::Insert {
                        0
                    } else if c0.start_a == c1.start_a && c1.tag == Tag::Insert {
                        1
                    } else {
                        usize::from(c0.start_a > c1.start_a)
                    }
                }
            };
            let Some(high_diff) = seqs[high_seq].pop_front() else {
                break;
            };
            let mut high_mark = high_diff.end_a;
            let mut other_seq = 1 - high_seq;

            let mut using: [Vec<DiffChunk>; 2] = [Vec::new(), Vec::new()];
            using[high_seq].push(high_diff);

            while let Some(&other_diff) = seqs[other_seq].front() {
                if high_mark < other_diff.start_a {
                    break;
                }
                if high_mark == other_diff.start_a
                    && !(high_diff.tag == Tag::Insert && other_diff.tag == Tag::Insert)
                {
                    break;
                }
                using[other_seq].push(other_diff);
                seqs[other_seq].pop_front();

                if high_mark < other_diff.end_a {
                    std::mem::swap(&mut high_seq, &mut other_seq);
                    high_mark = other_diff.end_a;
                }
            }

            match (using[0].as_slice(), using[1].as_slice()) {
                ([], [only]) => out.push(MergedChunk::right(*only)),
                ([only], []) => out.push(MergedChunk::left(*only)),
                _ => self.merge.merge_group(&using, texts, &mut out),
            }
        }
        out
    }

    fn update_line_cache(&mut self) {
        for (pane, cache) in self.line_cache.iter_mut().enumerate() {
            // One extra entry for "after the last line" queries.
            *cache = vec![ChunkLocation::default(); self.seqlength[pane] + 1];
        }

        let merge_cache = &self.merge_cache;
        let last_chunk = merge_cache.len();
        let find_next = |side: usize, pane: usize, current: Option<usize>| -> Option<usize> {
            let from = current.map_or(0, |c| c + 1);
            if pane == 1 && from < last_chunk {
                return Some(from);
            }
            (from..last_chunk).find(|&j| merge_cache[j].side(side).is_some())
        };

        let mut prev: [Option<usize>; 3] = [None; 3];
        let mut next = [find_next(0, 0, None), find_next(0, 1, None), find_next(1, 2, None)];
        let mut old_end = [0usize; 3];

        // (side, pane, use the b range)
        const PANES: [(usize, usize, bool); 3] = [(0, 0, true), (0, 1, false), (1, 2, true)];

        for (i, merged) in merge_cache.iter().enumerate() {
            for (side, pane, use_b) in PANES {
                let (side, chunk) = match merged.side(side) {
                    Some(chunk) => (side, chunk),
                    None if pane == 1 => match merged.right {
                        Some(chunk) => (1, chunk),
                        None => continue,
                    },
                    None => continue,
                };

                let cache = &mut self.line_cache[pane];
                let len = cache.len();
                let (start, mut end) = if use_b {
                    (chunk.start_b, chunk.end_b)
                } else {
                    (chunk.start_a, chunk.end_a)
                };

                let last = old_end[pane];
                if start > last {
                    let gap = ChunkLocation::new(None, prev[pane], next[pane]);
                    cache[last.min(len)..start.min(len)].fill(gap);
                }

                // Zero-width chunks claim the following line.
                if start == end {
                    end += 1;
                }

                next[pane] = find_next(side, pane, Some(i));
                let here = ChunkLocation::new(Some(i), prev[pane], next[pane]);
                cache[start.min(len)..end.min(len)].fill(here);
                prev[pane] = Some(i);
                old_end[pane] = end;
            }
        }

        for pane in 0..3 {
            let cache = &mut self.line_cache[pane];
            let (last, end) = (old_end[pane], cache.len());
            if last < end {
                cache[last..end].fill(ChunkLocation::new(None, prev[pane], next[pane]));
            }
        }
    }

    /// Chunks around `line` on `pane`. Defined up to and including
    /// `seqlength(pane)`; anything further reports no chunks.
    pub fn locate_chunk(&self, pane: usize, line: usize) -> ChunkLocation {
        self.line_cache[pane].get(line).copied().unwrap_or_default()
    }

    /// Whether `chunk` (pane 1 on its `a` side) is still present between
    /// pane 1 and `to_pane`.
    pub fn has_chunk(&self, to_pane: usize, chunk: &DiffChunk) -> bool {
        let side = usize::from(to_pane == 2);
        self.locate_chunk(1, chunk.start_a)
            .current
            .is_some_and(|idx| self.merge_cache[idx].side(side).as_ref() == Some(chunk))
    }

    /// The `index`-th change seen from `from_pane`, oriented so that its `a`
    /// side refers to `from_pane`. With `to_pane` only changes between the
    /// two panes are considered.
    pub fn get_chunk(&self, index: usize, from_pane: usize, to_pane: Option<usize>) -> Option<DiffChunk> {
        let side = usize::from(from_pane == 2 || to_pane == Some(2));
        let merged = self.merge_cache[index];
        let chunk = merged.side(side);
        if from_pane == 0 || from_pane == 2 {
            return chunk.map(|c| c.reversed());
        }
        if to_pane.is_none() && chunk.is_none() {
            return merged.right;
        }
        chunk
    }

    /// Start line of the `index`-th chunk on each pane, if it touches it.
    pub fn get_chunk_starts(&self, index: usize) -> [Option<usize>; 3] {
        let merged = self.merge_cache[index];
        [
            merged.left.map(|c| c.start_b),
            merged.any().map(|c| c.start_a),
            merged.right.map(|c| c.start_b),
        ]
    }

    /// Whether any non-conflicting change can be pushed into `pane` from
    /// its left and right neighbours.
    pub fn has_mergeable_changes(&self, pane: usize) -> (bool, bool) {
        match pane {
            0 => (self.mergeable[0], self.mergeable[1]),
            1 => (self.mergeable[1], self.mergeable[2]),
            2 => (self.mergeable[2], self.mergeable[3]),
            _ => panic!("invalid pane index {pane}"),
        }
    }

    /// True once initialised with no differences at all.
    pub fn sequences_identical(&self) -> bool {
        self.initialised && self.diffs.iter().all(Vec::is_empty)
    }

    /// Merge-cache index range touched by a line window on `pane`.
    fn range_from_lines(&self, pane: usize, lines: (usize, usize)) -> (Option<usize>, Option<usize>) {
        let top = self.locate_chunk(pane, lines.0);
        let bottom = self.locate_chunk(pane, lines.1);
        (top.current.or(top.next), bottom.current.or(bottom.prev))
    }

    /// Changes between `from_pane` and `to_pane`, oriented from `from_pane`.
    /// With `lines = Some((from_lo, from_hi, to_lo, to_hi))` only chunks
    /// overlapping those windows are returned.
    pub fn pair_changes(
        &self,
        from_pane: usize,
        to_pane: usize,
        lines: Option<(usize, usize, usize, usize)>,
    ) -> Vec<DiffChunk> {
        let window = match lines {
            None => &self.merge_cache[..],
            Some((lo1, hi1, lo2, hi2)) => {
                let (start1, end1) = self.range_from_lines(from_pane, (lo1, hi1));
                let (start2, end2) = self.range_from_lines(to_pane, (lo2, hi2));
                let start = start1.into_iter().chain(start2).min();
                let end = end1.into_iter().chain(end2).max();
                let usable = (start1.is_some() && end1.is_some()) || (start2.is_some() && end2.is_some());
                match (start, end) {
                    (Some(start), Some(end)) if usable && start <= end => &self.merge_cache[start..=end],
                    _ => return Vec::new(),
                }
            }
        };

        if from_pane == 1 {
            let side = to_pane / 2;
            window.iter().filter_map(|m| m.side(side)).collect()
        } else {
            let side = from_pane / 2;
            window.iter().filter_map(|m| m.side(side)).map(|c| c.reversed()).collect()
        }
    }

    /// Changes touching `pane`, oriented from it, optionally limited to a
    /// line window.
    pub fn single_changes(&self, pane: usize, lines: Option<(usize, usize)>) -> Vec<DiffChunk> {
        let window = match lines {
            None => &self.merge_cache[..],
            Some(lines) => match self.range_from_lines(pane, lines) {
                (Some(start), Some(end)) if start <= end => &self.merge_cache[start..=end],
                _ => return Vec::new(),
            },
        };
        if pane == 1 {
            window.iter().filter_map(MergedChunk::any).collect()
        } else {
            let side = pane / 2;
            window.iter().filter_map(|m| m.side(side)).map(|c| c.reversed()).collect()
        }
    }
}

/// Index of the first opcode ending after `line` on `pane`.
fn locate_in_diffs(diffs: &[DiffChunk], pane: usize, line: usize) -> usize {
    diffs
        .iter()
        .position(|c| if pane == 1 { line < c.end_a } else { line < c.end_b })
        .unwrap_or(diffs.len())
}

/// Resumable initialisation returned by [`Differ::set_sequences`].
pub struct SetSequences<'d, 's, T, M> {
    differ: &'d mut Differ<M>,
    sequences: &'s [&'s [T]],
    pair: usize,
    matcher: Option<Box<dyn SequenceMatcher + 's>>,
    changes: Option<ChunkChanges>,
}

impl<'d, 's, T: Token + 's, M: GroupMerge> SetSequences<'d, 's, T, M> {
    pub fn step(&mut self) -> Progress {
        if self.changes.is_some() {
            return Progress::Done;
        }

        let differ = &mut *self.differ;
        if self.pair + 1 < differ.num_sequences {
            let (pair, sequences) = (self.pair, self.sequences);
            let syncpoints = &differ.syncpoints[pair];
            let matcher = self.matcher.get_or_insert_with(|| {
                let (pivot, outer) = (sequences[1], sequences[pair * 2]);
                let matcher: Box<dyn SequenceMatcher + 's> = if syncpoints.is_empty() {
                    Box::new(MyersMatcher::new(pivot, outer))
                } else {
                    Box::new(SyncPointMatcher::new(pivot, outer, syncpoints))
                };
                matcher
            });
            if matcher.step() == Progress::Yield {
                return Progress::Yield;
            }
            differ.diffs[pair] = matcher.difference_opcodes();
            self.matcher = None;
            self.pair += 1;
            return Progress::Yield;
        }

        differ.initialised = true;
        self.changes = Some(differ.update_merge_cache(self.sequences));
        Progress::Done
    }

    /// Drive the initialisation to completion.
    pub fn run(mut self) -> ChunkChanges {
        while !self.step().is_done() {}
        self.changes.unwrap_or_default()
    }

    /// The `diffs-changed` delta, once finished.
    pub fn changes(&self) -> Option<&ChunkChanges> {
        self.changes.as_ref()
    }
}

impl<'s, T: Token + 's, M: GroupMerge> Task for SetSequences<'_, 's, T, M> {
    fn step(&mut self) -> TaskStep {
        match SetSequences::step(self) {
            Progress::Yield => TaskStep::Continue(None),
            Progress::Done => TaskStep::Done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn compare(texts: &[Vec<String>]) -> Differ {
        let mut differ = Differ::new();
        let refs: Vec<&[String]> = texts.iter().map(Vec::as_slice).collect();
        differ.set_sequences(&refs).run();
        differ
    }

    fn refs(texts: &[Vec<String>]) -> Vec<&[String]> {
        texts.iter().map(Vec::as_slice).collect()
    }

    #[test]
    fn test_basic_two_way() {
        let differ = compare(&[lines(&["a", "b", "c", "d"]), lines(&["a", "x", "c", "d"])]);
        assert_eq!(
            differ.merge_cache(),
            &[MergedChunk::left(DiffChunk::new(Tag::Replace, 1, 2, 1, 2))]
        );
        assert_eq!(differ.has_mergeable_changes(0), (false, true));
        assert_eq!(differ.has_mergeable_changes(1), (true, false));
        assert_eq!(differ.locate_chunk(0, 1), ChunkLocation::new(Some(0), None, None));
        assert_eq!(differ.locate_chunk(0, 0), ChunkLocation::new(None, None, Some(0)));
        assert_eq!(differ.locate_chunk(0, 3), ChunkLocation::new(None, Some(0), None));
        assert_eq!(differ.locate_chunk(0, 4), ChunkLocation::new(None, Some(0), None));
        assert_eq!(differ.locate_chunk(0, 99), ChunkLocation::default());
        assert!(!differ.sequences_identical());
    }

    #[test]
    fn test_identical_sequences() {
        let text = lines(&["a", "b"]);
        let differ = compare(&[text.clone(), text]);
        assert!(differ.merge_cache().is_empty());
        assert!(differ.sequences_identical());
    }

    #[test]
    fn test_uninitialised_is_not_identical() {
        let differ = Differ::new();
        assert!(!differ.sequences_identical());
    }

    #[test]
    fn test_three_way_coherent() {
        let differ = compare(&[
            lines(&["a", "X", "c"]),
            lines(&["a", "b", "c"]),
            lines(&["a", "X", "c"]),
        ]);
        let replace = DiffChunk::new(Tag::Replace, 1, 2, 1, 2);
        assert_eq!(differ.merge_cache(), &[MergedChunk::both(replace, replace)]);
        assert!(differ.conflicts().is_empty());
        assert_eq!(differ.has_mergeable_changes(1), (true, true));
    }

    #[test]
    fn test_three_way_conflict() {
        let differ = compare(&[
            lines(&["a", "X", "c"]),
            lines(&["a", "b", "c"]),
            lines(&["a", "Y", "c"]),
        ]);
        let conflict = DiffChunk::new(Tag::Conflict, 1, 2, 1, 2);
        assert_eq!(differ.merge_cache(), &[MergedChunk::both(conflict, conflict)]);
        assert_eq!(differ.conflicts(), &[0]);
        assert_eq!(differ.has_mergeable_changes(0), (false, false));
    }

    #[test]
    fn test_three_way_one_sided_changes() {
        let differ = compare(&[
            lines(&["a", "X", "c", "d"]),
            lines(&["a", "b", "c", "d"]),
            lines(&["a", "b", "c", "D"]),
        ]);
        assert_eq!(
            differ.merge_cache(),
            &[
                MergedChunk::left(DiffChunk::new(Tag::Replace, 1, 2, 1, 2)),
                MergedChunk::right(DiffChunk::new(Tag::Replace, 3, 4, 3, 4)),
            ]
        );
        // Pane 1 sees every chunk, the outer panes only their own.
        assert_eq!(differ.locate_chunk(1, 2), ChunkLocation::new(None, Some(0), Some(1)));
        assert_eq!(differ.locate_chunk(0, 3), ChunkLocation::new(None, Some(0), None));
        assert_eq!(differ.locate_chunk(2, 0), ChunkLocation::new(None, None, Some(1)));
        assert_eq!(differ.get_chunk_starts(1), [None, Some(3), Some(3)]);
    }

    #[test]
    fn test_get_chunk_orientation() {
        let differ = compare(&[lines(&["a", "x", "y", "b"]), lines(&["a", "b"])]);
        let stored = DiffChunk::new(Tag::Insert, 1, 1, 1, 3);
        assert_eq!(differ.get_chunk(0, 1, None), Some(stored));
        assert_eq!(differ.get_chunk(0, 0, None), Some(DiffChunk::new(Tag::Delete, 1, 3, 1, 1)));
        assert!(differ.has_chunk(0, &stored));
        assert!(!differ.has_chunk(2, &stored));
    }

    #[test]
    fn test_insert_claims_following_line() {
        let differ = compare(&[lines(&["a", "x", "b"]), lines(&["a", "b"])]);
        // On pane 1 the insertion has zero width at line 1.
        assert_eq!(differ.locate_chunk(1, 1), ChunkLocation::new(Some(0), None, None));
        assert_eq!(differ.locate_chunk(1, 0), ChunkLocation::new(None, None, Some(0)));
    }

    #[test]
    fn test_change_sequence_makes_identical() {
        let mut texts = vec![lines(&["a", "b", "c", "d"]), lines(&["a", "x", "c", "d"])];
        let mut differ = compare(&texts);

        texts[1][1] = "b".to_string();
        let changes = differ.change_sequence(1, 1, 0, &refs(&texts));
        assert!(differ.merge_cache().is_empty());
        assert!(differ.sequences_identical());
        assert_eq!(changes.removed.len(), 1);
        assert!(changes.added.is_empty());
        assert_eq!(changes.modified, None);
    }

    #[test]
    fn test_change_sequence_insert_line() {
        // Pane 0 lacks a line; inserting it removes the only chunk.
        let mut texts = vec![lines(&["a", "c", "d"]), lines(&["a", "b", "c", "d"])];
        let mut differ = compare(&texts);
        assert_eq!(differ.diff_count(), 1);

        texts[0].insert(1, "b".to_string());
        differ.change_sequence(0, 1, 1, &refs(&texts));
        assert_eq!(differ.seqlength(0), 4);
        assert!(differ.sequences_identical());
    }

    #[test]
    fn test_change_sequence_matches_fresh_diff() {
        let mut texts = vec![
            lines(&["one", "two", "three", "four", "five", "six"]),
            lines(&["one", "2", "three", "four", "5", "six"]),
        ];
        let mut differ = compare(&texts);

        // Delete "four" from pane 0.
        texts[0].remove(3);
        differ.change_sequence(0, 3, -1, &refs(&texts));
        // Append a line to pane 1.
        texts[1].push("seven".to_string());
        differ.change_sequence(1, 6, 1, &refs(&texts));
        // Edit a line in place.
        texts[0][0] = "ONE".to_string();
        differ.change_sequence(0, 0, 0, &refs(&texts));

        let fresh = compare(&texts);
        assert_eq!(differ.merge_cache(), fresh.merge_cache());
        for pane in 0..2 {
            assert_eq!(differ.seqlength(pane), texts[pane].len());
            for line in 0..=texts[pane].len() {
                assert_eq!(differ.locate_chunk(pane, line), fresh.locate_chunk(pane, line));
            }
        }
    }

    #[test]
    fn test_apply_edit_covers_lines_merged_by_terminators() {
        use crate::buffer::{split_buffer_lines, TextBuffer};

        let mut buffer = TextBuffer::new("\r\r\n\na");
        let mut texts = vec![lines(&split_buffer_lines(buffer.text())), lines(&["", "", "X", "a"])];
        let mut differ = compare(&texts);
        assert_eq!(
            differ.merge_cache(),
            &[MergedChunk::left(DiffChunk::new(Tag::Replace, 2, 3, 2, 3))]
        );

        // Dropping the "\n" of "\r\n" leaves a lone "\r": three old lines
        // collapse into two although the count only drops by one.
        let (_, edit) = buffer.delete(2, 5);
        texts[0] = lines(&split_buffer_lines(buffer.text()));
        assert_eq!(texts[0], lines(&["", "", ""]));
        differ.apply_edit(0, edit, &refs(&texts));

        let fresh = compare(&texts);
        assert_eq!(differ.merge_cache(), fresh.merge_cache());
        assert_eq!(differ.seqlength(0), 3);
        for line in 0..=3 {
            assert_eq!(differ.locate_chunk(0, line), fresh.locate_chunk(0, line));
        }
    }

    #[test]
    fn test_change_sequence_reports_modified_chunk() {
        let mut texts = vec![
            lines(&["a", "X", "Y", "d"]),
            lines(&["a", "b", "c", "d"]),
        ];
        let mut differ = compare(&texts);
        let before = differ.merge_cache()[0];

        // Rewrite a line inside the replaced block without changing its shape.
        texts[0][2] = "Z".to_string();
        let changes = differ.change_sequence(0, 2, 0, &refs(&texts));
        assert_eq!(differ.merge_cache(), &[before]);
        assert_eq!(changes.modified, Some(before));
        assert!(changes.added.is_empty() && changes.removed.is_empty());
    }

    #[test]
    fn test_change_middle_pane_three_way() {
        let mut texts = vec![
            lines(&["a", "X", "c"]),
            lines(&["a", "b", "c"]),
            lines(&["a", "Y", "c"]),
        ];
        let mut differ = compare(&texts);
        assert_eq!(differ.conflicts(), &[0]);

        texts[1][1] = "X".to_string();
        differ.change_sequence(1, 1, 0, &refs(&texts));
        let fresh = compare(&texts);
        assert_eq!(differ.merge_cache(), fresh.merge_cache());
        assert_eq!(
            differ.merge_cache(),
            &[MergedChunk::right(DiffChunk::new(Tag::Replace, 1, 2, 1, 2))]
        );
        assert!(differ.conflicts().is_empty());
    }

    #[test]
    #[should_panic]
    fn test_change_sequence_negative_length_panics() {
        let texts = vec![lines(&["a"]), lines(&["a"])];
        let mut differ = compare(&texts);
        differ.change_sequence(0, 0, -5, &refs(&texts));
    }

    #[test]
    fn test_ignore_blank_lines() {
        let texts = vec![lines(&["a", "", "b"]), lines(&["a", "b"])];
        let mut differ = Differ::new();
        differ.set_ignore_blanks(true);
        differ.set_sequences(&refs(&texts)).run();
        assert_eq!(differ.diff_count(), 0);

        let differ = compare(&texts);
        assert_eq!(
            differ.merge_cache(),
            &[MergedChunk::left(DiffChunk::new(Tag::Insert, 1, 1, 1, 2))]
        );
    }

    #[test]
    fn test_ignore_blank_lines_keeps_real_changes() {
        let texts = vec![lines(&["a", "", "new", "z"]), lines(&["a", "old", "", "z"])];
        let mut differ = Differ::new();
        differ.set_ignore_blanks(true);
        differ.set_sequences(&refs(&texts)).run();
        assert_eq!(
            differ.merge_cache(),
            &[
                MergedChunk::left(DiffChunk::new(Tag::Delete, 1, 2, 1, 1)),
                MergedChunk::left(DiffChunk::new(Tag::Insert, 3, 3, 2, 3)),
            ]
        );
    }

    #[test]
    fn test_sync_points_used_for_initialisation() {
        let texts = vec![lines(&["a", "X", "b"]), lines(&["a", "Y", "b"])];
        let mut differ = Differ::new();
        differ.set_sync_points(0, vec![(2, 1)]);
        differ.set_sequences(&refs(&texts)).run();
        assert_eq!(
            differ.diffs(0),
            &[
                DiffChunk::new(Tag::Delete, 1, 2, 1, 1),
                DiffChunk::new(Tag::Insert, 2, 2, 1, 2),
            ]
        );
    }

    #[test]
    fn test_diffs_changed_sink() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut differ = Differ::new();
        let log = Rc::clone(&seen);
        differ.connect(move |changes: &ChunkChanges| log.borrow_mut().push(changes.added.len()));

        let mut texts = vec![lines(&["a", "b"]), lines(&["a", "c"])];
        differ.set_sequences(&refs(&texts)).run();
        texts[0][1] = "c".to_string();
        differ.change_sequence(0, 1, 0, &refs(&texts));
        assert_eq!(*seen.borrow(), vec![1, 0]);
    }

    #[test]
    fn test_pair_and_single_changes() {
        let differ = compare(&[
            lines(&["a", "X", "c", "d"]),
            lines(&["a", "b", "c", "d"]),
            lines(&["a", "b", "c", "D"]),
        ]);
        assert_eq!(differ.pair_changes(1, 2, None), vec![DiffChunk::new(Tag::Replace, 3, 4, 3, 4)]);
        assert_eq!(differ.pair_changes(0, 1, None), vec![DiffChunk::new(Tag::Replace, 1, 2, 1, 2)]);
        assert_eq!(differ.single_changes(1, None).len(), 2);
        assert_eq!(differ.single_changes(1, Some((3, 4))).len(), 1);
        assert!(differ.pair_changes(1, 0, Some((3, 4, 3, 4))).is_empty());
    }

    #[test]
    fn test_clear() {
        let mut differ = compare(&[lines(&["a"]), lines(&["b"])]);
        let changes = differ.clear();
        assert_eq!(changes.removed.len(), 1);
        assert!(differ.merge_cache().is_empty());
        assert!(!differ.sequences_identical());
        assert_eq!(differ.locate_chunk(0, 0), ChunkLocation::default());
    }

    #[test]
    fn test_line_cache_references_existing_chunks() {
        let texts = vec![
            lines(&["1", "2", "x", "4", "5", "y", "7"]),
            lines(&["1", "2", "3", "4", "5", "6", "7", "8"]),
            lines(&["0", "1", "2", "3", "4", "5", "z", "7", "8"]),
        ];
        let differ = compare(&texts);
        for pane in 0..3 {
            for line in 0..=texts[pane].len() {
                let loc = differ.locate_chunk(pane, line);
                for idx in [loc.current, loc.prev, loc.next].into_iter().flatten() {
                    assert!(idx < differ.diff_count());
                }
            }
        }
        // Pane 1 ranges are ascending and disjoint.
        let mut last_end = 0;
        for merged in differ.merge_cache() {
            let chunk = merged.any().unwrap();
            assert!(chunk.start_a >= last_end);
            last_end = chunk.end_a;
        }
    }
}
