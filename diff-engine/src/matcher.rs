//! Myers O(NP) sequence matching.
//!
//! Implements "An O(NP) Sequence Comparison Algorithm" (Wu, Manber, Myers,
//! Miller, 1989) with two preprocessing passes:
//!
//! 1. the common prefix and suffix are stripped;
//! 2. tokens that cannot match anything on the other side are discarded.
//!    Line matching discards tokens absent from the other sequence; inline
//!    (character) matching keeps only positions covered by a 3-gram that
//!    also occurs on the other side.
//!
//! The search is resumable: [`SequenceMatcher::step`] performs at most
//! [`YIELD_INTERVAL`] rounds of the outer `p` loop before handing control
//! back, so a cooperative scheduler can interleave other work.
//!
//! [`SyncPointMatcher`] splits the problem at user-supplied alignment points
//! and runs a line matcher on every slice.

use std::collections::HashSet;
use std::hash::Hash;

use crate::error::{EngineError, Result};
use crate::types::{DiffChunk, MatchingBlock, Progress, Tag};

/// Outer-loop rounds between yields.
pub const YIELD_INTERVAL: usize = 100;

/// Minimum number of discarded tokens on either side before the reduced
/// sequences are used instead of the originals.
const DISCARD_THRESHOLD: usize = 10;

/// Window size for inline k-gram seeding.
const KMER: usize = 3;

/// A resumable matcher producing matching blocks and opcodes.
pub trait SequenceMatcher {
    /// Advance the computation. Returns [`Progress::Done`] once the matching
    /// blocks are available; further calls are no-ops.
    fn step(&mut self) -> Progress;

    /// The matching blocks, terminated by the `(|a|, |b|, 0)` sentinel.
    /// Runs the computation to completion if necessary.
    fn matching_blocks(&mut self) -> &[MatchingBlock];

    /// Opcodes partitioning both sequences, `equal` runs included.
    fn opcodes(&mut self) -> Vec<DiffChunk> {
        blocks_to_opcodes(self.matching_blocks())
    }

    /// Opcodes with `equal` runs filtered out.
    fn difference_opcodes(&mut self) -> Vec<DiffChunk> {
        self.opcodes().into_iter().filter(DiffChunk::is_change).collect()
    }

    /// Drive the computation to completion.
    fn run(&mut self) {
        while !self.step().is_done() {}
    }
}

/// How non-matching tokens are discarded before the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// Drop tokens that do not appear anywhere in the other sequence.
    Tokens,
    /// Keep only positions covered by a k-gram also present on the other side.
    Kmers,
}

/// Myers O(NP) matcher over borrowed sequences.
pub struct MyersMatcher<'a, T> {
    a: &'a [T],
    b: &'a [T],
    discard: Discard,
    state: State<'a, T>,
    matching_blocks: Vec<MatchingBlock>,
}

enum State<'a, T> {
    Fresh,
    Searching(Box<NpSearch<'a, T>>),
    Finished,
}

impl<'a, T: Eq + Hash> MyersMatcher<'a, T> {
    /// Line-oriented matcher.
    pub fn new(a: &'a [T], b: &'a [T]) -> Self {
        Self::with_discard(a, b, Discard::Tokens)
    }

    /// Character-oriented matcher used for inline highlighting.
    pub fn inline(a: &'a [T], b: &'a [T]) -> Self {
        Self::with_discard(a, b, Discard::Kmers)
    }

    pub fn with_discard(a: &'a [T], b: &'a [T], discard: Discard) -> Self {
        Self {
            a,
            b,
            discard,
            state: State::Fresh,
            matching_blocks: Vec::new(),
        }
    }

    /// Construct a matcher with a junk predicate. Junk filtering is not
    /// supported, so passing one fails.
    pub fn with_junk_filter<F>(a: &'a [T], b: &'a [T], isjunk: Option<F>) -> Result<Self>
    where
        F: Fn(&T) -> bool,
    {
        if isjunk.is_some() {
            return Err(EngineError::Unsupported("junk filtering in sequence matchers"));
        }
        Ok(Self::new(a, b))
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Finished)
    }

    fn finish(&mut self, search: &NpSearch<'a, T>, lastsnake: Option<usize>) {
        let mut blocks = search.build_matching_blocks(lastsnake, self.a.len(), self.b.len());
        postprocess(&mut blocks, self.a, self.b);
        tracing::trace!(
            len_a = self.a.len(),
            len_b = self.b.len(),
            blocks = blocks.len(),
            "matcher finished"
        );
        self.matching_blocks = blocks;
        self.state = State::Finished;
    }
}

impl<T: Eq + Hash> SequenceMatcher for MyersMatcher<'_, T> {
    fn step(&mut self) -> Progress {
        match std::mem::replace(&mut self.state, State::Finished) {
            State::Fresh => {
                let search = NpSearch::new(self.a, self.b, self.discard);
                if search.is_trivial() {
                    self.finish(&search, None);
                    return Progress::Done;
                }
                self.state = State::Searching(Box::new(search));
                Progress::Yield
            }
            State::Searching(mut search) => {
                for _ in 0..YIELD_INTERVAL {
                    if let Some(lastsnake) = search.advance() {
                        self.finish(&search, lastsnake);
                        return Progress::Done;
                    }
                }
                self.state = State::Searching(search);
                Progress::Yield
            }
            State::Finished => Progress::Done,
        }
    }

    fn matching_blocks(&mut self) -> &[MatchingBlock] {
        self.run();
        &self.matching_blocks
    }
}

/// A snake in the edit graph, chained to its predecessor.
#[derive(Debug)]
struct Snake {
    parent: Option<usize>,
    x: usize,
    y: usize,
    len: usize,
}

/// State of an in-progress O(NP) search.
struct NpSearch<'a, T> {
    a: Vec<&'a T>,
    b: Vec<&'a T>,
    common_prefix: usize,
    common_suffix: usize,
    aindex: Vec<usize>,
    bindex: Vec<usize>,
    discarded: bool,
    middle: isize,
    delta: isize,
    dmin: isize,
    dmax: isize,
    fp: Vec<(isize, Option<usize>)>,
    snakes: Vec<Snake>,
    p: isize,
}

impl<'a, T: Eq + Hash> NpSearch<'a, T> {
    fn new(a: &'a [T], b: &'a [T], discard: Discard) -> Self {
        let common_prefix = common_prefix_len(a, b);
        let (a, b) = (&a[common_prefix..], &b[common_prefix..]);
        let common_suffix = if !a.is_empty() && !b.is_empty() {
            common_suffix_len(a, b)
        } else {
            0
        };
        let a = &a[..a.len() - common_suffix];
        let b = &b[..b.len() - common_suffix];

        let reduced = match discard {
            Discard::Tokens => discard_nonmatching(a, b),
            Discard::Kmers => discard_nonmatching_kmers(a, b),
        };
        let (a_work, aindex, b_work, bindex, discarded) = match reduced {
            Some((a_work, aindex, b_work, bindex)) => (a_work, aindex, b_work, bindex, true),
            None => (a.iter().collect(), Vec::new(), b.iter().collect(), Vec::new(), false),
        };

        let m = a_work.len() as isize;
        let n = b_work.len() as isize;
        let middle = m + 1;
        let delta = n - m + middle;
        let size = if m > 0 && n > 0 { (n + m + 2) as usize } else { 0 };

        Self {
            a: a_work,
            b: b_work,
            common_prefix,
            common_suffix,
            aindex,
            bindex,
            discarded,
            middle,
            delta,
            dmin: middle.min(delta),
            dmax: middle.max(delta),
            fp: vec![(-1, None); size],
            snakes: Vec::new(),
            p: 0,
        }
    }

    /// No search is needed when either reduced sequence is empty.
    fn is_trivial(&self) -> bool {
        self.a.is_empty() || self.b.is_empty()
    }

    fn fp_get(&self, km: isize) -> (isize, Option<usize>) {
        usize::try_from(km)
            .ok()
            .and_then(|k| self.fp.get(k).copied())
            .unwrap_or((-1, None))
    }

    fn fp_set(&mut self, km: isize, value: (isize, Option<usize>)) {
        if let Some(slot) = usize::try_from(km).ok().and_then(|k| self.fp.get_mut(k)) {
            *slot = value;
        }
    }

    /// Follow the diagonal from `(x, y)`. Returns the new `y` and node.
    fn slide(&mut self, x: isize, y: isize, node: Option<usize>) -> (isize, Option<usize>) {
        if x < 0 || y < 0 {
            return (y, node);
        }
        let (start_x, start_y) = (x as usize, y as usize);
        let (mut xi, mut yi) = (start_x, start_y);
        while xi < self.a.len() && yi < self.b.len() && self.a[xi] == self.b[yi] {
            xi += 1;
            yi += 1;
        }
        if xi == start_x {
            return (y, node);
        }
        self.snakes.push(Snake {
            parent: node,
            x: start_x,
            y: start_y,
            len: xi - start_x,
        });
        (yi as isize, Some(self.snakes.len() - 1))
    }

    /// One round of the outer `p` loop. Returns `Some(lastsnake)` once the
    /// sink has been reached.
    fn advance(&mut self) -> Option<Option<usize>> {
        let p = self.p;
        self.p += 1;
        let (middle, delta) = (self.middle, self.delta);

        // Vertical edges.
        let mut yv: isize = -1;
        let mut node: Option<usize> = None;
        for km in (self.dmin - p)..delta {
            let (ty, tnode) = self.fp_get(km + 1);
            if yv < ty {
                yv = ty;
                node = tnode;
            } else {
                yv += 1;
            }
            (yv, node) = self.slide(yv - km + middle, yv, node);
            self.fp_set(km, (yv, node));
        }

        // Horizontal edges.
        let mut yh: isize = -1;
        let mut node: Option<usize> = None;
        for km in ((delta + 1)..=(self.dmax + p)).rev() {
            let (ty, tnode) = self.fp_get(km - 1);
            if yh <= ty {
                yh = ty + 1;
                node = tnode;
            }
            (yh, node) = self.slide(yh - km + middle, yh, node);
            self.fp_set(km, (yh, node));
        }

        // The diagonal leading to the sink.
        let (mut y, mut node) = if yv < yh {
            self.fp_get(delta + 1)
        } else {
            let (ty, tnode) = self.fp_get(delta - 1);
            (ty + 1, tnode)
        };
        (y, node) = self.slide(y - delta + middle, y, node);
        self.fp_set(delta, (y, node));

        (y >= self.b.len() as isize).then_some(node)
    }

    /// Walk the snake chain back to front, mapping reduced positions back to
    /// original ones and splitting snakes the discarding made non-contiguous.
    fn build_matching_blocks(
        &self,
        lastsnake: Option<usize>,
        total_a: usize,
        total_b: usize,
    ) -> Vec<MatchingBlock> {
        let prefix = self.common_prefix;
        let mut blocks = Vec::new();

        let mut current = lastsnake;
        while let Some(idx) = current {
            let snake = &self.snakes[idx];
            current = snake.parent;

            if !self.discarded {
                blocks.push(MatchingBlock::new(snake.x + prefix, snake.y + prefix, snake.len));
                continue;
            }

            let mut xi = snake.x + snake.len - 1;
            let mut yi = snake.y + snake.len - 1;
            let mut xprev = self.aindex[xi] + prefix;
            let mut yprev = self.bindex[yi] + prefix;
            let mut run = 1;
            for _ in 1..snake.len {
                xi -= 1;
                yi -= 1;
                let xnext = self.aindex[xi] + prefix;
                let ynext = self.bindex[yi] + prefix;
                if xprev - xnext != 1 || yprev - ynext != 1 {
                    blocks.push(MatchingBlock::new(xprev, yprev, run));
                    run = 0;
                }
                xprev = xnext;
                yprev = ynext;
                run += 1;
            }
            blocks.push(MatchingBlock::new(xprev, yprev, run));
        }
        blocks.reverse();

        if prefix > 0 {
            blocks.insert(0, MatchingBlock::new(0, 0, prefix));
        }
        if self.common_suffix > 0 {
            blocks.push(MatchingBlock::new(
                total_a - self.common_suffix,
                total_b - self.common_suffix,
                self.common_suffix,
            ));
        }
        blocks.push(MatchingBlock::new(total_a, total_b, 0));
        blocks
    }
}

type Reduced<'a, T> = (Vec<&'a T>, Vec<usize>, Vec<&'a T>, Vec<usize>);

fn common_prefix_len<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn common_suffix_len<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

fn worth_discarding(a_len: usize, kept_a: usize, b_len: usize, kept_b: usize) -> bool {
    a_len - kept_a > DISCARD_THRESHOLD || b_len - kept_b > DISCARD_THRESHOLD
}

/// Drop tokens of each sequence that never occur in the other one.
fn discard_nonmatching<'a, T: Eq + Hash>(a: &'a [T], b: &'a [T]) -> Option<Reduced<'a, T>> {
    if a.is_empty() || b.is_empty() {
        return None;
    }

    fn index_matching<'a, T: Eq + Hash>(
        present: &HashSet<&T>,
        seq: &'a [T],
    ) -> (Vec<&'a T>, Vec<usize>) {
        seq.iter()
            .enumerate()
            .filter(|(_, item)| present.contains(item))
            .map(|(i, item)| (item, i))
            .unzip()
    }

    let aset: HashSet<&T> = a.iter().collect();
    let bset: HashSet<&T> = b.iter().collect();
    let (b_kept, bindex) = index_matching(&aset, b);
    let (a_kept, aindex) = index_matching(&bset, a);

    worth_discarding(a.len(), a_kept.len(), b.len(), b_kept.len())
        .then_some((a_kept, aindex, b_kept, bindex))
}

/// Keep positions covered by a k-gram that also occurs in the other sequence.
fn discard_nonmatching_kmers<'a, T: Eq + Hash>(
    a: &'a [T],
    b: &'a [T],
) -> Option<Reduced<'a, T>> {
    if a.len() < KMER && b.len() < KMER {
        return None;
    }

    fn index_matching_kmers<'a, T: Eq + Hash>(
        other: &[T],
        seq: &'a [T],
    ) -> (Vec<&'a T>, Vec<usize>) {
        let kmers: HashSet<&[T]> = other.windows(KMER).collect();
        let mut kept = Vec::new();
        let mut index = Vec::new();
        let mut next_possible = 0;
        for end in (KMER - 1)..seq.len() {
            let start = end + 1 - KMER;
            if !kmers.contains(&seq[start..=end]) {
                continue;
            }
            // Overlapping windows must not record a position twice.
            for j in next_possible.max(start)..=end {
                kept.push(&seq[j]);
                index.push(j);
            }
            next_possible = end + 1;
        }
        (kept, index)
    }

    let (b_kept, bindex) = index_matching_kmers(a, b);
    let (a_kept, aindex) = index_matching_kmers(b, a);

    worth_discarding(a.len(), a_kept.len(), b.len(), b_kept.len())
        .then_some((a_kept, aindex, b_kept, bindex))
}

/// Greedy matching fragments runs; walk the blocks backwards and fold a
/// block into its successor whenever the gap between them is equal content.
fn postprocess<T: PartialEq>(blocks: &mut Vec<MatchingBlock>, a: &[T], b: &[T]) {
    let Some(&sentinel) = blocks.last() else {
        return;
    };
    let mut result = vec![sentinel];
    let mut i = blocks.len() as isize - 2;

    while i >= 0 {
        let mut cur = blocks[i as usize];
        i -= 1;
        while i >= 0 {
            let prev = blocks[i as usize];
            let adjacent = prev.b + prev.len == cur.b || prev.a + prev.len == cur.a;
            if adjacent
                && cur.a >= prev.len
                && cur.b >= prev.len
                && a[cur.a - prev.len..cur.a] == b[cur.b - prev.len..cur.b]
            {
                cur.a -= prev.len;
                cur.b -= prev.len;
                cur.len += prev.len;
                i -= 1;
                continue;
            }
            break;
        }
        result.push(cur);
    }

    result.reverse();
    *blocks = result;
}

/// Convert a sentinel-terminated block list into opcodes.
pub fn blocks_to_opcodes(blocks: &[MatchingBlock]) -> Vec<DiffChunk> {
    let mut opcodes = Vec::new();
    let (mut i, mut j) = (0, 0);
    push_opcodes(blocks, &mut i, &mut j, &mut opcodes);
    opcodes
}

fn push_opcodes(blocks: &[MatchingBlock], i: &mut usize, j: &mut usize, out: &mut Vec<DiffChunk>) {
    for block in blocks {
        let tag = match (*i < block.a, *j < block.b) {
            (true, true) => Some(Tag::Replace),
            (true, false) => Some(Tag::Delete),
            (false, true) => Some(Tag::Insert),
            (false, false) => None,
        };
        if let Some(tag) = tag {
            out.push(DiffChunk::new(tag, *i, block.a, *j, block.b));
        }
        *i = block.a + block.len;
        *j = block.b + block.len;
        if block.len > 0 {
            out.push(DiffChunk::new(Tag::Equal, block.a, *i, block.b, *j));
        }
    }
}

/// Matcher that forces alignment at user-supplied `(a, b)` positions.
///
/// Each slice between consecutive sync points is matched independently.
/// The combined matching blocks join a slice's trailing match with the next
/// slice's leading match when they are contiguous; opcodes are produced per
/// slice so that no chunk straddles a sync point.
pub struct SyncPointMatcher<'a, T> {
    a: &'a [T],
    b: &'a [T],
    slices: Vec<(usize, usize, usize, usize)>,
    next_slice: usize,
    current: Option<MyersMatcher<'a, T>>,
    matching_blocks: Vec<MatchingBlock>,
    split_matching_blocks: Vec<Vec<MatchingBlock>>,
    finished: bool,
}

impl<'a, T: Eq + Hash> SyncPointMatcher<'a, T> {
    /// `syncpoints` must be ascending on both sides and within bounds.
    pub fn new(a: &'a [T], b: &'a [T], syncpoints: &[(usize, usize)]) -> Self {
        let mut slices = Vec::with_capacity(syncpoints.len() + 1);
        let (mut ai, mut bi) = (0, 0);
        for &(aj, bj) in syncpoints {
            assert!(
                ai <= aj && bi <= bj && aj <= a.len() && bj <= b.len(),
                "sync point ({aj}, {bj}) out of order or out of bounds"
            );
            slices.push((ai, aj, bi, bj));
            ai = aj;
            bi = bj;
        }
        if ai < a.len() || bi < b.len() || slices.is_empty() {
            slices.push((ai, a.len(), bi, b.len()));
        }

        Self {
            a,
            b,
            slices,
            next_slice: 0,
            current: None,
            matching_blocks: Vec::new(),
            split_matching_blocks: Vec::new(),
            finished: false,
        }
    }

    /// Per-slice matching blocks, each terminated by its slice's sentinel.
    pub fn split_matching_blocks(&mut self) -> &[Vec<MatchingBlock>] {
        self.run();
        &self.split_matching_blocks
    }

    fn collect_slice(&mut self, blocks: &[MatchingBlock]) {
        let (ai, aj, bi, bj) = self.slices[self.next_slice];
        let mut body = &blocks[..blocks.len() - 1];

        let mut split = Vec::with_capacity(blocks.len());
        for block in body {
            split.push(MatchingBlock::new(ai + block.a, bi + block.b, block.len));
        }
        split.push(MatchingBlock::new(aj, bj, 0));
        self.split_matching_blocks.push(split);

        if let (Some(last), Some(first)) = (self.matching_blocks.last_mut(), body.first()) {
            if last.a + last.len == ai && last.b + last.len == bi && first.a == 0 && first.b == 0 {
                last.len += first.len;
                body = &body[1..];
            }
        }
        self.matching_blocks.extend(
            body.iter()
                .map(|block| MatchingBlock::new(ai + block.a, bi + block.b, block.len)),
        );
    }
}

impl<T: Eq + Hash> SequenceMatcher for SyncPointMatcher<'_, T> {
    fn step(&mut self) -> Progress {
        if self.finished {
            return Progress::Done;
        }

        let (ai, aj, bi, bj) = self.slices[self.next_slice];
        let (a, b) = (self.a, self.b);
        let matcher = self
            .current
            .get_or_insert_with(|| MyersMatcher::new(&a[ai..aj], &b[bi..bj]));
        if matcher.step() == Progress::Yield {
            return Progress::Yield;
        }
        let blocks = matcher.matching_blocks().to_vec();
        self.current = None;
        self.collect_slice(&blocks);
        self.next_slice += 1;

        if self.next_slice < self.slices.len() {
            return Progress::Yield;
        }
        self.matching_blocks
            .push(MatchingBlock::new(self.a.len(), self.b.len(), 0));
        self.finished = true;
        Progress::Done
    }

    fn matching_blocks(&mut self) -> &[MatchingBlock] {
        self.run();
        &self.matching_blocks
    }

    fn opcodes(&mut self) -> Vec<DiffChunk> {
        self.run();
        let mut opcodes = Vec::new();
        let (mut i, mut j) = (0, 0);
        for blocks in &self.split_matching_blocks {
            push_opcodes(blocks, &mut i, &mut j, &mut opcodes);
        }
        opcodes
    }
}

/// Difference opcodes between two line sequences, run to completion.
pub fn diff_opcodes<T: Eq + Hash>(a: &[T], b: &[T]) -> Vec<DiffChunk> {
    MyersMatcher::new(a, b).difference_opcodes()
}

/// Character-level opcodes (including `equal`) between two strings, with
/// offsets counted in `char`s.
pub fn inline_opcodes(text1: &str, textn: &str) -> Vec<DiffChunk> {
    let a: Vec<char> = text1.chars().collect();
    let b: Vec<char> = textn.chars().collect();
    MyersMatcher::inline(&a, &b).opcodes()
}
