//! Character-level highlighting inside changed chunks.
//!
//! [`CachedMatcher`] puts an [`InlineCache`] in front of the
//! [`MatcherPool`]. Callbacks are only ever run from [`CachedMatcher::pump`]
//! on the owning thread, cache hits included. [`InlineHighlighter`] is the
//! per-document coordinator that feeds chunk texts through it and turns the
//! arriving opcodes into character ranges.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::differ::{Differ, GroupMerge};
use crate::error::Result;
use crate::pool::{JobId, MatchResult, MatcherPool, PoolConfig};
use crate::types::{DiffChunk, Tag};

/// Combined chunk length above which only coarse highlighting is done.
pub const DEFAULT_CHAR_LIMIT: usize = 20_000;

/// Interior equal runs shorter than this are highlighted with their
/// neighbours.
const MIN_EQUAL_RUN: usize = 3;

pub type MatchCallback = Box<dyn FnOnce(&[DiffChunk])>;

#[derive(Debug, Clone)]
struct CacheEntry {
    opcodes: Vec<DiffChunk>,
    stamp: u64,
}

/// `(text1, textn) -> opcodes`, evicting the least recently used entries.
#[derive(Debug, Clone, Default)]
pub struct InlineCache {
    entries: HashMap<(String, String), CacheEntry>,
    epoch: u64,
}

impl InlineCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Cached opcodes, refreshing the entry's timestamp on a hit.
    pub fn get(&mut self, text1: &str, textn: &str) -> Option<Vec<DiffChunk>> {
        let stamp = self.tick();
        let entry = self.entries.get_mut(&(text1.to_owned(), textn.to_owned()))?;
        entry.stamp = stamp;
        Some(entry.opcodes.clone())
    }

    pub fn insert(&mut self, text1: String, textn: String, opcodes: Vec<DiffChunk>) {
        let stamp = self.tick();
        self.entries.insert((text1, textn), CacheEntry { opcodes, stamp });
    }

    /// Last-use stamp of an entry, without touching it.
    pub fn timestamp(&self, text1: &str, textn: &str) -> Option<u64> {
        self.entries
            .get(&(text1.to_owned(), textn.to_owned()))
            .map(|e| e.stamp)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Once the cache holds more than `3 * size_hint` entries, keep only
    /// the `2 * size_hint` most recently used. A hint of 0 (a comparison
    /// with no chunks) empties a non-empty cache.
    pub fn clean(&mut self, size_hint: usize) {
        if self.entries.len() <= size_hint * 3 {
            return;
        }
        let keep = size_hint * 2;
        if keep == 0 {
            self.entries.clear();
            return;
        }
        let mut stamps: Vec<u64> = self.entries.values().map(|e| e.stamp).collect();
        stamps.sort_unstable_by(|a, b| b.cmp(a));
        let cutoff = stamps[keep - 1];
        let before = self.entries.len();
        self.entries.retain(|_, e| e.stamp >= cutoff);
        tracing::trace!(before, after = self.entries.len(), "inline cache cleaned");
    }
}

struct PendingMatch {
    text1: String,
    textn: String,
    callback: MatchCallback,
}

/// Inline matcher with a result cache and main-thread callback delivery.
pub struct CachedMatcher {
    pool: MatcherPool,
    cache: InlineCache,
    pending: HashMap<JobId, PendingMatch>,
    ready: VecDeque<(MatchCallback, Vec<DiffChunk>)>,
}

impl std::fmt::Debug for CachedMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedMatcher")
            .field("pool", &self.pool)
            .field("cached", &self.cache.len())
            .field("pending", &self.pending.len())
            .field("ready", &self.ready.len())
            .finish()
    }
}

impl CachedMatcher {
    pub fn new(config: PoolConfig) -> Result<Self> {
        Ok(Self {
            pool: MatcherPool::new(config)?,
            cache: InlineCache::new(),
            pending: HashMap::new(),
            ready: VecDeque::new(),
        })
    }

    pub fn cache(&self) -> &InlineCache {
        &self.cache
    }

    /// Request opcodes for a pair of texts. The callback runs from a later
    /// [`pump`](Self::pump), never from this call. Returns `true` when
    /// this request moved the matcher from idle to busy, meaning the
    /// caller should arm its result pump.
    pub fn match_texts(
        &mut self,
        text1: &str,
        textn: &str,
        callback: impl FnOnce(&[DiffChunk]) + 'static,
    ) -> Result<bool> {
        let was_idle = !self.has_pending();
        if let Some(opcodes) = self.cache.get(text1, textn) {
            self.ready.push_back((Box::new(callback), opcodes));
        } else {
            let id = self.pool.submit(text1.to_owned(), textn.to_owned())?;
            self.pending.insert(
                id,
                PendingMatch {
                    text1: text1.to_owned(),
                    textn: textn.to_owned(),
                    callback: Box::new(callback),
                },
            );
        }
        Ok(was_idle)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.ready.is_empty()
    }

    /// Deliver everything that is ready, waiting up to the pool's poll
    /// interval if nothing was. Returns whether callbacks are still
    /// outstanding, i.e. whether the pump should stay armed.
    pub fn pump(&mut self) -> bool {
        while let Some((callback, opcodes)) = self.ready.pop_front() {
            callback(&opcodes);
        }

        let mut received = false;
        while let Some(result) = self.pool.try_recv() {
            self.deliver(result);
            received = true;
        }
        if !received && !self.pending.is_empty() {
            if let Some(result) = self.pool.recv_timeout() {
                self.deliver(result);
            }
        }
        self.has_pending()
    }

    fn deliver(&mut self, result: MatchResult) {
        let Some(pending) = self.pending.remove(&result.id) else {
            return;
        };
        // A failed job has already been logged by its worker; its callback
        // is dropped unrun.
        if let Some(opcodes) = result.opcodes {
            (pending.callback)(&opcodes);
            self.cache.insert(pending.text1, pending.textn, opcodes);
        }
    }

    pub fn clean(&mut self, size_hint: usize) {
        self.cache.clean(size_hint);
    }

    /// Forget cached results and outstanding callbacks. Jobs already
    /// submitted still run, but their results are ignored.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.pending.clear();
        self.ready.clear();
    }

    pub fn shutdown(&mut self) {
        self.pool.shutdown();
        self.clear();
    }
}

/// Highlight ranges of one chunk, in characters relative to the start of
/// the chunk text on each side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHighlight {
    /// The outer pane the chunk compares pane 1 against.
    pub pane: usize,
    pub chunk: DiffChunk,
    pub ranges: [Vec<(usize, usize)>; 2],
    /// Whole-chunk highlighting, used until (or instead of) a real match.
    pub coarse: bool,
}

struct Arrival {
    pane: usize,
    chunk: DiffChunk,
    text1: String,
    textn: String,
    opcodes: Vec<DiffChunk>,
}

/// Per-document inline highlight coordinator.
pub struct InlineHighlighter {
    char_limit: usize,
    highlights: HashMap<(usize, DiffChunk), ChunkHighlight>,
    inbox: Rc<RefCell<Vec<Arrival>>>,
}

impl Default for InlineHighlighter {
    fn default() -> Self {
        Self::new(DEFAULT_CHAR_LIMIT)
    }
}

impl InlineHighlighter {
    pub fn new(char_limit: usize) -> Self {
        Self {
            char_limit,
            highlights: HashMap::new(),
            inbox: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn char_limit(&self) -> usize {
        self.char_limit
    }

    /// Reset every highlight to coarse and submit each replaced or
    /// conflicting chunk to `matcher`. Returns whether the caller should
    /// arm the matcher's pump.
    pub fn refresh<M: GroupMerge, T: AsRef<str>>(
        &mut self,
        differ: &Differ<M>,
        texts: &[&[T]],
        matcher: &mut CachedMatcher,
    ) -> Result<bool> {
        self.highlights.clear();
        self.inbox.borrow_mut().clear();

        let outer_panes: &[usize] = if differ.num_sequences() == 3 { &[0, 2] } else { &[0] };
        let mut arm = false;
        for &pane in outer_panes {
            for chunk in differ.pair_changes(1, pane, None) {
                if !matches!(chunk.tag, Tag::Replace | Tag::Conflict) {
                    continue;
                }
                let text1 = chunk_text(texts[1], chunk.start_a, chunk.end_a);
                let textn = chunk_text(texts[pane], chunk.start_b, chunk.end_b);
                self.highlights
                    .insert((pane, chunk), coarse_highlight(pane, chunk, &text1, &textn));

                if text1.chars().count() + textn.chars().count() > self.char_limit {
                    tracing::trace!(pane, start = chunk.start_a, "chunk over inline limit, coarse only");
                    continue;
                }
                let inbox = Rc::clone(&self.inbox);
                let (t1, tn) = (text1.clone(), textn.clone());
                arm |= matcher.match_texts(&text1, &textn, move |opcodes| {
                    inbox.borrow_mut().push(Arrival {
                        pane,
                        chunk,
                        text1: t1,
                        textn: tn,
                        opcodes: opcodes.to_vec(),
                    });
                })?;
            }
        }
        matcher.clean(differ.diff_count());
        Ok(arm)
    }

    /// Apply results delivered by the matcher's pump. Results for chunks
    /// that no longer exist, or whose text has changed since submission,
    /// are skipped. Returns how many highlights were updated.
    pub fn apply_arrivals<M: GroupMerge, T: AsRef<str>>(
        &mut self,
        differ: &Differ<M>,
        texts: &[&[T]],
    ) -> usize {
        let arrivals: Vec<Arrival> = self.inbox.borrow_mut().drain(..).collect();
        let mut applied = 0;
        for arrival in arrivals {
            let chunk = arrival.chunk;
            if !differ.has_chunk(arrival.pane, &chunk) {
                continue;
            }
            if chunk_text(texts[1], chunk.start_a, chunk.end_a) != arrival.text1
                || chunk_text(texts[arrival.pane], chunk.start_b, chunk.end_b) != arrival.textn
            {
                continue;
            }
            self.highlights.insert(
                (arrival.pane, chunk),
                ChunkHighlight {
                    pane: arrival.pane,
                    chunk,
                    ranges: highlight_ranges(&arrival.opcodes),
                    coarse: false,
                },
            );
            applied += 1;
        }
        applied
    }

    pub fn get(&self, pane: usize, chunk: &DiffChunk) -> Option<&ChunkHighlight> {
        self.highlights.get(&(pane, *chunk))
    }

    pub fn highlights(&self) -> impl Iterator<Item = &ChunkHighlight> {
        self.highlights.values()
    }

    pub fn clear(&mut self) {
        self.highlights.clear();
        self.inbox.borrow_mut().clear();
    }
}

/// Lines `[lo..hi)` joined by `\n`.
fn chunk_text<T: AsRef<str>>(lines: &[T], lo: usize, hi: usize) -> String {
    let hi = hi.min(lines.len());
    let lo = lo.min(hi);
    lines[lo..hi]
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<&str>>()
        .join("\n")
}

fn coarse_highlight(pane: usize, chunk: DiffChunk, text1: &str, textn: &str) -> ChunkHighlight {
    let whole = |text: &str| match text.chars().count() {
        0 => Vec::new(),
        n => vec![(0, n)],
    };
    ChunkHighlight {
        pane,
        chunk,
        ranges: [whole(text1), whole(textn)],
        coarse: true,
    }
}

fn push_range(ranges: &mut Vec<(usize, usize)>, start: usize, end: usize) {
    if start == end {
        return;
    }
    match ranges.last_mut() {
        Some(last) if start <= last.1 => last.1 = last.1.max(end),
        _ => ranges.push((start, end)),
    }
}

/// Character ranges to highlight on each side for a list of inline
/// opcodes. Short equal runs between two changes are absorbed into the
/// surrounding highlight; equal runs at either end never are.
pub fn highlight_ranges(opcodes: &[DiffChunk]) -> [Vec<(usize, usize)>; 2] {
    let last = opcodes.len().saturating_sub(1);
    let mut ranges = [Vec::new(), Vec::new()];
    for (i, op) in opcodes.iter().enumerate() {
        if op.tag == Tag::Equal {
            let interior = i != 0 && i != last;
            if !interior || op.len_a() >= MIN_EQUAL_RUN {
                continue;
            }
        }
        push_range(&mut ranges[0], op.start_a, op.end_a);
        push_range(&mut ranges[1], op.start_b, op.end_b);
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn op(tag: Tag, a0: usize, a1: usize, b0: usize, b1: usize) -> DiffChunk {
        DiffChunk::new(tag, a0, a1, b0, b1)
    }

    fn matcher() -> CachedMatcher {
        CachedMatcher::new(PoolConfig {
            poll_interval: Duration::from_millis(20),
            ..PoolConfig::default()
        })
        .unwrap()
    }

    fn drain(matcher: &mut CachedMatcher) {
        for _ in 0..500 {
            if !matcher.pump() {
                return;
            }
        }
        panic!("matcher never went idle");
    }

    #[test]
    fn test_cache_get_refreshes_timestamp() {
        let mut cache = InlineCache::new();
        cache.insert("a".into(), "b".into(), vec![op(Tag::Replace, 0, 1, 0, 1)]);
        let first = cache.timestamp("a", "b").unwrap();
        assert_eq!(cache.get("a", "b").unwrap(), vec![op(Tag::Replace, 0, 1, 0, 1)]);
        assert!(cache.timestamp("a", "b").unwrap() > first);
        assert!(cache.get("b", "a").is_none());
    }

    #[test]
    fn test_cache_clean_keeps_most_recent() {
        let mut cache = InlineCache::new();
        for i in 0..7 {
            cache.insert(format!("l{i}"), format!("r{i}"), Vec::new());
        }
        // Touch the oldest entry so it survives.
        cache.get("l0", "r0");

        cache.clean(3);
        assert_eq!(cache.len(), 7, "under 3x the hint nothing is evicted");

        cache.clean(2);
        assert_eq!(cache.len(), 4);
        for key in ["l0", "l4", "l5", "l6"] {
            let right = key.replace('l', "r");
            assert!(cache.timestamp(key, &right).is_some(), "{key} evicted");
        }

        cache.clean(0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_highlight_ranges_absorbs_short_equal_runs() {
        let opcodes = vec![
            op(Tag::Equal, 0, 4, 0, 4),
            op(Tag::Replace, 4, 5, 4, 6),
            op(Tag::Equal, 5, 7, 6, 8),
            op(Tag::Delete, 7, 9, 8, 8),
            op(Tag::Equal, 9, 14, 8, 13),
            op(Tag::Insert, 14, 14, 13, 15),
            op(Tag::Equal, 14, 15, 15, 16),
        ];
        let [left, right] = highlight_ranges(&opcodes);
        assert_eq!(left, vec![(4, 9)]);
        assert_eq!(right, vec![(4, 8), (13, 15)]);
    }

    #[test]
    fn test_cache_hit_is_delivered_from_pump() {
        let mut matcher = matcher();
        let got = Rc::new(RefCell::new(Vec::new()));

        let sink = Rc::clone(&got);
        assert!(matcher
            .match_texts("kitten", "sitting", move |ops| sink.borrow_mut().push(ops.to_vec()))
            .unwrap());
        drain(&mut matcher);
        assert_eq!(got.borrow().len(), 1);
        let stamp = matcher.cache().timestamp("kitten", "sitting").unwrap();

        let sink = Rc::clone(&got);
        assert!(matcher
            .match_texts("kitten", "sitting", move |ops| sink.borrow_mut().push(ops.to_vec()))
            .unwrap());
        assert_eq!(got.borrow().len(), 1, "hit must not run inline");
        assert!(matcher.has_pending());
        assert!(!matcher.pump());

        let got = got.borrow();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], got[1]);
        assert!(matcher.cache().timestamp("kitten", "sitting").unwrap() > stamp);
    }

    #[test]
    fn test_second_request_while_busy_does_not_rearm() {
        let mut matcher = matcher();
        assert!(matcher.match_texts("abc", "abd", |_| {}).unwrap());
        assert!(!matcher.match_texts("xyz", "xyq", |_| {}).unwrap());
        drain(&mut matcher);
        assert_eq!(matcher.cache().len(), 2);
    }

    #[test]
    fn test_shutdown_clears_and_rejects() {
        let mut matcher = matcher();
        matcher.match_texts("abc", "abd", |_| {}).unwrap();
        matcher.shutdown();
        assert!(!matcher.has_pending());
        assert!(matcher.match_texts("one", "two", |_| {}).is_err());
    }

    #[test]
    fn test_highlighter_refines_replace_chunks() {
        let a = vec!["same", "the quick fox", "tail"];
        let b = vec!["same", "the quick box", "tail"];
        let texts: [&[&str]; 2] = [&a, &b];
        let mut differ = Differ::new();
        differ.set_sequences(&texts).run();

        let mut matcher = matcher();
        let mut highlighter = InlineHighlighter::default();
        assert!(highlighter.refresh(&differ, &texts, &mut matcher).unwrap());

        let chunk = op(Tag::Replace, 1, 2, 1, 2);
        let coarse = highlighter.get(0, &chunk).unwrap();
        assert!(coarse.coarse);
        assert_eq!(coarse.ranges, [vec![(0, 13)], vec![(0, 13)]]);

        drain(&mut matcher);
        assert_eq!(highlighter.apply_arrivals(&differ, &texts), 1);
        let fine = highlighter.get(0, &chunk).unwrap();
        assert!(!fine.coarse);
        assert_eq!(fine.ranges, [vec![(10, 11)], vec![(10, 11)]]);
    }

    #[test]
    fn test_highlighter_skips_stale_arrivals() {
        let a = vec!["alpha one"];
        let b = vec!["alpha two"];
        let texts: [&[&str]; 2] = [&a, &b];
        let mut differ = Differ::new();
        differ.set_sequences(&texts).run();

        let mut matcher = matcher();
        let mut highlighter = InlineHighlighter::default();
        highlighter.refresh(&differ, &texts, &mut matcher).unwrap();
        drain(&mut matcher);

        // The text moved on before the result was applied.
        let edited = vec!["alpha three"];
        let texts: [&[&str]; 2] = [&edited, &b];
        assert_eq!(highlighter.apply_arrivals(&differ, &texts), 0);
        assert!(highlighter.get(0, &op(Tag::Replace, 0, 1, 0, 1)).unwrap().coarse);
    }

    #[test]
    fn test_highlighter_char_limit_stays_coarse() {
        let a = vec!["abcdef"];
        let b = vec!["abcxef"];
        let texts: [&[&str]; 2] = [&a, &b];
        let mut differ = Differ::new();
        differ.set_sequences(&texts).run();

        let mut matcher = matcher();
        let mut highlighter = InlineHighlighter::new(10);
        assert!(!highlighter.refresh(&differ, &texts, &mut matcher).unwrap());
        assert!(!matcher.has_pending());
        let highlight = highlighter.get(0, &op(Tag::Replace, 0, 1, 0, 1)).unwrap();
        assert!(highlight.coarse);
    }
}
