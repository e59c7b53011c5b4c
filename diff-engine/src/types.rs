//! Core types shared by the matcher, differ and merge engine.
//!
//! All ranges are half-open `[start..end)`. A [`DiffChunk`] produced by the
//! differ always carries the pivot pane (pane 1) on its `a` side.

use std::fmt;
use std::hash::Hash;

use serde::Serialize;

/// Classification of a diff region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    Equal,
    Insert,
    Delete,
    Replace,
    /// Only produced by the three-way merge, never by a raw matcher.
    Conflict,
}

impl Tag {
    /// The tag seen from the other side of the comparison.
    pub fn reversed(self) -> Self {
        match self {
            Tag::Insert => Tag::Delete,
            Tag::Delete => Tag::Insert,
            other => other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Equal => "equal",
            Tag::Insert => "insert",
            Tag::Delete => "delete",
            Tag::Replace => "replace",
            Tag::Conflict => "conflict",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single opcode `(tag, a0, a1, b0, b1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DiffChunk {
    pub tag: Tag,
    pub start_a: usize,
    pub end_a: usize,
    pub start_b: usize,
    pub end_b: usize,
}

impl DiffChunk {
    pub fn new(tag: Tag, start_a: usize, end_a: usize, start_b: usize, end_b: usize) -> Self {
        Self {
            tag,
            start_a,
            end_a,
            start_b,
            end_b,
        }
    }

    /// Swap the `a` and `b` sides, flipping `insert` and `delete`.
    pub fn reversed(&self) -> Self {
        Self {
            tag: self.tag.reversed(),
            start_a: self.start_b,
            end_a: self.end_b,
            start_b: self.start_a,
            end_b: self.end_a,
        }
    }

    /// Shift both sides by the given amounts.
    pub fn offset(&self, by_a: usize, by_b: usize) -> Self {
        Self {
            tag: self.tag,
            start_a: self.start_a + by_a,
            end_a: self.end_a + by_a,
            start_b: self.start_b + by_b,
            end_b: self.end_b + by_b,
        }
    }

    pub fn len_a(&self) -> usize {
        self.end_a - self.start_a
    }

    pub fn len_b(&self) -> usize {
        self.end_b - self.start_b
    }

    /// Whether this chunk changes anything (i.e. is not `equal`).
    pub fn is_change(&self) -> bool {
        self.tag != Tag::Equal
    }
}

impl fmt::Display for DiffChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}..{}) <-> [{}..{})",
            self.tag, self.start_a, self.end_a, self.start_b, self.end_b
        )
    }
}

/// A maximal matching run: `a[a..a + len] == b[b..b + len]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchingBlock {
    pub a: usize,
    pub b: usize,
    pub len: usize,
}

impl MatchingBlock {
    pub fn new(a: usize, b: usize, len: usize) -> Self {
        Self { a, b, len }
    }
}

impl From<(usize, usize, usize)> for MatchingBlock {
    fn from((a, b, len): (usize, usize, usize)) -> Self {
        Self { a, b, len }
    }
}

/// One entry of the merge cache: the pane 1 → pane 0 change on the left and
/// the pane 1 → pane 2 change on the right. At least one side is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MergedChunk {
    pub left: Option<DiffChunk>,
    pub right: Option<DiffChunk>,
}

impl MergedChunk {
    pub fn new(left: Option<DiffChunk>, right: Option<DiffChunk>) -> Self {
        Self { left, right }
    }

    pub fn left(chunk: DiffChunk) -> Self {
        Self::new(Some(chunk), None)
    }

    pub fn right(chunk: DiffChunk) -> Self {
        Self::new(None, Some(chunk))
    }

    pub fn both(left: DiffChunk, right: DiffChunk) -> Self {
        Self::new(Some(left), Some(right))
    }

    /// Side 0 is the left (pane 0) change, side 1 the right (pane 2) change.
    pub fn side(&self, side: usize) -> Option<DiffChunk> {
        match side {
            0 => self.left,
            1 => self.right,
            _ => panic!("invalid merge side {side}"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    pub fn is_conflict(&self) -> bool {
        self.left.is_some_and(|c| c.tag == Tag::Conflict)
            || self.right.is_some_and(|c| c.tag == Tag::Conflict)
    }

    /// Either side, left preferred; used for pane 1 positions.
    pub fn any(&self) -> Option<DiffChunk> {
        self.left.or(self.right)
    }

    /// Pane 1 start line, used for ordering.
    pub fn start_a(&self) -> usize {
        self.any().map_or(0, |c| c.start_a)
    }
}

/// Outcome of advancing a resumable computation by one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More work remains; the caller may yield to other work.
    Yield,
    /// The computation is complete.
    Done,
}

impl Progress {
    pub fn is_done(self) -> bool {
        self == Progress::Done
    }
}

/// A comparable element of a sequence, typically a line of text.
///
/// The differ only needs equality and hashing; `is_blank` is consulted by
/// the ignore-blank-lines mode.
pub trait Token: Eq + Hash {
    fn is_blank(&self) -> bool;
}

impl Token for String {
    fn is_blank(&self) -> bool {
        self.is_empty()
    }
}

impl Token for str {
    fn is_blank(&self) -> bool {
        self.is_empty()
    }
}

impl<T: Token + ?Sized> Token for &T {
    fn is_blank(&self) -> bool {
        (**self).is_blank()
    }
}

impl Token for char {
    fn is_blank(&self) -> bool {
        false
    }
}

impl Token for u8 {
    fn is_blank(&self) -> bool {
        false
    }
}
