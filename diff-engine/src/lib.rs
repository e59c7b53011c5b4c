//! # diff-engine
//!
//! Incremental two- and three-way text differencing with automatic merge.
//!
//! ## Pieces
//!
//! 1. **Matcher** ([`matcher`]): a resumable Myers O(NP) sequence matcher
//!    with a discard pre-pass for lines, a k-gram pre-pass for characters
//!    and a sync-point variant that pins chosen lines to each other.
//!
//! 2. **Differ** ([`differ`]): keeps the opcodes between a pivot pane and
//!    one or two outer panes, folds them into a merge cache of chunks and
//!    conflicts, and repairs them locally after every edit.
//!
//! 3. **Merge** ([`merge`]): an extended grouping that resolves conflicts
//!    made of equal-length or deletion-only changes, and a [`Merger`] that
//!    writes merged text with conflict markers or pulls changes between
//!    two panes.
//!
//! 4. **Inline highlighting** ([`pool`], [`inline`]): character matching
//!    run off-thread on a tokio pool behind a least-recently-used cache.
//!
//! 5. **Plumbing**: a cooperative [`scheduler`], filtered and lazily
//!    materialised buffer lines ([`buffer`], [`filter`]) and grouped
//!    undo history with saved-state tracking ([`undo`]).
//!
//! ## Example
//!
//! ```rust
//! use diff_engine::{split_buffer_lines, Merger};
//!
//! let left = split_buffer_lines("one\nTWO\nthree\nfour\n");
//! let base = split_buffer_lines("one\ntwo\nthree\nfour\n");
//! let right = split_buffer_lines("one\ntwo\nthree\nFOUR\n");
//! let texts = [&left[..], &base[..], &right[..]];
//!
//! let mut merger = Merger::default();
//! merger.initialize(&texts).run();
//! let output = merger.merge_3_files(&texts, true).run();
//!
//! assert_eq!(output.text, "one\nTWO\nthree\nFOUR\n");
//! assert!(!output.has_conflicts());
//! ```

pub mod buffer;
pub mod differ;
pub mod error;
pub mod filter;
pub mod inline;
pub mod matcher;
pub mod merge;
pub mod pool;
pub mod scheduler;
pub mod types;
pub mod undo;

pub use buffer::{split_buffer_lines, BufferEdit, BufferLines, Newline, TextBuffer, TextSource};
pub use differ::{ChunkChanges, ChunkLocation, CoherentMerge, Differ, GroupMerge, SetSequences};
pub use error::{EngineError, Result};
pub use filter::{FilterChain, FilterRule};
pub use inline::{CachedMatcher, ChunkHighlight, InlineCache, InlineHighlighter};
pub use matcher::{MyersMatcher, SequenceMatcher, SyncPointMatcher};
pub use merge::{AutoMergeDiffer, ExtendedMerge, MergeOptions, MergeOutput, Merger};
pub use pool::{MatcherPool, PoolConfig};
pub use scheduler::{Policy, Runner, Scheduler, SchedulerHost, Task, TaskStep};
pub use types::{DiffChunk, MatchingBlock, MergedChunk, Progress, Tag, Token};
pub use undo::{AppliedEdit, DeleteText, InsertText, UndoAction, UndoEvent, UndoSequence};
