//! Error types for the differencing engine.
//!
//! Only conditions a caller can act on are errors. Broken invariants such as
//! an out-of-range pane index are programmer errors and panic.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A feature the matchers deliberately do not implement.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A text filter pattern failed to compile.
    #[error("invalid text filter {name:?}: {source}")]
    InvalidFilter {
        name: String,
        #[source]
        source: regex::Error,
    },

    /// A text filter removed or introduced line breaks.
    #[error("text filter changed the number of lines ({before} -> {after})")]
    FilterChangedLineCount { before: usize, after: usize },

    #[error("nothing to undo")]
    NothingToUndo,

    #[error("nothing to redo")]
    NothingToRedo,

    /// The matcher pool has been shut down and accepts no more work.
    #[error("matcher pool is shut down")]
    PoolShutDown,

    #[error("failed to start matcher runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
