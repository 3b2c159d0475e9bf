use std::io;

use thiserror::Error;

/// Errors produced by the term log core.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted after `close`, or on a writer/reader that was
    /// individually closed.
    #[error("term log is closed")]
    Closed,

    /// An index was requested that lies below the term's `startIndex`.
    #[error("index {index} is below start index {start}")]
    InvalidIndex { index: u64, start: u64 },

    /// `finishTerm` was called with an `endIndex` that regresses below the
    /// current commit, or that raises an already-finished term's end.
    #[error("illegal term boundary: {reason}")]
    IllegalTermBoundary { reason: &'static str },

    /// Recovery found a gap between the on-disk segments and the asserted
    /// `highestIndex`.
    #[error("missing segment(s) covering [{gap_start}, {gap_end})")]
    IncompleteSegment { gap_start: u64, gap_end: u64 },

    /// A blocking wait was interrupted.
    #[error("wait was interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Sentinel values returned by [`crate::writer::SegmentWriter::wait_for_commit`]
/// and delivered to commit waiters, distinct from ordinary commit indices.
pub mod wait {
    /// Returned when the term log was closed while a wait was outstanding.
    pub const CLOSED: i64 = i64::MIN;
    /// Returned when the waited-for index is beyond the term's `endIndex`.
    pub const TERM_END: i64 = i64::MIN + 1;
    /// Returned when the wait's timeout elapsed first.
    pub const TIMEOUT: i64 = i64::MIN + 2;
}
