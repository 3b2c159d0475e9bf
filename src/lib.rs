//! Segmented, file-backed append-only log for a single replicated state
//! machine term.
//!
//! A [`TermLog`] owns one election term's worth of log entries, stored
//! across a set of memory-mapped segment files. Writers ([`LogWriter`]) may
//! arrive out of order and are reconciled into a contiguous prefix; readers
//! ([`LogReader`]) follow behind either the contiguous or the commit
//! watermark. See [`TermLog`] for the operations that mediate all of this.
//!
//! Cross-term composition, peer replication, and record framing above the
//! raw byte stream are out of scope for this crate.

mod error;
mod lcache;
mod reader;
mod recovery;
mod segment;
mod segment_set;
mod term_log;
mod worker;
mod writer;

pub use error::{wait, Error, Result};
pub use reader::SegmentReader as LogReader;
pub use term_log::{Capture, Options, TermLog, NO_PREV_TERM};
pub use worker::Worker;
pub use writer::SegmentWriter as LogWriter;
