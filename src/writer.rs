use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{self, Error, Result};
use crate::segment::Segment;
use crate::term_log::TermLog;

struct WriterState {
    index: u64,
    segment: Option<Arc<Segment>>,
}

/// A cursor that appends bytes at a fixed `start_index` within a term.
///
/// Obtained via [`TermLog::open_writer`]. `index` advances with each
/// successful [`SegmentWriter::write`]; the writer is pinned to whichever
/// segment currently covers it and hands that pin back when it advances past
/// the segment's end or is closed.
pub struct SegmentWriter {
    term_log: Arc<TermLog>,
    pub start_index: u64,
    state: Mutex<WriterState>,
    prev_term: AtomicU64,
    closed: AtomicBool,
}

impl SegmentWriter {
    pub(crate) fn new(term_log: Arc<TermLog>, start_index: u64, prev_term: u64) -> Self {
        Self {
            term_log,
            start_index,
            state: Mutex::new(WriterState { index: start_index, segment: None }),
            prev_term: AtomicU64::new(prev_term),
            closed: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> u64 {
        self.state.lock().unwrap().index
    }

    pub fn prev_term(&self) -> u64 {
        self.prev_term.load(Ordering::Acquire)
    }

    /// Write `data`, asserting that bytes up to `asserted_highest` form a
    /// valid prefix through this call (the caller's contract: everything up
    /// to that index is durable or reconstructible).
    ///
    /// Returns the number of bytes actually written, which is less than
    /// `data.len()` only if the term ended mid-write (including zero, if it
    /// had already ended).
    pub fn write(&self, data: &[u8], asserted_highest: u64) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let mut state = self.state.lock().unwrap();
        let mut written = 0usize;
        while written < data.len() {
            let seg = self.current_segment(&mut state)?;
            let Some(seg) = seg else { break };
            let (n, became_dirty) = seg.write(state.index, &data[written..])?;
            if became_dirty {
                self.term_log.mark_dirty(seg.clone());
            }
            if n == 0 {
                // Exhausted this segment; release it and loop to acquire the next.
                state.segment = None;
                self.term_log.release_segment(seg);
                continue;
            }
            written += n;
            state.index += n as u64;
        }
        let final_index = state.index;
        drop(state);

        if final_index > self.start_index {
            self.prev_term.store(self.term_log.term(), Ordering::Release);
        }
        self.term_log.write_finished(self.start_index, final_index, asserted_highest);
        Ok(written)
    }

    fn current_segment(&self, state: &mut WriterState) -> Result<Option<Arc<Segment>>> {
        if let Some(seg) = &state.segment {
            if state.index < seg.end_index() {
                return Ok(Some(seg.clone()));
            }
            let old = state.segment.take().unwrap();
            self.term_log.release_segment(old);
        }
        match self.term_log.segment_for_writing(state.index)? {
            Some(seg) => {
                state.segment = Some(seg.clone());
                Ok(Some(seg))
            }
            None => Ok(None),
        }
    }

    /// Block until the commit watermark reaches `index`, or the wait times
    /// out, the term ends, or the term log (or this writer) is closed.
    ///
    /// Returns the commit index reached, or a sentinel from
    /// [`crate::error::wait`].
    pub fn wait_for_commit(&self, index: u64, timeout: Option<Duration>) -> i64 {
        if self.closed.load(Ordering::Acquire) {
            return error::wait::CLOSED;
        }
        self.term_log.wait_for_commit(index, timeout)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(seg) = state.segment.take() {
            self.term_log.release_segment(seg);
        }
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term_log::Options;
    use crate::worker::Worker;
    use tempfile::tempdir;

    fn new_log(dir: &std::path::Path) -> Arc<TermLog> {
        let worker = Arc::new(Worker::new(Duration::from_secs(1)));
        TermLog::open(dir.join("log"), 1, 0, Some(0), 0, 0, Options::default(), worker).unwrap()
    }

    #[test]
    fn write_advances_index_and_reports_highest() {
        let dir = tempdir().unwrap();
        let log = new_log(dir.path());
        let writer = log.open_writer(0).unwrap();
        let n = writer.write(b"hello", 5).unwrap();
        assert_eq!(n, 5);
        assert_eq!(writer.index(), 5);
        assert_eq!(log.capture_highest().highest_index, 5);
    }

    #[test]
    fn write_after_finish_term_returns_zero() {
        let dir = tempdir().unwrap();
        let log = new_log(dir.path());
        log.finish_term(4).unwrap();
        let writer = log.open_writer(4).unwrap();
        assert_eq!(writer.write(b"abcd", 8).unwrap(), 0);
    }
}
