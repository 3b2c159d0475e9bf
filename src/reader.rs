use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{self, Error, Result};
use crate::segment::Segment;
use crate::term_log::TermLog;

struct ReaderState {
    index: u64,
    segment: Option<Arc<Segment>>,
}

/// A cursor that follows a term log's commit or contiguous watermark.
///
/// Obtained via [`TermLog::open_reader`]. [`SegmentReader::read`] blocks for
/// new data up to the commit watermark; [`SegmentReader::read_any`] returns
/// immediately with whatever is available up to the contiguous watermark.
pub struct SegmentReader {
    term_log: Arc<TermLog>,
    state: Mutex<ReaderState>,
    prev_term: AtomicU64,
    recorded_prev_term: AtomicBool,
    closed: AtomicBool,
}

impl SegmentReader {
    pub(crate) fn new(term_log: Arc<TermLog>, start_index: u64, prev_term: u64) -> Self {
        Self {
            term_log,
            state: Mutex::new(ReaderState { index: start_index, segment: None }),
            prev_term: AtomicU64::new(prev_term),
            recorded_prev_term: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> u64 {
        self.state.lock().unwrap().index
    }

    pub fn prev_term(&self) -> u64 {
        self.prev_term.load(Ordering::Acquire)
    }

    /// `true` once this reader's cursor has reached a term log whose
    /// `end_index` is finite and has caught up to it — i.e. there will never
    /// be more data for this reader to consume.
    pub fn is_finished(&self) -> bool {
        let end = self.term_log.end_index();
        end != u64::MAX && self.index() >= end
    }

    /// Block until at least one more byte is committed past this reader's
    /// position, then read up to `buf.len()` bytes. Returns `Ok(0)` both when
    /// the term has ended at this index and when the wait times out; callers
    /// that must distinguish the two check [`SegmentReader::is_finished`].
    pub fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let want = self.state.lock().unwrap().index + 1;
        let commit = self.term_log.wait_for_commit(want, timeout);
        match commit {
            error::wait::CLOSED => Err(Error::Closed),
            error::wait::TERM_END | error::wait::TIMEOUT => Ok(0),
            available => self.read_bounded(buf, available as u64),
        }
    }

    /// Read whatever lies in `[index, contig_index)` without waiting.
    /// Returns `Ok(0)` both when caught up to `contig_index` and when the
    /// term has ended at this index.
    pub fn read_any(&self, buf: &mut [u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let contig = self.term_log.contig_index();
        self.read_bounded(buf, contig)
    }

    fn read_bounded(&self, buf: &mut [u8], available: u64) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.index >= available || buf.is_empty() {
            return Ok(0);
        }
        let max = (available - state.index).min(buf.len() as u64) as usize;
        let mut total = 0usize;
        while total < max {
            let seg = match &state.segment {
                Some(seg) if state.index < seg.end_index() => seg.clone(),
                _ => {
                    if let Some(old) = state.segment.take() {
                        self.term_log.release_segment(old);
                    }
                    match self.term_log.segment_for_reading(state.index) {
                        Some(seg) => {
                            state.segment = Some(seg.clone());
                            seg
                        }
                        None => break,
                    }
                }
            };
            let n = seg.read(state.index, &mut buf[total..max])?;
            if n == 0 {
                // Segment shrank out from under us (e.g. a concurrent
                // finish_term); drop it and let the next iteration re-acquire.
                state.segment = None;
                self.term_log.release_segment(seg);
                break;
            }
            total += n;
            state.index += n as u64;
        }
        if total > 0 && !self.recorded_prev_term.swap(true, Ordering::AcqRel) {
            self.prev_term.store(self.term_log.term(), Ordering::Release);
        }
        Ok(total)
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

impl Drop for SegmentReader {
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
    fn read_any_returns_available_prefix_without_waiting() {
        let dir = tempdir().unwrap();
        let log = new_log(dir.path());
        let writer = log.open_writer(0).unwrap();
        writer.write(b"hello world", 11).unwrap();

        let reader = log.open_reader(0).unwrap();
        let mut buf = [0u8; 11];
        let n = reader.read_any(&mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");

        // Caught up: returns 0 without blocking.
        assert_eq!(reader.read_any(&mut buf).unwrap(), 0);
    }

    #[test]
    fn read_blocks_until_committed() {
        let dir = tempdir().unwrap();
        let log = new_log(dir.path());
        let writer = log.open_writer(0).unwrap();
        writer.write(b"abcd", 4).unwrap();

        let log2 = log.clone();
        let handle = std::thread::spawn(move || {
            let reader = log2.open_reader(0).unwrap();
            let mut buf = [0u8; 4];
            let n = reader.read(&mut buf, Some(Duration::from_secs(2))).unwrap();
            (n, buf)
        });
        std::thread::sleep(Duration::from_millis(20));
        log.commit(4);
        let (n, buf) = handle.join().unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"abcd");
    }
}
