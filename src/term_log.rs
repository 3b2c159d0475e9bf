use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use log::{debug, warn};

use crate::error::{self, Error, Result};
use crate::lcache::LCache;
use crate::reader::SegmentReader;
use crate::recovery;
use crate::segment::Segment;
use crate::segment_set::SegmentSet;
use crate::worker::Worker;
use crate::writer::SegmentWriter;

/// Tunables governing segment sizing and cache capacities.
///
/// Mirrors the `Options` pattern used throughout this crate's lineage: a
/// plain `Copy` struct with a sensible [`Default`], threaded through at
/// construction time rather than read from environment or config files.
#[derive(Debug, Clone)]
pub struct Options {
    /// Segment sizes in bytes, smallest first. The segment created for the
    /// `n`th position in a term's segment set uses `segment_ramp[min(n, len-1)]`.
    pub segment_ramp: Vec<u64>,
    /// Number of idle writers kept warm per term log.
    pub writer_cache_capacity: usize,
    /// Number of idle readers kept warm per term log.
    pub reader_cache_capacity: usize,
    /// Number of idle (unpinned) segments kept mapped before their handles
    /// are scheduled for background close.
    pub segment_cache_capacity: usize,
    /// How long the background [`Worker`] sits idle before exiting.
    pub worker_idle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        const MIB: u64 = 1024 * 1024;
        Self {
            segment_ramp: vec![MIB, 2 * MIB, 4 * MIB, 8 * MIB, 16 * MIB, 32 * MIB, 64 * MIB],
            writer_cache_capacity: 16,
            reader_cache_capacity: 64,
            segment_cache_capacity: 32,
            worker_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl Options {
    fn segment_len(&self, ordinal: usize) -> u64 {
        let idx = ordinal.min(self.segment_ramp.len().saturating_sub(1));
        self.segment_ramp.get(idx).copied().unwrap_or(MIB_FALLBACK)
    }
}

const MIB_FALLBACK: u64 = 1024 * 1024;

/// Sentinel passed as `prev_term` to [`TermLog::open`] when the previous
/// term is not yet known; the first [`TermLog::set_prev_term_assertion`]
/// call then defines it.
pub const NO_PREV_TERM: u64 = u64::MAX;

/// Snapshot returned by [`TermLog::capture_highest`].
#[derive(Debug, Clone, Copy)]
pub struct Capture {
    pub term: u64,
    pub highest_index: u64,
    pub actual_commit: u64,
}

#[derive(Clone, Copy, Debug)]
struct NonContigWriter {
    index: u64,
    highest: u64,
}

struct Waiter {
    id: u64,
    result: Mutex<Option<i64>>,
    cond: Condvar,
}

impl Waiter {
    fn new(id: u64) -> Self {
        Self { id, result: Mutex::new(None), cond: Condvar::new() }
    }

    fn complete(&self, value: i64) {
        let mut result = self.result.lock().unwrap();
        if result.is_none() {
            *result = Some(value);
            self.cond.notify_all();
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> i64 {
        let mut result = self.result.lock().unwrap();
        loop {
            if let Some(v) = *result {
                return v;
            }
            match timeout {
                Some(d) => {
                    let (guard, wait_result) = self.cond.wait_timeout(result, d).unwrap();
                    result = guard;
                    if wait_result.timed_out() && result.is_none() {
                        return error::wait::TIMEOUT;
                    }
                }
                None => result = self.cond.wait(result).unwrap(),
            }
        }
    }
}

#[derive(Clone)]
struct CommitEntry {
    threshold: u64,
    waiter: Arc<Waiter>,
}

impl PartialEq for CommitEntry {
    fn eq(&self, other: &Self) -> bool {
        self.threshold == other.threshold && self.waiter.id == other.waiter.id
    }
}
impl Eq for CommitEntry {}
impl PartialOrd for CommitEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for CommitEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.threshold.cmp(&other.threshold).then(self.waiter.id.cmp(&other.waiter.id))
    }
}

struct Inner {
    start_index: u64,
    commit_index: u64,
    highest_index: u64,
    contig_index: u64,
    end_index: u64,
    segments: SegmentSet,
    non_contig: BTreeMap<u64, NonContigWriter>,
    commit_tasks: BinaryHeap<Reverse<CommitEntry>>,
}

impl Inner {
    fn actual_commit(&self) -> u64 {
        self.commit_index.min(self.highest_index)
    }
}

/// The append-only, segmented log for a single election term.
///
/// Owns the five watermarks (`start`, `commit`, `highest`, `contig`, `end`),
/// the segment set, the non-contiguous writer index, and the commit-waiter
/// queue. All index bookkeeping is mediated here; [`SegmentWriter`] and
/// [`SegmentReader`] hold only a pinned segment and their own cursor.
pub struct TermLog {
    base_path: PathBuf,
    term: u64,
    prev_term: AtomicU64,
    options: Options,
    worker: Arc<Worker>,
    inner: RwLock<Inner>,
    dirty: Mutex<VecDeque<Arc<Segment>>>,
    sync_latch: Mutex<()>,
    segment_cache: Mutex<LCache<Arc<Segment>>>,
    closed: AtomicBool,
    next_waiter_id: AtomicU64,
}

impl TermLog {
    /// Open (creating or recovering) the term log for `term` rooted at
    /// `base_path`.
    ///
    /// `start_index` of `None` asks recovery to adopt the lowest on-disk
    /// segment's start. `highest_index` is the caller's asserted high-water
    /// mark; on-disk segments must cover `[start_index, highest_index)`
    /// contiguously or this fails with [`Error::IncompleteSegment`].
    pub fn open(
        base_path: PathBuf,
        term: u64,
        prev_term: u64,
        start_index: Option<u64>,
        commit_index: u64,
        highest_index: u64,
        options: Options,
        worker: Arc<Worker>,
    ) -> Result<Arc<TermLog>> {
        let discovered = recovery::discover_segments(&base_path, term)?;
        let mut candidates = Vec::with_capacity(discovered.len());
        for (start, path) in discovered {
            let len = fs::metadata(&path)?.len();
            candidates.push((start, path, len));
        }
        candidates.sort_by_key(|(start, _, _)| *start);

        let start_index = match start_index {
            Some(s) => s,
            None => candidates.first().map(|(s, _, _)| *s).unwrap_or(0),
        };
        if start_index > highest_index {
            return Err(Error::IncompleteSegment { gap_start: highest_index, gap_end: start_index });
        }

        let (candidates, out_of_range): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|(start, _, len)| start + len > start_index && *start < highest_index);
        for (start, path, _) in out_of_range {
            debug!("segment {start} falls outside [{start_index}, {highest_index}), deleting");
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }

        let mut segments = SegmentSet::new();
        let mut cursor = start_index;
        for i in 0..candidates.len() {
            let (start, path, on_disk_len) = candidates[i].clone();
            if start > cursor {
                return Err(Error::IncompleteSegment { gap_start: cursor, gap_end: start });
            }
            let mut len = on_disk_len;
            if let Some((next_start, _, _)) = candidates.get(i + 1) {
                if start + len > *next_start {
                    debug!("segment {start} overlaps successor at {next_start}, shrinking");
                    len = next_start - start;
                }
            }
            len = len.min(highest_index.saturating_sub(start));
            let seg = Arc::new(Segment::new(path, start, len));
            if len < on_disk_len {
                // `Segment::new` was already given the shrunk length; physically
                // truncate the on-disk file to match it.
                seg.truncate()?;
            }
            seg.unpin();
            cursor = cursor.max(start + len);
            segments.insert(seg);
        }
        if cursor < highest_index {
            return Err(Error::IncompleteSegment { gap_start: cursor, gap_end: highest_index });
        }

        let segment_cache_capacity = options.segment_cache_capacity;
        Ok(Arc::new(TermLog {
            base_path,
            term,
            prev_term: AtomicU64::new(prev_term),
            options,
            worker,
            inner: RwLock::new(Inner {
                start_index,
                commit_index,
                highest_index,
                contig_index: cursor.min(highest_index),
                end_index: u64::MAX,
                segments,
                non_contig: BTreeMap::new(),
                commit_tasks: BinaryHeap::new(),
            }),
            dirty: Mutex::new(VecDeque::new()),
            sync_latch: Mutex::new(()),
            segment_cache: Mutex::new(LCache::new(segment_cache_capacity)),
            closed: AtomicBool::new(false),
            next_waiter_id: AtomicU64::new(0),
        }))
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn prev_term(&self) -> u64 {
        self.prev_term.load(Ordering::Acquire)
    }

    /// Implements the `defineTerm` consumer-contract operation (spec.md §6)
    /// at the level of a single term log: validates the caller's assertion
    /// about which term precedes this one.
    ///
    /// Returns `false` iff `asserted_prev_term` disagrees with the term's
    /// already-recorded previous term. Otherwise records the assertion (a
    /// no-op once it has already been recorded) and returns `true`.
    pub fn set_prev_term_assertion(&self, asserted_prev_term: u64) -> bool {
        loop {
            let current = self.prev_term.load(Ordering::Acquire);
            if current != NO_PREV_TERM {
                return current == asserted_prev_term;
            }
            if self
                .prev_term
                .compare_exchange(current, asserted_prev_term, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn start_index(&self) -> u64 {
        self.inner.read().unwrap().start_index
    }

    pub fn contig_index(&self) -> u64 {
        self.inner.read().unwrap().contig_index
    }

    pub fn end_index(&self) -> u64 {
        self.inner.read().unwrap().end_index
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Snapshot `term`, `highest_index`, and `actual_commit` under the
    /// shared latch.
    pub fn capture_highest(&self) -> Capture {
        let guard = self.inner.read().unwrap();
        Capture { term: self.term, highest_index: guard.highest_index, actual_commit: guard.actual_commit() }
    }

    /// Advance the commit watermark, clamped to `end_index`. Regressions are
    /// silently ignored. Wakes any commit waiters whose threshold is now met.
    pub fn commit(&self, new_commit_index: u64) {
        let ready = {
            let mut guard = self.inner.write().unwrap();
            let clamped = new_commit_index.min(guard.end_index);
            if clamped > guard.commit_index {
                guard.commit_index = clamped;
            }
            Self::drain_ready(&mut guard)
        };
        for (waiter, value) in ready {
            waiter.complete(value);
        }
    }

    /// Fix the term's end index. Must not be lower than `actual_commit`;
    /// must not raise an already-finished term's end. Idempotent if equal to
    /// the current value.
    pub fn finish_term(&self, end_index: u64) -> Result<()> {
        let (to_truncate, expired) = {
            let mut guard = self.inner.write().unwrap();
            let actual_commit = guard.actual_commit();
            if end_index < actual_commit {
                return Err(Error::IllegalTermBoundary { reason: "end_index below actual commit" });
            }
            if guard.end_index != u64::MAX {
                if end_index == guard.end_index {
                    return Ok(());
                }
                if end_index > guard.end_index {
                    return Err(Error::IllegalTermBoundary { reason: "end_index may not be raised once finished" });
                }
            }
            guard.end_index = end_index;
            guard.contig_index = guard.contig_index.min(end_index);
            guard.highest_index = guard.highest_index.min(end_index);
            guard.commit_index = guard.commit_index.min(end_index);

            let stale: Vec<u64> = guard
                .non_contig
                .range(end_index..)
                .map(|(start, _)| *start)
                .collect();
            for start in stale {
                guard.non_contig.remove(&start);
            }

            let to_truncate: Vec<Arc<Segment>> =
                guard.segments.iter().filter(|s| s.end_index() > end_index).cloned().collect();
            for seg in &to_truncate {
                seg.set_end_index(end_index);
                if seg.max_length() == 0 {
                    guard.segments.remove(seg.start_index);
                }
            }

            let mut expired = Vec::new();
            loop {
                match guard.commit_tasks.peek() {
                    Some(Reverse(entry)) if entry.threshold > end_index => {
                        let Reverse(entry) = guard.commit_tasks.pop().unwrap();
                        expired.push(entry.waiter);
                    }
                    _ => break,
                }
            }
            (to_truncate, expired)
        };

        for seg in to_truncate {
            self.worker.enqueue(move || {
                if let Err(e) = seg.truncate() {
                    warn!("truncate after finish_term failed: {e}");
                }
            });
        }
        for waiter in expired {
            waiter.complete(error::wait::TERM_END);
        }
        Ok(())
    }

    /// Report every gap in `[contig, expected)`, where `expected` is
    /// `end_index` if finite else `commit_index`. Returns the current
    /// `contig_index` so the caller can re-arm its snapshot.
    pub fn check_for_missing_data(&self, snapshot_contig: u64) -> (Vec<(u64, u64)>, u64) {
        let guard = self.inner.read().unwrap();
        if snapshot_contig != guard.contig_index {
            return (Vec::new(), guard.contig_index);
        }
        let expected = if guard.end_index != u64::MAX { guard.end_index } else { guard.commit_index };
        let mut gaps = Vec::new();
        let mut cursor = guard.contig_index;
        for (&start, w) in guard.non_contig.iter() {
            if start > cursor {
                gaps.push((cursor, start));
            }
            cursor = cursor.max(w.index);
        }
        if cursor < expected {
            gaps.push((cursor, expected));
        }
        (gaps, guard.contig_index)
    }

    pub(crate) fn write_finished(&self, writer_start: u64, new_index: u64, asserted_highest: u64) {
        let ready = {
            let mut guard = self.inner.write().unwrap();
            let end = guard.end_index;
            let new_index = new_index.min(end);
            let mut asserted_highest = asserted_highest.min(end);

            if writer_start <= guard.contig_index {
                guard.contig_index = guard.contig_index.max(new_index);
                loop {
                    let next = match guard.non_contig.iter().next() {
                        Some((&start, w)) if start <= guard.contig_index => Some((start, *w)),
                        _ => None,
                    };
                    match next {
                        Some((start, w)) => {
                            guard.non_contig.remove(&start);
                            guard.contig_index = guard.contig_index.max(w.index);
                            asserted_highest = asserted_highest.max(w.highest);
                        }
                        None => break,
                    }
                }
            } else {
                guard.non_contig.insert(writer_start, NonContigWriter { index: new_index, highest: asserted_highest });
            }

            let finished = guard.end_index != u64::MAX;
            let candidate = if finished { guard.contig_index } else { asserted_highest };
            if candidate > guard.highest_index && (finished || candidate <= guard.contig_index) {
                guard.highest_index = candidate;
            }

            Self::drain_ready(&mut guard)
        };
        for (waiter, value) in ready {
            waiter.complete(value);
        }
    }

    fn drain_ready(guard: &mut Inner) -> Vec<(Arc<Waiter>, i64)> {
        let mut out = Vec::new();
        loop {
            let actual_commit = guard.actual_commit();
            match guard.commit_tasks.peek() {
                Some(Reverse(entry)) if entry.threshold <= actual_commit => {
                    let Reverse(entry) = guard.commit_tasks.pop().unwrap();
                    out.push((entry.waiter, actual_commit as i64));
                }
                _ => break,
            }
        }
        out
    }

    /// Block the calling thread until the commit watermark reaches `index`.
    ///
    /// Returns the commit index reached, or one of the sentinels in
    /// [`crate::error::wait`].
    pub(crate) fn wait_for_commit(&self, index: u64, timeout: Option<Duration>) -> i64 {
        if self.closed.load(Ordering::Acquire) {
            return error::wait::CLOSED;
        }
        let waiter = {
            let mut guard = self.inner.write().unwrap();
            let actual_commit = guard.actual_commit();
            if index <= actual_commit {
                return actual_commit as i64;
            }
            if guard.end_index != u64::MAX && index > guard.end_index {
                return error::wait::TERM_END;
            }
            let waiter = Arc::new(Waiter::new(self.next_waiter_id.fetch_add(1, Ordering::Relaxed)));
            guard.commit_tasks.push(Reverse(CommitEntry { threshold: index, waiter: waiter.clone() }));
            waiter
        };
        waiter.wait(timeout)
    }

    /// Find (and pin) the segment to write index `index` into, allocating a
    /// new one if `index` has run past the end of the set.
    pub(crate) fn segment_for_writing(&self, index: u64) -> Result<Option<Arc<Segment>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let mut guard = self.inner.write().unwrap();
        if index >= guard.end_index {
            return Ok(None);
        }
        if let Some(seg) = guard.segments.floor(index).cloned() {
            if index < seg.end_index() {
                seg.pin();
                self.unshelve(&seg);
                return Ok(Some(seg));
            }
        }

        let prev_end = guard.segments.floor(index).map(|s| s.end_index()).unwrap_or(guard.start_index);
        let ordinal = guard.segments.len();
        let len = self.options.segment_len(ordinal);
        let mut start = prev_end;
        while index >= start.saturating_add(len) {
            start += len;
        }
        let mut len = len;
        if let Some(next) = guard.segments.ceiling(start) {
            len = len.min(next.start_index.saturating_sub(start));
        }
        if guard.end_index != u64::MAX {
            len = len.min(guard.end_index.saturating_sub(start));
        }
        if len == 0 || index >= start + len {
            return Ok(None);
        }
        let path = recovery::segment_path(&self.base_path, self.term, start);
        let seg = Arc::new(Segment::new(path, start, len));
        guard.segments.insert(seg.clone());
        Ok(Some(seg))
    }

    /// Find (and pin) the segment covering `index` for reading, if any.
    pub(crate) fn segment_for_reading(&self, index: u64) -> Option<Arc<Segment>> {
        let guard = self.inner.read().unwrap();
        let seg = guard.segments.floor(index)?.clone();
        let in_range = index < seg.end_index();
        drop(guard);
        if in_range {
            seg.pin();
            self.unshelve(&seg);
            Some(seg)
        } else {
            None
        }
    }

    fn unshelve(&self, seg: &Arc<Segment>) {
        self.segment_cache.lock().unwrap().remove(seg.start_index);
    }

    /// Release a pin on `seg`. If it becomes idle, it is cached in the
    /// segment LRU; evicting from that cache schedules a background close.
    pub(crate) fn release_segment(&self, seg: Arc<Segment>) {
        if seg.unpin() <= 0 {
            let victim = self.segment_cache.lock().unwrap().add(seg.start_index, seg);
            if let Some((_, victim)) = victim {
                self.worker.enqueue(move || victim.close());
            }
        }
    }

    /// Link `seg` into the dirty list, to be flushed on the next `sync`.
    pub(crate) fn mark_dirty(&self, seg: Arc<Segment>) {
        self.dirty.lock().unwrap().push_back(seg);
    }

    /// Flush every segment on the dirty list, FIFO. A sync failure re-marks
    /// the offending segment *and every segment still behind it in this
    /// batch* dirty, and returns the error; segments already flushed earlier
    /// in the batch stay clean.
    pub fn sync(&self) -> Result<()> {
        let _latch = self.sync_latch.lock().unwrap();
        let batch: VecDeque<Arc<Segment>> = {
            let mut dirty = self.dirty.lock().unwrap();
            dirty.drain(..).collect()
        };
        let mut batch = batch.into_iter();
        while let Some(seg) = batch.next() {
            if let Err(e) = seg.sync() {
                // Put this segment and every one still unsynced behind it
                // back on the dirty list so a later sync reattempts them all.
                let mut dirty = self.dirty.lock().unwrap();
                dirty.push_back(seg);
                dirty.extend(batch);
                return Err(Error::Io(e));
            }
        }
        Ok(())
    }

    /// Join the worker, close every segment, and wake all pending commit
    /// waiters with [`error::wait::CLOSED`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.worker.join();
        let expired = {
            let mut guard = self.inner.write().unwrap();
            for seg in guard.segments.iter() {
                seg.close();
            }
            std::mem::take(&mut guard.commit_tasks)
                .into_iter()
                .map(|Reverse(e)| e.waiter)
                .collect::<Vec<_>>()
        };
        for waiter in expired {
            waiter.complete(error::wait::CLOSED);
        }
    }

    pub fn open_writer(self: &Arc<Self>, start_index: u64) -> Result<SegmentWriter> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let (contig, end, prev_term) = {
            let guard = self.inner.read().unwrap();
            if start_index < guard.start_index {
                return Err(Error::InvalidIndex { index: start_index, start: guard.start_index });
            }
            (guard.contig_index, guard.end_index, self.prev_term())
        };
        if start_index > contig && start_index < end {
            let mut guard = self.inner.write().unwrap();
            guard
                .non_contig
                .entry(start_index)
                .or_insert(NonContigWriter { index: start_index, highest: start_index });
        }
        Ok(SegmentWriter::new(self.clone(), start_index, prev_term))
    }

    pub fn open_reader(self: &Arc<Self>, start_index: u64) -> Result<SegmentReader> {
        let guard = self.inner.read().unwrap();
        if start_index < guard.start_index {
            return Err(Error::InvalidIndex { index: start_index, start: guard.start_index });
        }
        drop(guard);
        Ok(SegmentReader::new(self.clone(), start_index, self.prev_term()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_log(dir: &std::path::Path) -> Arc<TermLog> {
        let worker = Arc::new(Worker::new(Duration::from_secs(1)));
        TermLog::open(dir.join("log"), 1, 0, Some(0), 0, 0, Options::default(), worker).unwrap()
    }

    #[test]
    fn linear_writer_then_commit() {
        let dir = tempdir().unwrap();
        let log = new_log(dir.path());
        let writer = log.open_writer(0).unwrap();
        writer.write(b"aaaa", 4).unwrap();
        writer.write(b"bbbb", 8).unwrap();

        let cap = log.capture_highest();
        assert_eq!(cap.highest_index, 8);
        assert_eq!(cap.actual_commit, 0);

        log.commit(8);
        assert_eq!(log.capture_highest().actual_commit, 8);

        let reader = log.open_reader(0).unwrap();
        let mut buf = [0u8; 8];
        let n = reader.read(&mut buf, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(n, 8);
        assert_eq!(&buf, b"aaaabbbb");
    }

    #[test]
    fn out_of_order_writers_merge_into_contig() {
        let dir = tempdir().unwrap();
        let log = new_log(dir.path());
        let w1 = log.open_writer(0).unwrap();
        let w2 = log.open_writer(4).unwrap();

        w2.write(b"yyyy", 8).unwrap();
        assert_eq!(log.contig_index(), 0);
        let (gaps, _) = log.check_for_missing_data(0);
        assert_eq!(gaps, vec![(0, 4)]);

        w1.write(b"xxxx", 8).unwrap();
        assert_eq!(log.contig_index(), 8);
        assert_eq!(log.capture_highest().highest_index, 8);

        log.commit(8);
        let reader = log.open_reader(0).unwrap();
        let mut buf = [0u8; 8];
        reader.read(&mut buf, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(&buf, b"xxxxyyyy");
    }

    #[test]
    fn finish_term_drops_pending_writer_and_fires_waiter() {
        let dir = tempdir().unwrap();
        let log = new_log(dir.path());
        let pending = log.open_writer(100).unwrap();

        log.finish_term(50).unwrap();
        let n = pending.write(b"z", 101).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn close_wakes_commit_waiters() {
        let dir = tempdir().unwrap();
        let log = new_log(dir.path());
        let log2 = log.clone();
        let handle = std::thread::spawn(move || log2.wait_for_commit(100, None));
        std::thread::sleep(Duration::from_millis(20));
        log.close();
        assert_eq!(handle.join().unwrap(), error::wait::CLOSED);
    }

    #[test]
    fn recovery_deletes_out_of_range_segments_and_truncates_overlap() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("log");

        // A segment entirely below start_index must be deleted outright.
        let stale_path = recovery::segment_path(&base, 1, 0);
        std::fs::write(&stale_path, vec![0u8; 10]).unwrap();

        // A segment that overlaps its successor must be shrunk and its file
        // physically truncated to match.
        let overlap_path = recovery::segment_path(&base, 1, 10);
        std::fs::write(&overlap_path, vec![0u8; 40]).unwrap();
        let next_path = recovery::segment_path(&base, 1, 30);
        std::fs::write(&next_path, vec![0u8; 20]).unwrap();

        let worker = Arc::new(Worker::new(Duration::from_secs(1)));
        let log = TermLog::open(base.clone(), 1, 0, Some(10), 0, 50, Options::default(), worker).unwrap();

        assert!(!stale_path.exists(), "segment below start_index must be deleted");
        assert_eq!(
            std::fs::metadata(&overlap_path).unwrap().len(),
            20,
            "overlapping segment's file must be truncated to abut its successor"
        );
        assert_eq!(log.start_index(), 10);
    }

    #[test]
    fn sync_batch_drains_cleanly_when_all_succeed() {
        let dir = tempdir().unwrap();
        let log = new_log(dir.path());
        let writer = log.open_writer(0).unwrap();
        writer.write(b"aaaa", 4).unwrap();
        assert!(log.sync().is_ok());
        assert!(log.dirty.lock().unwrap().is_empty());
    }

    #[test]
    fn set_prev_term_assertion_defines_then_locks_in() {
        let dir = tempdir().unwrap();
        let worker = Arc::new(Worker::new(Duration::from_secs(1)));
        let log = TermLog::open(dir.join("log"), 1, NO_PREV_TERM, Some(0), 0, 0, Options::default(), worker).unwrap();

        // First assertion defines the previously-unknown prev_term.
        assert!(log.set_prev_term_assertion(6));
        assert_eq!(log.prev_term(), 6);

        // A matching assertion keeps succeeding.
        assert!(log.set_prev_term_assertion(6));
        // A conflicting assertion is rejected and does not mutate the stored value.
        assert!(!log.set_prev_term_assertion(7));
        assert_eq!(log.prev_term(), 6);
    }

    #[test]
    fn set_prev_term_assertion_rejects_mismatch_when_already_known() {
        let dir = tempdir().unwrap();
        let log = new_log(dir.path()); // prev_term = 0, already defined.
        assert!(log.set_prev_term_assertion(0));
        assert!(!log.set_prev_term_assertion(99));
    }
}
