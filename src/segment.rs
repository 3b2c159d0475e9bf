use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use log::{debug, warn};
use memmap2::MmapMut;
use scopeguard::defer;

/// Number of file handles kept open for a non-empty segment.
const WRITE_HANDLES: usize = 8;
/// Number of file handles kept open for an empty (not-yet-written) segment.
const IDLE_HANDLES: usize = 1;

/// One backing file holding the bounded index range
/// `[start_index, start_index + max_length)`.
///
/// A `Segment` is logically owned by the term log's `SegmentSet`; writers and
/// readers hold counted references via [`Segment::pin`]/[`Segment::unpin`].
pub struct Segment {
    pub start_index: u64,
    path: PathBuf,
    state: Mutex<SegmentState>,
    /// `> 0`: live pins. `<= 0`: idle, cacheable in the segment LRU.
    ref_count: AtomicI64,
    /// Guards the 0->1 transition used to link this segment into the term's
    /// dirty list at most once.
    dirty: AtomicBool,
}

struct SegmentState {
    max_length: u64,
    handles: Option<HandlePool>,
    mmap: Option<MmapMut>,
}

struct HandlePool {
    files: Vec<File>,
    next: usize,
}

impl HandlePool {
    fn open(path: &Path, count: usize, create: bool) -> io::Result<Self> {
        let mut files = Vec::with_capacity(count);
        for _ in 0..count {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .open(path)?;
            files.push(file);
        }
        Ok(Self { files, next: 0 })
    }

    fn any(&mut self) -> &mut File {
        let i = self.next;
        self.next = (self.next + 1) % self.files.len();
        &mut self.files[i]
    }
}

impl Segment {
    /// Construct a freshly-allocated segment, not yet backed by any file.
    ///
    /// The returned segment is pinned once, on behalf of the caller that is
    /// about to write to it.
    pub fn new(path: PathBuf, start_index: u64, max_length: u64) -> Self {
        Self {
            start_index,
            path,
            state: Mutex::new(SegmentState {
                max_length,
                handles: None,
                mmap: None,
            }),
            ref_count: AtomicI64::new(1),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_length(&self) -> u64 {
        self.state.lock().unwrap().max_length
    }

    pub fn end_index(&self) -> u64 {
        self.start_index + self.max_length()
    }

    /// Increment the reference count, returning the new value.
    pub fn pin(&self) -> i64 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the reference count, returning the new value. A value `<= 0`
    /// means the segment is now idle and eligible for the segment LRU.
    pub fn unpin(&self) -> i64 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write `buf` at the absolute index `abs_index`, clipping at
    /// `max_length`. Returns the number of bytes actually written (which may
    /// be short, including zero, if `abs_index` is at or past the segment's
    /// end) and whether this call caused the 0->1 dirty transition, in which
    /// case the caller must link the segment into the term's dirty list.
    pub fn write(&self, abs_index: u64, buf: &[u8]) -> io::Result<(usize, bool)> {
        if buf.is_empty() {
            return Ok((0, false));
        }
        let rel = abs_index.saturating_sub(self.start_index) as usize;
        let mut state = self.state.lock().unwrap();
        if rel as u64 >= state.max_length {
            return Ok((0, false));
        }
        let len = buf.len().min((state.max_length as usize) - rel);
        self.ensure_mapped(&mut state, true)?;
        let result = Self::write_mapped(&mut state, rel, &buf[..len]);
        let len = match result {
            Ok(()) => len,
            Err(e) => {
                // Retry once after reopening the handle pool/mapping, in case
                // this coincided with an external remap.
                warn!("write to segment {} failed, retrying after reopen: {e}", self.start_index);
                self.reopen(&mut state, true)?;
                Self::write_mapped(&mut state, rel, &buf[..len])?;
                len
            }
        };
        let became_dirty = !self.dirty.swap(true, Ordering::AcqRel);
        Ok((len, became_dirty))
    }

    fn write_mapped(state: &mut SegmentState, rel: usize, buf: &[u8]) -> io::Result<()> {
        let mmap = state
            .mmap
            .as_mut()
            .expect("ensure_mapped must be called before write_mapped");
        mmap[rel..rel + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    /// Read up to `buf.len()` bytes starting at `abs_index`. Never returns a
    /// partial read *within* the segment; a short read only happens because
    /// `abs_index + buf.len()` exceeds the segment's bounds.
    pub fn read(&self, abs_index: u64, buf: &mut [u8]) -> io::Result<usize> {
        let rel = abs_index.saturating_sub(self.start_index) as usize;
        let mut state = self.state.lock().unwrap();
        if rel as u64 >= state.max_length {
            return Ok(0);
        }
        let len = buf.len().min((state.max_length as usize) - rel);
        if len == 0 {
            return Ok(0);
        }
        self.ensure_mapped(&mut state, false)?;
        match Self::read_mapped(&state, rel, &mut buf[..len]) {
            Ok(()) => Ok(len),
            Err(e) => {
                warn!("read from segment {} failed, retrying after reopen: {e}", self.start_index);
                self.reopen(&mut state, false)?;
                Self::read_mapped(&state, rel, &mut buf[..len])?;
                Ok(len)
            }
        }
    }

    fn read_mapped(state: &SegmentState, rel: usize, buf: &mut [u8]) -> io::Result<()> {
        let mmap = state.mmap.as_ref().expect("ensure_mapped must be called before read_mapped");
        buf.copy_from_slice(&mmap[rel..rel + buf.len()]);
        Ok(())
    }

    /// Open the handle pool and mmap if not already present.
    fn ensure_mapped(&self, state: &mut SegmentState, for_write: bool) -> io::Result<()> {
        if state.mmap.is_some() {
            return Ok(());
        }
        self.reopen(state, for_write)
    }

    fn reopen(&self, state: &mut SegmentState, for_write: bool) -> io::Result<()> {
        let count = if for_write && state.max_length > 0 {
            WRITE_HANDLES
        } else {
            IDLE_HANDLES
        };
        let mut pool = HandlePool::open(&self.path, count, true)?;
        let file = pool.any();
        if file.metadata()?.len() < state.max_length {
            Self::preallocate(file, state.max_length)?;
        }
        let mmap = if state.max_length > 0 {
            Some(unsafe { MmapMut::map_mut(&*file)? })
        } else {
            None
        };
        state.handles = Some(pool);
        state.mmap = mmap;
        Ok(())
    }

    /// Grow `file` to `len` bytes. With the `fallocate` feature on unix this
    /// asks the filesystem to reserve the blocks up front rather than
    /// leaving a sparse file; otherwise it falls back to a plain truncate.
    #[cfg(all(unix, feature = "fallocate"))]
    fn preallocate(file: &File, len: u64) -> io::Result<()> {
        use nix::fcntl::{fallocate, FallocateFlags};
        use std::os::unix::io::AsFd;

        match fallocate(file.as_fd(), FallocateFlags::empty(), 0, len as i64) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::EOPNOTSUPP) => file.set_len(len),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    #[cfg(not(all(unix, feature = "fallocate")))]
    fn preallocate(file: &File, len: u64) -> io::Result<()> {
        file.set_len(len)
    }

    /// Lower `max_length` to `max(0, end_index - start_index)`. Never grows.
    /// Returns `true` if the file on disk needs to be shortened/deleted as a
    /// result (the caller should schedule a [`Segment::truncate`]).
    pub fn set_end_index(&self, end_index: u64) -> bool {
        let new_len = end_index.saturating_sub(self.start_index);
        let mut state = self.state.lock().unwrap();
        if new_len >= state.max_length {
            return false;
        }
        debug!("segment {}: shrinking max_length {} -> {new_len}", self.start_index, state.max_length);
        state.max_length = new_len;
        if let Some(mmap) = state.mmap.take() {
            drop(mmap);
        }
        true
    }

    /// Flush dirty pages to disk. Returns `Ok(true)` if the flag transitioned
    /// back 1->0 successfully (the segment is clean), `Ok(false)` if there was
    /// nothing to flush, `Err` if fsync failed (the dirty flag is restored so
    /// a later sync retries).
    pub fn sync(&self) -> io::Result<bool> {
        if self.dirty.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Ok(false);
        }
        self.pin();
        defer! { self.unpin(); }
        let result = (|| {
            let mut state = self.state.lock().unwrap();
            if let Some(mmap) = state.mmap.as_mut() {
                mmap.flush()?;
            }
            if let Some(pool) = state.handles.as_mut() {
                pool.any().sync_data()?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            // Restore the dirty flag; re-link into the dirty list if this is
            // itself a fresh 0->1 transition.
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(true)
    }

    /// Shrink (or delete, if `max_length` is now zero) the file on disk to
    /// match the current `max_length`. Idempotent.
    pub fn truncate(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.max_length == 0 {
            state.mmap = None;
            state.handles = None;
            return match std::fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            };
        }
        state.mmap = None;
        if state.handles.is_none() {
            state.handles = Some(HandlePool::open(&self.path, IDLE_HANDLES, true)?);
        }
        let max_length = state.max_length;
        state.handles.as_mut().unwrap().any().set_len(max_length)?;
        Ok(())
    }

    /// Drop the memory mapping but keep file handles open. Called
    /// speculatively when a still-referenced segment is evicted from the
    /// segment LRU.
    pub fn unmap(&self) {
        let mut state = self.state.lock().unwrap();
        state.mmap = None;
    }

    /// Fully close the segment: drop the mapping and all file handles.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.mmap = None;
        state.handles = None;
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("start_index", &self.start_index)
            .field("max_length", &self.max_length())
            .field("ref_count", &self.ref_count())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
