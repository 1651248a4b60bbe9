//! Opportunistic whole-file cache.
//!
//! A background fill reads the file in bounded chunks into a memory buffer;
//! once the progress fraction reaches 1.0 the buffer is authoritative and
//! reads are served from it without an asynchronous round-trip. Downloads
//! reuse the same buffer, appending body chunks as they arrive.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Condvar, Mutex,
};

use crate::CACHE_CHUNK_LEN;

#[derive(Default)]
struct State {
    /// `Some` once a fill has been claimed; `None` again after `release`.
    buf: Option<Vec<u8>>,
    /// Bytes of `buf` filled so far. Never exceeds `buf.len()`.
    fill: usize,
    /// Download content length, when the origin reported one.
    expected: Option<usize>,
    complete: bool,
    failed: bool,
}

/// Fill state shared between the event-loop thread and caller threads
/// blocked on completion.
pub(crate) struct Cache {
    state: Mutex<State>,
    done: Condvar,
    /// Progress fraction in `[0.0, 1.0]`, stored as `f32` bits. Monotonically
    /// non-decreasing; frozen once it reaches 1.0.
    progress: AtomicU32,
    active: AtomicBool,
}

impl Cache {
    pub fn new() -> Self {
        Cache {
            state: Mutex::new(State::default()),
            done: Condvar::new(),
            progress: AtomicU32::new(0.0f32.to_bits()),
            active: AtomicBool::new(false),
        }
    }

    /// Whether a fill has been claimed.
    pub fn active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Relaxed))
    }

    /// True once the buffer is authoritative.
    pub fn complete(&self) -> bool {
        self.progress() == 1.0
    }

    /// Claims the cache for a fill of exactly `size` bytes. Returns false
    /// if a cache already exists.
    pub fn activate(&self, size: usize) -> bool {
        let mut st = self.state.lock().unwrap();
        if self.active.swap(true, Ordering::Relaxed) {
            return false;
        }
        st.buf = Some(vec![0u8; size]);
        st.fill = 0;
        true
    }

    /// Next chunk the fill should read, or `None` when the fill is over.
    /// Reaching the end of the buffer pins progress to 1.0 and wakes any
    /// completion waiter.
    pub fn next_chunk(&self) -> Option<(usize, usize)> {
        let mut st = self.state.lock().unwrap();
        if st.failed || st.complete {
            return None;
        }
        let len = st.buf.as_ref().map_or(0, Vec::len);
        if st.fill >= len {
            self.finish_locked(&mut st);
            return None;
        }
        Some((st.fill, (len - st.fill).min(CACHE_CHUNK_LEN)))
    }

    /// Lands one chunk at `offset`, advancing the fill cursor and the
    /// progress fraction.
    pub fn commit(&self, offset: usize, data: &[u8]) {
        let mut st = self.state.lock().unwrap();
        if st.complete || st.failed {
            return;
        }
        let Some(buf) = st.buf.as_mut() else { return };
        if offset >= buf.len() {
            return;
        }
        let end = (offset + data.len()).min(buf.len());
        buf[offset..end].copy_from_slice(&data[..end - offset]);
        let len = buf.len();
        st.fill = st.fill.max(end);
        if st.fill < len {
            self.bump_progress(st.fill as f32 / len as f32);
        }
    }

    /// Forces the fill to its end. `close()` uses this on the event-loop
    /// thread to short-circuit the remaining chunks.
    pub fn finish_now(&self) {
        let mut st = self.state.lock().unwrap();
        if !self.active() || st.complete || st.failed {
            return;
        }
        st.fill = st.buf.as_ref().map_or(0, Vec::len);
        self.finish_locked(&mut st);
    }

    /// Marks the fill as failed and releases any completion waiter. No
    /// retry: the subsystem stays dead for this wrapper and reads keep
    /// taking the uncached path, since progress never reaches 1.0.
    pub fn fail(&self) {
        let mut st = self.state.lock().unwrap();
        if st.complete || st.failed {
            return;
        }
        st.failed = true;
        self.done.notify_all();
    }

    /// Blocks until the fill completes or fails.
    pub fn wait_complete(&self) {
        let mut st = self.state.lock().unwrap();
        while !st.complete && !st.failed {
            st = self.done.wait(st).unwrap();
        }
    }

    /// Copies `dest.len()` bytes at `offset` out of the buffer. `None` once
    /// the buffer has been released (or was never claimed), in which case
    /// the caller falls back to the asynchronous path.
    pub fn copy_out(&self, offset: usize, dest: &mut [u8]) -> Option<usize> {
        let st = self.state.lock().unwrap();
        let buf = st.buf.as_ref()?;
        if offset + dest.len() > buf.len() {
            return None;
        }
        dest.copy_from_slice(&buf[offset..offset + dest.len()]);
        Some(dest.len())
    }

    /// Write path: lays `data` into the buffer, growing it for writes past
    /// the current end. Returns false once the buffer has been released.
    pub fn patch(&self, offset: usize, data: &[u8]) -> bool {
        let mut st = self.state.lock().unwrap();
        let Some(buf) = st.buf.as_mut() else {
            return false;
        };
        let end = offset + data.len();
        if end > buf.len() {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
        true
    }

    /// Drops the buffer after a close. Progress stays pinned; reads notice
    /// the missing buffer and go back to the asynchronous path.
    pub fn release(&self) {
        let mut st = self.state.lock().unwrap();
        st.buf = None;
        st.fill = 0;
    }

    /// Claims the cache for a streaming download of unknown final length.
    pub fn begin_download(&self, expected: Option<usize>) {
        let mut st = self.state.lock().unwrap();
        self.active.store(true, Ordering::Relaxed);
        st.buf = Some(Vec::new());
        st.fill = 0;
        st.expected = expected;
    }

    /// Appends one body chunk, returning the new fill cursor.
    pub fn append(&self, data: &[u8]) -> usize {
        let mut st = self.state.lock().unwrap();
        if st.complete || st.failed {
            return st.fill;
        }
        let expected = st.expected;
        let Some(buf) = st.buf.as_mut() else {
            return 0;
        };
        buf.extend_from_slice(data);
        let fill = buf.len();
        st.fill = fill;
        if let Some(total) = expected.filter(|t| *t > 0) {
            self.bump_progress(fill as f32 / total as f32);
        }
        fill
    }

    /// Pins progress to 1.0; used when a download's body is fully received.
    pub fn finish(&self) {
        let mut st = self.state.lock().unwrap();
        if st.complete {
            return;
        }
        self.finish_locked(&mut st);
    }

    fn finish_locked(&self, st: &mut State) {
        st.complete = true;
        self.progress.store(1.0f32.to_bits(), Ordering::Relaxed);
        self.done.notify_all();
    }

    /// Ratchets the progress fraction upward, never letting rounding reach
    /// 1.0 before the fill actually does. Non-negative f32 bit patterns
    /// order like their values, so a fetch_max on the bits suffices.
    fn bump_progress(&self, fraction: f32) {
        let fraction = fraction.min(0.999_999);
        self.progress
            .fetch_max(fraction.to_bits(), Ordering::Relaxed);
    }
}
