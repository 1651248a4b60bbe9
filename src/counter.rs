//! Running byte counters with a periodically resampled per-tick rate.

use std::sync::atomic::{AtomicU64, Ordering};

/// Byte counters shared between the event-loop thread and its observers.
///
/// The totals are only added to by completions running on the event-loop
/// side; the last-tick deltas are resampled by the tick timer and may be
/// read from any thread without locking.
#[derive(Debug, Default)]
pub struct Counters {
    read_total: AtomicU64,
    written_total: AtomicU64,
    read_since_tick: AtomicU64,
    written_since_tick: AtomicU64,
    read_last_tick: AtomicU64,
    written_last_tick: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_read(&self, n: u64) {
        self.read_total.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_written(&self, n: u64) {
        self.written_total.fetch_add(n, Ordering::Relaxed);
    }

    /// Total bytes read from disk since the loop started.
    pub fn read_total(&self) -> u64 {
        self.read_total.load(Ordering::Relaxed)
    }

    /// Total bytes written to disk since the loop started.
    pub fn written_total(&self) -> u64 {
        self.written_total.load(Ordering::Relaxed)
    }

    /// Bytes read during the last full tick; an approximate rate.
    pub fn read_last_tick(&self) -> u64 {
        self.read_last_tick.load(Ordering::Relaxed)
    }

    /// Bytes written during the last full tick; an approximate rate.
    pub fn written_last_tick(&self) -> u64 {
        self.written_last_tick.load(Ordering::Relaxed)
    }

    /// Resamples the per-tick deltas from the running totals. Driven by the
    /// tick timer on the event-loop thread.
    pub(crate) fn tick(&self) {
        let read = self.read_total.load(Ordering::Relaxed);
        let written = self.written_total.load(Ordering::Relaxed);
        let read_snap = self.read_since_tick.swap(read, Ordering::Relaxed);
        let written_snap = self.written_since_tick.swap(written, Ordering::Relaxed);
        self.read_last_tick.store(read - read_snap, Ordering::Relaxed);
        self.written_last_tick
            .store(written - written_snap, Ordering::Relaxed);
    }
}
