//! The dedicated event-loop thread: sole owner of file handles, transfers
//! and timers. Everything else reaches it through the request queue.

use std::{
    io,
    sync::{mpsc as std_mpsc, Arc, Mutex, Weak},
    thread,
};

use once_cell::sync::Lazy;
use tokio::task::LocalSet;

use crate::{
    counter::Counters,
    error::event_loop::{LoopError, Result},
    error::file,
    request::{promise, Receiver, RequestQueue},
    transfer::{Completion, Multi},
    vfile::Inner,
    TICK,
};

/// State owned by the event-loop thread. Requests receive a mutable
/// reference to it; that is the only way to touch it from outside.
pub struct LoopCtx {
    pub(crate) queue: RequestQueue,
    pub(crate) counters: Arc<Counters>,
    pub(crate) multi: Multi,
    /// Every wrapper ever opened on this loop, pruned as they die. Appended
    /// to inside open requests, so only this thread touches it.
    files: Vec<Weak<Inner>>,
    shutdown: bool,
}

impl LoopCtx {
    /// Queue handle for requests that need to schedule follow-up work onto
    /// the loop they are already running on.
    pub fn queue(&self) -> RequestQueue {
        self.queue.clone()
    }

    /// Records a live wrapper.
    pub(crate) fn register(&mut self, file: &Arc<Inner>) {
        self.files.retain(|f| f.strong_count() > 0);
        self.files.push(Arc::downgrade(file));
    }

    fn live_files(&mut self) -> Vec<String> {
        self.files.retain(|f| f.strong_count() > 0);
        self.files
            .iter()
            .filter_map(Weak::upgrade)
            .map(|f| f.name.clone())
            .collect()
    }

    fn finish_transfer(&mut self, done: Completion) {
        match self.multi.remove(done.id) {
            Some(file) => file.download_done(done),
            // the engine must never report a transfer it wasn't handed
            None => log::error!("completion for unknown transfer {}", done.id),
        }
    }
}

/// Handle to one event-loop thread. Cheap to clone; clones share the loop.
#[derive(Clone)]
pub struct IoLoop {
    shared: Arc<Shared>,
}

struct Shared {
    queue: RequestQueue,
    counters: Arc<Counters>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl IoLoop {
    /// Spawns a new event-loop thread, blocking until its runtime and
    /// transfer engine are fully initialized: once this returns, enqueueing
    /// is safe.
    pub fn spawn() -> Result<Self> {
        let (queue, rx) = RequestQueue::new();
        let counters = Arc::new(Counters::new());
        let (barrier_tx, barrier_rx) = std_mpsc::sync_channel(1);

        let thread_queue = queue.clone();
        let thread_counters = counters.clone();
        let handle = thread::Builder::new()
            .name("vfile-loop".into())
            .spawn(move || run_loop(thread_queue, rx, thread_counters, barrier_tx))
            .map_err(LoopError::Spawn)?;

        match barrier_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(LoopError::Init(e));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(LoopError::Init(io::Error::new(
                    io::ErrorKind::Other,
                    "event-loop thread died during startup",
                )));
            }
        }

        Ok(IoLoop {
            shared: Arc::new(Shared {
                queue,
                counters,
                thread: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Stops the loop: enqueues a shutdown request, then joins the thread.
    pub fn shutdown(&self) -> Result<()> {
        let handle = self
            .shared
            .thread
            .lock()
            .unwrap()
            .take()
            .ok_or(LoopError::NotRunning)?;
        let _ = self.shared.queue.enqueue(|ctx| ctx.shutdown = true);
        if handle.join().is_err() {
            log::error!("event-loop thread panicked");
        }
        Ok(())
    }

    pub(crate) fn queue(&self) -> RequestQueue {
        self.shared.queue.clone()
    }

    pub(crate) fn counters(&self) -> Arc<Counters> {
        self.shared.counters.clone()
    }

    /// Names of every wrapper still alive on this loop.
    pub fn live_files(&self) -> file::Result<Vec<String>> {
        let (fulfil, promise) = promise();
        self.shared
            .queue
            .enqueue(move |ctx| fulfil.set(ctx.live_files()))?;
        promise.wait()
    }

    pub fn read_total(&self) -> u64 {
        self.shared.counters.read_total()
    }

    pub fn written_total(&self) -> u64 {
        self.shared.counters.written_total()
    }

    /// Bytes read during the last tick; an approximate throughput.
    pub fn read_last_tick(&self) -> u64 {
        self.shared.counters.read_last_tick()
    }

    /// Bytes written during the last tick; an approximate throughput.
    pub fn written_last_tick(&self) -> u64 {
        self.shared.counters.written_last_tick()
    }
}

static GLOBAL: Lazy<Mutex<Option<IoLoop>>> = Lazy::new(|| Mutex::new(None));

/// Starts the process-wide event-loop thread. Fails if it is already
/// running.
pub fn start_thread() -> Result<()> {
    let mut slot = GLOBAL.lock().unwrap();
    if slot.is_some() {
        return Err(LoopError::AlreadyRunning);
    }
    *slot = Some(IoLoop::spawn()?);
    Ok(())
}

/// Stops the process-wide event-loop thread and joins it. Fails if it is
/// not running.
pub fn stop_thread() -> Result<()> {
    let io = GLOBAL
        .lock()
        .unwrap()
        .take()
        .ok_or(LoopError::NotRunning)?;
    io.shutdown()
}

/// Handle to the process-wide loop, if running.
pub fn handle() -> Option<IoLoop> {
    GLOBAL.lock().unwrap().clone()
}

fn run_loop(
    queue: RequestQueue,
    mut rx: Receiver,
    counters: Arc<Counters>,
    barrier: std_mpsc::SyncSender<io::Result<()>>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = barrier.send(Err(e));
            return;
        }
    };

    let local = LocalSet::new();
    local.block_on(&rt, async move {
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        let multi = match Multi::new(done_tx) {
            Ok(multi) => multi,
            Err(e) => {
                let _ = barrier.send(Err(io::Error::new(io::ErrorKind::Other, e)));
                return;
            }
        };
        let mut ctx = LoopCtx {
            queue,
            counters,
            multi,
            files: Vec::new(),
            shutdown: false,
        };

        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // an interval's first tick completes immediately; swallow it so the
        // first real resample happens one full tick in
        tick.tick().await;

        let _ = barrier.send(Ok(()));
        log::info!("event-loop thread started");

        loop {
            tokio::select! {
                req = rx.recv() => match req {
                    Some(req) => {
                        req(&mut ctx);
                        // drain the whole queue before yielding back
                        while let Ok(req) = rx.try_recv() {
                            req(&mut ctx);
                        }
                    }
                    None => break,
                },
                done = done_rx.recv() => match done {
                    Some(done) => ctx.finish_transfer(done),
                    None => break,
                },
                _ = tick.tick() => ctx.counters.tick(),
            }
            // flush completions that queued up behind socket activity
            while let Ok(done) = done_rx.try_recv() {
                ctx.finish_transfer(done);
            }
            if ctx.shutdown {
                break;
            }
        }

        ctx.multi.abort_all();
        log::info!("event-loop thread stopping");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_and_shutdown_roundtrip() {
        let io = IoLoop::spawn().unwrap();
        assert!(io.live_files().unwrap().is_empty());
        io.shutdown().unwrap();
    }

    #[test]
    fn second_shutdown_fails() {
        let io = IoLoop::spawn().unwrap();
        io.shutdown().unwrap();
        assert!(matches!(io.shutdown(), Err(LoopError::NotRunning)));
    }

    #[test]
    fn enqueue_after_shutdown_reports_gone() {
        let io = IoLoop::spawn().unwrap();
        io.shutdown().unwrap();
        assert!(matches!(
            io.live_files(),
            Err(crate::error::file::FileError::LoopGone)
        ));
    }

    #[test]
    fn requests_run_in_submission_order() {
        let io = IoLoop::spawn().unwrap();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..16 {
            let tx = tx.clone();
            io.queue()
                .enqueue(move |_ctx| {
                    let _ = tx.send(i);
                })
                .unwrap();
        }
        let seen: Vec<i32> = rx.iter().take(16).collect();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
        io.shutdown().unwrap();
    }

    // The global lifecycle shares one slot per process, so it gets exactly
    // one test.
    #[test]
    fn global_start_twice_and_stop_twice_fail() {
        start_thread().unwrap();
        assert!(matches!(start_thread(), Err(LoopError::AlreadyRunning)));
        assert!(handle().is_some());
        stop_thread().unwrap();
        assert!(matches!(stop_thread(), Err(LoopError::NotRunning)));
        assert!(handle().is_none());
    }
}
