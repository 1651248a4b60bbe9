//! The public file handle wrapper: one open local file or one in-flight
//! download, with synchronous-looking operations that hand off to the
//! event-loop thread and block until the asynchronous result is ready.

mod test;

use std::{
    fs::{File, OpenOptions},
    io,
    io::SeekFrom,
    os::unix::fs::FileExt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;

use crate::{
    cache::Cache,
    counter::Counters,
    error::file::{FileError, Result},
    event_loop::IoLoop,
    request::{promise, RequestQueue},
    transfer::Completion,
};

/// Whether the wrapper may be written to. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
}

/// Invoked once on the event-loop thread when a download finishes (success
/// or not), with the wrapper and the effective URL after redirects.
///
/// Runs on the event-loop thread: it must not call blocking wrapper
/// operations, which would wait on that same thread.
pub type DownloadCallback = Box<dyn FnOnce(VFile, &str) + Send>;

/// State shared between the wrapper's clones, the event-loop thread and the
/// per-operation completions.
pub(crate) struct Inner {
    pub(crate) name: String,
    mode: Mode,
    queue: RequestQueue,
    counters: Arc<Counters>,
    /// Set by the open request on the event-loop thread; `None` before the
    /// open lands, after a failed open, after a close, and for downloads.
    handle: Mutex<Option<Arc<File>>>,
    size: AtomicU64,
    ptr_r: AtomicU64,
    ptr_w: AtomicU64,
    failed: AtomicBool,
    pub(crate) cache: Cache,
    download: bool,
    completed: AtomicBool,
    download_cb: Mutex<Option<DownloadCallback>>,
}

impl Inner {
    fn new(name: String, mode: Mode, io: &IoLoop, download: bool) -> Self {
        Inner {
            name,
            mode,
            queue: io.queue(),
            counters: io.counters(),
            handle: Mutex::new(None),
            size: AtomicU64::new(0),
            ptr_r: AtomicU64::new(0),
            ptr_w: AtomicU64::new(0),
            // a download is never marked failed; an open flips this once
            // the handle lands
            failed: AtomicBool::new(!download),
            cache: Cache::new(),
            download,
            completed: AtomicBool::new(false),
            download_cb: Mutex::new(None),
        }
    }

    fn handle(&self) -> Option<Arc<File>> {
        self.handle.lock().unwrap().clone()
    }

    /// Self-perpetuating chunk loop: read up to [`crate::CACHE_CHUNK_LEN`]
    /// bytes at the fill cursor, commit, repeat until the fill cursor
    /// reaches the size. Runs as a task on the event-loop thread.
    async fn run_cache_fill(self: Arc<Self>) {
        let Some(handle) = self.handle() else {
            self.cache.fail();
            return;
        };
        while let Some((offset, len)) = self.cache.next_chunk() {
            let chunk_handle = handle.clone();
            let read = tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; len];
                let n = chunk_handle.read_at(&mut buf, offset as u64)?;
                buf.truncate(n);
                Ok::<_, io::Error>(buf)
            })
            .await
            .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e)));

            match read {
                Ok(buf) if !buf.is_empty() => {
                    self.counters.add_read(buf.len() as u64);
                    self.cache.commit(offset, &buf);
                }
                Ok(_) => {
                    log::error!("cache fill of {:?} hit an unexpected end-of-file", self.name);
                    self.cache.fail();
                    return;
                }
                Err(e) => {
                    log::error!("cache fill of {:?} failed: {}", self.name, e);
                    self.cache.fail();
                    return;
                }
            }
        }
    }

    pub(crate) fn begin_download(&self, content_length: Option<u64>) {
        self.cache.begin_download(content_length.map(|n| n as usize));
    }

    pub(crate) fn append_download(&self, data: &[u8]) {
        let fill = self.cache.append(data);
        self.size.store(fill as u64, Ordering::Relaxed);
    }

    /// Runs on the event-loop thread when the engine reports the transfer
    /// finished. Fires the user callback uniformly on success and failure.
    pub(crate) fn download_done(self: &Arc<Self>, done: Completion) {
        self.completed.store(true, Ordering::Relaxed);
        match &done.result {
            Ok(()) => self.cache.finish(),
            Err(_) => self.cache.fail(),
        }
        let callback = self.download_cb.lock().unwrap().take();
        if let Some(callback) = callback {
            callback(VFile { inner: self.clone() }, &done.effective_url);
        }
        log::debug!(
            "download of {:?} finished ({})",
            self.name,
            if done.result.is_ok() { "ok" } else { "error" }
        );
    }
}

/// A local file or an HTTP(S) download behind a synchronous-looking
/// interface. Cheap to clone; clones share all state.
///
/// Operations enqueued by one thread run in submission order; concurrent
/// use of one wrapper from several threads needs external synchronization.
#[derive(Clone)]
pub struct VFile {
    inner: Arc<Inner>,
}

impl VFile {
    /// Opens an existing file read-only.
    pub fn open(io: &IoLoop, path: impl Into<String>) -> Self {
        let mut opts = OpenOptions::new();
        opts.read(true);
        Self::open_with(io, path.into(), Mode::ReadOnly, opts)
    }

    /// Opens the file read-write, creating it if missing.
    pub fn create(io: &IoLoop, path: impl Into<String>) -> Self {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        Self::open_with(io, path.into(), Mode::ReadWrite, opts)
    }

    /// Opens the file read-write, creating it or truncating any existing
    /// content.
    pub fn truncate(io: &IoLoop, path: impl Into<String>) -> Self {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(true);
        Self::open_with(io, path.into(), Mode::ReadWrite, opts)
    }

    /// Opens an existing file read-write.
    pub fn read_write(io: &IoLoop, path: impl Into<String>) -> Self {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        Self::open_with(io, path.into(), Mode::ReadWrite, opts)
    }

    /// Every open variant funnels here: enqueue the open and fstat onto the
    /// event-loop thread and block until a handle or a failure is known.
    /// Failure is never raised to the caller; the wrapper is left with the
    /// failed flag set, size 0 and cursors at 0.
    fn open_with(io: &IoLoop, path: String, mode: Mode, opts: OpenOptions) -> Self {
        let inner = Arc::new(Inner::new(path.clone(), mode, io, false));
        let (fulfil, pending) = promise();
        let open_inner = inner.clone();
        let enqueued = inner.queue.enqueue(move |ctx| {
            ctx.register(&open_inner);
            tokio::task::spawn_local(async move {
                let opened = tokio::task::spawn_blocking(move || {
                    let file = opts.open(&path)?;
                    let size = file.metadata()?.len();
                    Ok::<_, io::Error>((file, size))
                })
                .await
                .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e)));

                match opened {
                    Ok((file, size)) => {
                        *open_inner.handle.lock().unwrap() = Some(Arc::new(file));
                        open_inner.size.store(size, Ordering::Relaxed);
                        open_inner.failed.store(false, Ordering::Relaxed);
                    }
                    Err(e) => {
                        log::warn!("failed to open {:?}: {}", open_inner.name, e);
                    }
                }
                fulfil.set(());
            });
        });
        match enqueued {
            Ok(()) => {
                let _ = pending.wait();
            }
            Err(_) => log::warn!("event loop is gone, {:?} left failed", inner.name),
        }
        VFile { inner }
    }

    /// Starts an HTTP(S) download of `url`, returning immediately.
    ///
    /// The received body is retained in the wrapper's cache; once the
    /// transfer completes the cache is authoritative and reads are served
    /// from it. `callback` fires on the event-loop thread when the transfer
    /// finishes, success or not. Only URL parsing can fail here; connect
    /// and transfer failures surface through the callback, never as a
    /// constructor error.
    pub fn download(
        io: &IoLoop,
        url: impl AsRef<str>,
        callback: Option<DownloadCallback>,
    ) -> Result<Self> {
        let url = url::Url::parse(url.as_ref())?;
        let inner = Arc::new(Inner::new(url.to_string(), Mode::ReadOnly, io, true));
        *inner.download_cb.lock().unwrap() = callback;

        let transfer_inner = inner.clone();
        inner.queue.enqueue(move |ctx| {
            ctx.register(&transfer_inner);
            let id = ctx.multi.add(url, transfer_inner.clone());
            log::debug!("transfer {} started for {:?}", id, transfer_inner.name);
        })?;
        Ok(VFile { inner })
    }

    /// Source path or URL.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> u64 {
        self.inner.size.load(Ordering::Relaxed)
    }

    pub fn writable(&self) -> bool {
        self.inner.mode == Mode::ReadWrite
    }

    /// Whether the open did not succeed. Downloads never set this.
    pub fn failed(&self) -> bool {
        self.inner.failed.load(Ordering::Relaxed)
    }

    /// Whether a download has finished (successfully or not).
    pub fn download_complete(&self) -> bool {
        self.inner.download && self.inner.completed.load(Ordering::Relaxed)
    }

    /// Cache fill fraction in `[0.0, 1.0]`; 1.0 means reads are served from
    /// memory.
    pub fn cache_progress(&self) -> f32 {
        self.inner.cache.progress()
    }

    pub fn read_pos(&self) -> u64 {
        self.inner.ptr_r.load(Ordering::Relaxed)
    }

    pub fn write_pos(&self) -> u64 {
        self.inner.ptr_w.load(Ordering::Relaxed)
    }

    /// True iff the read cursor sits at end-of-file.
    pub fn eof(&self) -> bool {
        self.read_pos() == self.size()
    }

    /// Reads from the read cursor, advancing it by the bytes actually read.
    pub fn read(&self, dest: &mut [u8]) -> Result<usize> {
        let ptr = self.inner.ptr_r.load(Ordering::Relaxed);
        let n = self.read_at_inner(dest, ptr)?;
        self.inner.ptr_r.store(ptr + n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Positioned read; the read cursor is left untouched.
    pub fn read_at(&self, dest: &mut [u8], offset: u64) -> Result<usize> {
        self.read_at_inner(dest, offset)
    }

    fn read_at_inner(&self, dest: &mut [u8], offset: u64) -> Result<usize> {
        let size = self.size();
        let len = (size.saturating_sub(offset)).min(dest.len() as u64) as usize;
        if len == 0 {
            return Err(FileError::NoData);
        }

        // a fully populated cache serves the copy without a thread hop
        if self.inner.cache.complete() {
            if let Some(n) = self.inner.cache.copy_out(offset as usize, &mut dest[..len]) {
                return Ok(n);
            }
        }

        let handle = self.inner.handle().ok_or(FileError::Failed)?;
        let (fulfil, pending) = promise();
        let counters = self.inner.counters.clone();
        self.inner.queue.enqueue(move |_ctx| {
            tokio::task::spawn_local(async move {
                let read = tokio::task::spawn_blocking(move || {
                    let mut buf = vec![0u8; len];
                    let n = handle.read_at(&mut buf, offset)?;
                    buf.truncate(n);
                    Ok::<_, io::Error>(buf)
                })
                .await
                .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e)));

                if let Ok(buf) = &read {
                    counters.add_read(buf.len() as u64);
                }
                fulfil.set(read);
            });
        })?;

        let buf = pending.wait()??;
        dest[..buf.len()].copy_from_slice(&buf);
        Ok(buf.len())
    }

    /// Writes at the write cursor. The cursor advances by the full length
    /// immediately; the durable write completes asynchronously.
    pub fn write(&self, src: &[u8]) -> Result<usize> {
        self.write_bytes(Bytes::copy_from_slice(src))
    }

    /// Take-ownership variant of [`VFile::write`]: the buffer is handed to
    /// the durable write without copying.
    pub fn write_bytes(&self, src: Bytes) -> Result<usize> {
        let ptr = self.inner.ptr_w.load(Ordering::Relaxed);
        let len = src.len();
        self.write_at_inner(src, ptr)?;
        self.inner
            .ptr_w
            .store(ptr + len as u64, Ordering::Relaxed);
        Ok(len)
    }

    /// Positioned write; the write cursor is left untouched.
    pub fn write_at(&self, src: &[u8], offset: u64) -> Result<usize> {
        self.write_bytes_at(Bytes::copy_from_slice(src), offset)
    }

    /// Take-ownership variant of [`VFile::write_at`].
    pub fn write_bytes_at(&self, src: Bytes, offset: u64) -> Result<usize> {
        let len = src.len();
        self.write_at_inner(src, offset)?;
        Ok(len)
    }

    fn write_at_inner(&self, src: Bytes, offset: u64) -> Result<()> {
        if !self.writable() {
            return Err(FileError::NotWritable);
        }
        if self.failed() {
            return Err(FileError::Failed);
        }

        if self.inner.cache.active() {
            // an in-flight fill must land before the cache is patched
            self.inner.cache.wait_complete();
            if self.inner.cache.patch(offset as usize, &src) {
                let end = offset + src.len() as u64;
                if end > self.size() {
                    self.inner.size.store(end, Ordering::Relaxed);
                }
            }
        }

        let Some(handle) = self.inner.handle() else {
            // fire-and-forget semantics: a handle closed under us drops the
            // durable write, like the original completion would have
            log::warn!("dropping write to closed handle {:?}", self.inner.name);
            return Ok(());
        };
        let counters = self.inner.counters.clone();
        let name = self.inner.name.clone();
        self.inner.queue.enqueue(move |_ctx| {
            tokio::task::spawn_local(async move {
                let len = src.len() as u64;
                let written =
                    tokio::task::spawn_blocking(move || handle.write_all_at(&src, offset))
                        .await
                        .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e)));
                match written {
                    Ok(()) => counters.add_written(len),
                    Err(e) => log::warn!("write to {:?} at {} failed: {}", name, offset, e),
                }
            });
        })?;
        Ok(())
    }

    /// Moves the read cursor, clamping it into `[0, size]`. Returns the new
    /// cursor.
    pub fn rseek(&self, pos: SeekFrom) -> u64 {
        let size = self.size();
        let cur = self.read_pos();
        let target = seek_target(pos, cur, size).clamp(0, size as i128) as u64;
        self.inner.ptr_r.store(target, Ordering::Relaxed);
        target
    }

    /// Moves the write cursor, clamping it non-negative only: writes may
    /// extend past end-of-file, growing the file. Returns the new cursor.
    pub fn wseek(&self, pos: SeekFrom) -> u64 {
        let size = self.size();
        let cur = self.write_pos();
        let target = seek_target(pos, cur, size).clamp(0, u64::MAX as i128) as u64;
        self.inner.ptr_w.store(target, Ordering::Relaxed);
        target
    }

    /// Starts the opportunistic background fill of the whole file into
    /// memory. No-op on a wrapper that failed to open; fails if a cache
    /// already exists.
    pub fn start_caching(&self) -> Result<()> {
        if self.failed() {
            return Ok(());
        }
        let size = self.size();
        if !self.inner.cache.activate(size as usize) {
            return Err(FileError::AlreadyCached);
        }
        let fill_inner = self.inner.clone();
        let enqueued = self.inner.queue.enqueue(move |_ctx| {
            tokio::task::spawn_local(fill_inner.run_cache_fill());
        });
        if let Err(e) = enqueued {
            // nobody will ever fill it; release waiters instead of hanging
            self.inner.cache.fail();
            return Err(e);
        }
        Ok(())
    }

    /// Closes the wrapper: a cache fill still in progress is short-circuited
    /// and waited for, the cache buffer is released, and the underlying
    /// handle is closed asynchronously on the event-loop thread.
    pub fn close(&self) {
        if self.inner.cache.active() && !self.inner.cache.complete() {
            let cache_inner = self.inner.clone();
            let enqueued = self
                .inner
                .queue
                .enqueue(move |_ctx| cache_inner.cache.finish_now());
            if enqueued.is_ok() {
                self.inner.cache.wait_complete();
            }
        }
        self.inner.cache.release();

        let handle = self.inner.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let name = self.inner.name.clone();
            let _ = self.inner.queue.enqueue(move |_ctx| {
                tokio::task::spawn_local(async move {
                    // the fd closes when the last clone drops; in-flight
                    // operations keep theirs until they finish
                    let _ = tokio::task::spawn_blocking(move || drop(handle)).await;
                    log::trace!("closed {:?}", name);
                });
            });
        }
    }
}

/// Absolute seek target for the classic three seek modes, before clamping.
fn seek_target(pos: SeekFrom, cur: u64, size: u64) -> i128 {
    match pos {
        SeekFrom::Start(p) => p as i128,
        SeekFrom::End(d) => size as i128 + d as i128,
        SeekFrom::Current(d) => cur as i128 + d as i128,
    }
}
