pub type Result<T, E = FileError> = std::result::Result<T, E>;

/// Error type returned by per-handle operations.
///
/// These are non-fatal: the blocked caller receives the error as the
/// operation's result instead of anything being raised on the event-loop
/// thread.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("no data")]
    /// The clamped request length was zero: the cursor (or the given offset)
    /// is at or past end-of-file. The cursor does not move.
    NoData,

    #[error("handle is not writable")]
    /// Write on a read-only handle.
    NotWritable,

    #[error("handle failed to open")]
    /// The underlying open did not succeed; the wrapper carries the
    /// persistent failed flag instead of having raised at construction.
    Failed,

    #[error("file is already cached")]
    /// `start_caching` was called while a cache already exists.
    AlreadyCached,

    #[error("invalid url: {0}")]
    /// The download URL did not parse; the only construction-time error.
    BadUrl(#[from] url::ParseError),

    #[error("event-loop thread is gone")]
    /// The event-loop thread shut down before the operation completed.
    LoopGone,

    #[error("{0}")]
    /// An IO error occurred.
    Io(#[from] std::io::Error),
}
