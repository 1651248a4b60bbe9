pub type Result<T, E = LoopError> = std::result::Result<T, E>;

/// Error type returned when starting or stopping the event-loop thread.
///
/// These happen before any asynchronous hand-off, so they are raised
/// synchronously to the calling thread.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("event-loop thread already running")]
    /// A loop is already running; only one may exist at a time.
    AlreadyRunning,

    #[error("event-loop thread isn't running")]
    /// Stop was requested but no loop is running.
    NotRunning,

    #[error("failed to spawn event-loop thread: {0}")]
    /// The OS refused to spawn the thread.
    Spawn(std::io::Error),

    #[error("failed to initialize event-loop runtime: {0}")]
    /// The runtime or the transfer engine could not be brought up; reported
    /// through the start barrier before the loop ever runs.
    Init(std::io::Error),
}
