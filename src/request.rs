//! Cross-thread request marshaling onto the event-loop thread.
//!
//! Every mutation of loop-owned state goes through this queue: a request is
//! a boxed closure taking the loop context, and sending it doubles as the
//! wakeup signal. The loop drains the whole queue before yielding back to
//! the reactor, so requests from one thread run in submission order.

use tokio::sync::{mpsc, oneshot};

use crate::error::file::FileError;
use crate::event_loop::LoopCtx;

/// A unit of work executed on the event-loop thread.
pub type Request = Box<dyn FnOnce(&mut LoopCtx) + Send + 'static>;

/// The channel the event-loop thread listens on for requests.
pub type Receiver = mpsc::UnboundedReceiver<Request>;

/// Clonable handle used to schedule work onto the event-loop thread.
#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<Request>,
}

impl RequestQueue {
    pub(crate) fn new() -> (Self, Receiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RequestQueue { tx }, rx)
    }

    /// Schedules `f` on the event-loop thread. Safe from any thread,
    /// including the loop thread itself.
    pub fn enqueue<F>(&self, f: F) -> Result<(), FileError>
    where
        F: FnOnce(&mut LoopCtx) + Send + 'static,
    {
        self.tx.send(Box::new(f)).map_err(|_| FileError::LoopGone)
    }
}

/// Creates a one-shot result channel bridging an asynchronous completion on
/// the event-loop thread to a blocked caller thread.
pub(crate) fn promise<T>() -> (Fulfil<T>, Promise<T>) {
    let (tx, rx) = oneshot::channel();
    (Fulfil { tx }, Promise { rx })
}

/// The completing side of a [`promise`]. Single use.
pub(crate) struct Fulfil<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Fulfil<T> {
    /// Publishes the result, waking the blocked caller. A caller that gave
    /// up waiting is fine; the value is simply dropped.
    pub fn set(self, value: T) {
        let _ = self.tx.send(value);
    }
}

/// The waiting side of a [`promise`].
pub(crate) struct Promise<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Promise<T> {
    /// Blocks the calling thread until the result is published.
    ///
    /// Must not be called from the event-loop thread: the completion it
    /// waits for runs there.
    pub fn wait(self) -> Result<T, FileError> {
        self.rx.blocking_recv().map_err(|_| FileError::LoopGone)
    }
}
