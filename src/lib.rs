//! Synchronous-looking file and HTTP download handles backed by a single
//! dedicated event-loop thread. All actual IO happens on that thread; every
//! other thread schedules work onto it and blocks on a one-shot result.

pub mod counter;
pub mod error;
pub mod event_loop;
pub mod request;
pub mod vfile;

mod cache;
mod transfer;

mod define;
pub use define::*;

pub use event_loop::{handle, start_thread, stop_thread, IoLoop};
pub use vfile::{Mode, VFile};
