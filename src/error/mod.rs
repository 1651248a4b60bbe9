//! Set of module Error
pub mod event_loop;
pub mod file;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Loop(#[from] event_loop::LoopError),
    #[error(transparent)]
    File(#[from] file::FileError),
}
