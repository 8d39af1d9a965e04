use thiserror::Error;

/// Errors surfaced by the structures in this crate.
///
/// A failed compare-and-swap is never one of these: contention is retried internally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// `pop` on an empty stack.
    #[error("the structure is empty")]
    Empty,

    /// `remove_*`/`get_*` on an empty deque.
    #[error("no such element")]
    NoSuchElement,

    /// The operation is not offered by this structure.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A constructor or operation was given an argument outside its domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
