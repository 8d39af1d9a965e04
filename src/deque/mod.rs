//! Lock-free deques.
//!
//! - [`LockFreeDeque`] and [`EbDeque`]: Michael's anchor-based deque, without and with
//!   elimination backoff.
//! - [`HakanDeque`]: Sundell and Tsigas' doubly linked deque with cooperative helping.

mod anchor;
mod helping;

pub use anchor::{AnchorDeque, ContentionPolicy, EbDeque, Eliminate, LockFreeDeque, Node, Retry};
pub use helping::HakanDeque;

/// One end of a deque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    /// Front.
    Left,
    /// Back.
    Right,
}

impl End {
    /// The other end.
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}
