//! Non-blocking concurrent data structures.
//!
//! Every structure in this crate is lock-free: operations never block, and a failed
//! compare-and-swap always means some other thread made progress. Memory is reclaimed with
//! `crossbeam_epoch`.

#![warn(missing_docs, missing_debug_implementations)]
#![deny(unsafe_op_in_unsafe_fn)]

mod adt;
pub mod bst;
mod config;
pub mod deque;
pub mod dictionary;
mod elimination;
mod error;
pub mod list;
mod markable;
pub mod mcas;
mod stack;
#[doc(hidden)]
pub mod test;

pub use adt::{ConcurrentMap, ConcurrentSet};
pub use bst::Bst;
pub use config::{EliminationConfig, HashSetConfig, SkipListConfig};
pub use deque::{EbDeque, HakanDeque, LockFreeDeque};
pub use dictionary::LockFreeDictionary;
pub use elimination::EliminationArray;
pub use error::{Error, Result};
pub use list::{LockFreeList, LockFreeOrderedList, LockFreeSet};
pub use markable::MarkableRef;
pub use mcas::{mcas, McasCell, McasEntry, Small, Word};
pub use stack::EbStack;
