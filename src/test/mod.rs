//! Randomized drivers shared by the unit tests and the integration tests.
#![doc(hidden)]

pub mod adt;
mod keys;
pub mod linear;

pub use keys::{owner, RandKey};
