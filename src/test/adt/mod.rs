//! Drivers for [`ConcurrentMap`](crate::ConcurrentMap) and [`ConcurrentSet`](crate::ConcurrentSet).

pub mod map;
pub mod set;
