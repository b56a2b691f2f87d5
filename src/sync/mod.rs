//! Synchronization primitives.
//!
//! The staging and transfer paths are single-threaded and take `&mut self`.
//! These wrappers are only used where a backend or a guard must be shared.

pub(crate) mod atomics;
pub(crate) mod mutex;
