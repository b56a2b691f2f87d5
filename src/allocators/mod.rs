//! Memory and staging backends.
//!
//! **These are the only modules that touch mapped device memory.**

pub mod factory;
pub mod memory;
pub mod registry;
pub mod staging;
