//! Public API for gpustage.
//!
//! Handles, GpuBuffers, configuration, errors and statistics. Most users
//! only touch these types and [`crate::ResourceCoordinator`].

pub mod buffer;
pub mod config;
pub mod error;
pub mod handle;
pub mod stats;
