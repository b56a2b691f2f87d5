//! Resource coordination
//!
//! One façade over the allocator, staging ring and transfer paths.

pub mod resource_coordinator;

pub use resource_coordinator::ResourceCoordinator;
