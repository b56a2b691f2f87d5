//! Vulkan backend
//!
//! Implements [`DeviceBackend`](crate::gpu::DeviceBackend) and
//! [`QueueBackend`](crate::gpu::QueueBackend) on top of an `ash::Device`
//! owned by the application.

pub mod device;

pub use device::{select_queue_families, VulkanDevice};
