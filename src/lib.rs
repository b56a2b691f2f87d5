//! # gpustage
//!
//! GPU resource management for real-time engines.
//!
//! ## Features
//!
//! - Memory-type selection with a three-tier fallback
//! - Memory-pressure tracking and one retry on device OOM
//! - A persistently mapped staging ring buffer with wrap and waste tracking
//! - GpuBuffers that accumulate data and upload it in one copy
//! - Direct or staged copies, synchronous or asynchronous, singly or batched
//! - A dedicated transfer queue when the device exposes one
//! - Optional Vulkan backend (`vulkan`) and Bevy integration (`bevy`)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gpustage::{BufferUsage, DummyDevice, ResourceConfig, ResourceCoordinator};
//!
//! let device = Arc::new(DummyDevice::new());
//! let mut gpu = ResourceCoordinator::new(device, ResourceConfig::default()).unwrap();
//!
//! let vertices = gpu.create_gpu_buffer(64 * 1024, BufferUsage::VERTEX_BUFFER, true).unwrap();
//!
//! // Game loop
//! gpu.add_data(vertices, &[0u8; 1024], 16).unwrap();
//! gpu.end_frame().unwrap();
//! ```

pub mod allocators;
pub mod api;
pub mod coordinator;
pub mod diagnostics;
pub mod gpu;
pub mod transfer;
pub mod util;

mod sync;

#[cfg(feature = "bevy")]
pub mod bevy;

// Re-export public API at crate root for convenience
pub use coordinator::ResourceCoordinator;
pub use api::buffer::GpuBuffer;
pub use api::config::ResourceConfig;
pub use api::error::{GpuError, StagingError, TransferError};
pub use api::handle::ResourceHandle;
pub use api::stats::{BufferStats, HeapBudget, MemoryStats, StagingStats, TransferStats};

// Allocation
pub use allocators::memory::{DeviceAllocation, MatchTier, MemoryAllocator, MemoryTypeSelection};
pub use allocators::registry::{BufferId, BufferRegistry};
pub use allocators::staging::{RingState, StagingRegion, StagingRingBuffer, StagingScope};

// Transfers
pub use transfer::{
    AsyncTransfer, CommandExecutor, QueueManager, StagingContext, TransferId, TransferOrchestrator, TransferRequest,
    TransferState,
};

// Device abstraction
pub use gpu::{
    BufferCopy, BufferUsage, DeviceBackend, DeviceError, DummyDevice, MemoryPropertyFlags, MemoryProperties,
    QueueBackend, QueueFamilies, QueueKind,
};

#[cfg(feature = "vulkan")]
pub use gpu::vulkan::VulkanDevice;

// Diagnostics
pub use diagnostics::{Diagnostic, DiagnosticKind};
pub use diagnostics::{
    GS101, GS102, GS103, GS104, GS105, GS201, GS202, GS203, GS204, GS301, GS302, GS303, GS304, GS901,
};
