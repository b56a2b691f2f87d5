//! GPU device abstraction
//!
//! The resource layer talks to the device only through the traits in
//! [`traits`]. Two implementations exist:
//!
//! - `dummy`: a software device for tests and benchmarks (always available)
//! - `vulkan`: via the `ash` crate (enable the `vulkan` feature)

// Always present for API stability: traits define the interface
pub mod traits;
pub use traits::{
    BufferCopy, BufferUsage, DeviceBackend, DeviceError, MemoryHeap, MemoryProperties, MemoryPropertyFlags,
    MemoryRequirements, MemoryTypeInfo, QueueBackend, QueueFamilies, QueueKind, RawBuffer, RawCommandBuffer,
    RawCommandPool, RawFence, RawImage, RawImageView, RawMemory,
};

// Dummy device for testing (always available)
pub mod dummy;
pub use dummy::DummyDevice;

#[cfg(feature = "vulkan")]
pub mod vulkan;
