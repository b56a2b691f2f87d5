//! Device and queue backend traits.
//!
//! This module defines the device interface WITHOUT pulling in any
//! backend-specific dependencies. The allocator, staging ring and transfer
//! executor depend on these traits, not on implementations.
//!
//! Handles are opaque `u64` newtypes, the same representation Vulkan uses for
//! non-dispatchable objects.

use std::ptr::NonNull;

use thiserror::Error;

/// Errors reported by a device or queue backend call.
///
/// The core treats every variant as "the call did not succeed"; only the
/// out-of-memory variants feed the recovery-and-retry path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Device-local memory exhausted
    #[error("device out of memory")]
    OutOfDeviceMemory,
    /// Host memory exhausted
    #[error("host out of memory")]
    OutOfHostMemory,
    /// Memory could not be mapped
    #[error("memory map failed")]
    MemoryMapFailed,
    /// Handle unknown to the backend
    #[error("invalid handle")]
    InvalidHandle,
    /// Fence wait exceeded its timeout
    #[error("timeout waiting for fence")]
    Timeout,
    /// Device lost
    #[error("device lost")]
    DeviceLost,
    /// Backend-specific error (opaque)
    #[error("backend error: {0}")]
    Backend(String),
}

impl DeviceError {
    /// Whether this error reports memory exhaustion.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, DeviceError::OutOfDeviceMemory | DeviceError::OutOfHostMemory)
    }
}

macro_rules! raw_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);

        impl $name {
            /// The null handle.
            pub const NULL: Self = Self(0);

            /// Get the raw value.
            pub fn raw(&self) -> u64 {
                self.0
            }

            /// Whether this is the null handle.
            pub fn is_null(&self) -> bool {
                self.0 == 0
            }
        }
    };
}

raw_handle!(
    /// Opaque buffer handle
    RawBuffer
);
raw_handle!(
    /// Opaque device memory handle
    RawMemory
);
raw_handle!(
    /// Opaque image handle
    RawImage
);
raw_handle!(
    /// Opaque image view handle
    RawImageView
);
raw_handle!(
    /// Opaque command pool handle
    RawCommandPool
);
raw_handle!(
    /// Opaque command buffer handle
    RawCommandBuffer
);
raw_handle!(
    /// Opaque fence handle
    RawFence
);

/// Buffer usage flags (bit-compatible with `VkBufferUsageFlags`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferUsage {
    pub bits: u32,
}

impl BufferUsage {
    pub const TRANSFER_SRC: Self = Self { bits: 0x0001 };
    pub const TRANSFER_DST: Self = Self { bits: 0x0002 };
    pub const UNIFORM_TEXEL_BUFFER: Self = Self { bits: 0x0004 };
    pub const STORAGE_TEXEL_BUFFER: Self = Self { bits: 0x0008 };
    pub const UNIFORM_BUFFER: Self = Self { bits: 0x0010 };
    pub const STORAGE_BUFFER: Self = Self { bits: 0x0020 };
    pub const INDEX_BUFFER: Self = Self { bits: 0x0040 };
    pub const VERTEX_BUFFER: Self = Self { bits: 0x0080 };
    pub const INDIRECT_BUFFER: Self = Self { bits: 0x0100 };

    /// No usage bits.
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Whether all bits of `other` are set.
    pub const fn contains(&self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self { bits: self.bits | rhs.bits }
    }
}

/// Memory property flags (bit-compatible with `VkMemoryPropertyFlags`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemoryPropertyFlags {
    pub bits: u32,
}

impl MemoryPropertyFlags {
    pub const DEVICE_LOCAL: Self = Self { bits: 0x0001 };
    pub const HOST_VISIBLE: Self = Self { bits: 0x0002 };
    pub const HOST_COHERENT: Self = Self { bits: 0x0004 };
    pub const HOST_CACHED: Self = Self { bits: 0x0008 };
    pub const LAZILY_ALLOCATED: Self = Self { bits: 0x0010 };

    /// No property bits.
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Whether all bits of `other` are set.
    pub const fn contains(&self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }

    /// Host-visible and coherent: the usual properties for mapped buffers.
    pub const fn host_mapped() -> Self {
        Self {
            bits: Self::HOST_VISIBLE.bits | Self::HOST_COHERENT.bits,
        }
    }
}

impl std::ops::BitOr for MemoryPropertyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self { bits: self.bits | rhs.bits }
    }
}

/// One memory type exposed by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypeInfo {
    pub property_flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

/// One memory heap exposed by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: u64,
    pub device_local: bool,
}

/// Memory topology of a physical device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryProperties {
    pub memory_types: Vec<MemoryTypeInfo>,
    pub memory_heaps: Vec<MemoryHeap>,
}

/// Size, alignment and allowed memory types for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    /// Bit `i` set means memory type `i` may back the resource
    pub memory_type_bits: u32,
}

/// A single buffer-to-buffer copy region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Queue capability classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

/// Queue-family topology.
///
/// `has_dedicated_transfer` is true only when `transfer` names a family
/// distinct from `graphics`, i.e. copies can overlap rendering work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: Option<u32>,
    pub transfer: Option<u32>,
    pub has_dedicated_transfer: bool,
}

impl QueueFamilies {
    /// A device exposing only a graphics family.
    pub fn graphics_only(graphics: u32) -> Self {
        Self {
            graphics,
            compute: None,
            transfer: None,
            has_dedicated_transfer: false,
        }
    }

    /// A device with a dedicated transfer family.
    pub fn with_transfer(graphics: u32, compute: Option<u32>, transfer: u32) -> Self {
        Self {
            graphics,
            compute,
            transfer: Some(transfer),
            has_dedicated_transfer: transfer != graphics,
        }
    }

    /// Family index for a queue kind, falling back to graphics.
    pub fn family_for(&self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Graphics => self.graphics,
            QueueKind::Compute => self.compute.unwrap_or(self.graphics),
            QueueKind::Transfer => self.transfer.unwrap_or(self.graphics),
        }
    }
}

/// Device memory and resource creation.
///
/// This trait is object-safe for use with `Arc<dyn DeviceBackend>`.
pub trait DeviceBackend: Send + Sync {
    /// Memory types and heaps of the physical device.
    fn memory_properties(&self) -> MemoryProperties;

    /// Create an unbound buffer.
    fn create_buffer(&self, size: u64, usage: BufferUsage) -> Result<RawBuffer, DeviceError>;

    /// Destroy a buffer. Its memory must be freed separately.
    fn destroy_buffer(&self, buffer: RawBuffer);

    /// Memory requirements of an unbound buffer.
    fn buffer_memory_requirements(&self, buffer: RawBuffer) -> MemoryRequirements;

    /// Allocate a block of device memory from one memory type.
    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<RawMemory, DeviceError>;

    /// Free a block of device memory.
    fn free_memory(&self, memory: RawMemory);

    /// Bind memory to a buffer at `offset`.
    fn bind_buffer_memory(&self, buffer: RawBuffer, memory: RawMemory, offset: u64) -> Result<(), DeviceError>;

    /// Map `size` bytes of host-visible memory starting at `offset`.
    fn map_memory(&self, memory: RawMemory, offset: u64, size: u64) -> Result<NonNull<u8>, DeviceError>;

    /// Unmap previously mapped memory.
    fn unmap_memory(&self, memory: RawMemory);

    /// Destroy an image and its view.
    fn destroy_image(&self, image: RawImage, view: RawImageView);
}

/// Queue topology, command recording and fences.
pub trait QueueBackend: Send + Sync {
    /// Queue-family topology.
    fn queue_families(&self) -> QueueFamilies;

    /// Create a command pool for one-shot command buffers on `family`.
    fn create_command_pool(&self, family: u32) -> Result<RawCommandPool, DeviceError>;

    /// Destroy a command pool and every command buffer allocated from it.
    fn destroy_command_pool(&self, pool: RawCommandPool);

    /// Allocate a primary command buffer.
    fn allocate_command_buffer(&self, pool: RawCommandPool) -> Result<RawCommandBuffer, DeviceError>;

    /// Return a command buffer to its pool.
    fn free_command_buffer(&self, pool: RawCommandPool, command_buffer: RawCommandBuffer);

    /// Record a complete one-shot copy: begin, copy regions, end.
    fn record_copy(
        &self,
        command_buffer: RawCommandBuffer,
        src: RawBuffer,
        dst: RawBuffer,
        regions: &[BufferCopy],
    ) -> Result<(), DeviceError>;

    /// Create an unsignaled fence.
    fn create_fence(&self) -> Result<RawFence, DeviceError>;

    /// Destroy a fence.
    fn destroy_fence(&self, fence: RawFence);

    /// Submit a recorded command buffer to the first queue of `family`.
    fn submit(&self, family: u32, command_buffer: RawCommandBuffer, fence: RawFence) -> Result<(), DeviceError>;

    /// Non-blocking fence query: `true` once signaled.
    fn fence_status(&self, fence: RawFence) -> Result<bool, DeviceError>;

    /// Block until the fence signals or `timeout_ns` elapses.
    fn wait_for_fence(&self, fence: RawFence, timeout_ns: u64) -> Result<(), DeviceError>;

    /// Block until all submitted work completes.
    fn wait_idle(&self) -> Result<(), DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_contains() {
        let flags = MemoryPropertyFlags::host_mapped() | MemoryPropertyFlags::HOST_CACHED;
        assert!(flags.contains(MemoryPropertyFlags::HOST_VISIBLE));
        assert!(flags.contains(MemoryPropertyFlags::host_mapped()));
        assert!(!flags.contains(MemoryPropertyFlags::DEVICE_LOCAL));
        assert!(flags.contains(MemoryPropertyFlags::empty()));
    }

    #[test]
    fn test_queue_family_fallback() {
        let families = QueueFamilies::graphics_only(0);
        assert_eq!(families.family_for(QueueKind::Transfer), 0);
        assert!(!families.has_dedicated_transfer);

        let families = QueueFamilies::with_transfer(0, Some(1), 2);
        assert_eq!(families.family_for(QueueKind::Transfer), 2);
        assert_eq!(families.family_for(QueueKind::Compute), 1);
        assert!(families.has_dedicated_transfer);
    }

    #[test]
    fn test_out_of_memory_classification() {
        assert!(DeviceError::OutOfDeviceMemory.is_out_of_memory());
        assert!(DeviceError::OutOfHostMemory.is_out_of_memory());
        assert!(!DeviceError::MemoryMapFailed.is_out_of_memory());
    }
}
