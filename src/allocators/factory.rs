//! Buffer creation and destruction.
//!
//! Create buffer, query requirements, allocate, bind. Every failure undoes
//! the steps already taken.

use crate::allocators::memory::MemoryAllocator;
use crate::api::error::GpuError;
use crate::api::handle::ResourceHandle;
use crate::gpu::{BufferUsage, MemoryPropertyFlags};

/// Create a buffer backed by memory with `properties`.
pub fn create_buffer(
    allocator: &mut MemoryAllocator,
    size: u64,
    usage: BufferUsage,
    properties: MemoryPropertyFlags,
) -> Result<ResourceHandle, GpuError> {
    if size == 0 {
        return Err(GpuError::InvalidArgument("buffer size must be non-zero"));
    }

    let device = allocator.device().clone();
    let buffer = device.create_buffer(size, usage).map_err(GpuError::BufferCreation)?;
    let requirements = device.buffer_memory_requirements(buffer);

    let allocation = match allocator.allocate_memory(&requirements, properties) {
        Ok(allocation) => allocation,
        Err(err) => {
            device.destroy_buffer(buffer);
            return Err(err);
        }
    };

    if let Err(err) = device.bind_buffer_memory(buffer, allocation.memory, 0) {
        allocator.free_memory(allocation);
        device.destroy_buffer(buffer);
        return Err(GpuError::BindFailed(err));
    }

    log::debug!(
        "created buffer {:#x}: {} bytes, usage {:#x}, memory type {}",
        buffer.raw(),
        size,
        usage.bits,
        allocation.memory_type_index
    );

    Ok(ResourceHandle::from_buffer(buffer, allocation, None, size, usage))
}

/// Create a host-visible, coherent buffer with a persistent mapping.
pub fn create_mapped_buffer(
    allocator: &mut MemoryAllocator,
    size: u64,
    usage: BufferUsage,
) -> Result<ResourceHandle, GpuError> {
    let mut handle = create_buffer(allocator, size, usage, MemoryPropertyFlags::host_mapped())?;

    let mapped = match handle.allocation {
        Some(allocation) if allocation.host_visible => allocator.map_memory(&allocation),
        _ => Err(GpuError::InvalidArgument("selected memory type is not host-visible")),
    };

    match mapped {
        Ok(ptr) => {
            handle.mapped = Some(ptr);
            Ok(handle)
        }
        Err(err) => {
            destroy_resource(allocator, handle);
            Err(err)
        }
    }
}

/// Release every device object a handle owns.
pub fn destroy_resource(allocator: &mut MemoryAllocator, mut handle: ResourceHandle) {
    let device = allocator.device().clone();

    handle.mapped = None;
    if let Some(buffer) = handle.buffer.take() {
        device.destroy_buffer(buffer);
    }
    if let Some((image, view)) = handle.image.take() {
        device.destroy_image(image, view);
    }
    if let Some(allocation) = handle.allocation.take() {
        allocator.free_memory(allocation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DummyDevice;
    use std::sync::Arc;

    #[test]
    fn test_create_and_destroy() {
        let device = Arc::new(DummyDevice::new());
        let mut allocator = MemoryAllocator::new(device.clone(), 0.8);

        let handle = create_buffer(
            &mut allocator,
            1000,
            BufferUsage::VERTEX_BUFFER | BufferUsage::TRANSFER_DST,
            MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();
        assert!(handle.is_valid());
        assert!(!handle.is_host_visible());
        assert!(handle.mapped_ptr().is_none());
        assert_eq!(device.live_buffers(), 1);

        destroy_resource(&mut allocator, handle);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(allocator.stats().active_allocations, 0);
    }

    #[test]
    fn test_mapped_buffer() {
        let device = Arc::new(DummyDevice::new());
        let mut allocator = MemoryAllocator::new(device.clone(), 0.8);

        let mut handle = create_mapped_buffer(&mut allocator, 64, BufferUsage::UNIFORM_BUFFER).unwrap();
        assert!(handle.is_host_visible());
        handle.write_mapped(0, &[9; 64]).unwrap();
        let buffer = handle.buffer().unwrap();
        assert_eq!(device.read_buffer(buffer).unwrap(), vec![9; 64]);

        destroy_resource(&mut allocator, handle);
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn test_failed_allocation_cleans_up() {
        let device = Arc::new(DummyDevice::new());
        let mut allocator = MemoryAllocator::new(device.clone(), 0.8);

        device.fail_next_allocations(2);
        let result = create_buffer(
            &mut allocator,
            64,
            BufferUsage::TRANSFER_DST,
            MemoryPropertyFlags::DEVICE_LOCAL,
        );
        assert!(result.is_err());
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_zero_size_rejected() {
        let device = Arc::new(DummyDevice::new());
        let mut allocator = MemoryAllocator::new(device.clone(), 0.8);
        let result = create_buffer(&mut allocator, 0, BufferUsage::TRANSFER_DST, MemoryPropertyFlags::DEVICE_LOCAL);
        assert!(matches!(result, Err(GpuError::InvalidArgument(_))));
        assert_eq!(device.live_buffers(), 0);
    }
}
