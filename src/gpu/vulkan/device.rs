//! Vulkan device implementation

use std::collections::HashMap;
use std::ptr::NonNull;

use ash::vk::{self, Handle};

use crate::gpu::traits::*;
use crate::sync::mutex::Mutex;

/// Vulkan-backed device.
///
/// The wrapped `ash::Device` is borrowed from the application: it is not
/// destroyed when this value drops.
pub struct VulkanDevice {
    device: ash::Device,
    memory_properties: MemoryProperties,
    families: QueueFamilies,
    /// First queue of each family in use. Submission requires external
    /// synchronization, hence the lock.
    queues: Mutex<HashMap<u32, vk::Queue>>,
}

impl VulkanDevice {
    /// Wrap a logical device.
    ///
    /// # Safety
    /// `device` must have been created from `physical_device` with at least
    /// one queue for every family named in `families`.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        families: QueueFamilies,
    ) -> Self {
        let raw = instance.get_physical_device_memory_properties(physical_device);
        let memory_properties = convert_memory_properties(&raw);

        let mut queues = HashMap::new();
        for family in [Some(families.graphics), families.compute, families.transfer]
            .into_iter()
            .flatten()
        {
            queues
                .entry(family)
                .or_insert_with(|| device.get_device_queue(family, 0));
        }

        log::debug!(
            "VulkanDevice: {} memory types, {} heaps, dedicated transfer: {}",
            memory_properties.memory_types.len(),
            memory_properties.memory_heaps.len(),
            families.has_dedicated_transfer
        );

        Self {
            device,
            memory_properties,
            families,
            queues: Mutex::new(queues),
        }
    }

    /// The wrapped logical device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }
}

/// Pick graphics, compute and transfer families from the physical device's
/// queue family list.
///
/// Transfer prefers a transfer-only family, then any non-graphics family
/// with transfer support. Returns `None` if no family supports graphics.
pub fn select_queue_families(properties: &[vk::QueueFamilyProperties]) -> Option<QueueFamilies> {
    let find = |pred: &dyn Fn(vk::QueueFlags) -> bool| {
        properties
            .iter()
            .position(|p| p.queue_count > 0 && pred(p.queue_flags))
            .map(|i| i as u32)
    };

    let graphics = find(&|f: vk::QueueFlags| f.contains(vk::QueueFlags::GRAPHICS))?;
    let compute = find(&|f: vk::QueueFlags| f.contains(vk::QueueFlags::COMPUTE) && !f.contains(vk::QueueFlags::GRAPHICS));
    let transfer = find(&|f: vk::QueueFlags| {
        f.contains(vk::QueueFlags::TRANSFER)
            && !f.contains(vk::QueueFlags::GRAPHICS)
            && !f.contains(vk::QueueFlags::COMPUTE)
    })
    .or_else(|| find(&|f: vk::QueueFlags| f.contains(vk::QueueFlags::TRANSFER) && !f.contains(vk::QueueFlags::GRAPHICS)));

    Some(match transfer {
        Some(t) => QueueFamilies::with_transfer(graphics, compute, t),
        None => QueueFamilies {
            compute,
            ..QueueFamilies::graphics_only(graphics)
        },
    })
}

fn convert_memory_properties(raw: &vk::PhysicalDeviceMemoryProperties) -> MemoryProperties {
    let memory_types = raw.memory_types[..raw.memory_type_count as usize]
        .iter()
        .map(|t| MemoryTypeInfo {
            property_flags: MemoryPropertyFlags {
                bits: t.property_flags.as_raw(),
            },
            heap_index: t.heap_index,
        })
        .collect();
    let memory_heaps = raw.memory_heaps[..raw.memory_heap_count as usize]
        .iter()
        .map(|h| MemoryHeap {
            size: h.size,
            device_local: h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL),
        })
        .collect();
    MemoryProperties {
        memory_types,
        memory_heaps,
    }
}

fn vk_err(result: vk::Result) -> DeviceError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => DeviceError::OutOfDeviceMemory,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => DeviceError::OutOfHostMemory,
        vk::Result::ERROR_MEMORY_MAP_FAILED => DeviceError::MemoryMapFailed,
        vk::Result::TIMEOUT => DeviceError::Timeout,
        vk::Result::ERROR_DEVICE_LOST => DeviceError::DeviceLost,
        other => DeviceError::Backend(format!("{:?}", other)),
    }
}

impl DeviceBackend for VulkanDevice {
    fn memory_properties(&self) -> MemoryProperties {
        self.memory_properties.clone()
    }

    fn create_buffer(&self, size: u64, usage: BufferUsage) -> Result<RawBuffer, DeviceError> {
        let shared = [self.families.graphics, self.families.family_for(QueueKind::Transfer)];
        let mut info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::from_raw(usage.bits));
        // Staged copies run on the transfer family while rendering reads on
        // graphics; concurrent sharing avoids ownership transfer barriers.
        info = if self.families.has_dedicated_transfer {
            info.sharing_mode(vk::SharingMode::CONCURRENT).queue_family_indices(&shared)
        } else {
            info.sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let buffer = unsafe { self.device.create_buffer(&info, None) }.map_err(vk_err)?;
        Ok(RawBuffer(buffer.as_raw()))
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        unsafe { self.device.destroy_buffer(vk::Buffer::from_raw(buffer.0), None) };
    }

    fn buffer_memory_requirements(&self, buffer: RawBuffer) -> MemoryRequirements {
        let req = unsafe { self.device.get_buffer_memory_requirements(vk::Buffer::from_raw(buffer.0)) };
        MemoryRequirements {
            size: req.size,
            alignment: req.alignment,
            memory_type_bits: req.memory_type_bits,
        }
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<RawMemory, DeviceError> {
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        let memory = unsafe { self.device.allocate_memory(&info, None) }.map_err(vk_err)?;
        Ok(RawMemory(memory.as_raw()))
    }

    fn free_memory(&self, memory: RawMemory) {
        unsafe { self.device.free_memory(vk::DeviceMemory::from_raw(memory.0), None) };
    }

    fn bind_buffer_memory(&self, buffer: RawBuffer, memory: RawMemory, offset: u64) -> Result<(), DeviceError> {
        unsafe {
            self.device.bind_buffer_memory(
                vk::Buffer::from_raw(buffer.0),
                vk::DeviceMemory::from_raw(memory.0),
                offset,
            )
        }
        .map_err(vk_err)
    }

    fn map_memory(&self, memory: RawMemory, offset: u64, size: u64) -> Result<NonNull<u8>, DeviceError> {
        let ptr = unsafe {
            self.device.map_memory(
                vk::DeviceMemory::from_raw(memory.0),
                offset,
                size,
                vk::MemoryMapFlags::empty(),
            )
        }
        .map_err(vk_err)?;
        NonNull::new(ptr as *mut u8).ok_or(DeviceError::MemoryMapFailed)
    }

    fn unmap_memory(&self, memory: RawMemory) {
        unsafe { self.device.unmap_memory(vk::DeviceMemory::from_raw(memory.0)) };
    }

    fn destroy_image(&self, image: RawImage, view: RawImageView) {
        unsafe {
            if !view.is_null() {
                self.device.destroy_image_view(vk::ImageView::from_raw(view.0), None);
            }
            self.device.destroy_image(vk::Image::from_raw(image.0), None);
        }
    }
}

impl QueueBackend for VulkanDevice {
    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn create_command_pool(&self, family: u32) -> Result<RawCommandPool, DeviceError> {
        let info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { self.device.create_command_pool(&info, None) }.map_err(vk_err)?;
        Ok(RawCommandPool(pool.as_raw()))
    }

    fn destroy_command_pool(&self, pool: RawCommandPool) {
        unsafe { self.device.destroy_command_pool(vk::CommandPool::from_raw(pool.0), None) };
    }

    fn allocate_command_buffer(&self, pool: RawCommandPool) -> Result<RawCommandBuffer, DeviceError> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(vk::CommandPool::from_raw(pool.0))
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }.map_err(vk_err)?;
        buffers
            .into_iter()
            .next()
            .map(|cb| RawCommandBuffer(cb.as_raw()))
            .ok_or(DeviceError::InvalidHandle)
    }

    fn free_command_buffer(&self, pool: RawCommandPool, command_buffer: RawCommandBuffer) {
        unsafe {
            self.device.free_command_buffers(
                vk::CommandPool::from_raw(pool.0),
                &[vk::CommandBuffer::from_raw(command_buffer.0)],
            )
        };
    }

    fn record_copy(
        &self,
        command_buffer: RawCommandBuffer,
        src: RawBuffer,
        dst: RawBuffer,
        regions: &[BufferCopy],
    ) -> Result<(), DeviceError> {
        let cb = vk::CommandBuffer::from_raw(command_buffer.0);
        let vk_regions: Vec<vk::BufferCopy> = regions
            .iter()
            .map(|r| vk::BufferCopy {
                src_offset: r.src_offset,
                dst_offset: r.dst_offset,
                size: r.size,
            })
            .collect();
        let begin = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device.begin_command_buffer(cb, &begin).map_err(vk_err)?;
            self.device.cmd_copy_buffer(
                cb,
                vk::Buffer::from_raw(src.0),
                vk::Buffer::from_raw(dst.0),
                &vk_regions,
            );
            self.device.end_command_buffer(cb).map_err(vk_err)
        }
    }

    fn create_fence(&self) -> Result<RawFence, DeviceError> {
        let info = vk::FenceCreateInfo::default();
        let fence = unsafe { self.device.create_fence(&info, None) }.map_err(vk_err)?;
        Ok(RawFence(fence.as_raw()))
    }

    fn destroy_fence(&self, fence: RawFence) {
        unsafe { self.device.destroy_fence(vk::Fence::from_raw(fence.0), None) };
    }

    fn submit(&self, family: u32, command_buffer: RawCommandBuffer, fence: RawFence) -> Result<(), DeviceError> {
        let queues = self.queues.lock();
        let queue = *queues.get(&family).ok_or(DeviceError::InvalidHandle)?;
        let command_buffers = [vk::CommandBuffer::from_raw(command_buffer.0)];
        let submit = vk::SubmitInfo::builder().command_buffers(&command_buffers).build();
        unsafe {
            self.device
                .queue_submit(queue, &[submit], vk::Fence::from_raw(fence.0))
        }
        .map_err(vk_err)
    }

    fn fence_status(&self, fence: RawFence) -> Result<bool, DeviceError> {
        unsafe { self.device.get_fence_status(vk::Fence::from_raw(fence.0)) }.map_err(vk_err)
    }

    fn wait_for_fence(&self, fence: RawFence, timeout_ns: u64) -> Result<(), DeviceError> {
        unsafe {
            self.device
                .wait_for_fences(&[vk::Fence::from_raw(fence.0)], true, timeout_ns)
        }
        .map_err(vk_err)
    }

    fn wait_idle(&self) -> Result<(), DeviceError> {
        // Queue-level waits also need the submission lock.
        let _queues = self.queues.lock();
        unsafe { self.device.device_wait_idle() }.map_err(vk_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_prefers_transfer_only_family() {
        let props = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let families = select_queue_families(&props).unwrap();
        assert_eq!(families.graphics, 0);
        assert_eq!(families.compute, Some(1));
        assert_eq!(families.transfer, Some(2));
        assert!(families.has_dedicated_transfer);
    }

    #[test]
    fn test_graphics_only_device() {
        let props = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER)];
        let families = select_queue_families(&props).unwrap();
        assert_eq!(families.transfer, None);
        assert!(!families.has_dedicated_transfer);
    }

    #[test]
    fn test_result_mapping() {
        assert_eq!(vk_err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY), DeviceError::OutOfDeviceMemory);
        assert_eq!(vk_err(vk::Result::TIMEOUT), DeviceError::Timeout);
    }
}
