//! Dummy device implementation for testing
//!
//! Device memory is plain `Box<[u8]>` storage in RAM, copy commands execute on
//! the CPU, and fences are flags. No GPU hardware or loader is required.
//!
//! Completion can be deferred (`set_deferred_completion`) so tests can observe
//! a transfer in the pending state and then release it with
//! `complete_pending`.

use std::collections::HashMap;
use std::ptr::NonNull;

use super::traits::*;
use crate::sync::atomics::AtomicCounter;
use crate::sync::mutex::Mutex;
use crate::util::layout::align_up;
use crate::util::size::mb;

struct DummyMemory {
    data: Box<[u8]>,
    heap_index: u32,
    host_visible: bool,
    mapped: bool,
}

struct DummyBuffer {
    size: u64,
    usage: BufferUsage,
    binding: Option<(RawMemory, u64)>,
}

#[derive(Clone)]
struct RecordedCopy {
    src: RawBuffer,
    dst: RawBuffer,
    regions: Vec<BufferCopy>,
}

struct DummyCommandBuffer {
    pool: RawCommandPool,
    recorded: Option<RecordedCopy>,
}

#[derive(Default)]
struct DummyFence {
    signaled: bool,
    pending: Vec<RecordedCopy>,
}

#[derive(Default)]
struct DummyState {
    next_handle: u64,
    memories: HashMap<u64, DummyMemory>,
    buffers: HashMap<u64, DummyBuffer>,
    pools: HashMap<u64, u32>,
    command_buffers: HashMap<u64, DummyCommandBuffer>,
    fences: HashMap<u64, DummyFence>,
    heap_usage: Vec<u64>,
    fail_allocations: u32,
    deferred_completion: bool,
}

impl DummyState {
    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Resolve a buffer range to (memory, absolute offset), checking bounds.
    fn resolve(&self, buffer: RawBuffer, offset: u64, size: u64) -> Option<(RawMemory, usize)> {
        let buf = self.buffers.get(&buffer.0)?;
        if offset.checked_add(size)? > buf.size {
            return None;
        }
        let (memory, base) = buf.binding?;
        let mem = self.memories.get(&memory.0)?;
        let start = base + offset;
        if start + size > mem.data.len() as u64 {
            return None;
        }
        Some((memory, start as usize))
    }

    fn execute(&mut self, copy: &RecordedCopy) -> u64 {
        let mut executed = 0;
        for region in &copy.regions {
            let (Some((src_mem, src_at)), Some((dst_mem, dst_at))) = (
                self.resolve(copy.src, region.src_offset, region.size),
                self.resolve(copy.dst, region.dst_offset, region.size),
            ) else {
                // Buffers destroyed while the copy was in flight.
                continue;
            };
            let len = region.size as usize;
            let bytes = match self.memories.get(&src_mem.0) {
                Some(mem) => mem.data[src_at..src_at + len].to_vec(),
                None => continue,
            };
            if let Some(mem) = self.memories.get_mut(&dst_mem.0) {
                mem.data[dst_at..dst_at + len].copy_from_slice(&bytes);
                executed += 1;
            }
        }
        executed
    }
}

/// A software GPU device implementing both backend traits.
pub struct DummyDevice {
    properties: MemoryProperties,
    families: QueueFamilies,
    state: Mutex<DummyState>,
    submissions: AtomicCounter,
    copies_executed: AtomicCounter,
    allocation_calls: AtomicCounter,
}

impl DummyDevice {
    /// A discrete-GPU-shaped device: separate device-local and host heaps,
    /// and a dedicated transfer queue family.
    pub fn new() -> Self {
        let properties = MemoryProperties {
            memory_types: vec![
                MemoryTypeInfo {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryTypeInfo {
                    property_flags: MemoryPropertyFlags::host_mapped(),
                    heap_index: 1,
                },
                MemoryTypeInfo {
                    property_flags: MemoryPropertyFlags::host_mapped() | MemoryPropertyFlags::HOST_CACHED,
                    heap_index: 1,
                },
                MemoryTypeInfo {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL | MemoryPropertyFlags::host_mapped(),
                    heap_index: 0,
                },
            ],
            memory_heaps: vec![
                MemoryHeap {
                    size: mb(256),
                    device_local: true,
                },
                MemoryHeap {
                    size: mb(256),
                    device_local: false,
                },
            ],
        };
        Self::with_topology(properties, QueueFamilies::with_transfer(0, Some(1), 2))
    }

    /// A device with the given memory and queue topology.
    pub fn with_topology(properties: MemoryProperties, families: QueueFamilies) -> Self {
        let state = DummyState {
            heap_usage: vec![0; properties.memory_heaps.len()],
            ..DummyState::default()
        };
        Self {
            properties,
            families,
            state: Mutex::new(state),
            submissions: AtomicCounter::default(),
            copies_executed: AtomicCounter::default(),
            allocation_calls: AtomicCounter::default(),
        }
    }

    /// Same memory layout as `new()` but only a graphics queue family.
    pub fn without_transfer_queue() -> Self {
        let device = Self::new();
        Self::with_topology(device.properties.clone(), QueueFamilies::graphics_only(0))
    }

    /// Override heap sizes (device-local heap 0, host heap 1).
    pub fn with_heap_sizes(mut self, device_local: u64, host: u64) -> Self {
        if let Some(heap) = self.properties.memory_heaps.get_mut(0) {
            heap.size = device_local;
        }
        if let Some(heap) = self.properties.memory_heaps.get_mut(1) {
            heap.size = host;
        }
        self
    }

    /// Hold submitted work until `complete_pending` or a fence wait.
    pub fn set_deferred_completion(&self, deferred: bool) {
        self.state.lock().deferred_completion = deferred;
    }

    /// Execute all pending submissions and signal their fences.
    pub fn complete_pending(&self) -> usize {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state
            .fences
            .iter()
            .filter(|(_, f)| !f.signaled && !f.pending.is_empty())
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.signal(&mut state, *id);
        }
        ids.len()
    }

    /// Make the next `count` memory allocations fail with out-of-memory.
    pub fn fail_next_allocations(&self, count: u32) {
        self.state.lock().fail_allocations = count;
    }

    /// Read back the full contents of a bound buffer.
    pub fn read_buffer(&self, buffer: RawBuffer) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let size = state.buffers.get(&buffer.0)?.size;
        let (memory, at) = state.resolve(buffer, 0, size)?;
        let mem = state.memories.get(&memory.0)?;
        Some(mem.data[at..at + size as usize].to_vec())
    }

    /// Number of queue submissions.
    pub fn submissions(&self) -> u64 {
        self.submissions.get()
    }

    /// Number of copy regions executed.
    pub fn copies_executed(&self) -> u64 {
        self.copies_executed.get()
    }

    /// Number of `allocate_memory` calls, including failed ones.
    pub fn allocation_calls(&self) -> u64 {
        self.allocation_calls.get()
    }

    /// Number of live buffers.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Number of live memory allocations.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().memories.len()
    }

    /// Number of live fences.
    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    /// Number of live command buffers.
    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    fn signal(&self, state: &mut DummyState, fence: u64) {
        let pending = match state.fences.get_mut(&fence) {
            Some(f) => std::mem::take(&mut f.pending),
            None => return,
        };
        for copy in &pending {
            let executed = state.execute(copy);
            self.copies_executed.add(executed);
        }
        if let Some(f) = state.fences.get_mut(&fence) {
            f.signaled = true;
        }
    }
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for DummyDevice {
    fn memory_properties(&self) -> MemoryProperties {
        self.properties.clone()
    }

    fn create_buffer(&self, size: u64, usage: BufferUsage) -> Result<RawBuffer, DeviceError> {
        if size == 0 {
            return Err(DeviceError::Backend("zero-sized buffer".to_string()));
        }
        let mut state = self.state.lock();
        let id = state.next();
        state.buffers.insert(
            id,
            DummyBuffer {
                size,
                usage,
                binding: None,
            },
        );
        Ok(RawBuffer(id))
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        self.state.lock().buffers.remove(&buffer.0);
    }

    fn buffer_memory_requirements(&self, buffer: RawBuffer) -> MemoryRequirements {
        let state = self.state.lock();
        let (size, usage) = state
            .buffers
            .get(&buffer.0)
            .map(|b| (b.size, b.usage))
            .unwrap_or((0, BufferUsage::empty()));
        let alignment = if usage.bits & (BufferUsage::UNIFORM_BUFFER.bits | BufferUsage::STORAGE_BUFFER.bits) != 0 {
            256
        } else {
            16
        };
        let type_count = self.properties.memory_types.len() as u32;
        let memory_type_bits = if type_count >= 32 { u32::MAX } else { (1u32 << type_count) - 1 };
        MemoryRequirements {
            size: align_up(size, alignment),
            alignment,
            memory_type_bits,
        }
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<RawMemory, DeviceError> {
        self.allocation_calls.increment();
        let mut state = self.state.lock();

        if state.fail_allocations > 0 {
            state.fail_allocations -= 1;
            return Err(DeviceError::OutOfDeviceMemory);
        }

        let memory_type = self
            .properties
            .memory_types
            .get(memory_type_index as usize)
            .ok_or(DeviceError::InvalidHandle)?;
        let heap_index = memory_type.heap_index;
        let heap_size = self
            .properties
            .memory_heaps
            .get(heap_index as usize)
            .map(|h| h.size)
            .ok_or(DeviceError::InvalidHandle)?;

        let used = state.heap_usage.get(heap_index as usize).copied().unwrap_or(0);
        if used + size > heap_size {
            return Err(if memory_type.property_flags.contains(MemoryPropertyFlags::DEVICE_LOCAL) {
                DeviceError::OutOfDeviceMemory
            } else {
                DeviceError::OutOfHostMemory
            });
        }

        if let Some(usage) = state.heap_usage.get_mut(heap_index as usize) {
            *usage += size;
        }
        let id = state.next();
        state.memories.insert(
            id,
            DummyMemory {
                data: vec![0u8; size as usize].into_boxed_slice(),
                heap_index,
                host_visible: memory_type.property_flags.contains(MemoryPropertyFlags::HOST_VISIBLE),
                mapped: false,
            },
        );
        Ok(RawMemory(id))
    }

    fn free_memory(&self, memory: RawMemory) {
        let mut state = self.state.lock();
        if let Some(mem) = state.memories.remove(&memory.0) {
            if let Some(usage) = state.heap_usage.get_mut(mem.heap_index as usize) {
                *usage = usage.saturating_sub(mem.data.len() as u64);
            }
        }
    }

    fn bind_buffer_memory(&self, buffer: RawBuffer, memory: RawMemory, offset: u64) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let mem_len = state
            .memories
            .get(&memory.0)
            .map(|m| m.data.len() as u64)
            .ok_or(DeviceError::InvalidHandle)?;
        let buf = state.buffers.get_mut(&buffer.0).ok_or(DeviceError::InvalidHandle)?;
        if offset + buf.size > mem_len {
            return Err(DeviceError::Backend("binding exceeds allocation".to_string()));
        }
        buf.binding = Some((memory, offset));
        Ok(())
    }

    fn map_memory(&self, memory: RawMemory, offset: u64, size: u64) -> Result<NonNull<u8>, DeviceError> {
        let mut state = self.state.lock();
        let mem = state.memories.get_mut(&memory.0).ok_or(DeviceError::InvalidHandle)?;
        if !mem.host_visible || offset + size > mem.data.len() as u64 {
            return Err(DeviceError::MemoryMapFailed);
        }
        mem.mapped = true;
        // SAFETY: offset is within the boxed slice, which never moves or
        // resizes while the allocation is alive.
        let ptr = unsafe { mem.data.as_mut_ptr().add(offset as usize) };
        NonNull::new(ptr).ok_or(DeviceError::MemoryMapFailed)
    }

    fn unmap_memory(&self, memory: RawMemory) {
        if let Some(mem) = self.state.lock().memories.get_mut(&memory.0) {
            mem.mapped = false;
        }
    }

    fn destroy_image(&self, _image: RawImage, _view: RawImageView) {
        // Images are never created by the dummy device.
    }
}

impl QueueBackend for DummyDevice {
    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn create_command_pool(&self, family: u32) -> Result<RawCommandPool, DeviceError> {
        let mut state = self.state.lock();
        let id = state.next();
        state.pools.insert(id, family);
        Ok(RawCommandPool(id))
    }

    fn destroy_command_pool(&self, pool: RawCommandPool) {
        let mut state = self.state.lock();
        state.pools.remove(&pool.0);
        state.command_buffers.retain(|_, cb| cb.pool != pool);
    }

    fn allocate_command_buffer(&self, pool: RawCommandPool) -> Result<RawCommandBuffer, DeviceError> {
        let mut state = self.state.lock();
        if !state.pools.contains_key(&pool.0) {
            return Err(DeviceError::InvalidHandle);
        }
        let id = state.next();
        state.command_buffers.insert(id, DummyCommandBuffer { pool, recorded: None });
        Ok(RawCommandBuffer(id))
    }

    fn free_command_buffer(&self, _pool: RawCommandPool, command_buffer: RawCommandBuffer) {
        self.state.lock().command_buffers.remove(&command_buffer.0);
    }

    fn record_copy(
        &self,
        command_buffer: RawCommandBuffer,
        src: RawBuffer,
        dst: RawBuffer,
        regions: &[BufferCopy],
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        for region in regions {
            if state.resolve(src, region.src_offset, region.size).is_none()
                || state.resolve(dst, region.dst_offset, region.size).is_none()
            {
                return Err(DeviceError::Backend("copy region out of bounds".to_string()));
            }
        }
        let cb = state
            .command_buffers
            .get_mut(&command_buffer.0)
            .ok_or(DeviceError::InvalidHandle)?;
        cb.recorded = Some(RecordedCopy {
            src,
            dst,
            regions: regions.to_vec(),
        });
        Ok(())
    }

    fn create_fence(&self) -> Result<RawFence, DeviceError> {
        let mut state = self.state.lock();
        let id = state.next();
        state.fences.insert(id, DummyFence::default());
        Ok(RawFence(id))
    }

    fn destroy_fence(&self, fence: RawFence) {
        self.state.lock().fences.remove(&fence.0);
    }

    fn submit(&self, family: u32, command_buffer: RawCommandBuffer, fence: RawFence) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let known_family = family == self.families.graphics
            || Some(family) == self.families.compute
            || Some(family) == self.families.transfer;
        if !known_family {
            return Err(DeviceError::InvalidHandle);
        }
        let recorded = state
            .command_buffers
            .get(&command_buffer.0)
            .and_then(|cb| cb.recorded.clone())
            .ok_or(DeviceError::InvalidHandle)?;
        let deferred = state.deferred_completion;
        let f = state.fences.get_mut(&fence.0).ok_or(DeviceError::InvalidHandle)?;
        f.pending.push(recorded);
        self.submissions.increment();

        if !deferred {
            self.signal(&mut state, fence.0);
        }
        Ok(())
    }

    fn fence_status(&self, fence: RawFence) -> Result<bool, DeviceError> {
        let state = self.state.lock();
        state
            .fences
            .get(&fence.0)
            .map(|f| f.signaled)
            .ok_or(DeviceError::InvalidHandle)
    }

    fn wait_for_fence(&self, fence: RawFence, _timeout_ns: u64) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let (signaled, has_work) = state
            .fences
            .get(&fence.0)
            .map(|f| (f.signaled, !f.pending.is_empty()))
            .ok_or(DeviceError::InvalidHandle)?;
        if signaled {
            return Ok(());
        }
        if !has_work {
            // Never submitted: a real device would block forever.
            return Err(DeviceError::Timeout);
        }
        self.signal(&mut state, fence.0);
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), DeviceError> {
        self.complete_pending();
        Ok(())
    }
}
