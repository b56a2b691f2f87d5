//! The composition root of the resource layer.

use std::sync::Arc;

use crate::allocators::factory;
use crate::allocators::memory::MemoryAllocator;
use crate::allocators::registry::{BufferId, BufferRegistry};
use crate::allocators::staging::StagingRingBuffer;
use crate::api::buffer::GpuBuffer;
use crate::api::config::ResourceConfig;
use crate::api::error::{GpuError, TransferError};
use crate::api::handle::ResourceHandle;
use crate::api::stats::{BufferStats, HeapBudget, MemoryStats, StagingStats, TransferStats};
use crate::gpu::{BufferUsage, DeviceBackend, MemoryPropertyFlags, QueueBackend};
use crate::transfer::context::StagingContext;
use crate::transfer::executor::{AsyncTransfer, CommandExecutor};
use crate::transfer::orchestrator::{TransferOrchestrator, TransferRequest};

/// Owns the memory allocator, staging ring, command executor, transfer
/// orchestrator and GpuBuffer registry, and exposes them as one façade.
///
/// All mutation goes through `&mut self`: one thread drives the coordinator
/// per frame.
///
/// # Example
///
/// ```rust,ignore
/// let device = Arc::new(DummyDevice::new());
/// let mut coordinator = ResourceCoordinator::new(device, ResourceConfig::default())?;
///
/// let vertices = coordinator.create_gpu_buffer(4096, BufferUsage::VERTEX_BUFFER, true)?;
/// coordinator.add_data(vertices, bytes, 16)?;
/// coordinator.end_frame()?; // uploads pending data
/// ```
pub struct ResourceCoordinator {
    queues: Arc<dyn QueueBackend>,
    config: ResourceConfig,
    allocator: MemoryAllocator,
    staging: StagingRingBuffer,
    executor: CommandExecutor,
    transfers: TransferOrchestrator,
    registry: BufferRegistry,
}

impl ResourceCoordinator {
    /// Create a coordinator over a device implementing both backend traits.
    pub fn new<D>(device: Arc<D>, config: ResourceConfig) -> Result<Self, GpuError>
    where
        D: DeviceBackend + QueueBackend + 'static,
    {
        let queues: Arc<dyn QueueBackend> = device.clone();
        Self::with_backends(device, queues, config)
    }

    /// Create a coordinator from separate device and queue backends.
    pub fn with_backends(
        device: Arc<dyn DeviceBackend>,
        queues: Arc<dyn QueueBackend>,
        config: ResourceConfig,
    ) -> Result<Self, GpuError> {
        let mut allocator = MemoryAllocator::new(device, config.memory_pressure_threshold);
        let mut executor =
            CommandExecutor::new(Arc::clone(&queues), config.transfer_timeout_ns).map_err(GpuError::Device)?;

        let staging =
            match StagingRingBuffer::new(&mut allocator, config.staging_pool_size, config.fragmentation_threshold) {
                Ok(staging) => staging,
                Err(err) => {
                    executor.release();
                    return Err(err);
                }
            };

        log::info!(
            "resource coordinator ready: {} staging, dedicated transfer queue: {}",
            crate::util::size::format_bytes(config.staging_pool_size),
            executor.uses_dedicated_transfer_queue()
        );

        Ok(Self {
            queues,
            transfers: TransferOrchestrator::new(config.staging_alignment, config.allow_async_transfers),
            config,
            allocator,
            staging,
            executor,
            registry: BufferRegistry::new(),
        })
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Create a buffer backed by memory with `properties`.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsage,
        properties: MemoryPropertyFlags,
    ) -> Result<ResourceHandle, GpuError> {
        factory::create_buffer(&mut self.allocator, size, usage, properties)
    }

    /// Create a host-visible buffer with a persistent mapping.
    pub fn create_mapped_buffer(&mut self, size: u64, usage: BufferUsage) -> Result<ResourceHandle, GpuError> {
        factory::create_mapped_buffer(&mut self.allocator, size, usage)
    }

    /// Release a resource created by this coordinator.
    pub fn destroy_resource(&mut self, handle: ResourceHandle) {
        factory::destroy_resource(&mut self.allocator, handle);
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    /// Copy `data` into `dst` at `offset`, waiting for completion.
    pub fn copy_to_buffer(&mut self, dst: &mut ResourceHandle, data: &[u8], offset: u64) -> Result<(), TransferError> {
        let mut ctx = StagingContext::new(&mut self.staging, &mut self.executor);
        self.transfers.copy_to_buffer(&mut ctx, dst, data, offset)
    }

    /// Copy `data` into `dst` at `offset` without waiting on the staged path.
    pub fn copy_to_buffer_async(
        &mut self,
        dst: &mut ResourceHandle,
        data: &[u8],
        offset: u64,
    ) -> Result<AsyncTransfer, TransferError> {
        let mut ctx = StagingContext::new(&mut self.staging, &mut self.executor);
        self.transfers.copy_to_buffer_async(&mut ctx, dst, data, offset)
    }

    pub fn is_transfer_complete(&mut self, token: &mut AsyncTransfer) -> Result<bool, TransferError> {
        Ok(self.executor.is_transfer_complete(token)?)
    }

    pub fn wait_for_transfer(&mut self, token: &mut AsyncTransfer) -> Result<(), TransferError> {
        Ok(self.executor.wait_for_transfer(token)?)
    }

    /// Return a token's command buffer and fence.
    pub fn free_async_transfer(&mut self, token: &mut AsyncTransfer) -> Result<(), TransferError> {
        Ok(self.executor.free_async_transfer(token)?)
    }

    /// Run a batch of copies; see [`TransferOrchestrator::execute_batch`].
    pub fn execute_batch(&mut self, batch: &mut [TransferRequest<'_>]) -> Result<(), TransferError> {
        let mut ctx = StagingContext::new(&mut self.staging, &mut self.executor);
        self.transfers.execute_batch(&mut ctx, batch)
    }

    // =========================================================================
    // GpuBuffers
    // =========================================================================

    /// Create and register a GpuBuffer.
    ///
    /// Device-local buffers upload through the staging ring; the others are
    /// persistently mapped and written directly.
    pub fn create_gpu_buffer(&mut self, size: u64, usage: BufferUsage, device_local: bool) -> Result<BufferId, GpuError> {
        let storage = if device_local {
            self.create_buffer(size, usage | BufferUsage::TRANSFER_DST, MemoryPropertyFlags::DEVICE_LOCAL)?
        } else {
            self.create_mapped_buffer(size, usage)?
        };
        Ok(self.registry.insert(GpuBuffer::new(storage)))
    }

    /// Append data to a GpuBuffer; see [`GpuBuffer::add_data`].
    ///
    /// If staging the data wraps the ring, every buffer's pending regions
    /// are uploaded first so the wrap cannot overwrite them.
    pub fn add_data(&mut self, id: BufferId, data: &[u8], alignment: u64) -> Result<u64, TransferError> {
        let staged = self
            .registry
            .get(id)
            .ok_or(TransferError::UnknownBuffer)?
            .is_device_local();
        let mut ctx = StagingContext::new(&mut self.staging, &mut self.executor);

        if staged && ctx.pool.would_wrap(data.len() as u64, alignment) {
            for (other, buffer) in self.registry.iter_mut() {
                if let Err(err) = buffer.spill(&mut ctx) {
                    log::warn!("early upload of buffer {} failed: {}", other.raw_index(), err);
                }
            }
        }

        let buffer = self.registry.get_mut(id).ok_or(TransferError::UnknownBuffer)?;
        buffer.add_data(&mut ctx, data, alignment)
    }

    /// Upload a GpuBuffer's pending data to `dst_offset`.
    pub fn flush_buffer(&mut self, id: BufferId, dst_offset: u64) -> Result<bool, TransferError> {
        let buffer = self.registry.get_mut(id).ok_or(TransferError::UnknownBuffer)?;
        let mut ctx = StagingContext::new(&mut self.staging, &mut self.executor);
        buffer.flush_to_gpu(&mut ctx, dst_offset)
    }

    /// Upload every GpuBuffer with pending data.
    pub fn flush_all_buffers(&mut self) -> Result<usize, TransferError> {
        let mut ctx = StagingContext::new(&mut self.staging, &mut self.executor);
        self.transfers.flush_all_buffers(&mut ctx, &mut self.registry)
    }

    /// Place this buffer's future frame uploads at `offset` instead of 0.
    pub fn set_upload_offset(&mut self, id: BufferId, offset: u64) -> bool {
        match self.registry.get_mut(id) {
            Some(buffer) => {
                buffer.set_upload_offset(offset);
                true
            }
            None => false,
        }
    }

    /// Rewind a host-visible GpuBuffer so the next write lands at offset 0.
    pub fn reset_buffer_cursor(&mut self, id: BufferId) -> bool {
        match self.registry.get_mut(id) {
            Some(buffer) => {
                buffer.reset_cursor();
                true
            }
            None => false,
        }
    }

    pub fn gpu_buffer(&self, id: BufferId) -> Option<&GpuBuffer> {
        self.registry.get(id)
    }

    /// Unregister and release a GpuBuffer. Unflushed data is discarded.
    pub fn destroy_gpu_buffer(&mut self, id: BufferId) -> bool {
        let Some(mut buffer) = self.registry.remove(id) else {
            return false;
        };
        if buffer.has_pending_data() {
            log::debug!(
                "destroying gpu buffer {} with {} unflushed bytes",
                id.raw_index(),
                buffer.staging_bytes_written()
            );
        }
        buffer.cleanup(&mut self.allocator);
        true
    }

    // =========================================================================
    // Staging and frames
    // =========================================================================

    /// Reset the staging ring if fragmentation is critical.
    ///
    /// Pending GpuBuffer data is uploaded and in-flight copies are waited for
    /// before the ring is reclaimed.
    pub fn try_defragment_staging(&mut self) -> Result<bool, TransferError> {
        if !self.staging.is_fragmentation_critical() {
            return Ok(false);
        }
        self.flush_all_buffers()?;
        self.executor.wait_in_flight()?;
        Ok(self.staging.try_defragment())
    }

    /// Upload pending GpuBuffer data, then reclaim the whole staging ring.
    pub fn reset_staging(&mut self) -> Result<(), TransferError> {
        self.flush_all_buffers()?;
        let mut ctx = StagingContext::new(&mut self.staging, &mut self.executor);
        ctx.reset_pool()
    }

    /// End-of-frame housekeeping: upload pending GpuBuffer data, release
    /// dropped async tokens, and defragment the ring when enabled.
    pub fn end_frame(&mut self) -> Result<(), TransferError> {
        let flushed = self.flush_all_buffers();
        let retired = self.executor.collect_retired();
        if retired > 0 {
            log::debug!("collected {} retired transfers", retired);
        }
        if self.config.auto_defragment {
            self.try_defragment_staging()?;
        }
        flushed.map(|_| ())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Snapshot of the whole resource layer.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            memory: self.allocator.stats().clone(),
            staging: self.staging.stats(),
            transfers: self.transfers.stats().clone(),
            registered_buffers: self.registry.len(),
            pending_uploads: self.registry.pending_ids().len(),
            in_flight_transfers: self.executor.in_flight_count(),
            dedicated_transfer_queue: self.executor.uses_dedicated_transfer_queue(),
        }
    }

    pub fn memory_stats(&self) -> &MemoryStats {
        self.allocator.stats()
    }

    pub fn staging_stats(&self) -> StagingStats {
        self.staging.stats()
    }

    pub fn transfer_stats(&self) -> &TransferStats {
        self.transfers.stats()
    }

    pub fn reset_transfer_stats(&mut self) {
        self.transfers.reset_stats();
    }

    pub fn is_under_memory_pressure(&self) -> bool {
        self.allocator.is_under_memory_pressure()
    }

    pub fn heap_budgets(&self) -> Vec<HeapBudget> {
        self.allocator.heap_budgets()
    }

    pub fn uses_dedicated_transfer_queue(&self) -> bool {
        self.executor.uses_dedicated_transfer_queue()
    }

    /// The staging ring, read-only.
    pub fn staging_pool(&self) -> &StagingRingBuffer {
        &self.staging
    }

    /// The memory allocator, read-only.
    pub fn memory_allocator(&self) -> &MemoryAllocator {
        &self.allocator
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }
}

impl Drop for ResourceCoordinator {
    fn drop(&mut self) {
        if let Err(err) = self.queues.wait_idle() {
            log::error!("wait_idle failed during shutdown: {}", err);
        }
        for mut buffer in self.registry.drain() {
            buffer.cleanup(&mut self.allocator);
        }
        self.executor.release();
        self.staging.release(&mut self.allocator);
        log::debug!(
            "resource coordinator shut down, {} allocations outstanding",
            self.allocator.tracked_allocations()
        );
    }
}
