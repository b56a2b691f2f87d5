//! Command executor and async transfer tokens.
//!
//! Copies are recorded into one-shot command buffers from a pool on the
//! transfer queue family (graphics when the device has no dedicated transfer
//! family) and submitted with a fence.
//!
//! Token states:
//!
//! ```text
//! Allocated -> Submitted -> Pending <-> (polled) -> Complete -> Freed
//! ```
//!
//! There is no transition back from `Complete`. `Allocated` covers the
//! window inside submission, between command buffer allocation and the
//! queue submit; a failure there is rolled back and no token is returned,
//! so every token a caller holds starts at `Submitted`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::gpu::{
    BufferCopy, DeviceError, QueueBackend, QueueFamilies, QueueKind, RawBuffer, RawCommandBuffer, RawCommandPool,
    RawFence,
};

/// Unique identifier for an async transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(u64);

impl TransferId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Id of tokens that never touched the device.
    pub const NONE: TransferId = TransferId(0);

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// State of an async transfer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Command buffer allocated, not yet submitted. Only passed through
    /// while a copy is being submitted; tokens are handed out afterwards.
    Allocated,
    /// Submitted, never polled.
    Submitted,
    /// Polled at least once and not yet complete.
    Pending,
    /// Fence signaled.
    Complete,
    /// Command buffer and fence returned.
    Freed,
}

#[derive(Debug, Clone, Copy)]
struct SubmittedCopy {
    command_buffer: RawCommandBuffer,
    fence: RawFence,
    pool: RawCommandPool,
}

/// A copy released by dropping its token instead of freeing it.
struct RetiredTransfer {
    id: TransferId,
    copy: SubmittedCopy,
}

/// Lock-free queue of dropped tokens awaiting release.
#[derive(Default)]
struct RetireQueue {
    queue: SegQueue<RetiredTransfer>,
}

/// A pollable, waitable handle to a submitted copy.
///
/// Return it with [`CommandExecutor::free_async_transfer`]. A token dropped
/// before that is queued and released by
/// [`CommandExecutor::collect_retired`].
pub struct AsyncTransfer {
    id: TransferId,
    copy: Option<SubmittedCopy>,
    state: TransferState,
    bytes: u64,
    retire: Option<Arc<RetireQueue>>,
}

impl AsyncTransfer {
    /// A token for a copy that finished synchronously.
    pub fn completed(bytes: u64) -> Self {
        Self {
            id: TransferId::NONE,
            copy: None,
            state: TransferState::Complete,
            bytes,
            retire: None,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Bytes copied by this transfer.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Whether the token still holds a command buffer and fence.
    pub fn holds_device_objects(&self) -> bool {
        self.copy.is_some()
    }
}

impl std::fmt::Debug for AsyncTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTransfer")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for AsyncTransfer {
    fn drop(&mut self) {
        if let (Some(copy), Some(retire)) = (self.copy.take(), self.retire.as_ref()) {
            crate::gs_emit!(GS302, "transfer {}", self.id.0);
            retire.queue.push(RetiredTransfer { id: self.id, copy });
        }
    }
}

/// Queue selection: dedicated transfer family when present, graphics
/// otherwise.
#[derive(Debug, Clone, Copy)]
pub struct QueueManager {
    families: QueueFamilies,
}

impl QueueManager {
    pub fn new(families: QueueFamilies) -> Self {
        Self { families }
    }

    /// Family used for staged copies.
    pub fn transfer_family(&self) -> u32 {
        self.families.family_for(QueueKind::Transfer)
    }

    pub fn graphics_family(&self) -> u32 {
        self.families.graphics
    }

    pub fn uses_dedicated_transfer_queue(&self) -> bool {
        self.families.has_dedicated_transfer
    }

    pub fn families(&self) -> &QueueFamilies {
        &self.families
    }
}

/// Records and submits buffer copies.
pub struct CommandExecutor {
    queues: Arc<dyn QueueBackend>,
    manager: QueueManager,
    transfer_pool: RawCommandPool,
    /// Async copies reading from the staging ring, not yet known complete.
    in_flight: Vec<(TransferId, RawFence)>,
    retired: Arc<RetireQueue>,
    timeout_ns: u64,
    submissions: u64,
}

impl CommandExecutor {
    /// Create an executor with a command pool on the transfer family.
    pub fn new(queues: Arc<dyn QueueBackend>, timeout_ns: u64) -> Result<Self, DeviceError> {
        let manager = QueueManager::new(queues.queue_families());
        let transfer_pool = queues.create_command_pool(manager.transfer_family())?;

        if manager.uses_dedicated_transfer_queue() {
            log::debug!("using dedicated transfer queue family {}", manager.transfer_family());
        } else {
            log::debug!(
                "no dedicated transfer queue, copies go to graphics family {}",
                manager.graphics_family()
            );
        }

        Ok(Self {
            queues,
            manager,
            transfer_pool,
            in_flight: Vec::new(),
            retired: Arc::new(RetireQueue::default()),
            timeout_ns,
            submissions: 0,
        })
    }

    pub fn uses_dedicated_transfer_queue(&self) -> bool {
        self.manager.uses_dedicated_transfer_queue()
    }

    pub fn queue_manager(&self) -> &QueueManager {
        &self.manager
    }

    /// Record and submit one copy. The returned copy owns its command buffer
    /// and fence.
    fn submit_copy(&mut self, src: RawBuffer, dst: RawBuffer, regions: &[BufferCopy]) -> Result<SubmittedCopy, DeviceError> {
        let pool = self.transfer_pool;
        let command_buffer = self.queues.allocate_command_buffer(pool)?;

        // Allocated: undo on any failure before the submit lands.
        let fence = match self
            .queues
            .record_copy(command_buffer, src, dst, regions)
            .and_then(|_| self.queues.create_fence())
        {
            Ok(fence) => fence,
            Err(err) => {
                self.queues.free_command_buffer(pool, command_buffer);
                return Err(err);
            }
        };

        if let Err(err) = self.queues.submit(self.manager.transfer_family(), command_buffer, fence) {
            self.queues.destroy_fence(fence);
            self.queues.free_command_buffer(pool, command_buffer);
            return Err(err);
        }

        self.submissions += 1;
        Ok(SubmittedCopy {
            command_buffer,
            fence,
            pool,
        })
    }

    fn release_copy(&self, copy: SubmittedCopy) {
        self.queues.destroy_fence(copy.fence);
        self.queues.free_command_buffer(copy.pool, copy.command_buffer);
    }

    /// Copy and block until the device finishes.
    pub fn copy_buffer_to_buffer(&mut self, src: RawBuffer, dst: RawBuffer, regions: &[BufferCopy]) -> Result<(), DeviceError> {
        let copy = self.submit_copy(src, dst, regions)?;
        match self.queues.wait_for_fence(copy.fence, self.timeout_ns) {
            Ok(()) => {
                self.release_copy(copy);
                Ok(())
            }
            Err(err) => {
                // Still executing: hand it to the retire queue rather than
                // freeing a command buffer in use.
                self.retired.queue.push(RetiredTransfer {
                    id: TransferId::new(),
                    copy,
                });
                Err(err)
            }
        }
    }

    /// Copy without waiting.
    ///
    /// With `track_in_flight`, the copy is waited on by
    /// [`wait_in_flight`](Self::wait_in_flight) before its source is reused.
    pub fn copy_buffer_to_buffer_async(
        &mut self,
        src: RawBuffer,
        dst: RawBuffer,
        regions: &[BufferCopy],
        track_in_flight: bool,
    ) -> Result<AsyncTransfer, DeviceError> {
        let copy = self.submit_copy(src, dst, regions)?;
        let id = TransferId::new();
        if track_in_flight {
            self.in_flight.push((id, copy.fence));
        }
        log::trace!("async transfer {} submitted", id.0);
        Ok(AsyncTransfer {
            id,
            copy: Some(copy),
            state: TransferState::Submitted,
            bytes: regions.iter().map(|r| r.size).sum(),
            retire: Some(Arc::clone(&self.retired)),
        })
    }

    /// Non-blocking completion check.
    pub fn is_transfer_complete(&mut self, token: &mut AsyncTransfer) -> Result<bool, DeviceError> {
        match token.state {
            TransferState::Complete | TransferState::Freed => Ok(true),
            TransferState::Allocated => Ok(false),
            TransferState::Submitted | TransferState::Pending => {
                let Some(copy) = token.copy else {
                    token.state = TransferState::Complete;
                    return Ok(true);
                };
                if self.queues.fence_status(copy.fence)? {
                    self.mark_complete(token);
                    Ok(true)
                } else {
                    token.state = TransferState::Pending;
                    Ok(false)
                }
            }
        }
    }

    /// Block until the transfer completes.
    pub fn wait_for_transfer(&mut self, token: &mut AsyncTransfer) -> Result<(), DeviceError> {
        if matches!(token.state, TransferState::Complete | TransferState::Freed) {
            return Ok(());
        }
        if let Some(copy) = token.copy {
            self.queues.wait_for_fence(copy.fence, self.timeout_ns)?;
        }
        self.mark_complete(token);
        Ok(())
    }

    fn mark_complete(&mut self, token: &mut AsyncTransfer) {
        token.state = TransferState::Complete;
        self.in_flight.retain(|(id, _)| *id != token.id);
    }

    /// Return the token's command buffer and fence, waiting first if the
    /// copy is still running. Freeing twice is a no-op.
    pub fn free_async_transfer(&mut self, token: &mut AsyncTransfer) -> Result<(), DeviceError> {
        if token.state == TransferState::Freed {
            return Ok(());
        }
        self.wait_for_transfer(token)?;
        if let Some(copy) = token.copy.take() {
            self.release_copy(copy);
        }
        token.state = TransferState::Freed;
        Ok(())
    }

    /// Wait for every tracked async copy.
    pub fn wait_in_flight(&mut self) -> Result<(), DeviceError> {
        if self.in_flight.is_empty() {
            return Ok(());
        }
        log::debug!("waiting for {} in-flight transfers", self.in_flight.len());
        while let Some(&(_, fence)) = self.in_flight.last() {
            self.queues.wait_for_fence(fence, self.timeout_ns)?;
            self.in_flight.pop();
        }
        Ok(())
    }

    /// Tracked async copies not yet known complete.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Release copies whose tokens were dropped. Returns how many.
    pub fn collect_retired(&mut self) -> usize {
        let mut collected = 0;
        while let Some(retired) = self.retired.queue.pop() {
            if let Err(err) = self.queues.wait_for_fence(retired.copy.fence, self.timeout_ns) {
                log::warn!("retired transfer {} wait failed: {}", retired.id.0, err);
            }
            self.in_flight.retain(|(id, _)| *id != retired.id);
            self.release_copy(retired.copy);
            collected += 1;
        }
        collected
    }

    /// Queue submissions so far.
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    /// Release retired copies and the command pool.
    pub fn destroy(mut self) {
        self.release();
    }

    /// Release in place. The executor must not be used afterwards.
    pub(crate) fn release(&mut self) {
        self.collect_retired();
        self.in_flight.clear();
        if !self.transfer_pool.is_null() {
            self.queues.destroy_command_pool(self.transfer_pool);
            self.transfer_pool = RawCommandPool::NULL;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::factory;
    use crate::allocators::memory::MemoryAllocator;
    use crate::api::handle::ResourceHandle;
    use crate::gpu::{BufferUsage, DummyDevice, MemoryPropertyFlags};

    struct Fixture {
        device: Arc<DummyDevice>,
        allocator: MemoryAllocator,
        executor: CommandExecutor,
        src: ResourceHandle,
        dst: ResourceHandle,
    }

    fn fixture(device: DummyDevice) -> Fixture {
        let device = Arc::new(device);
        let mut allocator = MemoryAllocator::new(device.clone(), 0.8);
        let executor = CommandExecutor::new(device.clone(), u64::MAX).unwrap();
        let mut src = factory::create_mapped_buffer(&mut allocator, 64, BufferUsage::TRANSFER_SRC).unwrap();
        src.write_mapped(0, &[3; 64]).unwrap();
        let dst = factory::create_buffer(
            &mut allocator,
            64,
            BufferUsage::TRANSFER_DST,
            MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();
        Fixture {
            device,
            allocator,
            executor,
            src,
            dst,
        }
    }

    impl Fixture {
        fn region(&self) -> (RawBuffer, RawBuffer, [BufferCopy; 1]) {
            (
                self.src.buffer().unwrap(),
                self.dst.buffer().unwrap(),
                [BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: 64,
                }],
            )
        }

        fn finish(mut self) {
            self.executor.destroy();
            factory::destroy_resource(&mut self.allocator, self.src);
            factory::destroy_resource(&mut self.allocator, self.dst);
        }
    }

    #[test]
    fn test_queue_selection() {
        let fx = fixture(DummyDevice::new());
        assert!(fx.executor.uses_dedicated_transfer_queue());
        assert_eq!(fx.executor.queue_manager().transfer_family(), 2);
        fx.finish();

        let fx = fixture(DummyDevice::without_transfer_queue());
        assert!(!fx.executor.uses_dedicated_transfer_queue());
        assert_eq!(fx.executor.queue_manager().transfer_family(), 0);
        fx.finish();
    }

    #[test]
    fn test_sync_copy() {
        let mut fx = fixture(DummyDevice::new());
        let (src, dst, regions) = fx.region();
        fx.executor.copy_buffer_to_buffer(src, dst, &regions).unwrap();
        assert_eq!(fx.device.read_buffer(dst).unwrap(), vec![3; 64]);
        assert_eq!(fx.device.live_fences(), 0);
        assert_eq!(fx.device.live_command_buffers(), 0);
        fx.finish();
    }

    #[test]
    fn test_token_state_machine() {
        let mut fx = fixture(DummyDevice::new());
        fx.device.set_deferred_completion(true);
        let (src, dst, regions) = fx.region();

        let mut token = fx.executor.copy_buffer_to_buffer_async(src, dst, &regions, true).unwrap();
        assert_eq!(token.state(), TransferState::Submitted);
        assert_eq!(token.bytes(), 64);
        assert_eq!(fx.executor.in_flight_count(), 1);

        assert!(!fx.executor.is_transfer_complete(&mut token).unwrap());
        assert_eq!(token.state(), TransferState::Pending);
        assert!(!fx.executor.is_transfer_complete(&mut token).unwrap());
        assert_eq!(token.state(), TransferState::Pending);

        fx.device.complete_pending();
        assert!(fx.executor.is_transfer_complete(&mut token).unwrap());
        assert_eq!(token.state(), TransferState::Complete);
        assert_eq!(fx.executor.in_flight_count(), 0);
        assert_eq!(fx.device.read_buffer(dst).unwrap(), vec![3; 64]);

        fx.executor.free_async_transfer(&mut token).unwrap();
        assert_eq!(token.state(), TransferState::Freed);
        assert!(!token.holds_device_objects());
        assert!(fx.executor.is_transfer_complete(&mut token).unwrap());
        assert_eq!(fx.device.live_fences(), 0);

        // Double free is harmless.
        fx.executor.free_async_transfer(&mut token).unwrap();
        fx.finish();
    }

    #[test]
    fn test_failed_recording_hands_out_no_token() {
        let mut fx = fixture(DummyDevice::new());
        let (src, dst, _) = fx.region();
        let oversized = [BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: 4096,
        }];

        assert!(fx.executor.copy_buffer_to_buffer_async(src, dst, &oversized, true).is_err());
        assert_eq!(fx.executor.in_flight_count(), 0);
        assert_eq!(fx.device.live_command_buffers(), 0);
        assert_eq!(fx.device.live_fences(), 0);
        assert_eq!(fx.device.submissions(), 0);
        fx.finish();
    }

    #[test]
    fn test_free_waits_for_pending() {
        let mut fx = fixture(DummyDevice::new());
        fx.device.set_deferred_completion(true);
        let (src, dst, regions) = fx.region();

        let mut token = fx.executor.copy_buffer_to_buffer_async(src, dst, &regions, false).unwrap();
        fx.executor.free_async_transfer(&mut token).unwrap();
        assert_eq!(fx.device.read_buffer(dst).unwrap(), vec![3; 64]);
        fx.finish();
    }

    #[test]
    fn test_dropped_token_is_retired() {
        let mut fx = fixture(DummyDevice::new());
        fx.device.set_deferred_completion(true);
        let (src, dst, regions) = fx.region();

        let token = fx.executor.copy_buffer_to_buffer_async(src, dst, &regions, true).unwrap();
        drop(token);
        assert_eq!(fx.device.live_fences(), 1);

        assert_eq!(fx.executor.collect_retired(), 1);
        assert_eq!(fx.device.live_fences(), 0);
        assert_eq!(fx.executor.in_flight_count(), 0);
        assert_eq!(fx.device.read_buffer(dst).unwrap(), vec![3; 64]);
        fx.finish();
    }

    #[test]
    fn test_wait_in_flight() {
        let mut fx = fixture(DummyDevice::new());
        fx.device.set_deferred_completion(true);
        let (src, dst, regions) = fx.region();

        let mut a = fx.executor.copy_buffer_to_buffer_async(src, dst, &regions, true).unwrap();
        let mut b = fx.executor.copy_buffer_to_buffer_async(src, dst, &regions, true).unwrap();
        fx.executor.wait_in_flight().unwrap();
        assert_eq!(fx.executor.in_flight_count(), 0);
        assert!(fx.executor.is_transfer_complete(&mut a).unwrap());
        assert!(fx.executor.is_transfer_complete(&mut b).unwrap());

        fx.executor.free_async_transfer(&mut a).unwrap();
        fx.executor.free_async_transfer(&mut b).unwrap();
        fx.finish();
    }

    #[test]
    fn test_completed_token() {
        let mut fx = fixture(DummyDevice::new());
        let mut token = AsyncTransfer::completed(16);
        assert_eq!(token.id(), TransferId::NONE);
        assert!(fx.executor.is_transfer_complete(&mut token).unwrap());
        fx.executor.free_async_transfer(&mut token).unwrap();
        fx.finish();
    }
}
