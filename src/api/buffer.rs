//! GPU buffers with batched uploads.
//!
//! A [`GpuBuffer`] pairs a device resource with an upload batch. Writes to a
//! host-visible buffer go straight into its mapping. Writes to a
//! device-local buffer are staged in the ring, one region per append, and
//! uploaded together by one submission in [`GpuBuffer::flush_to_gpu`].
//!
//! Appends are laid out in the destination relative to the batch base
//! (the buffer's upload offset, 0 unless set), each aligned like the
//! staging region it came from. Other buffers may stage in between, so the
//! regions of one batch need not be adjacent in the ring.
//!
//! When an append wraps the ring onto a pending region, the regions staged
//! so far are uploaded first and the batch is anchored at its base. The
//! final flush must then target that same base; any other offset is
//! rejected.

use crate::allocators::factory;
use crate::allocators::memory::MemoryAllocator;
use crate::api::error::{StagingError, TransferError};
use crate::api::handle::ResourceHandle;
use crate::gpu::BufferCopy;
use crate::transfer::context::StagingContext;
use crate::util::layout::{align_up, normalize_alignment};

/// One append waiting for upload.
#[derive(Debug, Clone, Copy)]
struct PendingCopy {
    src_offset: u64,
    /// Offset from the batch base in the destination.
    dst_offset: u64,
    size: u64,
    wraps: u64,
    epoch: u64,
}

/// A device buffer with a staged upload batch.
#[derive(Debug)]
pub struct GpuBuffer {
    storage: ResourceHandle,
    buffer_size: u64,
    is_device_local: bool,
    pending: Vec<PendingCopy>,
    /// Destination extent of the current batch, padding included.
    batch_len: u64,
    /// Base chosen by an early upload; later flushes must match it.
    anchor: Option<u64>,
    /// Default batch base for frame flushes.
    upload_offset: u64,
    /// Next write offset in the mapping (host-visible path).
    write_cursor: u64,
}

impl GpuBuffer {
    /// Wrap a resource. Unmapped storage uses the staged path.
    pub fn new(storage: ResourceHandle) -> Self {
        let buffer_size = storage.size();
        let is_device_local = storage.mapped_ptr().is_none();
        Self {
            storage,
            buffer_size,
            is_device_local,
            pending: Vec::new(),
            batch_len: 0,
            anchor: None,
            upload_offset: 0,
            write_cursor: 0,
        }
    }

    /// Append `data`.
    ///
    /// Returns where the bytes were placed: the mapping offset for
    /// host-visible buffers, the staging ring offset for device-local ones.
    pub fn add_data(
        &mut self,
        ctx: &mut StagingContext<'_>,
        data: &[u8],
        alignment: u64,
    ) -> Result<u64, TransferError> {
        if !self.storage.is_valid() {
            return Err(TransferError::NoStorage);
        }
        if data.is_empty() {
            return Err(TransferError::EmptyData);
        }
        let alignment = normalize_alignment(alignment).ok_or(StagingError::InvalidAlignment(alignment))?;
        let len = data.len() as u64;

        if !self.is_device_local {
            let offset = align_up(self.write_cursor, alignment);
            self.storage.write_mapped(offset, data)?;
            self.write_cursor = offset + len;
            return Ok(offset);
        }

        // Reject before staging so an oversized batch never gets stuck.
        let relative = align_up(self.batch_len, alignment);
        let base = self.upload_target();
        if base
            .checked_add(relative)
            .and_then(|start| start.checked_add(len))
            .map_or(true, |end| end > self.buffer_size)
        {
            return Err(TransferError::OutOfBounds {
                offset: base.saturating_add(relative),
                size: len,
                capacity: self.buffer_size,
            });
        }
        self.check_pending_live(ctx)?;

        let region = ctx.reserve(len, alignment)?;

        let overwrites_pending = self
            .pending
            .iter()
            .any(|p| p.epoch != region.epoch || p.wraps != region.wrap_count);
        if overwrites_pending {
            log::debug!(
                "staging wrap splits upload batch: uploading {} bytes early",
                self.staging_bytes_written()
            );
            self.upload_pending(ctx, base)?;
            self.anchor = Some(base);
        }

        ctx.pool.write(&region, data)?;

        self.pending.push(PendingCopy {
            src_offset: region.offset,
            dst_offset: relative,
            size: len,
            wraps: region.wrap_count,
            epoch: region.epoch,
        });
        self.batch_len = relative + len;
        Ok(region.offset)
    }

    /// Upload the pending batch with its base at `dst_offset`.
    ///
    /// Returns `Ok(false)` without touching the device when there is nothing
    /// left to upload; a batch that an early upload fully placed is closed.
    ///
    /// If a wrap already uploaded part of this batch, `dst_offset` must equal
    /// that base or the flush fails with
    /// [`TransferError::UploadOffsetMismatch`] and the batch is kept.
    pub fn flush_to_gpu(&mut self, ctx: &mut StagingContext<'_>, dst_offset: u64) -> Result<bool, TransferError> {
        if !(self.is_device_local && self.has_open_batch()) {
            return Ok(false);
        }
        if let Some(anchor) = self.anchor {
            if anchor != dst_offset {
                crate::gs_emit!(GS303, "requested {}, batch anchored at {}", dst_offset, anchor);
                return Err(TransferError::UploadOffsetMismatch {
                    requested: dst_offset,
                    anchored: anchor,
                });
            }
        }
        if dst_offset
            .checked_add(self.batch_len)
            .map_or(true, |end| end > self.buffer_size)
        {
            return Err(TransferError::OutOfBounds {
                offset: dst_offset,
                size: self.batch_len,
                capacity: self.buffer_size,
            });
        }
        self.check_pending_live(ctx)?;

        // Everything already went out with an early upload.
        if !self.has_pending_data() {
            self.discard_batch();
            return Ok(false);
        }
        self.upload_pending(ctx, dst_offset)?;
        self.discard_batch();
        Ok(true)
    }

    /// Upload pending regions early so a coming wrap cannot overwrite them.
    ///
    /// The batch stays open and is anchored at its base.
    pub(crate) fn spill(&mut self, ctx: &mut StagingContext<'_>) -> Result<bool, TransferError> {
        if !(self.is_device_local && self.has_pending_data()) {
            return Ok(false);
        }
        self.check_pending_live(ctx)?;
        let base = self.upload_target();
        self.upload_pending(ctx, base)?;
        self.anchor = Some(base);
        Ok(true)
    }

    /// Submit every pending region in one copy and clear them.
    fn upload_pending(&mut self, ctx: &mut StagingContext<'_>, base: u64) -> Result<(), TransferError> {
        let dst = self.storage.buffer().ok_or(TransferError::NoStorage)?;
        let regions: Vec<BufferCopy> = self
            .pending
            .iter()
            .map(|p| BufferCopy {
                src_offset: p.src_offset,
                dst_offset: base + p.dst_offset,
                size: p.size,
            })
            .collect();
        let src = ctx.pool.buffer();
        ctx.executor.copy_buffer_to_buffer(src, dst, &regions)?;

        log::trace!(
            "uploaded {} staged regions ({} bytes) at base {}",
            regions.len(),
            self.staging_bytes_written(),
            base
        );
        self.pending.clear();
        Ok(())
    }

    fn check_pending_live(&mut self, ctx: &StagingContext<'_>) -> Result<(), TransferError> {
        let stale = self
            .pending
            .iter()
            .find(|p| !ctx.pool.is_span_live(p.src_offset, p.wraps, p.epoch))
            .copied();
        if let Some(region) = stale {
            crate::gs_emit!(
                GS204,
                "{} bytes at staging offset {}",
                self.staging_bytes_written(),
                region.src_offset
            );
            self.discard_batch();
            return Err(TransferError::StaleStaging);
        }
        Ok(())
    }

    fn discard_batch(&mut self) {
        self.pending.clear();
        self.batch_len = 0;
        self.anchor = None;
    }

    /// Staged bytes await a flush.
    pub fn has_pending_data(&self) -> bool {
        !self.pending.is_empty()
    }

    /// A batch is in progress, possibly already partly uploaded.
    pub fn has_open_batch(&self) -> bool {
        self.batch_len > 0
    }

    /// Base the next flush of this batch will use when the caller has no
    /// placement of its own.
    pub fn upload_target(&self) -> u64 {
        self.anchor.unwrap_or(self.upload_offset)
    }

    /// Set the default batch base used by frame flushes. A batch already
    /// anchored by an early upload keeps its base.
    pub fn set_upload_offset(&mut self, offset: u64) {
        self.upload_offset = offset;
    }

    pub fn upload_offset(&self) -> u64 {
        self.upload_offset
    }

    /// Rewind the mapping cursor of a host-visible buffer to offset 0.
    pub fn reset_cursor(&mut self) {
        self.write_cursor = 0;
    }

    /// Release the storage. The buffer is unusable afterwards.
    pub fn cleanup(&mut self, allocator: &mut MemoryAllocator) {
        let storage = std::mem::take(&mut self.storage);
        factory::destroy_resource(allocator, storage);
        self.discard_batch();
    }

    pub fn storage(&self) -> &ResourceHandle {
        &self.storage
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    pub fn is_device_local(&self) -> bool {
        self.is_device_local
    }

    pub fn needs_upload(&self) -> bool {
        self.has_pending_data()
    }

    /// Ring offset of the oldest pending region.
    pub fn staging_start_offset(&self) -> u64 {
        self.pending.first().map_or(0, |p| p.src_offset)
    }

    /// Payload bytes staged and not yet uploaded.
    pub fn staging_bytes_written(&self) -> u64 {
        self.pending.iter().map(|p| p.size).sum()
    }

    /// Destination extent of the open batch, padding included.
    pub fn batch_len(&self) -> u64 {
        self.batch_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::staging::StagingRingBuffer;
    use crate::gpu::{BufferUsage, DummyDevice, MemoryPropertyFlags};
    use crate::transfer::executor::CommandExecutor;
    use std::sync::Arc;

    struct Rig {
        device: Arc<DummyDevice>,
        allocator: MemoryAllocator,
        pool: StagingRingBuffer,
        executor: CommandExecutor,
    }

    impl Rig {
        fn new(pool_size: u64) -> Self {
            let device = Arc::new(DummyDevice::new());
            let mut allocator = MemoryAllocator::new(device.clone(), 0.8);
            let pool = StagingRingBuffer::new(&mut allocator, pool_size, 0.5).unwrap();
            let executor = CommandExecutor::new(device.clone(), u64::MAX).unwrap();
            Self {
                device,
                allocator,
                pool,
                executor,
            }
        }

        fn ctx(&mut self) -> StagingContext<'_> {
            StagingContext::new(&mut self.pool, &mut self.executor)
        }

        fn device_local(&mut self, size: u64) -> GpuBuffer {
            let storage = factory::create_buffer(
                &mut self.allocator,
                size,
                BufferUsage::TRANSFER_DST,
                MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .unwrap();
            GpuBuffer::new(storage)
        }

        fn contents(&self, buffer: &GpuBuffer) -> Vec<u8> {
            self.device.read_buffer(buffer.storage().buffer().unwrap()).unwrap()
        }

        fn finish(mut self, mut buffers: Vec<GpuBuffer>) {
            for buffer in &mut buffers {
                buffer.cleanup(&mut self.allocator);
            }
            self.executor.destroy();
            self.pool.destroy(&mut self.allocator);
        }
    }

    #[test]
    fn test_batched_upload() {
        let mut rig = Rig::new(1024);
        let mut buffer = rig.device_local(64);

        let mut ctx = rig.ctx();
        assert_eq!(buffer.add_data(&mut ctx, &[1; 8], 4).unwrap(), 0);
        assert_eq!(buffer.add_data(&mut ctx, &[2; 8], 4).unwrap(), 8);
        assert!(buffer.has_pending_data());
        assert_eq!(buffer.staging_bytes_written(), 16);

        assert!(buffer.flush_to_gpu(&mut ctx, 0).unwrap());
        assert!(!buffer.has_pending_data());
        assert_eq!(rig.device.submissions(), 1);

        let contents = rig.contents(&buffer);
        assert_eq!(&contents[..8], &[1; 8]);
        assert_eq!(&contents[8..16], &[2; 8]);
        rig.finish(vec![buffer]);
    }

    #[test]
    fn test_flush_is_idempotent() {
        let mut rig = Rig::new(1024);
        let mut buffer = rig.device_local(64);

        let mut ctx = rig.ctx();
        assert!(!buffer.flush_to_gpu(&mut ctx, 0).unwrap());
        buffer.add_data(&mut ctx, &[7; 4], 4).unwrap();
        assert!(buffer.flush_to_gpu(&mut ctx, 0).unwrap());
        assert!(!buffer.flush_to_gpu(&mut ctx, 0).unwrap());
        assert_eq!(rig.device.submissions(), 1);
        rig.finish(vec![buffer]);
    }

    #[test]
    fn test_padding_is_part_of_span() {
        let mut rig = Rig::new(1024);
        let mut buffer = rig.device_local(64);

        let mut ctx = rig.ctx();
        buffer.add_data(&mut ctx, &[1; 3], 4).unwrap();
        assert_eq!(buffer.add_data(&mut ctx, &[2; 4], 4).unwrap(), 4);
        assert_eq!(buffer.staging_bytes_written(), 7);
        assert_eq!(buffer.batch_len(), 8);
        buffer.flush_to_gpu(&mut ctx, 0).unwrap();

        let contents = rig.contents(&buffer);
        assert_eq!(&contents[..3], &[1; 3]);
        assert_eq!(&contents[4..8], &[2; 4]);
        rig.finish(vec![buffer]);
    }

    #[test]
    fn test_wrap_flushes_pending_span_first() {
        let mut rig = Rig::new(1024);
        let mut buffer = rig.device_local(1200);

        let mut ctx = rig.ctx();
        assert_eq!(buffer.add_data(&mut ctx, &[1; 400], 16).unwrap(), 0);
        assert_eq!(buffer.add_data(&mut ctx, &[2; 400], 16).unwrap(), 400);
        assert_eq!(buffer.add_data(&mut ctx, &[3; 400], 16).unwrap(), 0);
        assert_eq!(ctx.pool.wrap_around_count(), 1);
        // The first two writes went out before the wrap overwrote them.
        assert_eq!(rig.device.submissions(), 1);

        assert_eq!(buffer.upload_target(), 0);
        assert_eq!(buffer.staging_bytes_written(), 400);

        let mut ctx = rig.ctx();
        assert!(buffer.flush_to_gpu(&mut ctx, 0).unwrap());
        assert!(!buffer.has_open_batch());
        assert_eq!(rig.device.submissions(), 2);

        let contents = rig.contents(&buffer);
        assert_eq!(&contents[..400], &[1; 400][..]);
        assert_eq!(&contents[400..800], &[2; 400][..]);
        assert_eq!(&contents[800..1200], &[3; 400][..]);
        rig.finish(vec![buffer]);
    }

    #[test]
    fn test_interleaved_appends_keep_own_bytes() {
        let mut rig = Rig::new(1024);
        let mut a = rig.device_local(64);
        let mut b = rig.device_local(64);

        let mut ctx = rig.ctx();
        assert_eq!(a.add_data(&mut ctx, &[1; 16], 16).unwrap(), 0);
        assert_eq!(b.add_data(&mut ctx, &[2; 16], 16).unwrap(), 16);
        assert_eq!(a.add_data(&mut ctx, &[3; 16], 16).unwrap(), 32);
        assert_eq!(a.staging_bytes_written(), 32);
        assert!(a.flush_to_gpu(&mut ctx, 0).unwrap());
        assert!(b.flush_to_gpu(&mut ctx, 0).unwrap());
        // One submission per buffer, however scattered its regions are.
        assert_eq!(rig.device.submissions(), 2);

        let contents = rig.contents(&a);
        assert_eq!(&contents[..16], &[1; 16]);
        assert_eq!(&contents[16..32], &[3; 16]);
        assert_eq!(&rig.contents(&b)[..16], &[2; 16]);
        rig.finish(vec![a, b]);
    }

    #[test]
    fn test_wrap_after_flush_starts_at_base() {
        let mut rig = Rig::new(1024);
        let mut buffer = rig.device_local(1024);

        let mut ctx = rig.ctx();
        buffer.add_data(&mut ctx, &[1; 600], 16).unwrap();
        assert!(buffer.flush_to_gpu(&mut ctx, buffer.upload_target()).unwrap());

        assert_eq!(buffer.add_data(&mut ctx, &[2; 600], 16).unwrap(), 0);
        assert_eq!(ctx.pool.wrap_around_count(), 1);
        assert_eq!(buffer.upload_target(), 0);
        assert!(buffer.flush_to_gpu(&mut ctx, buffer.upload_target()).unwrap());

        assert_eq!(&rig.contents(&buffer)[..600], &[2; 600][..]);
        rig.finish(vec![buffer]);
    }

    #[test]
    fn test_flush_offset_must_match_anchor() {
        let mut rig = Rig::new(1024);
        let mut buffer = rig.device_local(2048);

        let mut ctx = rig.ctx();
        buffer.add_data(&mut ctx, &[1; 600], 1).unwrap();
        buffer.add_data(&mut ctx, &[2; 600], 1).unwrap();
        assert_eq!(rig.device.submissions(), 1);

        let mut ctx = rig.ctx();
        assert_eq!(
            buffer.flush_to_gpu(&mut ctx, 512),
            Err(TransferError::UploadOffsetMismatch {
                requested: 512,
                anchored: 0
            })
        );
        assert!(buffer.has_pending_data());
        assert!(buffer.flush_to_gpu(&mut ctx, 0).unwrap());

        let contents = rig.contents(&buffer);
        assert_eq!(&contents[..600], &[1; 600][..]);
        assert_eq!(&contents[600..1200], &[2; 600][..]);
        rig.finish(vec![buffer]);
    }

    #[test]
    fn test_upload_offset_moves_batch_base() {
        let mut rig = Rig::new(1024);
        let mut buffer = rig.device_local(64);
        buffer.set_upload_offset(32);

        let mut ctx = rig.ctx();
        buffer.add_data(&mut ctx, &[4; 16], 16).unwrap();
        assert!(buffer.flush_to_gpu(&mut ctx, buffer.upload_target()).unwrap());
        assert_eq!(&rig.contents(&buffer)[32..48], &[4; 16]);

        // 32 + 48 overruns the buffer.
        let mut ctx = rig.ctx();
        assert!(matches!(
            buffer.add_data(&mut ctx, &[5; 48], 16),
            Err(TransferError::OutOfBounds { .. })
        ));
        rig.finish(vec![buffer]);
    }

    #[test]
    fn test_oversized_append_is_not_staged() {
        let mut rig = Rig::new(1024);
        let mut buffer = rig.device_local(32);

        let mut ctx = rig.ctx();
        buffer.add_data(&mut ctx, &[1; 16], 16).unwrap();
        assert!(matches!(
            buffer.add_data(&mut ctx, &[2; 32], 16),
            Err(TransferError::OutOfBounds { .. })
        ));
        assert_eq!(ctx.pool.current_offset(), 16);
        assert_eq!(buffer.staging_bytes_written(), 16);
        assert!(buffer.flush_to_gpu(&mut ctx, 0).unwrap());
        rig.finish(vec![buffer]);
    }

    #[test]
    fn test_reset_invalidates_pending_span() {
        let mut rig = Rig::new(1024);
        let mut buffer = rig.device_local(64);

        let mut ctx = rig.ctx();
        buffer.add_data(&mut ctx, &[1; 16], 16).unwrap();
        ctx.pool.reset();
        assert_eq!(buffer.flush_to_gpu(&mut ctx, 0), Err(TransferError::StaleStaging));
        assert!(!buffer.has_pending_data());
        assert_eq!(rig.device.submissions(), 0);
        rig.finish(vec![buffer]);
    }

    #[test]
    fn test_host_visible_writes_directly() {
        let mut rig = Rig::new(1024);
        let storage = factory::create_mapped_buffer(&mut rig.allocator, 64, BufferUsage::UNIFORM_BUFFER).unwrap();
        let mut buffer = GpuBuffer::new(storage);
        assert!(!buffer.is_device_local());

        let mut ctx = rig.ctx();
        assert_eq!(buffer.add_data(&mut ctx, &[5; 4], 16).unwrap(), 0);
        assert_eq!(buffer.add_data(&mut ctx, &[6; 4], 16).unwrap(), 16);
        assert!(!buffer.has_pending_data());
        assert!(!buffer.flush_to_gpu(&mut ctx, 0).unwrap());
        assert_eq!(ctx.pool.stats().allocations, 0);

        let contents = rig.contents(&buffer);
        assert_eq!(&contents[16..20], &[6; 4]);

        let mut ctx = rig.ctx();
        assert!(buffer.add_data(&mut ctx, &[0; 64], 16).is_err());
        rig.finish(vec![buffer]);
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut rig = Rig::new(1024);
        let mut buffer = rig.device_local(64);
        let mut empty = GpuBuffer::new(ResourceHandle::null());

        let mut ctx = rig.ctx();
        assert_eq!(buffer.add_data(&mut ctx, &[], 4), Err(TransferError::EmptyData));
        assert_eq!(empty.add_data(&mut ctx, &[1], 4), Err(TransferError::NoStorage));
        assert_eq!(
            buffer.add_data(&mut ctx, &[1], 3),
            Err(TransferError::Staging(StagingError::InvalidAlignment(3)))
        );
        assert!(!buffer.has_pending_data());
        rig.finish(vec![buffer]);
    }

    #[test]
    fn test_flush_out_of_bounds_keeps_data() {
        let mut rig = Rig::new(1024);
        let mut buffer = rig.device_local(32);

        let mut ctx = rig.ctx();
        buffer.add_data(&mut ctx, &[1; 16], 16).unwrap();
        assert!(matches!(
            buffer.flush_to_gpu(&mut ctx, 24),
            Err(TransferError::OutOfBounds { .. })
        ));
        assert!(buffer.has_pending_data());
        assert!(buffer.flush_to_gpu(&mut ctx, 16).unwrap());
        rig.finish(vec![buffer]);
    }
}
