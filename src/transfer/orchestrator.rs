//! Transfer orchestration.
//!
//! Picks the cheapest path per copy:
//!
//! | Destination        | Path                                      |
//! |--------------------|-------------------------------------------|
//! | persistently mapped | direct write into the mapping            |
//! | device-local       | stage into the ring, copy on the device   |
//!
//! Async requests on the staged path return a pollable token.

use crate::allocators::registry::BufferRegistry;
use crate::api::error::TransferError;
use crate::api::handle::ResourceHandle;
use crate::api::stats::TransferStats;
use crate::gpu::{BufferCopy, RawBuffer};
use crate::transfer::context::StagingContext;
use crate::transfer::executor::AsyncTransfer;

/// One entry of a batched upload.
#[derive(Debug)]
pub struct TransferRequest<'a> {
    pub dst: &'a mut ResourceHandle,
    pub data: &'a [u8],
    pub offset: u64,
}

impl<'a> TransferRequest<'a> {
    pub fn new(dst: &'a mut ResourceHandle, data: &'a [u8], offset: u64) -> Self {
        Self { dst, data, offset }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Path {
    Direct,
    Staged,
}

/// Dispatches copies and keeps transfer statistics.
#[derive(Debug)]
pub struct TransferOrchestrator {
    stats: TransferStats,
    staging_alignment: u64,
    allow_async: bool,
}

impl TransferOrchestrator {
    pub fn new(staging_alignment: u64, allow_async: bool) -> Self {
        Self {
            stats: TransferStats::default(),
            staging_alignment,
            allow_async,
        }
    }

    fn validate(dst: &ResourceHandle, data: &[u8], offset: u64) -> Result<RawBuffer, TransferError> {
        let buffer = dst.buffer().ok_or(TransferError::InvalidDestination)?;
        if data.is_empty() {
            return Err(TransferError::EmptyData);
        }
        let size = data.len() as u64;
        if offset.checked_add(size).map_or(true, |end| end > dst.size()) {
            return Err(TransferError::OutOfBounds {
                offset,
                size,
                capacity: dst.size(),
            });
        }
        Ok(buffer)
    }

    /// Validate and perform one synchronous copy, counting its path.
    fn transfer_one(
        &mut self,
        ctx: &mut StagingContext<'_>,
        dst: &mut ResourceHandle,
        data: &[u8],
        offset: u64,
    ) -> Result<Path, TransferError> {
        let buffer = Self::validate(dst, data, offset)?;

        if dst.mapped_ptr().is_some() {
            dst.write_mapped(offset, data)?;
            self.stats.direct_transfers += 1;
            return Ok(Path::Direct);
        }

        let region = ctx.stage(data, self.staging_alignment)?;
        let copy = BufferCopy {
            src_offset: region.offset,
            dst_offset: offset,
            size: region.size,
        };
        ctx.executor.copy_buffer_to_buffer(region.buffer, buffer, &[copy])?;
        self.stats.staged_transfers += 1;
        Ok(Path::Staged)
    }

    /// Copy `data` into `dst` at `offset` and wait for completion.
    pub fn copy_to_buffer(
        &mut self,
        ctx: &mut StagingContext<'_>,
        dst: &mut ResourceHandle,
        data: &[u8],
        offset: u64,
    ) -> Result<(), TransferError> {
        match self.transfer_one(ctx, dst, data, offset) {
            Ok(path) => {
                log::trace!("copy_to_buffer: {} bytes via {:?}", data.len(), path);
                self.stats.total_transfers += 1;
                self.stats.total_bytes_transferred += data.len() as u64;
                Ok(())
            }
            Err(err) => {
                self.stats.failed_transfers += 1;
                Err(err)
            }
        }
    }

    /// Copy without waiting on the staged path.
    ///
    /// Mapped destinations are written immediately and return an
    /// already-complete token. With async transfers disabled the staged copy
    /// is synchronous as well.
    pub fn copy_to_buffer_async(
        &mut self,
        ctx: &mut StagingContext<'_>,
        dst: &mut ResourceHandle,
        data: &[u8],
        offset: u64,
    ) -> Result<AsyncTransfer, TransferError> {
        let len = data.len() as u64;
        if dst.mapped_ptr().is_some() || !self.allow_async {
            self.copy_to_buffer(ctx, dst, data, offset)?;
            return Ok(AsyncTransfer::completed(len));
        }

        let result = Self::validate(dst, data, offset).and_then(|buffer| {
            let region = ctx.stage(data, self.staging_alignment)?;
            let copy = BufferCopy {
                src_offset: region.offset,
                dst_offset: offset,
                size: region.size,
            };
            Ok(ctx
                .executor
                .copy_buffer_to_buffer_async(region.buffer, buffer, &[copy], true)?)
        });

        match result {
            Ok(token) => {
                self.stats.total_transfers += 1;
                self.stats.async_transfers += 1;
                self.stats.staged_transfers += 1;
                self.stats.total_bytes_transferred += len;
                Ok(token)
            }
            Err(err) => {
                self.stats.failed_transfers += 1;
                Err(err)
            }
        }
    }

    /// Run every request, continuing past failures.
    ///
    /// Succeeds only if every entry succeeded. Bytes of the successful
    /// entries are recorded once, after the whole batch.
    pub fn execute_batch(
        &mut self,
        ctx: &mut StagingContext<'_>,
        batch: &mut [TransferRequest<'_>],
    ) -> Result<(), TransferError> {
        self.stats.batch_transfers += 1;

        let mut failed = 0;
        let mut bytes = 0;
        for request in batch.iter_mut() {
            match self.transfer_one(ctx, request.dst, request.data, request.offset) {
                Ok(_) => {
                    self.stats.total_transfers += 1;
                    bytes += request.data.len() as u64;
                }
                Err(err) => {
                    log::debug!("batch entry failed: {}", err);
                    self.stats.failed_transfers += 1;
                    failed += 1;
                }
            }
        }
        self.stats.total_bytes_transferred += bytes;

        if failed > 0 {
            crate::gs_emit!(GS304, "{} of {} failed", failed, batch.len());
            return Err(TransferError::PartialBatch {
                failed,
                attempted: batch.len(),
            });
        }
        Ok(())
    }

    /// Flush every registered buffer with staged data. Returns how many
    /// flushed.
    pub fn flush_all_buffers(
        &mut self,
        ctx: &mut StagingContext<'_>,
        registry: &mut BufferRegistry,
    ) -> Result<usize, TransferError> {
        let pending = registry.open_batch_ids();
        let attempted = pending.len();
        let mut flushed = 0;
        let mut failed = 0;

        for id in pending {
            let Some(buffer) = registry.get_mut(id) else {
                continue;
            };
            let bytes = buffer.staging_bytes_written();
            match buffer.flush_to_gpu(ctx, buffer.upload_target()) {
                Ok(true) => {
                    flushed += 1;
                    self.stats.total_transfers += 1;
                    self.stats.staged_transfers += 1;
                    self.stats.total_bytes_transferred += bytes;
                }
                Ok(false) => {}
                Err(err) => {
                    log::warn!("flush of buffer {} failed: {}", id.raw_index(), err);
                    self.stats.failed_transfers += 1;
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(TransferError::PartialBatch { failed, attempted });
        }
        Ok(flushed)
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// Zero all transfer counters.
    pub fn reset_stats(&mut self) {
        self.stats = TransferStats::default();
    }

    pub fn allow_async(&self) -> bool {
        self.allow_async
    }
}
