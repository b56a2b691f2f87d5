//! Borrowed staging resources for one upload operation.

use crate::allocators::staging::{StagingRegion, StagingRingBuffer};
use crate::api::error::{StagingError, TransferError};
use crate::transfer::executor::CommandExecutor;

/// The staging ring and the executor that drains it.
///
/// Both are owned by the coordinator; uploads borrow them together.
pub struct StagingContext<'a> {
    pub pool: &'a mut StagingRingBuffer,
    pub executor: &'a mut CommandExecutor,
}

impl<'a> StagingContext<'a> {
    pub fn new(pool: &'a mut StagingRingBuffer, executor: &'a mut CommandExecutor) -> Self {
        Self { pool, executor }
    }

    /// Reserve a staging region.
    ///
    /// Async copies still reading the ring are waited for before the ring
    /// wraps onto them.
    pub fn reserve(&mut self, size: u64, alignment: u64) -> Result<StagingRegion, TransferError> {
        if self.pool.would_wrap(size, alignment) && self.executor.in_flight_count() > 0 {
            self.executor.wait_in_flight()?;
        }
        self.pool.allocate(size, alignment).map_err(|err| {
            if let StagingError::TooLarge { size, capacity } = err {
                crate::gs_emit!(GS201, "{} bytes requested, ring holds {}", size, capacity);
            }
            TransferError::from(err)
        })
    }

    /// Reserve a region and fill it with `data`.
    pub fn stage(&mut self, data: &[u8], alignment: u64) -> Result<StagingRegion, TransferError> {
        let region = self.reserve(data.len() as u64, alignment)?;
        self.pool.write(&region, data)?;
        Ok(region)
    }

    /// Wait for in-flight copies, then reclaim the whole ring.
    pub fn reset_pool(&mut self) -> Result<(), TransferError> {
        self.executor.wait_in_flight()?;
        self.pool.reset();
        Ok(())
    }
}
