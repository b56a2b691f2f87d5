//! Staging ring buffer.
//!
//! A bump allocator over one persistently mapped, host-visible buffer.
//! Allocation never frees: when a request does not fit in the tail, the
//! tail is abandoned (counted as waste) and allocation restarts at offset 0.
//! Space is reclaimed only by [`StagingRingBuffer::reset`].
//!
//! ```text
//!  0                 current_offset                 total_size
//!  |=== handed out ===|---------- free tail ----------|
//! ```
//!
//! Regions are plain values. A region is valid until the ring wraps past
//! its offset or the ring is reset; writes through
//! [`StagingRingBuffer::write`] reject regions from an older reset epoch.

use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::allocators::factory;
use crate::allocators::memory::MemoryAllocator;
use crate::api::error::{GpuError, StagingError};
use crate::api::handle::ResourceHandle;
use crate::api::stats::StagingStats;
use crate::gpu::{BufferUsage, RawBuffer};
use crate::sync::atomics::AtomicGauge;
use crate::util::layout::{align_up, normalize_alignment, padding_for};

/// Offset and waste bookkeeping of the ring, independent of any device.
#[derive(Debug, Clone, PartialEq)]
pub struct RingState {
    current_offset: u64,
    total_size: u64,
    total_wasted_bytes: u64,
    wrap_around_count: u64,
    largest_free_block: u64,
    epoch: u64,
}

impl RingState {
    /// Empty ring of `total_size` bytes.
    pub fn new(total_size: u64) -> Self {
        Self {
            current_offset: 0,
            total_size,
            total_wasted_bytes: 0,
            wrap_around_count: 0,
            largest_free_block: total_size,
            epoch: 0,
        }
    }

    /// Reserve `size` bytes at `alignment`, returning the offset.
    ///
    /// Rejected requests leave the state untouched.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<u64, StagingError> {
        let alignment = normalize_alignment(alignment).ok_or(StagingError::InvalidAlignment(alignment))?;
        if size == 0 {
            return Err(StagingError::ZeroSize);
        }
        if size > self.total_size {
            return Err(StagingError::TooLarge {
                size,
                capacity: self.total_size,
            });
        }

        let padding = padding_for(self.current_offset, alignment);
        let aligned = self.current_offset + padding;
        let offset = if aligned.checked_add(size).map_or(true, |end| end > self.total_size) {
            self.total_wasted_bytes += self.total_size - self.current_offset;
            self.wrap_around_count += 1;
            0
        } else {
            self.total_wasted_bytes += padding;
            aligned
        };

        self.current_offset = offset + size;
        self.largest_free_block = self.total_size - self.current_offset;
        Ok(offset)
    }

    /// Whether `allocate(size, alignment)` would wrap to offset 0.
    pub fn would_wrap(&self, size: u64, alignment: u64) -> bool {
        let alignment = normalize_alignment(alignment).unwrap_or(1);
        size <= self.total_size
            && align_up(self.current_offset, alignment)
                .checked_add(size)
                .map_or(true, |end| end > self.total_size)
    }

    /// Reclaim the whole ring and start a new epoch.
    pub fn reset(&mut self) {
        self.current_offset = 0;
        self.total_wasted_bytes = 0;
        self.wrap_around_count = 0;
        self.largest_free_block = self.total_size;
        self.epoch += 1;
    }

    /// Whether bytes staged from `start` in (`wraps`, `epoch`) may still be
    /// intact: no reset since, and the ring has not come back around past
    /// `start`.
    pub fn is_span_live(&self, start: u64, wraps: u64, epoch: u64) -> bool {
        if epoch != self.epoch {
            return false;
        }
        match self.wrap_around_count.checked_sub(wraps) {
            Some(0) => true,
            Some(1) => self.current_offset <= start,
            _ => false,
        }
    }

    /// Wasted bytes over ring size.
    pub fn fragmentation_ratio(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        self.total_wasted_bytes as f64 / self.total_size as f64
    }

    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn total_wasted_bytes(&self) -> u64 {
        self.total_wasted_bytes
    }

    pub fn wrap_around_count(&self) -> u64 {
        self.wrap_around_count
    }

    pub fn largest_free_block(&self) -> u64 {
        self.largest_free_block
    }

    /// Incremented by every reset.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// A view into the ring's mapped memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingRegion {
    /// The ring's buffer, the copy source.
    pub buffer: RawBuffer,
    pub offset: u64,
    pub size: u64,
    pub(crate) mapped: NonNull<u8>,
    pub(crate) epoch: u64,
    pub(crate) wrap_count: u64,
}

// SAFETY: a region is an address into the ring's persistent mapping; writes
// go through `StagingRingBuffer::write`, which requires `&mut` on the ring.
unsafe impl Send for StagingRegion {}
unsafe impl Sync for StagingRegion {}

impl StagingRegion {
    /// Address of the first byte of the region.
    pub fn mapped_ptr(&self) -> NonNull<u8> {
        self.mapped
    }
}

/// A region counted as outstanding until dropped.
///
/// Dropping frees nothing; the ring reclaims space on reset. Resetting while
/// scopes are alive logs `GS202`.
#[derive(Debug)]
pub struct StagingScope {
    region: StagingRegion,
    live: Arc<AtomicGauge>,
}

impl StagingScope {
    pub fn region(&self) -> &StagingRegion {
        &self.region
    }
}

impl Deref for StagingScope {
    type Target = StagingRegion;

    fn deref(&self) -> &StagingRegion {
        &self.region
    }
}

impl Drop for StagingScope {
    fn drop(&mut self) {
        self.live.sub(1);
    }
}

/// Ring allocator over one mapped transfer-source buffer.
pub struct StagingRingBuffer {
    resource: ResourceHandle,
    buffer: RawBuffer,
    mapped: NonNull<u8>,
    state: RingState,
    fragmentation_threshold: f64,
    live_scopes: Arc<AtomicGauge>,
    allocations: u64,
    bytes_allocated: u64,
    failed_allocations: u64,
    resets: u64,
    auto_defragmentations: u64,
}

// SAFETY: the mapping is owned by `resource` and only written through
// `&mut self`.
unsafe impl Send for StagingRingBuffer {}
unsafe impl Sync for StagingRingBuffer {}

impl StagingRingBuffer {
    /// Allocate and map a ring of `size` bytes.
    pub fn new(allocator: &mut MemoryAllocator, size: u64, fragmentation_threshold: f64) -> Result<Self, GpuError> {
        let resource = factory::create_mapped_buffer(allocator, size, BufferUsage::TRANSFER_SRC)?;
        let (Some(buffer), Some(mapped)) = (resource.buffer(), resource.mapped_ptr()) else {
            factory::destroy_resource(allocator, resource);
            return Err(GpuError::InvalidArgument("staging buffer was not mapped"));
        };

        log::debug!("staging ring created: {} bytes", size);

        Ok(Self {
            resource,
            buffer,
            mapped,
            state: RingState::new(size),
            fragmentation_threshold,
            live_scopes: Arc::new(AtomicGauge::default()),
            allocations: 0,
            bytes_allocated: 0,
            failed_allocations: 0,
            resets: 0,
            auto_defragmentations: 0,
        })
    }

    /// Reserve `size` bytes at `alignment` (0 means unaligned).
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<StagingRegion, StagingError> {
        match self.state.allocate(size, alignment) {
            Ok(offset) => {
                self.allocations += 1;
                self.bytes_allocated += size;
                log::trace!(
                    "staging allocate: {} bytes at {} (wraps {})",
                    size,
                    offset,
                    self.state.wrap_around_count()
                );
                // SAFETY: offset + size <= total_size, within the mapping.
                let mapped = unsafe { NonNull::new_unchecked(self.mapped.as_ptr().add(offset as usize)) };
                Ok(StagingRegion {
                    buffer: self.buffer,
                    offset,
                    size,
                    mapped,
                    epoch: self.state.epoch(),
                    wrap_count: self.state.wrap_around_count(),
                })
            }
            Err(err) => {
                self.failed_allocations += 1;
                Err(err)
            }
        }
    }

    /// Like [`allocate`](Self::allocate), counted as outstanding until the
    /// scope drops.
    pub fn allocate_scoped(&mut self, size: u64, alignment: u64) -> Result<StagingScope, StagingError> {
        let region = self.allocate(size, alignment)?;
        self.live_scopes.add(1);
        Ok(StagingScope {
            region,
            live: Arc::clone(&self.live_scopes),
        })
    }

    /// Copy `data` into the start of `region`.
    pub fn write(&mut self, region: &StagingRegion, data: &[u8]) -> Result<(), StagingError> {
        if region.epoch != self.state.epoch() || region.buffer != self.buffer {
            return Err(StagingError::StaleRegion);
        }
        let len = data.len() as u64;
        if len > region.size {
            return Err(StagingError::RegionOverflow { len, size: region.size });
        }
        // SAFETY: the region lies inside the mapping and `len <= size`.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), region.mapped.as_ptr(), data.len());
        }
        Ok(())
    }

    /// Reclaim the whole ring. Every outstanding region becomes invalid.
    pub fn reset(&mut self) {
        let live = self.live_scopes.get();
        if live > 0 {
            crate::gs_emit!(GS202, "{} scopes alive", live);
        }
        log::debug!(
            "staging reset: {} bytes wasted over {} wraps",
            self.state.total_wasted_bytes(),
            self.state.wrap_around_count()
        );
        self.state.reset();
        self.resets += 1;
    }

    /// Whether the waste ratio exceeds the fragmentation threshold.
    pub fn is_fragmentation_critical(&self) -> bool {
        self.state.fragmentation_ratio() > self.fragmentation_threshold
    }

    /// Reset if fragmentation is critical. Returns whether it reset.
    pub fn try_defragment(&mut self) -> bool {
        if !self.is_fragmentation_critical() {
            return false;
        }
        crate::gs_emit!(GS203, "{:.1}% wasted", self.state.fragmentation_ratio() * 100.0);
        self.reset();
        self.auto_defragmentations += 1;
        true
    }

    pub fn would_wrap(&self, size: u64, alignment: u64) -> bool {
        self.state.would_wrap(size, alignment)
    }

    pub fn is_span_live(&self, start: u64, wraps: u64, epoch: u64) -> bool {
        self.state.is_span_live(start, wraps, epoch)
    }

    pub fn fragmentation_ratio(&self) -> f64 {
        self.state.fragmentation_ratio()
    }

    /// Offset/waste bookkeeping.
    pub fn state(&self) -> &RingState {
        &self.state
    }

    /// The ring's buffer, source of every staged copy.
    pub fn buffer(&self) -> RawBuffer {
        self.buffer
    }

    pub fn total_size(&self) -> u64 {
        self.state.total_size()
    }

    pub fn current_offset(&self) -> u64 {
        self.state.current_offset()
    }

    pub fn wrap_around_count(&self) -> u64 {
        self.state.wrap_around_count()
    }

    pub fn total_wasted_bytes(&self) -> u64 {
        self.state.total_wasted_bytes()
    }

    pub fn largest_free_block(&self) -> u64 {
        self.state.largest_free_block()
    }

    /// Scopes not yet dropped.
    pub fn live_scopes(&self) -> usize {
        self.live_scopes.get()
    }

    pub fn stats(&self) -> StagingStats {
        StagingStats {
            total_size: self.state.total_size(),
            current_offset: self.state.current_offset(),
            wasted_bytes: self.state.total_wasted_bytes(),
            wrap_around_count: self.state.wrap_around_count(),
            largest_free_block: self.state.largest_free_block(),
            allocations: self.allocations,
            bytes_allocated: self.bytes_allocated,
            failed_allocations: self.failed_allocations,
            resets: self.resets,
            auto_defragmentations: self.auto_defragmentations,
        }
    }

    /// Release the ring's buffer and memory.
    pub fn destroy(mut self, allocator: &mut MemoryAllocator) {
        self.release(allocator);
    }

    /// Release in place. The ring must not be used afterwards.
    pub(crate) fn release(&mut self, allocator: &mut MemoryAllocator) {
        let resource = std::mem::take(&mut self.resource);
        if resource.is_valid() {
            factory::destroy_resource(allocator, resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DummyDevice;

    fn ring(size: u64) -> (Arc<DummyDevice>, MemoryAllocator, StagingRingBuffer) {
        let device = Arc::new(DummyDevice::new());
        let mut allocator = MemoryAllocator::new(device.clone(), 0.8);
        let pool = StagingRingBuffer::new(&mut allocator, size, 0.5).unwrap();
        (device, allocator, pool)
    }

    #[test]
    fn test_monotonic_until_wrap() {
        let mut state = RingState::new(1024);
        let mut last = None;
        for _ in 0..5 {
            let offset = state.allocate(100, 16).unwrap();
            if let Some(prev) = last {
                assert!(offset > prev);
            }
            last = Some(offset);
        }
        assert_eq!(state.wrap_around_count(), 0);
        // 100 -> 112 each time after the first
        assert_eq!(state.total_wasted_bytes(), 4 * 12);
    }

    #[test]
    fn test_wrap_accounts_tail() {
        let mut state = RingState::new(1024);
        assert_eq!(state.allocate(400, 16), Ok(0));
        assert_eq!(state.allocate(400, 16), Ok(400));
        assert!(state.would_wrap(400, 16));
        assert_eq!(state.allocate(400, 16), Ok(0));
        assert_eq!(state.wrap_around_count(), 1);
        assert_eq!(state.total_wasted_bytes(), 224);
        assert_eq!(state.current_offset(), 400);
        assert_eq!(state.largest_free_block(), 624);
    }

    #[test]
    fn test_padding_is_waste_unless_wrapping() {
        let mut state = RingState::new(256);
        assert_eq!(state.allocate(10, 1), Ok(0));
        assert_eq!(state.allocate(16, 64), Ok(64));
        assert_eq!(state.total_wasted_bytes(), 54);

        // The padding before a wrap is part of the abandoned tail, not extra.
        assert_eq!(state.allocate(200, 64), Ok(0));
        assert_eq!(state.total_wasted_bytes(), 54 + 176);
        assert_eq!(state.current_offset(), 200);
    }

    #[test]
    fn test_exact_fit_does_not_wrap() {
        let mut state = RingState::new(1024);
        assert_eq!(state.allocate(1024, 16), Ok(0));
        assert_eq!(state.wrap_around_count(), 0);
        assert_eq!(state.largest_free_block(), 0);
    }

    #[test]
    fn test_rejections_leave_state() {
        let mut state = RingState::new(1024);
        state.allocate(10, 1).unwrap();
        let before = state.clone();

        assert_eq!(state.allocate(2048, 16), Err(StagingError::TooLarge { size: 2048, capacity: 1024 }));
        assert_eq!(state.allocate(0, 16), Err(StagingError::ZeroSize));
        assert_eq!(state.allocate(16, 3), Err(StagingError::InvalidAlignment(3)));
        assert_eq!(state, before);
    }

    #[test]
    fn test_zero_alignment_is_unaligned() {
        let mut state = RingState::new(64);
        state.allocate(3, 0).unwrap();
        assert_eq!(state.allocate(3, 0), Ok(3));
        assert_eq!(state.total_wasted_bytes(), 0);
    }

    #[test]
    fn test_span_liveness() {
        let mut state = RingState::new(1024);
        let start = state.allocate(400, 16).unwrap();
        let (wraps, epoch) = (state.wrap_around_count(), state.epoch());

        state.allocate(400, 16).unwrap();
        assert!(state.is_span_live(start, wraps, epoch));

        // Wrap lands on top of the span.
        state.allocate(300, 16).unwrap();
        assert!(!state.is_span_live(start, wraps, epoch));

        let start = 512;
        let mut state = RingState::new(1024);
        state.allocate(start, 1).unwrap();
        let (wraps, epoch) = (state.wrap_around_count(), state.epoch());
        state.allocate(400, 1).unwrap();
        state.allocate(400, 1).unwrap(); // wraps, ends at 400
        assert!(state.is_span_live(start, wraps, epoch));

        state.reset();
        assert!(!state.is_span_live(start, wraps, epoch));
    }

    #[test]
    fn test_fragmentation_threshold_is_strict() {
        let (_device, mut allocator, mut pool) = ring(1000);
        // Waste exactly half: not critical.
        pool.allocate(500, 1).unwrap();
        pool.allocate(600, 1).unwrap();
        assert_eq!(pool.total_wasted_bytes(), 500);
        assert!(!pool.is_fragmentation_critical());
        assert!(!pool.try_defragment());

        // One more wrap pushes it over.
        pool.allocate(500, 1).unwrap();
        assert_eq!(pool.total_wasted_bytes(), 900);
        assert!(pool.is_fragmentation_critical());
        assert!(pool.try_defragment());
        assert_eq!(pool.current_offset(), 0);
        assert_eq!(pool.total_wasted_bytes(), 0);
        assert_eq!(pool.stats().auto_defragmentations, 1);

        pool.destroy(&mut allocator);
    }

    #[test]
    fn test_write_and_read_back() {
        let (device, mut allocator, mut pool) = ring(256);
        let region = pool.allocate(4, 16).unwrap();
        let region2 = pool.allocate(4, 16).unwrap();
        pool.write(&region, &[1, 2, 3, 4]).unwrap();
        pool.write(&region2, &[5, 6]).unwrap();

        let contents = device.read_buffer(pool.buffer()).unwrap();
        assert_eq!(&contents[0..4], &[1, 2, 3, 4]);
        assert_eq!(&contents[16..18], &[5, 6]);

        assert_eq!(
            pool.write(&region, &[0; 8]),
            Err(StagingError::RegionOverflow { len: 8, size: 4 })
        );
        pool.destroy(&mut allocator);
    }

    #[test]
    fn test_reset_invalidates_regions() {
        let (_device, mut allocator, mut pool) = ring(256);
        let region = pool.allocate(16, 16).unwrap();
        pool.reset();
        assert_eq!(pool.write(&region, &[1]), Err(StagingError::StaleRegion));
        assert_eq!(pool.stats().resets, 1);
        pool.destroy(&mut allocator);
    }

    #[test]
    fn test_scopes_are_counted() {
        let (_device, mut allocator, mut pool) = ring(256);
        let a = pool.allocate_scoped(16, 16).unwrap();
        let b = pool.allocate_scoped(16, 16).unwrap();
        assert_eq!(pool.live_scopes(), 2);
        assert_eq!(b.offset, 16);
        drop(a);
        assert_eq!(pool.live_scopes(), 1);
        // Reset with a live scope only warns.
        pool.reset();
        drop(b);
        assert_eq!(pool.live_scopes(), 0);
        pool.destroy(&mut allocator);
    }

    #[test]
    fn test_stats_count_failures() {
        let (_device, mut allocator, mut pool) = ring(128);
        pool.allocate(64, 16).unwrap();
        assert!(pool.allocate(256, 16).is_err());
        let stats = pool.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.bytes_allocated, 64);
        assert_eq!(stats.failed_allocations, 1);
        pool.destroy(&mut allocator);
    }

    #[test]
    fn test_destroy_releases_memory() {
        let (device, mut allocator, pool) = ring(128);
        assert_eq!(device.live_buffers(), 1);
        pool.destroy(&mut allocator);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_allocations(), 0);
    }
}
