//! Resource layer statistics.

use crate::util::size::format_bytes;

/// Device memory allocator statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStats {
    /// Total bytes ever allocated.
    pub total_allocated: u64,

    /// Total bytes ever freed.
    pub total_freed: u64,

    /// Currently tracked allocations.
    pub active_allocations: u64,

    /// Bytes currently allocated.
    pub current_usage: u64,

    /// High water mark of `current_usage`.
    pub peak_usage: u64,

    /// Allocations that failed after recovery and retry.
    pub failed_allocations: u64,

    /// Calls to the recovery hook.
    pub recovery_attempts: u64,

    /// Allocations retried after an out-of-memory report.
    pub retried_allocations: u64,
}

/// Usage of one memory heap, estimated from tracked allocations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeapBudget {
    pub heap_index: u32,
    pub used: u64,
    pub size: u64,
    pub usage_ratio: f64,
}

/// Staging ring statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagingStats {
    pub total_size: u64,
    pub current_offset: u64,
    pub wasted_bytes: u64,
    pub wrap_around_count: u64,
    pub largest_free_block: u64,
    /// Successful allocations.
    pub allocations: u64,
    /// Bytes handed out, excluding padding.
    pub bytes_allocated: u64,
    /// Rejected allocations.
    pub failed_allocations: u64,
    /// Calls to `reset`, explicit or automatic.
    pub resets: u64,
    /// Resets triggered by critical fragmentation.
    pub auto_defragmentations: u64,
}

impl StagingStats {
    /// Wasted bytes over ring size.
    pub fn fragmentation_ratio(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        self.wasted_bytes as f64 / self.total_size as f64
    }
}

/// Transfer statistics. Monotonic until explicitly reset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferStats {
    pub total_transfers: u64,
    pub async_transfers: u64,
    pub batch_transfers: u64,
    pub total_bytes_transferred: u64,
    /// Copies written straight into mapped memory.
    pub direct_transfers: u64,
    /// Copies that went through the staging ring.
    pub staged_transfers: u64,
    pub failed_transfers: u64,
}

impl TransferStats {
    /// Mean bytes per successful transfer.
    pub fn average_transfer_size(&self) -> f64 {
        if self.total_transfers == 0 {
            return 0.0;
        }
        self.total_bytes_transferred as f64 / self.total_transfers as f64
    }
}

/// Snapshot of the whole resource layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferStats {
    pub memory: MemoryStats,
    pub staging: StagingStats,
    pub transfers: TransferStats,
    /// Live GpuBuffers in the registry.
    pub registered_buffers: usize,
    /// GpuBuffers with staged bytes awaiting flush.
    pub pending_uploads: usize,
    /// Async staged copies not yet known to be complete.
    pub in_flight_transfers: usize,
    pub dedicated_transfer_queue: bool,
}

impl std::fmt::Display for BufferStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "GPU Resource Statistics:")?;
        writeln!(f, "  Device memory:   {}", format_bytes(self.memory.current_usage))?;
        writeln!(f, "  Peak memory:     {}", format_bytes(self.memory.peak_usage))?;
        writeln!(f, "  Allocations:     {}", self.memory.active_allocations)?;
        writeln!(
            f,
            "  Staging:         {} / {} ({:.1}% wasted, {} wraps)",
            format_bytes(self.staging.current_offset),
            format_bytes(self.staging.total_size),
            self.staging.fragmentation_ratio() * 100.0,
            self.staging.wrap_around_count
        )?;
        writeln!(
            f,
            "  Transfers:       {} ({} async, {} batches, {})",
            self.transfers.total_transfers,
            self.transfers.async_transfers,
            self.transfers.batch_transfers,
            format_bytes(self.transfers.total_bytes_transferred)
        )?;
        writeln!(f, "  Buffers:         {} ({} pending)", self.registered_buffers, self.pending_uploads)?;
        writeln!(f, "  In flight:       {}", self.in_flight_transfers)?;
        Ok(())
    }
}
