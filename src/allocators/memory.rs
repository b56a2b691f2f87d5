//! Device memory allocator.
//!
//! Raw device memory allocation with three-tier memory-type selection,
//! heap pressure estimation from tracked allocations, and one
//! recovery-and-retry on out-of-memory.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::api::error::GpuError;
use crate::api::stats::{HeapBudget, MemoryStats};
use crate::gpu::{DeviceBackend, MemoryProperties, MemoryPropertyFlags, MemoryRequirements, RawMemory};

/// Which fallback tier matched a memory-type query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchTier {
    /// Property flags equal the request.
    Exact = 1,
    /// Property flags contain the request plus extra bits.
    Superset = 2,
    /// Any type allowed by the filter mask.
    AnyAllowed = 3,
}

/// Result of [`MemoryAllocator::find_memory_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypeSelection {
    pub index: u32,
    pub tier: MatchTier,
}

/// A block of device memory owned by a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAllocation {
    pub memory: RawMemory,
    pub size: u64,
    pub memory_type_index: u32,
    pub heap_index: u32,
    pub host_visible: bool,
}

#[derive(Debug)]
struct TrackedAllocation {
    memory: RawMemory,
    size: u64,
    heap_index: u32,
    mapped: bool,
}

/// Device memory allocator.
pub struct MemoryAllocator {
    device: Arc<dyn DeviceBackend>,
    properties: MemoryProperties,
    pressure_threshold: f64,
    allocations: Vec<TrackedAllocation>,
    heap_usage: Vec<u64>,
    stats: MemoryStats,
}

impl MemoryAllocator {
    /// Create an allocator over `device`.
    pub fn new(device: Arc<dyn DeviceBackend>, pressure_threshold: f64) -> Self {
        let properties = device.memory_properties();
        let heap_usage = vec![0; properties.memory_heaps.len()];
        Self {
            device,
            properties,
            pressure_threshold,
            allocations: Vec::new(),
            heap_usage,
            stats: MemoryStats::default(),
        }
    }

    /// The device this allocator allocates from.
    pub fn device(&self) -> &Arc<dyn DeviceBackend> {
        &self.device
    }

    /// Memory topology queried at creation.
    pub fn memory_properties(&self) -> &MemoryProperties {
        &self.properties
    }

    /// Select a memory type for `type_filter` (bit `i` allows type `i`).
    ///
    /// Tiers are tried in order: exact property match, superset of the
    /// requested properties, then any allowed type. Tier 2 and 3 matches are
    /// reported as warnings. Failing all three is fatal.
    pub fn find_memory_type(
        &self,
        type_filter: u32,
        properties: MemoryPropertyFlags,
    ) -> Result<MemoryTypeSelection, GpuError> {
        let allowed = |i: usize| i < 32 && type_filter & (1 << i) != 0;
        let types = &self.properties.memory_types;

        let exact = types
            .iter()
            .enumerate()
            .position(|(i, t)| allowed(i) && t.property_flags == properties);
        if let Some(index) = exact {
            return Ok(MemoryTypeSelection {
                index: index as u32,
                tier: MatchTier::Exact,
            });
        }

        let superset = types
            .iter()
            .enumerate()
            .position(|(i, t)| allowed(i) && t.property_flags.contains(properties));
        if let Some(index) = superset {
            crate::gs_emit!(
                GS103,
                "type {} has flags {:#x} for requested {:#x}",
                index,
                types[index].property_flags.bits,
                properties.bits
            );
            return Ok(MemoryTypeSelection {
                index: index as u32,
                tier: MatchTier::Superset,
            });
        }

        if let Some(index) = (0..types.len()).find(|&i| allowed(i)) {
            crate::gs_emit!(
                GS104,
                "type {} has flags {:#x} for requested {:#x}",
                index,
                types[index].property_flags.bits,
                properties.bits
            );
            return Ok(MemoryTypeSelection {
                index: index as u32,
                tier: MatchTier::AnyAllowed,
            });
        }

        crate::gs_emit!(GS901, "type filter {:#x}, properties {:#x}", type_filter, properties.bits);
        Err(GpuError::NoSuitableMemoryType {
            type_filter,
            properties: properties.bits,
        })
    }

    /// Allocate device memory for a resource.
    pub fn allocate_memory(
        &mut self,
        requirements: &MemoryRequirements,
        properties: MemoryPropertyFlags,
    ) -> Result<DeviceAllocation, GpuError> {
        if requirements.size == 0 {
            return Err(GpuError::InvalidArgument("allocation size must be non-zero"));
        }

        let selection = self.find_memory_type(requirements.memory_type_bits, properties)?;
        let memory_type = self.properties.memory_types[selection.index as usize];

        if self.is_under_memory_pressure() {
            crate::gs_emit!(GS101, "allocating {} bytes", requirements.size);
            self.attempt_memory_recovery();
        }

        let memory = match self.device.allocate_memory(requirements.size, selection.index) {
            Ok(memory) => memory,
            Err(err) if err.is_out_of_memory() => {
                crate::gs_emit!(GS105, "{} bytes from type {}", requirements.size, selection.index);
                self.attempt_memory_recovery();
                self.stats.retried_allocations += 1;
                self.device
                    .allocate_memory(requirements.size, selection.index)
                    .map_err(|source| self.allocation_failed(requirements.size, source))?
            }
            Err(source) => return Err(self.allocation_failed(requirements.size, source)),
        };

        self.allocations.push(TrackedAllocation {
            memory,
            size: requirements.size,
            heap_index: memory_type.heap_index,
            mapped: false,
        });
        if let Some(usage) = self.heap_usage.get_mut(memory_type.heap_index as usize) {
            *usage += requirements.size;
        }

        self.stats.total_allocated += requirements.size;
        self.stats.active_allocations += 1;
        self.stats.current_usage += requirements.size;
        self.stats.peak_usage = self.stats.peak_usage.max(self.stats.current_usage);

        log::trace!(
            "allocated {} bytes from memory type {} (tier {:?})",
            requirements.size,
            selection.index,
            selection.tier
        );

        Ok(DeviceAllocation {
            memory,
            size: requirements.size,
            memory_type_index: selection.index,
            heap_index: memory_type.heap_index,
            host_visible: memory_type.property_flags.contains(MemoryPropertyFlags::HOST_VISIBLE),
        })
    }

    fn allocation_failed(&mut self, size: u64, source: crate::gpu::DeviceError) -> GpuError {
        self.stats.failed_allocations += 1;
        log::warn!("device allocation of {} bytes failed: {}", size, source);
        GpuError::AllocationFailed { size, source }
    }

    /// Persistently map a whole host-visible allocation.
    pub fn map_memory(&mut self, allocation: &DeviceAllocation) -> Result<NonNull<u8>, GpuError> {
        if !allocation.host_visible {
            return Err(GpuError::InvalidArgument("memory is not host-visible"));
        }
        let ptr = self
            .device
            .map_memory(allocation.memory, 0, allocation.size)
            .map_err(GpuError::MapFailed)?;
        if let Some(tracked) = self.allocations.iter_mut().find(|a| a.memory == allocation.memory) {
            tracked.mapped = true;
        }
        Ok(ptr)
    }

    /// Unmap if mapped, stop tracking, and free.
    pub fn free_memory(&mut self, allocation: DeviceAllocation) {
        let Some(pos) = self.allocations.iter().position(|a| a.memory == allocation.memory) else {
            log::warn!("free of untracked device memory {:#x}", allocation.memory.raw());
            return;
        };
        let tracked = self.allocations.swap_remove(pos);

        if tracked.mapped {
            self.device.unmap_memory(tracked.memory);
        }
        self.device.free_memory(tracked.memory);

        if let Some(usage) = self.heap_usage.get_mut(tracked.heap_index as usize) {
            *usage = usage.saturating_sub(tracked.size);
        }
        self.stats.total_freed += tracked.size;
        self.stats.active_allocations = self.stats.active_allocations.saturating_sub(1);
        self.stats.current_usage = self.stats.current_usage.saturating_sub(tracked.size);
    }

    /// Whether any heap's tracked usage exceeds the pressure threshold.
    pub fn is_under_memory_pressure(&self) -> bool {
        self.heap_budgets()
            .iter()
            .any(|budget| budget.usage_ratio > self.pressure_threshold)
    }

    /// Best-effort recovery hook.
    ///
    /// Device memory cannot be compacted here, so this only records the
    /// attempt and reports `false`.
    pub fn attempt_memory_recovery(&mut self) -> bool {
        self.stats.recovery_attempts += 1;
        crate::gs_emit!(GS102);
        false
    }

    /// Per-heap usage estimated from tracked allocations.
    pub fn heap_budgets(&self) -> Vec<HeapBudget> {
        self.properties
            .memory_heaps
            .iter()
            .enumerate()
            .map(|(i, heap)| {
                let used = self.heap_usage.get(i).copied().unwrap_or(0);
                HeapBudget {
                    heap_index: i as u32,
                    used,
                    size: heap.size,
                    usage_ratio: if heap.size == 0 { 0.0 } else { used as f64 / heap.size as f64 },
                }
            })
            .collect()
    }

    /// Allocation statistics.
    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    /// Number of tracked allocations.
    pub fn tracked_allocations(&self) -> usize {
        self.allocations.len()
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        if !self.allocations.is_empty() {
            log::warn!(
                "MemoryAllocator dropped with {} live allocations ({} bytes)",
                self.allocations.len(),
                self.stats.current_usage
            );
        }
    }
}
