//! Resource layer configuration.

use crate::util::size::{kb, mb};

/// Configuration for the [`ResourceCoordinator`](crate::ResourceCoordinator).
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    /// Size of the staging ring (default: 16 MB)
    pub staging_pool_size: u64,

    /// Alignment of orchestrated staging allocations (default: 16)
    pub staging_alignment: u64,

    /// Ring waste ratio above which fragmentation is critical (default: 0.5)
    pub fragmentation_threshold: f64,

    /// Heap usage ratio above which memory is under pressure (default: 0.8)
    pub memory_pressure_threshold: f64,

    /// Submit staged copies asynchronously when requested
    pub allow_async_transfers: bool,

    /// Reset a critically fragmented ring at `end_frame`
    pub auto_defragment: bool,

    /// Fence wait timeout in nanoseconds
    pub transfer_timeout_ns: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            staging_pool_size: mb(16),
            staging_alignment: 16,
            fragmentation_threshold: 0.5,
            memory_pressure_threshold: 0.8,
            allow_async_transfers: true,
            auto_defragment: true,
            transfer_timeout_ns: u64::MAX,
        }
    }
}

impl ResourceConfig {
    /// Create a minimal config for testing or constrained environments.
    pub fn minimal() -> Self {
        Self {
            staging_pool_size: kb(256),
            allow_async_transfers: false,
            ..Self::default()
        }
    }

    /// Create a config for streaming-heavy workloads.
    pub fn high_throughput() -> Self {
        Self {
            staging_pool_size: mb(64),
            staging_alignment: 256,
            ..Self::default()
        }
    }

    /// Builder pattern: set staging ring size.
    pub fn with_staging_pool_size(mut self, size: u64) -> Self {
        self.staging_pool_size = size;
        self
    }

    /// Builder pattern: set staging alignment.
    pub fn with_staging_alignment(mut self, alignment: u64) -> Self {
        self.staging_alignment = alignment;
        self
    }

    /// Builder pattern: set fragmentation threshold.
    pub fn with_fragmentation_threshold(mut self, threshold: f64) -> Self {
        self.fragmentation_threshold = threshold;
        self
    }

    /// Builder pattern: set memory pressure threshold.
    pub fn with_memory_pressure_threshold(mut self, threshold: f64) -> Self {
        self.memory_pressure_threshold = threshold;
        self
    }

    /// Builder pattern: enable async transfers.
    pub fn with_async_transfers(mut self, enable: bool) -> Self {
        self.allow_async_transfers = enable;
        self
    }

    /// Builder pattern: enable automatic defragmentation.
    pub fn with_auto_defragment(mut self, enable: bool) -> Self {
        self.auto_defragment = enable;
        self
    }

    /// Builder pattern: set fence wait timeout.
    pub fn with_transfer_timeout(mut self, timeout_ns: u64) -> Self {
        self.transfer_timeout_ns = timeout_ns;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ResourceConfig::default();
        assert_eq!(config.staging_pool_size, 16 * 1024 * 1024);
        assert_eq!(config.fragmentation_threshold, 0.5);
        assert_eq!(config.memory_pressure_threshold, 0.8);
    }

    #[test]
    fn test_builders() {
        let config = ResourceConfig::minimal()
            .with_staging_pool_size(1024)
            .with_async_transfers(true)
            .with_fragmentation_threshold(0.25);
        assert_eq!(config.staging_pool_size, 1024);
        assert!(config.allow_async_transfers);
        assert_eq!(config.fragmentation_threshold, 0.25);
    }
}
