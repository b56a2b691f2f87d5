//! Error types for allocation, staging and transfers.

use thiserror::Error;

use crate::gpu::DeviceError;

/// Device memory and resource creation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpuError {
    /// No memory type satisfies the requirements, not even by filter mask.
    #[error("no suitable memory type (type filter {type_filter:#x}, properties {properties:#x})")]
    NoSuitableMemoryType { type_filter: u32, properties: u32 },

    /// The device refused the allocation, after recovery and one retry for
    /// out-of-memory.
    #[error("device allocation of {size} bytes failed: {source}")]
    AllocationFailed {
        size: u64,
        #[source]
        source: DeviceError,
    },

    /// Buffer object creation failed.
    #[error("buffer creation failed: {0}")]
    BufferCreation(#[source] DeviceError),

    /// Binding memory to a buffer failed.
    #[error("memory binding failed: {0}")]
    BindFailed(#[source] DeviceError),

    /// Mapping host-visible memory failed.
    #[error("memory mapping failed: {0}")]
    MapFailed(#[source] DeviceError),

    /// Device setup call (command pool, queue query) failed.
    #[error("device error: {0}")]
    Device(#[source] DeviceError),

    /// Rejected argument, nothing was allocated.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl GpuError {
    /// Whether this error is a precondition violation the engine cannot
    /// recover from by retrying or freeing memory.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GpuError::NoSuitableMemoryType { .. })
    }
}

/// Staging ring errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StagingError {
    #[error("zero-sized staging request")]
    ZeroSize,

    #[error("staging alignment {0} is not a power of two")]
    InvalidAlignment(u64),

    /// Larger than the whole ring; wrapping cannot help.
    #[error("staging request of {size} bytes exceeds ring capacity of {capacity} bytes")]
    TooLarge { size: u64, capacity: u64 },

    /// The region was handed out before the last reset.
    #[error("staging region invalidated by a ring reset")]
    StaleRegion,

    #[error("write of {len} bytes overflows staging region of {size} bytes")]
    RegionOverflow { len: u64, size: u64 },
}

/// Copy path errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("invalid destination resource")]
    InvalidDestination,

    #[error("empty transfer data")]
    EmptyData,

    #[error("transfer of {size} bytes at offset {offset} exceeds destination size {capacity}")]
    OutOfBounds { offset: u64, size: u64, capacity: u64 },

    /// The `BufferId` is stale or was never issued.
    #[error("unknown gpu buffer id")]
    UnknownBuffer,

    /// The GpuBuffer has no backing storage.
    #[error("gpu buffer has no storage")]
    NoStorage,

    /// Staged bytes awaiting flush were overwritten by a ring wrap or reset.
    #[error("pending staged data was invalidated before flush")]
    StaleStaging,

    /// Part of the batch was already uploaded at another base offset.
    #[error("flush offset {requested} does not match upload already placed at {anchored}")]
    UploadOffsetMismatch { requested: u64, anchored: u64 },

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Some entries of a batch failed; successful entries stay applied.
    #[error("{failed} of {attempted} batched transfers failed")]
    PartialBatch { failed: usize, attempted: usize },
}
