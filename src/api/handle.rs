//! Owned GPU resource handles.

use std::ptr::NonNull;

use crate::allocators::memory::DeviceAllocation;
use crate::api::error::TransferError;
use crate::gpu::{BufferUsage, RawBuffer, RawImage, RawImageView};

/// An owned GPU resource: a buffer or an image with its view, plus the
/// device memory backing it.
///
/// Handles are move-only and must be returned to
/// [`ResourceCoordinator::destroy_resource`](crate::ResourceCoordinator::destroy_resource).
/// Dropping a live handle leaks its device objects and logs `GS301`.
#[derive(Debug)]
pub struct ResourceHandle {
    pub(crate) buffer: Option<RawBuffer>,
    pub(crate) image: Option<(RawImage, RawImageView)>,
    pub(crate) allocation: Option<DeviceAllocation>,
    pub(crate) mapped: Option<NonNull<u8>>,
    pub(crate) size: u64,
    pub(crate) usage: BufferUsage,
}

// SAFETY: the mapped pointer refers to device memory owned by this handle;
// it is only dereferenced through `&mut self` or by the single thread
// driving the coordinator.
unsafe impl Send for ResourceHandle {}
unsafe impl Sync for ResourceHandle {}

impl ResourceHandle {
    /// A handle that owns nothing.
    pub const fn null() -> Self {
        Self {
            buffer: None,
            image: None,
            allocation: None,
            mapped: None,
            size: 0,
            usage: BufferUsage::empty(),
        }
    }

    pub(crate) fn from_buffer(
        buffer: RawBuffer,
        allocation: DeviceAllocation,
        mapped: Option<NonNull<u8>>,
        size: u64,
        usage: BufferUsage,
    ) -> Self {
        Self {
            buffer: Some(buffer),
            image: None,
            allocation: Some(allocation),
            mapped,
            size,
            usage,
        }
    }

    /// Adopt an externally created image and view so they are released
    /// through the coordinator's destroy path.
    pub fn from_image(image: RawImage, view: RawImageView, allocation: Option<DeviceAllocation>) -> Self {
        Self {
            buffer: None,
            image: Some((image, view)),
            size: allocation.map(|a| a.size).unwrap_or(0),
            allocation,
            mapped: None,
            usage: BufferUsage::empty(),
        }
    }

    /// True while the handle owns a buffer or an image.
    pub fn is_valid(&self) -> bool {
        self.buffer.is_some() || self.image.is_some()
    }

    pub fn buffer(&self) -> Option<RawBuffer> {
        self.buffer
    }

    pub fn image(&self) -> Option<(RawImage, RawImageView)> {
        self.image
    }

    pub fn allocation(&self) -> Option<&DeviceAllocation> {
        self.allocation.as_ref()
    }

    /// Requested size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Pointer to the persistent mapping, if mapped.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    /// Whether the backing memory type is host-visible.
    pub fn is_host_visible(&self) -> bool {
        self.allocation.map(|a| a.host_visible).unwrap_or(false)
    }

    /// Copy `data` into the persistent mapping at `offset`.
    pub fn write_mapped(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        let ptr = self.mapped.ok_or(TransferError::InvalidDestination)?;
        let len = data.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(TransferError::OutOfBounds {
                offset,
                size: len,
                capacity: self.size,
            });
        }
        // SAFETY: the mapping covers `size` bytes and the range was checked.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr().add(offset as usize), data.len());
        }
        Ok(())
    }
}

impl Default for ResourceHandle {
    fn default() -> Self {
        Self::null()
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        if self.is_valid() {
            crate::gs_emit!(GS301, "{} bytes", self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle() {
        let handle = ResourceHandle::null();
        assert!(!handle.is_valid());
        assert!(handle.mapped_ptr().is_none());
        assert!(!handle.is_host_visible());
    }

    #[test]
    fn test_write_mapped_bounds() {
        let mut backing = vec![0u8; 16];
        let mut handle = ResourceHandle::null();
        handle.mapped = NonNull::new(backing.as_mut_ptr());
        handle.size = 16;

        handle.write_mapped(8, &[1, 2, 3, 4]).unwrap();
        let err = handle.write_mapped(14, &[0; 4]).unwrap_err();
        assert_eq!(err, TransferError::OutOfBounds { offset: 14, size: 4, capacity: 16 });

        handle.mapped = None;
        assert_eq!(backing[8..12], [1, 2, 3, 4]);
    }

    #[test]
    fn test_adopted_image_is_valid() {
        let handle = ResourceHandle::from_image(RawImage(5), RawImageView(6), None);
        assert!(handle.is_valid());
        assert!(handle.buffer().is_none());
        assert_eq!(handle.image(), Some((RawImage(5), RawImageView(6))));
    }
}
