//! Page-aligned host memory backing for the transfer buffer.

use crate::error::{DmalinkError, Result};
use std::alloc::Layout;
use std::ptr::NonNull;

/// Alignment for host-allocated transfer buffers (one page).
pub const HOST_ALIGN: usize = 4096;

/// An owned, page-aligned, zero-initialized host memory region.
pub struct HostRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The region is plain host memory owned by this handle.
unsafe impl Send for HostRegion {}
unsafe impl Sync for HostRegion {}

impl HostRegion {
    /// Allocate `size` bytes, page-aligned and zeroed.
    pub fn alloc_zeroed(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(DmalinkError::allocation("zero-sized host region"));
        }
        let layout = Layout::from_size_align(size, HOST_ALIGN)
            .map_err(|e| DmalinkError::allocation(format!("invalid layout for size {size}: {e}")))?;
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            DmalinkError::allocation(format!("host allocation of {size} bytes failed"))
        })?;
        Ok(Self { ptr, layout })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_page_aligned_and_zeroed() {
        let region = HostRegion::alloc_zeroed(8192).unwrap();
        assert_eq!(region.len(), 8192);
        assert_eq!(region.as_ptr() as usize % HOST_ALIGN, 0);
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr(), region.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            HostRegion::alloc_zeroed(0),
            Err(DmalinkError::Allocation(_))
        ));
    }

    #[test]
    fn test_odd_size_keeps_exact_len() {
        let region = HostRegion::alloc_zeroed(1000).unwrap();
        assert_eq!(region.len(), 1000);
    }
}
