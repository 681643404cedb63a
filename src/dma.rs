//! DMA buffer lifecycle.

use crate::error::Result;
use crate::traits::{IommuMapper, Iova, PageAllocator};

/// A page-aligned region of memory mapped into the IOMMU at a known [`Iova`].
/// Construction and destruction are explicit (not `Drop`) because both need
/// a `&mut` handle to the owning platform's allocator/mapper, which the
/// buffer itself does not hold.
#[derive(Debug, Clone, Copy)]
pub struct DmaBuffer {
    pub vaddr: *mut u8,
    pub iova: Iova,
    pub len: usize,
}

impl DmaBuffer {
    /// Allocates `count` units of `unit_size` bytes, page-aligned, and maps
    /// them into the IOMMU. If the IOMMU mapping fails the pages are
    /// released before the error is returned.
    pub fn create<P: PageAllocator + IommuMapper>(
        platform: &mut P,
        count: usize,
        unit_size: usize,
    ) -> Result<Self> {
        let (vaddr, len) = platform.alloc(count, unit_size)?;
        match platform.map(vaddr, len) {
            Ok(iova) => Ok(Self { vaddr, iova, len }),
            Err(err) => {
                platform.free(vaddr, len);
                Err(err)
            }
        }
    }

    /// Unmaps then frees. Idempotent callers should only invoke this once;
    /// queues guard that via `Option<DmaBuffer>`.
    pub fn destroy<P: PageAllocator + IommuMapper>(self, platform: &mut P) {
        let _ = platform.unmap(self.vaddr);
        platform.free(self.vaddr, self.len);
    }

    /// # Safety
    /// The caller must ensure `T` matches the buffer's actual layout and
    /// that no concurrent mutable access occurs while the slice is live.
    pub unsafe fn as_slice<T>(&self) -> &[T] {
        let count = self.len / core::mem::size_of::<T>();
        core::slice::from_raw_parts(self.vaddr as *const T, count)
    }

    /// # Safety
    /// Same requirements as [`DmaBuffer::as_slice`].
    pub unsafe fn as_mut_slice<T>(&mut self) -> &mut [T] {
        let count = self.len / core::mem::size_of::<T>();
        core::slice::from_raw_parts_mut(self.vaddr as *mut T, count)
    }
}
