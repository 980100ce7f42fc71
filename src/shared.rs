//! A [`SegFit`] behind a lock, usable as an [`Allocator`].
//!
//! The allocator API hands out `NonNull<[u8]>` slices described by a
//! `Layout`. A `SegFit` block is aligned to the smaller of its size class and
//! the page size, so a layout is served from the class of
//! `max(size, align)`. Alignments above the page size are refused.
//! Zero-sized layouts never reach the heap; they get a dangling, well-aligned
//! pointer.

use super::*;
use crate::region::{GlobalRegions, RegionSource, PAGE_SIZE};
use crate::segfit::SegFit;
use crate::stats::AllocatorStats;
use core::{alloc::Layout, cmp, ptr::NonNull};

mod mutex;
pub use mutex::{Lock, SingleThreadedLock, SpinLock};
use mutex::Mutex;

/// A [`SegFit`] shared through a lock of type `L`.
///
/// Because this crate is `no_std` and does not assume the presence of an
/// operating system, you pick the locking mechanism. See the [`Lock`] trait
/// for details. With [`SpinLock`] this type is `Sync` and can back
/// collections on many threads.
///
/// ```
/// # #[cfg(feature = "allocator_api2")] {
/// use allocator_api2::vec::Vec;
/// use segfit::{SegFit, SharedSegFit, SingleThreadedLock};
///
/// let heap = SharedSegFit::new(SegFit::new().unwrap(), SingleThreadedLock::new());
/// let mut v = Vec::new_in(&heap);
/// v.extend(0..1000u32);
/// assert_eq!(v.iter().sum::<u32>(), 499500);
/// # }
/// ```
pub struct SharedSegFit<R = GlobalRegions, L = SingleThreadedLock>
where
    R: RegionSource,
    L: Lock,
{
    heap: Mutex<SegFit<R>, L>,
}

impl<R, L> SharedSegFit<R, L>
where
    R: RegionSource,
    L: Lock,
{
    /// Wrap `heap` behind `lock`.
    #[inline]
    pub const fn new(heap: SegFit<R>, lock: L) -> Self {
        SharedSegFit {
            heap: Mutex::new(heap, lock),
        }
    }

    /// Run `f` with exclusive access to the underlying allocator.
    ///
    /// `f` must not use this `SharedSegFit`, or any collection allocating
    /// from it; doing so re-enters the lock.
    pub fn with<T>(&self, f: impl FnOnce(&mut SegFit<R>) -> T) -> T {
        let mut heap = self.heap.lock();
        f(&mut heap)
    }

    /// A snapshot of the underlying allocator's counters.
    pub fn stats(&self) -> AllocatorStats {
        self.heap.lock().stats()
    }

    /// Get an exclusive reference to the underlying allocator.
    #[inline]
    pub fn get_mut(&mut self) -> &mut SegFit<R> {
        self.heap.get_mut()
    }

    /// Unwrap the underlying allocator.
    #[inline]
    pub fn into_inner(self) -> SegFit<R> {
        self.heap.into_inner()
    }

    /// The `SegFit` request size for `layout`, or `None` if no block can
    /// satisfy its alignment.
    fn request_size(heap: &SegFit<R>, layout: Layout) -> Option<usize> {
        let max_align = cmp::min(PAGE_SIZE, heap.source().page_size());
        (layout.align() <= max_align).then(|| cmp::max(layout.size(), layout.align()))
    }

    fn dangling(layout: Layout) -> Result<NonNull<[u8]>, ApiAllocError> {
        let ptr = NonNull::new(layout.align() as *mut u8).ok_or(ApiAllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, 0))
    }

    /// Move or resize a non-empty block to fit `new_layout`, which must have
    /// a non-zero size.
    fn resize(&self, ptr: NonNull<u8>, new_layout: Layout) -> Result<NonNull<[u8]>, ApiAllocError> {
        let mut heap = self.heap.lock();
        let size = Self::request_size(&heap, new_layout).ok_or(ApiAllocError)?;
        let new_ptr = match heap.reallocate(Some(ptr), size) {
            Ok(Some(p)) => p,
            Ok(None) => return Err(ApiAllocError),
            Err(e) => {
                log::debug!("resizing {ptr:p} to {new_layout:?} failed: {e}");
                return Err(ApiAllocError);
            }
        };
        let len = heap.usable_size(new_ptr).map_err(|_| ApiAllocError)?;
        Ok(NonNull::slice_from_raw_parts(new_ptr, len))
    }
}

unsafe impl<R, L> Allocator for SharedSegFit<R, L>
where
    R: RegionSource,
    L: Lock,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, ApiAllocError> {
        if layout.size() == 0 {
            return Self::dangling(layout);
        }

        let mut heap = self.heap.lock();
        let size = Self::request_size(&heap, layout).ok_or(ApiAllocError)?;
        let ptr = heap.allocate(size).map_err(|e| {
            log::debug!("allocating {layout:?} failed: {e}");
            ApiAllocError
        })?;
        let len = heap.usable_size(ptr).map_err(|_| ApiAllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, len))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        if let Err(e) = self.heap.lock().deallocate(ptr) {
            log::warn!("deallocating {ptr:p} ({layout:?}) failed: {e}");
        }
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, ApiAllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());
        if old_layout.size() == 0 {
            return self.allocate(new_layout);
        }
        self.resize(ptr, new_layout)
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, ApiAllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());
        if new_layout.size() == 0 {
            self.deallocate(ptr, old_layout);
            return Self::dangling(new_layout);
        }
        self.resize(ptr, new_layout)
    }
}
