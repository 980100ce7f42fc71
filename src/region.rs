//! Where the allocator's memory comes from.
//!
//! The allocator never maps memory itself. It asks a [`RegionSource`] for one
//! big backing pool at creation time, and for one region per large block.

use crate::error::OsError;
use core::{alloc::Layout, ptr::NonNull};

/// The page size assumed by [`GlobalRegions`].
pub const PAGE_SIZE: usize = 4096;

/// A provider of zeroed, page-aligned memory regions.
///
/// # Safety
///
/// * A region returned by `alloc_region(size)` must be valid for reads and
///   writes of `size` bytes, aligned to `page_size()`, zero-filled, and must
///   not overlap any other live region until it is freed or resized.
///
/// * `page_size()` must return a power of two and must never change.
///
/// * A successful `resize_region` must preserve the first `min(old_size,
///   new_size)` bytes of the region, after which the old pointer is invalid
///   and the returned one obeys the same rules as a fresh region of
///   `new_size` bytes, except that bytes past `old_size` need not be zero.
pub unsafe trait RegionSource {
    /// The granularity regions are handed out at.
    fn page_size(&self) -> usize;

    /// Get a new region of exactly `size` bytes. `size` is a non-zero multiple
    /// of `page_size()`.
    fn alloc_region(&self, size: usize) -> Result<NonNull<u8>, OsError>;

    /// Return a region.
    ///
    /// # Safety
    ///
    /// `region` must have come from this source with exactly `size` bytes,
    /// and must not be used afterwards.
    unsafe fn free_region(&self, region: NonNull<u8>, size: usize);

    /// Grow or shrink a region, moving it if need be.
    ///
    /// Region sources that cannot do better than allocate-copy-free should
    /// leave the default, which reports [`OsError::Unsupported`] and lets the
    /// allocator do the copy itself.
    ///
    /// # Safety
    ///
    /// `region` must have come from this source with exactly `old_size`
    /// bytes. `new_size` is a non-zero multiple of `page_size()`. On failure
    /// the old region is untouched.
    #[inline]
    unsafe fn resize_region(
        &self,
        region: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, OsError> {
        let _ = (region, old_size, new_size);
        Err(OsError::Unsupported)
    }
}

/// Round `size` up to a multiple of `page_size`, or `None` on overflow.
#[inline]
pub(crate) fn round_to_pages(size: usize, page_size: usize) -> Option<usize> {
    debug_assert!(page_size.is_power_of_two());
    Some(size.checked_add(page_size - 1)? & !(page_size - 1))
}

/// A [`RegionSource`] that carves regions out of the global allocator with
/// page alignment.
///
/// This is always available, including in `no_std` environments that have a
/// global allocator. Resizing forwards to the global allocator's `realloc`,
/// which for large sizes is typically backed by `mremap` or an equivalent.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalRegions;

impl GlobalRegions {
    fn layout(size: usize) -> Result<Layout, OsError> {
        if size == 0 {
            return Err(OsError::InvalidLayout);
        }
        Layout::from_size_align(size, PAGE_SIZE).map_err(|_| OsError::InvalidLayout)
    }
}

unsafe impl RegionSource for GlobalRegions {
    #[inline]
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn alloc_region(&self, size: usize) -> Result<NonNull<u8>, OsError> {
        let layout = Self::layout(size)?;
        // Safety: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(OsError::Refused)
    }

    unsafe fn free_region(&self, region: NonNull<u8>, size: usize) {
        match Self::layout(size) {
            Ok(layout) => alloc::alloc::dealloc(region.as_ptr(), layout),
            Err(_) => debug_assert!(false, "freeing a region with an impossible size {size}"),
        }
    }

    unsafe fn resize_region(
        &self,
        region: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, OsError> {
        let old_layout = Self::layout(old_size)?;
        // Validate the new size against the alignment before handing it to
        // `realloc`, which requires it to be representable.
        Self::layout(new_size)?;
        let ptr = alloc::alloc::realloc(region.as_ptr(), old_layout, new_size);
        NonNull::new(ptr).ok_or(OsError::Refused)
    }
}

#[cfg(all(unix, feature = "mmap"))]
pub use self::mmap::Mmap;

#[cfg(all(unix, feature = "mmap"))]
mod mmap {
    use super::*;

    /// A [`RegionSource`] backed by anonymous private `mmap`s.
    ///
    /// On Linux, large blocks are resized with `mremap(MREMAP_MAYMOVE)`, which
    /// moves page table entries instead of copying bytes.
    #[derive(Clone, Copy, Debug)]
    pub struct Mmap {
        page_size: usize,
    }

    impl Default for Mmap {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Mmap {
        /// Create a new `Mmap` region source, querying the system page size.
        pub fn new() -> Self {
            // Safety: `sysconf` has no preconditions.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            let page_size = usize::try_from(raw)
                .ok()
                .filter(|p| p.is_power_of_two())
                .unwrap_or(PAGE_SIZE);
            Mmap { page_size }
        }
    }

    unsafe impl RegionSource for Mmap {
        #[inline]
        fn page_size(&self) -> usize {
            self.page_size
        }

        fn alloc_region(&self, size: usize) -> Result<NonNull<u8>, OsError> {
            if size == 0 {
                return Err(OsError::InvalidLayout);
            }

            // Safety: anonymous mapping with no address hint.
            let ptr = unsafe {
                libc::mmap(
                    core::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                log::debug!("mmap of {size} bytes failed");
                return Err(OsError::Refused);
            }
            NonNull::new(ptr.cast::<u8>()).ok_or(OsError::Refused)
        }

        unsafe fn free_region(&self, region: NonNull<u8>, size: usize) {
            if libc::munmap(region.as_ptr().cast::<libc::c_void>(), size) != 0 {
                log::warn!("munmap({region:p}, {size}) failed");
            }
        }

        #[cfg(target_os = "linux")]
        unsafe fn resize_region(
            &self,
            region: NonNull<u8>,
            old_size: usize,
            new_size: usize,
        ) -> Result<NonNull<u8>, OsError> {
            if new_size == 0 {
                return Err(OsError::InvalidLayout);
            }
            let ptr = libc::mremap(
                region.as_ptr().cast::<libc::c_void>(),
                old_size,
                new_size,
                libc::MREMAP_MAYMOVE,
            );
            if ptr == libc::MAP_FAILED {
                log::debug!("mremap({region:p}, {old_size} -> {new_size}) failed");
                return Err(OsError::Refused);
            }
            NonNull::new(ptr.cast::<u8>()).ok_or(OsError::Refused)
        }
    }
}
