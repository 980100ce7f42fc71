//! The segregated-fit allocator.
//!
//! Requests up to [`MAX_SMALL_SIZE`](crate::MAX_SMALL_SIZE) bytes are rounded
//! up to a power-of-two size class and served from that class's free list.
//! Each class carves
//! chunks from one backing region, obtained once at creation time, whenever
//! its free list runs dry. Anything bigger gets a region of its own from the
//! [`RegionSource`] and is tracked in a bounded registry.
//!
//! Deallocation needs nothing but the pointer: a range test against the
//! backing region plus a lookup in its chunk-owner table recovers the class
//! and slot of a small block in constant time, and anything outside the
//! backing region must be a registered large block.

use crate::config::SegFitConfig;
use crate::error::{AllocError, CorruptionReport, CreateError, DeallocError, Exhaustion, OsError};
use crate::large::{LargeBlock, LargeBlockRegistry};
use crate::pool::{BackingPool, SizeClassPool};
use crate::region::{round_to_pages, GlobalRegions, RegionSource};
use crate::size_class::{size_to_class, ClassIndex};
use crate::stats::{AllocatorStats, LeakAudit};
use alloc::vec::Vec;
use core::{cmp, ptr, ptr::NonNull};

/// The largest request that is even attempted.
pub const MAX_ALLOCATION_SIZE: usize = isize::MAX as usize;

/// Where a [`SegFit`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Serving requests.
    Active,
    /// All memory has been released. Every operation fails with
    /// `UseAfterDestroy`.
    Destroyed,
}

#[derive(Clone, Copy, Debug, Default)]
struct Counters {
    total_allocations: u64,
    total_deallocations: u64,
    total_reallocations: u64,
    bytes_allocated: u64,
    bytes_deallocated: u64,
    bytes_reallocated: u64,
    cache_hits: u64,
    cache_misses: u64,
    resize_in_place: u64,
    resize_fallbacks: u64,
    last_class: Option<ClassIndex>,
    corruption_detected: bool,
    /// Source of large-block stamps.
    sequence: u64,
}

/// Which part of the allocator a live pointer belongs to.
#[derive(Clone, Copy, Debug)]
enum Origin {
    Small(ClassIndex),
    Large(LargeBlock),
}

/// A segregated free-list allocator.
///
/// All methods take `&mut self`; wrap it in a
/// [`SharedSegFit`](crate::SharedSegFit) to share it or to use it with
/// collections.
///
/// ```
/// use segfit::SegFit;
///
/// let mut heap = SegFit::new()?;
/// let p = heap.allocate(100)?;
/// assert_eq!(heap.usable_size(p)?, 128);
///
/// let p = heap.reallocate(Some(p), 120)?.unwrap();
/// heap.deallocate(p)?;
///
/// assert!(heap.destroy()?.is_clean());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct SegFit<R: RegionSource = GlobalRegions> {
    source: R,
    config: SegFitConfig,
    state: State,

    backing: BackingPool,
    /// The size the backing region was obtained with.
    backing_region_size: usize,

    /// One pool per size class, smallest first.
    classes: Vec<SizeClassPool>,
    large: LargeBlockRegistry,
    counters: Counters,
}

// Safety: the allocator exclusively owns the backing region, every large
// region, and all of its bookkeeping. Nothing is shared with other instances.
unsafe impl<R> Send for SegFit<R> where R: RegionSource + Send {}

impl SegFit<GlobalRegions> {
    /// Create an allocator with the default configuration, backed by the
    /// global allocator.
    pub fn new() -> Result<Self, CreateError> {
        SegFit::create(SegFitConfig::default(), GlobalRegions)
    }
}

impl<R> SegFit<R>
where
    R: RegionSource,
{
    /// Create an allocator, obtaining its backing pool from `source`.
    pub fn create(config: SegFitConfig, source: R) -> Result<Self, CreateError> {
        config.validate()?;

        let chunk_count = config.chunk_count();
        let region_size = round_to_pages(config.usable_pool_size(), source.page_size())
            .ok_or(OsError::InvalidLayout)?;
        let base = source.alloc_region(region_size)?;
        log::debug!(
            "created allocator: {region_size} byte pool at {base:p}, {chunk_count} chunks of {}",
            config.chunk_size
        );

        let mut segfit = SegFit {
            backing: BackingPool::new(base, config.chunk_size, chunk_count),
            backing_region_size: region_size,
            classes: ClassIndex::all()
                .map(|class| SizeClassPool::new(class, config.chunk_size))
                .collect(),
            large: LargeBlockRegistry::new(config.large_block_limit),
            counters: Counters::default(),
            state: State::Active,
            config,
            source,
        };
        if config.prewarm {
            segfit.prewarm();
        }
        Ok(segfit)
    }

    /// Carve one chunk for every class, smallest first, for as long as the
    /// backing pool has room.
    fn prewarm(&mut self) {
        for pool in &mut self.classes {
            if pool.total_count() == 0 && !pool.grow(&mut self.backing) {
                log::debug!("prewarm stopped at {}", pool.class());
                break;
            }
        }
    }

    /// The configuration this allocator was created with.
    #[inline]
    pub fn config(&self) -> &SegFitConfig {
        &self.config
    }

    /// The region source.
    #[inline]
    pub fn source(&self) -> &R {
        &self.source
    }

    /// Where this allocator is in its lifecycle.
    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    fn ensure_active(&self) -> Result<(), AllocError> {
        match self.state {
            State::Active => Ok(()),
            State::Destroyed => Err(AllocError::UseAfterDestroy),
        }
    }

    /// Allocate `size` bytes.
    ///
    /// The block is aligned to the smaller of its size class and 4096 bytes,
    /// and large blocks are page aligned. Fresh memory is zeroed; recycled
    /// blocks keep whatever their previous owner left in them.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.ensure_active()?;
        if size == 0 || size > MAX_ALLOCATION_SIZE {
            return Err(AllocError::InvalidSize { size });
        }

        match size_to_class(size) {
            Some(class) => self.allocate_small(class),
            None => self.allocate_large(size),
        }
    }

    fn allocate_small(&mut self, class: ClassIndex) -> Result<NonNull<u8>, AllocError> {
        let pool = &mut self.classes[class.get()];
        let was_cached = pool.free_count() > 0;

        match pool.allocate(&mut self.backing) {
            Ok(Some(block)) => {
                debug_assert_eq!(self.backing.locate(block.ptr), Some((class, block.slot)));
                if was_cached {
                    self.counters.cache_hits += 1;
                } else {
                    self.counters.cache_misses += 1;
                }
                self.counters.total_allocations += 1;
                self.counters.bytes_allocated += class.block_size() as u64;
                self.counters.last_class = Some(class);
                Ok(block.ptr)
            }
            Ok(None) => {
                self.counters.cache_misses += 1;
                Err(AllocError::OutOfMemory {
                    cause: Exhaustion::PoolExhausted,
                })
            }
            Err(report) => Err(self.corrupted(report)),
        }
    }

    fn allocate_large(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if self.large.is_full() {
            log::debug!(
                "refusing {size} byte block: {} large blocks live",
                self.large.len()
            );
            return Err(AllocError::OutOfMemory {
                cause: Exhaustion::RegistryFull,
            });
        }

        let capacity = round_to_pages(size, self.source.page_size())
            .ok_or(AllocError::InvalidSize { size })?;
        let ptr = self
            .source
            .alloc_region(capacity)
            .map_err(|e| AllocError::OutOfMemory {
                cause: Exhaustion::OsRefused(e),
            })?;

        let block = LargeBlock {
            ptr,
            size,
            capacity,
            stamp: self.next_stamp(),
        };
        if self.large.register(block).is_err() {
            // Safety: the region was just obtained from `source` with this
            // size and has not been handed out.
            unsafe { self.source.free_region(ptr, capacity) };
            return Err(AllocError::OutOfMemory {
                cause: Exhaustion::RegistryFull,
            });
        }

        self.counters.total_allocations += 1;
        self.counters.bytes_allocated += capacity as u64;
        Ok(ptr)
    }

    fn next_stamp(&mut self) -> u64 {
        self.counters.sequence += 1;
        self.counters.sequence
    }

    /// Return a block.
    ///
    /// Double frees, interior pointers, and pointers this allocator never
    /// handed out are rejected with [`DeallocError::UnknownPointer`] before
    /// anything is modified.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), DeallocError> {
        if self.state == State::Destroyed {
            return Err(DeallocError::UseAfterDestroy);
        }

        if self.backing.contains(ptr) {
            let (class, slot) = self
                .backing
                .locate(ptr)
                .ok_or(DeallocError::UnknownPointer)?;
            match self.classes[class.get()].deallocate(slot) {
                Ok(()) => {
                    self.counters.total_deallocations += 1;
                    self.counters.bytes_deallocated += class.block_size() as u64;
                    Ok(())
                }
                Err(DeallocError::Corrupted(report)) => {
                    self.counters.corruption_detected = true;
                    Err(DeallocError::Corrupted(report))
                }
                Err(e) => Err(e),
            }
        } else {
            let block = self
                .large
                .unregister(ptr)
                .map_err(|_| DeallocError::UnknownPointer)?;
            // Safety: the block was registered, so its region came from
            // `source` with exactly `capacity` bytes, and the caller has
            // given it back.
            unsafe { self.source.free_region(block.ptr, block.capacity) };
            self.counters.total_deallocations += 1;
            self.counters.bytes_deallocated += block.capacity as u64;
            Ok(())
        }
    }

    /// Resize a block, moving it if need be.
    ///
    /// * `ptr == None` allocates `new_size` bytes.
    /// * `new_size == 0` frees `ptr` and returns `None`.
    /// * A small block whose new size maps to the same class, or a large
    ///   block whose region is already big enough, stays where it is.
    /// * Large blocks of at least
    ///   [`resize_threshold`](SegFitConfig::resize_threshold) bytes are first
    ///   offered to [`RegionSource::resize_region`].
    /// * Otherwise a new block is allocated, the old contents copied over,
    ///   and the old block freed.
    ///
    /// On failure the original block is untouched and still owned by the
    /// caller.
    pub fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        self.ensure_active()?;
        let Some(ptr) = ptr else {
            return self.allocate(new_size).map(Some);
        };
        if new_size == 0 {
            self.deallocate(ptr)?;
            return Ok(None);
        }
        if new_size > MAX_ALLOCATION_SIZE {
            return Err(AllocError::InvalidSize { size: new_size });
        }

        let new_ptr = match self.origin(ptr).ok_or(AllocError::UnknownPointer)? {
            Origin::Small(class) if size_to_class(new_size) == Some(class) => ptr,
            Origin::Small(class) => self.move_block(ptr, class.block_size(), new_size)?,
            Origin::Large(block) if new_size <= block.capacity => {
                let resized = LargeBlock {
                    size: new_size,
                    ..block
                };
                self.large
                    .relocate(ptr, resized)
                    .map_err(|_| AllocError::UnknownPointer)?;
                ptr
            }
            Origin::Large(block) => self.grow_large(block, new_size)?,
        };

        self.counters.total_reallocations += 1;
        self.counters.bytes_reallocated += new_size as u64;
        Ok(Some(new_ptr))
    }

    /// Grow a large block beyond its region.
    fn grow_large(
        &mut self,
        block: LargeBlock,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(new_size > block.capacity);

        if block.capacity >= self.config.resize_threshold {
            let new_capacity = round_to_pages(new_size, self.source.page_size())
                .ok_or(AllocError::InvalidSize { size: new_size })?;

            // Safety: the region came from `source` with exactly
            // `block.capacity` bytes, and `new_capacity` is a non-zero
            // multiple of the page size.
            let resized =
                unsafe { self.source.resize_region(block.ptr, block.capacity, new_capacity) };
            match resized {
                Ok(new_ptr) => {
                    let moved = LargeBlock {
                        ptr: new_ptr,
                        size: new_size,
                        capacity: new_capacity,
                        stamp: self.next_stamp(),
                    };
                    self.large
                        .relocate(block.ptr, moved)
                        .map_err(|_| AllocError::UnknownPointer)?;

                    self.counters.resize_in_place += 1;
                    self.counters.bytes_deallocated += block.capacity as u64;
                    self.counters.bytes_allocated += new_capacity as u64;
                    log::debug!(
                        "resized large block {:p} -> {new_ptr:p} ({} -> {new_capacity} bytes)",
                        block.ptr,
                        block.capacity
                    );
                    return Ok(new_ptr);
                }
                Err(OsError::Unsupported) => {}
                Err(e) => log::debug!(
                    "resizing large block {:p} failed ({e}); copying instead",
                    block.ptr
                ),
            }
        }

        let new_ptr = self.move_block(block.ptr, block.capacity, new_size)?;
        self.counters.resize_fallbacks += 1;
        Ok(new_ptr)
    }

    /// Allocate-copy-free. `old_usable` is how many bytes of the old block
    /// the caller may have written.
    fn move_block(
        &mut self,
        old: NonNull<u8>,
        old_usable: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let new = self.allocate(new_size)?;

        // Safety: both blocks are live, distinct, and at least this big.
        unsafe {
            ptr::copy_nonoverlapping(
                old.as_ptr().cast_const(),
                new.as_ptr(),
                cmp::min(old_usable, new_size),
            );
        }

        if let Err(e) = self.deallocate(old) {
            // The old block stays with the caller; give back the new one.
            let _ = self.deallocate(new);
            return Err(e.into());
        }
        Ok(new)
    }

    /// Classify a pointer to a live block, or `None` if it is not one.
    fn origin(&mut self, ptr: NonNull<u8>) -> Option<Origin> {
        if self.backing.contains(ptr) {
            let (class, slot) = self.backing.locate(ptr)?;
            self.classes[class.get()]
                .is_handed(slot)
                .then_some(Origin::Small(class))
        } else {
            self.large.find(ptr).map(Origin::Large)
        }
    }

    /// How many bytes the block at `ptr` can actually hold: its class's block
    /// size, or its region's size for large blocks.
    pub fn usable_size(&mut self, ptr: NonNull<u8>) -> Result<usize, DeallocError> {
        if self.state == State::Destroyed {
            return Err(DeallocError::UseAfterDestroy);
        }
        match self.origin(ptr).ok_or(DeallocError::UnknownPointer)? {
            Origin::Small(class) => Ok(class.block_size()),
            Origin::Large(block) => Ok(block.capacity),
        }
    }

    /// Is `ptr` a live block handed out by this allocator?
    pub fn owns(&mut self, ptr: NonNull<u8>) -> bool {
        self.state == State::Active && self.origin(ptr).is_some()
    }

    /// The registry record for the large block at `ptr`.
    pub fn large_block(&mut self, ptr: NonNull<u8>) -> Option<LargeBlock> {
        if self.state == State::Destroyed || self.backing.contains(ptr) {
            return None;
        }
        self.large.find(ptr)
    }

    /// Walk every free list, checking it end to end.
    ///
    /// Every corrupted class is poisoned, not just the first one found; the
    /// first report is returned as [`AllocError::Corrupted`]. A destroyed
    /// allocator reports [`AllocError::UseAfterDestroy`].
    pub fn validate(&mut self) -> Result<(), AllocError> {
        self.ensure_active()?;

        let mut first = None;
        for pool in &mut self.classes {
            if let Err(report) = pool.validate() {
                first.get_or_insert(report);
            }
        }
        match first {
            Some(report) => Err(self.corrupted(report)),
            None => {
                debug_assert!(self.large.len() <= self.config.large_block_limit);
                Ok(())
            }
        }
    }

    fn corrupted(&mut self, report: CorruptionReport) -> AllocError {
        self.counters.corruption_detected = true;
        AllocError::Corrupted(report)
    }

    /// A snapshot of the allocator's counters.
    ///
    /// Once destroyed, this is the allocator's final state as of the call to
    /// [`SegFit::destroy`]; check [`SegFit::state`] to tell the two apart.
    pub fn stats(&self) -> AllocatorStats {
        let c = &self.counters;
        AllocatorStats {
            total_allocations: c.total_allocations,
            total_deallocations: c.total_deallocations,
            total_reallocations: c.total_reallocations,
            bytes_allocated: c.bytes_allocated,
            bytes_deallocated: c.bytes_deallocated,
            bytes_reallocated: c.bytes_reallocated,
            cache_hits: c.cache_hits,
            cache_misses: c.cache_misses,
            resize_in_place: c.resize_in_place,
            resize_fallbacks: c.resize_fallbacks,
            pool_size: self.backing.size(),
            pool_used: self.backing.used(),
            large_blocks: self.large.len(),
            large_bytes: self.large.total_bytes(),
            last_class: c.last_class,
            corruption_detected: c.corruption_detected,
            classes: core::array::from_fn(|i| self.classes[i].stats()),
        }
    }

    fn leak_audit(&self) -> LeakAudit {
        let (small_blocks, small_bytes) = self.classes.iter().fold((0, 0), |(n, b), pool| {
            let live = pool.live_count();
            (n + u64::from(live), b + live as usize * pool.block_size())
        });
        LeakAudit {
            small_blocks,
            small_bytes,
            large_blocks: self.large.len(),
            large_bytes: self.large.total_bytes(),
        }
    }

    /// Release every large block.
    fn release_large_blocks(&mut self) {
        while let Some(block) = self.large.pop() {
            // Safety: registered regions came from `source` with exactly
            // `capacity` bytes. The caller has given up all pointers.
            unsafe { self.source.free_region(block.ptr, block.capacity) };
        }
    }

    /// Return to the state right after creation, keeping the backing region.
    ///
    /// Every outstanding block is released; all pointers previously handed
    /// out become invalid. Counters and the corruption flag are cleared.
    pub fn reset(&mut self) -> Result<(), AllocError> {
        self.ensure_active()?;
        let audit = self.leak_audit();
        log::debug!("resetting allocator; {audit}");

        self.release_large_blocks();

        // Chunks carved after a reset must be zeroed like fresh ones.
        // Safety: the carved prefix of the backing region is ours.
        unsafe {
            self.backing
                .base()
                .as_ptr()
                .write_bytes(0, self.backing.used());
        }
        self.backing.reset();
        for pool in &mut self.classes {
            pool.reset();
        }
        self.counters = Counters::default();

        if self.config.prewarm {
            self.prewarm();
        }
        Ok(())
    }

    /// Release all memory and move to [`State::Destroyed`].
    ///
    /// Returns what was still outstanding; those pointers are now dangling.
    pub fn destroy(&mut self) -> Result<LeakAudit, AllocError> {
        self.ensure_active()?;
        let audit = self.leak_audit();
        if !audit.is_clean() {
            log::warn!("allocator destroyed with {audit}");
        }

        self.release_large_blocks();
        // Safety: the backing region came from `source` with this size, and
        // is never touched again once the state is `Destroyed`.
        unsafe {
            self.source
                .free_region(self.backing.base(), self.backing_region_size)
        };
        self.state = State::Destroyed;
        log::debug!("allocator destroyed");
        Ok(audit)
    }
}

impl<R> Drop for SegFit<R>
where
    R: RegionSource,
{
    fn drop(&mut self) {
        if self.state == State::Active {
            let _ = self.destroy();
        }
    }
}
