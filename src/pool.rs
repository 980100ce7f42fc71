//! Per-size-class pools and the backing pool they carve chunks from.
//!
//! A size class owns a list of chunks carved from the allocator's single
//! backing region, bump-pointer style, and a slot table with one
//! [`FreeBlock`] record per block in those chunks. Slot `s` lives in chunk
//! `s / blocks_per_chunk` at block offset `s % blocks_per_chunk`, so mapping a
//! pointer back to its slot is pure arithmetic.
//!
//! The free list is threaded through the slot table rather than through the
//! freed memory itself. A block's record is tagged either free, with its
//! links, or handed out. That tag is checked before any link is trusted.

use crate::error::{CorruptionKind, CorruptionReport, DeallocError};
use crate::size_class::ClassIndex;
use crate::stats::ClassStats;
use alloc::vec::Vec;
use core::ptr::NonNull;

/// Index of a block within its size class's slot table.
pub(crate) type Slot = u32;

/// The bookkeeping record for one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FreeBlock {
    /// Linked into its class's free list.
    Free {
        next: Option<Slot>,
        prev: Option<Slot>,
    },

    /// Owned by a caller. The allocator knows nothing more about it.
    Handed,
}

/// A block handed out by a [`SizeClassPool`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct Block {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) slot: Slot,
}

/// Which size class a carved chunk belongs to, and which of that class's
/// chunks it is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ChunkOwner {
    class: ClassIndex,
    ordinal: u32,
}

/// The single contiguous region every size class carves its chunks from.
///
/// Chunks are handed out in address order and never returned, except by
/// [`BackingPool::reset`].
pub(crate) struct BackingPool {
    base: NonNull<u8>,
    chunk_size: usize,
    carved: usize,
    /// One entry per chunk in the pool, `None` until it is carved.
    owners: Vec<Option<ChunkOwner>>,
}

impl BackingPool {
    /// Manage `chunk_count` chunks of `chunk_size` bytes starting at `base`.
    pub(crate) fn new(base: NonNull<u8>, chunk_size: usize, chunk_count: usize) -> Self {
        debug_assert!(chunk_size.is_power_of_two());
        let mut owners = Vec::with_capacity(chunk_count);
        owners.resize(chunk_count, None);
        BackingPool {
            base,
            chunk_size,
            carved: 0,
            owners,
        }
    }

    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Total bytes managed.
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.owners.len() * self.chunk_size
    }

    /// Bytes carved into chunks so far.
    #[inline]
    pub(crate) fn used(&self) -> usize {
        self.carved * self.chunk_size
    }

    /// Carve the next chunk for `class`, recording it as that class's
    /// `ordinal`-th chunk. `None` when the pool is exhausted.
    fn carve(&mut self, class: ClassIndex, ordinal: u32) -> Option<NonNull<u8>> {
        let index = self.carved;
        let owner = self.owners.get_mut(index)?;
        *owner = Some(ChunkOwner { class, ordinal });
        self.carved += 1;

        // Safety: `index` is within the pool, so the offset stays inside the
        // backing region.
        let chunk = unsafe { self.base.add(index * self.chunk_size) };
        log::debug!(
            "carved chunk {index} at {chunk:p} for {class} ({} of {} chunks used)",
            self.carved,
            self.owners.len()
        );
        Some(chunk)
    }

    /// Does `ptr` point anywhere inside the backing region?
    #[inline]
    pub(crate) fn contains(&self, ptr: NonNull<u8>) -> bool {
        let start = self.base.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= start && addr - start < self.size()
    }

    /// Map a pointer to the class and slot of the block starting at it.
    ///
    /// Returns `None` for pointers outside the pool, inside chunks that were
    /// never carved, or not at the start of a block.
    pub(crate) fn locate(&self, ptr: NonNull<u8>) -> Option<(ClassIndex, Slot)> {
        if !self.contains(ptr) {
            return None;
        }
        let offset = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        let chunk = offset / self.chunk_size;
        let within = offset % self.chunk_size;

        let owner = (*self.owners.get(chunk)?)?;
        let block_size = owner.class.block_size();
        if within % block_size != 0 {
            return None;
        }

        let blocks_per_chunk = (self.chunk_size / block_size) as u64;
        let slot = u64::from(owner.ordinal) * blocks_per_chunk + (within / block_size) as u64;
        let slot = Slot::try_from(slot).ok()?;
        Some((owner.class, slot))
    }

    /// Forget every carved chunk.
    pub(crate) fn reset(&mut self) {
        self.carved = 0;
        for owner in &mut self.owners {
            *owner = None;
        }
    }
}

/// The blocks of one size class.
pub(crate) struct SizeClassPool {
    class: ClassIndex,
    blocks_per_chunk: u32,

    /// Base address of each of this class's chunks, in carve order.
    chunks: Vec<NonNull<u8>>,

    /// One record per block across all chunks.
    slots: Vec<FreeBlock>,

    head: Option<Slot>,
    tail: Option<Slot>,

    free_count: u32,
    total_count: u32,
    alloc_count: u64,
    dealloc_count: u64,

    /// Set once the free list has been found corrupted. Every later
    /// operation on this class fails with this report.
    poisoned: Option<CorruptionReport>,
}

impl SizeClassPool {
    pub(crate) fn new(class: ClassIndex, chunk_size: usize) -> Self {
        let blocks_per_chunk = u32::try_from(chunk_size / class.block_size()).unwrap_or(u32::MAX);
        SizeClassPool {
            class,
            blocks_per_chunk,
            chunks: Vec::new(),
            slots: Vec::new(),
            head: None,
            tail: None,
            free_count: 0,
            total_count: 0,
            alloc_count: 0,
            dealloc_count: 0,
            poisoned: None,
        }
    }

    #[inline]
    pub(crate) fn class(&self) -> ClassIndex {
        self.class
    }

    #[inline]
    pub(crate) fn block_size(&self) -> usize {
        self.class.block_size()
    }

    #[inline]
    pub(crate) fn free_count(&self) -> u32 {
        self.free_count
    }

    #[inline]
    pub(crate) fn total_count(&self) -> u32 {
        self.total_count
    }

    /// Blocks currently handed out.
    #[inline]
    pub(crate) fn live_count(&self) -> u32 {
        self.total_count - self.free_count
    }

    #[cfg(test)]
    pub(crate) fn poisoned(&self) -> Option<CorruptionReport> {
        self.poisoned
    }

    /// Is `slot` a block currently owned by a caller?
    #[inline]
    pub(crate) fn is_handed(&self, slot: Slot) -> bool {
        matches!(self.slots.get(slot as usize), Some(FreeBlock::Handed))
    }

    /// Pop a block off the free list, carving a fresh chunk from `backing`
    /// first if the list is empty.
    ///
    /// `Ok(None)` means both the free list and the backing pool are empty.
    pub(crate) fn allocate(
        &mut self,
        backing: &mut BackingPool,
    ) -> Result<Option<Block>, CorruptionReport> {
        if let Some(report) = self.poisoned {
            return Err(report);
        }

        if self.head.is_none() && !self.grow(backing) {
            return Ok(None);
        }
        let Some(slot) = self.head else {
            return Ok(None);
        };

        let next = match self.slots.get(slot as usize) {
            Some(FreeBlock::Free { next, prev: None }) => Ok(*next),
            Some(FreeBlock::Handed) => Err((slot, CorruptionKind::NotFree)),
            _ => Err((slot, CorruptionKind::BrokenLink)),
        };
        let next = match next {
            Ok(next) => next,
            Err((at, kind)) => return Err(self.poison(Some(at), kind)),
        };

        let unlinked = match next {
            Some(next) => match self.slots.get_mut(next as usize) {
                Some(FreeBlock::Free { prev, .. }) if *prev == Some(slot) => {
                    *prev = None;
                    Ok(())
                }
                Some(FreeBlock::Handed) => Err((next, CorruptionKind::NotFree)),
                _ => Err((next, CorruptionKind::BrokenLink)),
            },
            None => {
                self.tail = None;
                Ok(())
            }
        };
        if let Err((at, kind)) = unlinked {
            return Err(self.poison(Some(at), kind));
        }

        self.head = next;
        self.slots[slot as usize] = FreeBlock::Handed;
        self.free_count -= 1;
        self.alloc_count += 1;

        let ptr = self.block_ptr(slot);
        log::trace!("{}: handed out slot {slot} at {ptr:p}", self.class);
        Ok(Some(Block { ptr, slot }))
    }

    /// Push a caller's block back onto the free list.
    ///
    /// A slot that is already free is a double free and is reported as an
    /// unknown pointer. Nothing is written unless the current head of the
    /// list checks out.
    pub(crate) fn deallocate(&mut self, slot: Slot) -> Result<(), DeallocError> {
        if let Some(report) = self.poisoned {
            return Err(DeallocError::Corrupted(report));
        }

        match self.slots.get(slot as usize) {
            Some(FreeBlock::Handed) => {}
            Some(FreeBlock::Free { .. }) | None => return Err(DeallocError::UnknownPointer),
        }

        let old_head = self.head;
        let linked = match old_head {
            Some(head) => match self.slots.get_mut(head as usize) {
                Some(FreeBlock::Free { prev, .. }) if prev.is_none() => {
                    *prev = Some(slot);
                    Ok(())
                }
                Some(FreeBlock::Handed) => Err((head, CorruptionKind::NotFree)),
                _ => Err((head, CorruptionKind::BrokenLink)),
            },
            None => {
                self.tail = Some(slot);
                Ok(())
            }
        };
        if let Err((at, kind)) = linked {
            let report = self.poison(Some(at), kind);
            return Err(DeallocError::Corrupted(report));
        }

        self.slots[slot as usize] = FreeBlock::Free {
            next: old_head,
            prev: None,
        };
        self.head = Some(slot);
        self.free_count += 1;
        self.dealloc_count += 1;

        log::trace!("{}: slot {slot} returned to free list", self.class);
        Ok(())
    }

    /// The address of the block in `slot`.
    pub(crate) fn block_ptr(&self, slot: Slot) -> NonNull<u8> {
        let chunk = (slot / self.blocks_per_chunk) as usize;
        let index = (slot % self.blocks_per_chunk) as usize;
        // Safety: every slot in the table belongs to a carved chunk, and the
        // block offset is within that chunk.
        unsafe { self.chunks[chunk].add(index * self.block_size()) }
    }

    /// Carve one chunk from `backing` and link all of its blocks into the
    /// (empty) free list, lowest address first.
    pub(crate) fn grow(&mut self, backing: &mut BackingPool) -> bool {
        debug_assert!(self.head.is_none());
        debug_assert_eq!(self.free_count, 0);

        let count = self.blocks_per_chunk;
        let Some(new_total) = self.total_count.checked_add(count) else {
            return false;
        };
        let Ok(ordinal) = u32::try_from(self.chunks.len()) else {
            return false;
        };

        // The slot table lives on the global heap. Make room for the new
        // records before carving so a refused reservation costs no chunk.
        if self.chunks.try_reserve(1).is_err()
            || self.slots.try_reserve(count as usize).is_err()
        {
            log::warn!(
                "{}: no memory for {count} more block records",
                self.class
            );
            return false;
        }

        let Some(chunk) = backing.carve(self.class, ordinal) else {
            log::debug!("{}: backing pool exhausted", self.class);
            return false;
        };

        let first = self.total_count;
        let last = new_total - 1;
        self.chunks.push(chunk);
        self.slots.extend((first..new_total).map(|slot| FreeBlock::Free {
            next: (slot < last).then(|| slot + 1),
            prev: (slot > first).then(|| slot - 1),
        }));

        self.head = Some(first);
        self.tail = Some(last);
        self.free_count = count;
        self.total_count = new_total;
        true
    }

    /// Walk the entire free list, checking tags, links, and counters.
    pub(crate) fn validate(&mut self) -> Result<(), CorruptionReport> {
        if let Some(report) = self.poisoned {
            return Err(report);
        }

        let mut walked: u32 = 0;
        let mut prev_slot = None;
        let mut cursor = self.head;

        while let Some(slot) = cursor {
            // A cycle would otherwise walk forever.
            if walked >= self.total_count {
                let kind = CorruptionKind::CountMismatch {
                    walked: walked.saturating_add(1),
                    recorded: self.free_count,
                };
                return Err(self.poison(Some(slot), kind));
            }

            match self.slots.get(slot as usize) {
                Some(FreeBlock::Free { next, prev }) => {
                    if *prev != prev_slot {
                        return Err(self.poison(Some(slot), CorruptionKind::BrokenLink));
                    }
                    prev_slot = Some(slot);
                    cursor = *next;
                }
                Some(FreeBlock::Handed) => {
                    return Err(self.poison(Some(slot), CorruptionKind::NotFree))
                }
                None => return Err(self.poison(Some(slot), CorruptionKind::BrokenLink)),
            }
            walked += 1;
        }

        if prev_slot != self.tail {
            return Err(self.poison(self.tail, CorruptionKind::TailMismatch));
        }
        if walked != self.free_count {
            let kind = CorruptionKind::CountMismatch {
                walked,
                recorded: self.free_count,
            };
            return Err(self.poison(None, kind));
        }

        let tagged_free = self
            .slots
            .iter()
            .filter(|b| matches!(b, FreeBlock::Free { .. }))
            .count();
        if tagged_free != walked as usize || self.slots.len() != self.total_count as usize {
            let kind = CorruptionKind::CountMismatch {
                walked,
                recorded: u32::try_from(tagged_free).unwrap_or(u32::MAX),
            };
            return Err(self.poison(None, kind));
        }

        Ok(())
    }

    /// Drop every chunk and block record. The chunks themselves go back to
    /// the backing pool via [`BackingPool::reset`].
    pub(crate) fn reset(&mut self) {
        *self = SizeClassPool::new(self.class, self.blocks_per_chunk as usize * self.block_size());
    }

    pub(crate) fn stats(&self) -> ClassStats {
        ClassStats {
            class: self.class,
            block_size: self.block_size(),
            chunks: self.chunks.len(),
            total_blocks: self.total_count,
            free_blocks: self.free_count,
            allocations: self.alloc_count,
            deallocations: self.dealloc_count,
            poisoned: self.poisoned.is_some(),
        }
    }

    /// Record corruption and refuse all further operations on this class.
    fn poison(&mut self, slot: Option<Slot>, kind: CorruptionKind) -> CorruptionReport {
        let report = CorruptionReport {
            class: self.class,
            slot,
            kind,
        };
        log::warn!("free-list corruption detected: {report}");
        *self.poisoned.get_or_insert(report)
    }

    /// Overwrite a block record, bypassing all checks.
    #[cfg(test)]
    pub(crate) fn tamper(&mut self, slot: Slot, block: FreeBlock) {
        self.slots[slot as usize] = block;
    }

    #[cfg(test)]
    pub(crate) fn head(&self) -> Option<Slot> {
        self.head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{GlobalRegions, RegionSource};
    use crate::size_class::size_to_class;

    const CHUNK: usize = 64 * 1024;

    struct Fixture {
        backing: BackingPool,
        chunks: usize,
    }

    impl Fixture {
        fn new(chunks: usize) -> Self {
            let base = GlobalRegions.alloc_region(chunks * CHUNK).unwrap();
            Fixture {
                backing: BackingPool::new(base, CHUNK, chunks),
                chunks,
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            unsafe {
                GlobalRegions.free_region(self.backing.base(), self.chunks * CHUNK);
            }
        }
    }

    fn class_of(size: usize) -> ClassIndex {
        size_to_class(size).unwrap()
    }

    #[test]
    fn lazily_carves_and_pops_in_address_order() {
        let mut fx = Fixture::new(2);
        let mut pool = SizeClassPool::new(class_of(64), CHUNK);
        assert_eq!(pool.total_count(), 0);
        assert_eq!(fx.backing.used(), 0);

        let a = pool.allocate(&mut fx.backing).unwrap().unwrap();
        let b = pool.allocate(&mut fx.backing).unwrap().unwrap();
        assert_eq!(fx.backing.used(), CHUNK);
        assert_eq!(pool.total_count(), 1024);
        assert_eq!(pool.free_count(), 1022);
        assert_eq!(a.ptr, fx.backing.base());
        assert_eq!(b.ptr.as_ptr() as usize - a.ptr.as_ptr() as usize, 64);
        assert_eq!(pool.validate(), Ok(()));
    }

    #[test]
    fn free_list_is_lifo() {
        let mut fx = Fixture::new(1);
        let mut pool = SizeClassPool::new(class_of(32), CHUNK);
        let a = pool.allocate(&mut fx.backing).unwrap().unwrap();
        let b = pool.allocate(&mut fx.backing).unwrap().unwrap();
        pool.deallocate(a.slot).unwrap();
        pool.deallocate(b.slot).unwrap();

        assert_eq!(pool.allocate(&mut fx.backing).unwrap().unwrap().slot, b.slot);
        assert_eq!(pool.allocate(&mut fx.backing).unwrap().unwrap().slot, a.slot);
        assert_eq!(pool.validate(), Ok(()));
    }

    #[test]
    fn double_free_is_rejected_without_damage() {
        let mut fx = Fixture::new(1);
        let mut pool = SizeClassPool::new(class_of(8), CHUNK);
        let a = pool.allocate(&mut fx.backing).unwrap().unwrap();
        pool.deallocate(a.slot).unwrap();
        assert_eq!(pool.deallocate(a.slot), Err(DeallocError::UnknownPointer));
        assert_eq!(pool.validate(), Ok(()));
        assert!(pool.poisoned().is_none());
    }

    #[test]
    fn exhausting_the_backing_pool() {
        let mut fx = Fixture::new(2);
        let mut pool = SizeClassPool::new(class_of(CHUNK), CHUNK);
        let a = pool.allocate(&mut fx.backing).unwrap().unwrap();
        let _b = pool.allocate(&mut fx.backing).unwrap().unwrap();
        assert!(pool.allocate(&mut fx.backing).unwrap().is_none());

        pool.deallocate(a.slot).unwrap();
        let again = pool.allocate(&mut fx.backing).unwrap().unwrap();
        assert_eq!(again.ptr, a.ptr);
    }

    #[test]
    fn locate_maps_pointers_back_to_slots() {
        let mut fx = Fixture::new(3);
        let mut small = SizeClassPool::new(class_of(16), CHUNK);
        let mut big = SizeClassPool::new(class_of(4096), CHUNK);

        let s = small.allocate(&mut fx.backing).unwrap().unwrap();
        let b1 = big.allocate(&mut fx.backing).unwrap().unwrap();
        let b2 = big.allocate(&mut fx.backing).unwrap().unwrap();

        assert_eq!(fx.backing.locate(s.ptr), Some((class_of(16), s.slot)));
        assert_eq!(fx.backing.locate(b1.ptr), Some((class_of(4096), b1.slot)));
        assert_eq!(fx.backing.locate(b2.ptr), Some((class_of(4096), b2.slot)));

        // Interior pointer.
        let interior = unsafe { b1.ptr.add(8) };
        assert_eq!(fx.backing.locate(interior), None);

        // The third chunk has not been carved.
        let uncarved = unsafe { fx.backing.base().add(2 * CHUNK) };
        assert_eq!(fx.backing.locate(uncarved), None);

        // Outside the pool entirely.
        let past_end = unsafe { fx.backing.base().add(3 * CHUNK) };
        assert!(!fx.backing.contains(past_end));
    }

    #[test]
    fn tampered_head_poisons_the_class() {
        let mut fx = Fixture::new(1);
        let mut pool = SizeClassPool::new(class_of(128), CHUNK);
        let a = pool.allocate(&mut fx.backing).unwrap().unwrap();
        let head = pool.head().unwrap();
        pool.tamper(head, FreeBlock::Handed);

        let report = pool.allocate(&mut fx.backing).unwrap_err();
        assert_eq!(report.kind, CorruptionKind::NotFree);
        assert_eq!(report.slot, Some(head));
        assert_eq!(
            pool.deallocate(a.slot),
            Err(DeallocError::Corrupted(report))
        );
        assert_eq!(pool.validate(), Err(report));
    }

    #[test]
    fn validate_catches_broken_links() {
        let mut fx = Fixture::new(1);
        let mut pool = SizeClassPool::new(class_of(1024), CHUNK);
        pool.grow(&mut fx.backing);
        pool.tamper(
            3,
            FreeBlock::Free {
                next: Some(4),
                prev: Some(0),
            },
        );
        let report = pool.validate().unwrap_err();
        assert_eq!(report.kind, CorruptionKind::BrokenLink);
        assert_eq!(report.slot, Some(3));
    }

    #[test]
    fn validate_catches_cycles() {
        let mut fx = Fixture::new(1);
        let mut pool = SizeClassPool::new(class_of(8192), CHUNK);
        pool.grow(&mut fx.backing);
        // 8 blocks; point the last one back at the first.
        pool.tamper(
            7,
            FreeBlock::Free {
                next: Some(0),
                prev: Some(6),
            },
        );
        pool.tamper(
            0,
            FreeBlock::Free {
                next: Some(1),
                prev: None,
            },
        );
        let report = pool.validate().unwrap_err();
        assert!(matches!(report.kind, CorruptionKind::BrokenLink | CorruptionKind::CountMismatch { .. }));
    }

    #[test]
    fn reset_forgets_everything() {
        let mut fx = Fixture::new(1);
        let mut pool = SizeClassPool::new(class_of(256), CHUNK);
        pool.allocate(&mut fx.backing).unwrap().unwrap();
        pool.reset();
        fx.backing.reset();
        assert_eq!(pool.total_count(), 0);
        assert_eq!(fx.backing.used(), 0);
        let again = pool.allocate(&mut fx.backing).unwrap().unwrap();
        assert_eq!(again.ptr, fx.backing.base());
    }
}
