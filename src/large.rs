//! Bookkeeping for allocations too big for any size class.
//!
//! Each large block is its own region from the
//! [`RegionSource`](crate::RegionSource). The registry keeps one heap-allocated
//! entry per live block in an intrusive splay tree keyed by address, so
//! recently-touched blocks are the cheapest to find again. The registry is
//! bounded: once `capacity` blocks are live, registration fails. Entries are
//! allocated fallibly, so a global heap that is out of memory is refused the
//! same way.

use alloc::{alloc::alloc, boxed::Box};
use core::{alloc::Layout, ptr::NonNull};
use entry::{LargeEntry, Tree};

/// A live large block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LargeBlock {
    /// Start of the block's region.
    pub ptr: NonNull<u8>,
    /// The size the caller asked for.
    pub size: usize,
    /// The size of the region backing the block. At least `size`.
    pub capacity: usize,
    /// Allocation sequence number at the time the block was registered or
    /// last resized.
    pub stamp: u64,
}

/// The registry cannot take another block: it already holds as many as it
/// may, or there is no memory for the entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CapacityExceeded;

/// No block is registered at the given address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct NotFound;

pub(crate) struct LargeBlockRegistry {
    tree: Tree,
    count: usize,
    capacity: usize,
    /// Sum of the capacities of every registered block.
    bytes: usize,
}

// Safety: the registry exclusively owns every entry in its tree; nothing else
// holds references to them.
unsafe impl Send for LargeBlockRegistry {}

impl LargeBlockRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        LargeBlockRegistry {
            tree: Tree::default(),
            count: 0,
            capacity,
            bytes: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.count >= self.capacity
    }

    /// Total region bytes held by registered blocks.
    #[inline]
    pub(crate) fn total_bytes(&self) -> usize {
        self.bytes
    }

    /// Start tracking a block.
    pub(crate) fn register(&mut self, block: LargeBlock) -> Result<(), CapacityExceeded> {
        if self.is_full() {
            return Err(CapacityExceeded);
        }
        debug_assert!(
            self.tree.find(&block.ptr).is_none(),
            "{:p} registered twice",
            block.ptr
        );

        let entry = new_entry(block).ok_or_else(|| {
            log::warn!("no memory for the registry entry of {:p}", block.ptr);
            CapacityExceeded
        })?;
        self.tree.insert(entry);
        self.count += 1;
        self.bytes += block.capacity;
        log::debug!(
            "registered large block {:p} ({} bytes, {} mapped); {} live",
            block.ptr,
            block.size,
            block.capacity,
            self.count
        );
        Ok(())
    }

    /// Look up the block starting at `ptr`.
    pub(crate) fn find(&mut self, ptr: NonNull<u8>) -> Option<LargeBlock> {
        self.tree.find(&ptr).map(|entry| entry.block())
    }

    /// Stop tracking the block starting at `ptr`, returning its record.
    pub(crate) fn unregister(&mut self, ptr: NonNull<u8>) -> Result<LargeBlock, NotFound> {
        let entry = self.tree.remove(&ptr).ok_or(NotFound)?;
        let block = entry.block();

        // Safety: the entry was just removed from the tree, was allocated in
        // `register`, and nothing else references it.
        unsafe { free_entry(entry) };

        self.count -= 1;
        self.bytes -= block.capacity;
        log::debug!("unregistered large block {:p}; {} live", ptr, self.count);
        Ok(block)
    }

    /// Replace the record for the block at `old` with `block`, which may live
    /// at a different address after a resize. The existing entry is re-keyed,
    /// so this never allocates.
    pub(crate) fn relocate(&mut self, old: NonNull<u8>, block: LargeBlock) -> Result<(), NotFound> {
        let entry = self.tree.remove(&old).ok_or(NotFound)?;
        let previous = entry.block();
        entry.set_block(block);
        self.tree.insert(entry);

        self.bytes = self.bytes - previous.capacity + block.capacity;
        log::debug!("large block {old:p} is now {:p}", block.ptr);
        Ok(())
    }

    /// Remove and return an arbitrary registered block.
    pub(crate) fn pop(&mut self) -> Option<LargeBlock> {
        let entry = self.tree.pop_root()?;
        let block = entry.block();

        // Safety: same as in `unregister`.
        unsafe { free_entry(entry) };

        self.count -= 1;
        self.bytes -= block.capacity;
        Some(block)
    }
}

impl Drop for LargeBlockRegistry {
    fn drop(&mut self) {
        // The regions themselves are the allocator's to release; only the
        // entries are ours.
        while self.pop().is_some() {}
    }
}

/// Allocate an entry for `block`, or `None` if the global heap refuses.
fn new_entry(block: LargeBlock) -> Option<&'static LargeEntry<'static>> {
    let layout = Layout::new::<LargeEntry<'static>>();
    // Safety: the layout is non-zero sized.
    let raw = NonNull::new(unsafe { alloc(layout) })?.cast::<LargeEntry<'static>>();
    // Safety: `raw` is freshly allocated with the layout of an entry, and
    // `Box::from_raw` in `free_entry` frees it with that same layout.
    unsafe {
        raw.as_ptr().write(LargeEntry::new(block));
        Some(&*raw.as_ptr())
    }
}

/// Free an entry allocated by [`new_entry`].
///
/// # Safety
///
/// The entry must not be in the tree or otherwise referenced.
unsafe fn free_entry(entry: &'static LargeEntry<'static>) {
    let raw = entry as *const LargeEntry<'static> as *mut LargeEntry<'static>;
    drop(Box::from_raw(raw));
}

mod entry {
    use super::LargeBlock;
    use core::{cell::Cell, cmp::Ordering, ptr::NonNull};
    use intrusive_splay_tree::{Node, SplayTree, TreeOrd};

    /// A registry entry: a block record plus its splay tree links.
    ///
    /// Note: the `'a` lifetime keeps the tree code free of `unsafe` inside
    /// this module; outside it is always erased to `'static` and entries are
    /// freed by hand.
    #[derive(Debug)]
    pub(super) struct LargeEntry<'a> {
        block: Cell<LargeBlock>,
        node: Node<'a>,
    }

    impl<'a> LargeEntry<'a> {
        pub(super) fn new(block: LargeBlock) -> Self {
            LargeEntry {
                block: Cell::new(block),
                node: Node::default(),
            }
        }

        pub(super) fn block(&self) -> LargeBlock {
            self.block.get()
        }

        /// Only while the entry is out of the tree: the address is its key.
        pub(super) fn set_block(&self, block: LargeBlock) {
            self.block.set(block);
        }
    }

    pub(super) struct ByAddress;
    pub(super) type Tree = SplayTree<'static, ByAddress>;

    /// Entries are ordered by block address.
    impl<'a> TreeOrd<'a, ByAddress> for LargeEntry<'a> {
        fn tree_cmp(&self, other: &'a LargeEntry<'a>) -> Ordering {
            Ord::cmp(&self.block().ptr, &other.block().ptr)
        }
    }

    /// Lookup of an entry by the address of its block.
    impl<'a> TreeOrd<'a, ByAddress> for NonNull<u8> {
        fn tree_cmp(&self, other: &'a LargeEntry<'a>) -> Ordering {
            Ord::cmp(self, &other.block().ptr)
        }
    }

    intrusive_splay_tree::impl_intrusive_node! {
        impl<'a> IntrusiveNode<'a> for ByAddress
        where
            type Elem = LargeEntry<'a>,
            node = node;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(addr: usize, size: usize) -> LargeBlock {
        LargeBlock {
            ptr: NonNull::new(addr as *mut u8).unwrap(),
            size,
            capacity: size,
            stamp: 0,
        }
    }

    #[test]
    fn register_find_unregister() {
        let mut registry = LargeBlockRegistry::new(4);
        let a = block(0x10000, 0x20000);
        let b = block(0x40000, 0x30000);
        registry.register(a).unwrap();
        registry.register(b).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.total_bytes(), 0x50000);

        assert_eq!(registry.find(a.ptr), Some(a));
        assert_eq!(registry.find(b.ptr), Some(b));
        assert_eq!(registry.find(NonNull::new(0x10008 as *mut u8).unwrap()), None);

        assert_eq!(registry.unregister(a.ptr), Ok(a));
        assert_eq!(registry.unregister(a.ptr), Err(NotFound));
        assert_eq!(registry.find(a.ptr), None);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.total_bytes(), 0x30000);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut registry = LargeBlockRegistry::new(2);
        registry.register(block(0x1000, 0x1000)).unwrap();
        registry.register(block(0x2000, 0x1000)).unwrap();
        assert!(registry.is_full());
        assert_eq!(
            registry.register(block(0x3000, 0x1000)),
            Err(CapacityExceeded)
        );

        registry.unregister(NonNull::new(0x1000 as *mut u8).unwrap()).unwrap();
        registry.register(block(0x3000, 0x1000)).unwrap();
    }

    #[test]
    fn relocate_rekeys_the_entry() {
        let mut registry = LargeBlockRegistry::new(1);
        let old = block(0x1000, 0x1000);
        registry.register(old).unwrap();

        let new = LargeBlock {
            stamp: 7,
            ..block(0x9000, 0x4000)
        };
        registry.relocate(old.ptr, new).unwrap();
        assert_eq!(registry.find(old.ptr), None);
        assert_eq!(registry.find(new.ptr), Some(new));
        assert_eq!(registry.total_bytes(), 0x4000);
    }

    #[test]
    fn pop_drains() {
        let mut registry = LargeBlockRegistry::new(8);
        for i in 1..=5 {
            registry.register(block(i * 0x1000, 0x1000)).unwrap();
        }
        let mut seen = alloc::vec::Vec::new();
        while let Some(b) = registry.pop() {
            seen.push(b.ptr.as_ptr() as usize);
        }
        seen.sort_unstable();
        assert_eq!(seen, [0x1000, 0x2000, 0x3000, 0x4000, 0x5000]);
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.total_bytes(), 0);
    }
}
