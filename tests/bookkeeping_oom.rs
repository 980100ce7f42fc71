//! Running the global heap dry while the allocator needs room for its own
//! bookkeeping is an ordinary out-of-memory error, not an abort.

use segfit::{AllocError, Exhaustion, GlobalRegions, SegFit, SegFitConfig, PAGE_SIZE};
use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::Cell,
    ptr,
};

const MIB: usize = 1 << 20;

thread_local! {
    static REFUSING: Cell<bool> = const { Cell::new(false) };
}

fn refusing(layout: Layout) -> bool {
    // Page-aligned requests are the allocator's regions; let them through.
    layout.align() < PAGE_SIZE && REFUSING.try_with(Cell::get).unwrap_or(false)
}

/// The system allocator, except that it refuses small requests on any thread
/// inside [`refuse`].
struct Refusing;

unsafe impl GlobalAlloc for Refusing {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if refusing(layout) {
            return ptr::null_mut();
        }
        System.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if refusing(layout) {
            return ptr::null_mut();
        }
        System.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if refusing(layout) {
            return ptr::null_mut();
        }
        System.realloc(ptr, layout, new_size)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static GLOBAL: Refusing = Refusing;

fn refuse<T>(f: impl FnOnce() -> T) -> T {
    REFUSING.with(|r| r.set(true));
    let out = f();
    REFUSING.with(|r| r.set(false));
    out
}

fn heap() -> SegFit {
    SegFit::create(SegFitConfig::default().with_pool_size(MIB), GlobalRegions).unwrap()
}

#[test]
fn no_room_for_block_records() {
    let mut heap = heap();

    // An 8-byte class chunk needs 8192 block records.
    assert_eq!(
        refuse(|| heap.allocate(8)),
        Err(AllocError::OutOfMemory {
            cause: Exhaustion::PoolExhausted
        })
    );
    // The chunk was not carved for nothing.
    assert_eq!(heap.stats().pool_used, 0);
    assert_eq!(heap.validate(), Ok(()));

    let p = heap.allocate(8).unwrap();
    assert_eq!(heap.stats().pool_used, 64 * 1024);
    heap.deallocate(p).unwrap();
    assert!(heap.destroy().unwrap().is_clean());
}

#[test]
fn no_room_for_a_registry_entry() {
    let mut heap = heap();

    assert_eq!(
        refuse(|| heap.allocate(MIB)),
        Err(AllocError::OutOfMemory {
            cause: Exhaustion::RegistryFull
        })
    );
    assert_eq!(heap.stats().large_blocks, 0);
    assert_eq!(heap.stats().large_bytes, 0);

    let p = heap.allocate(MIB).unwrap();
    heap.deallocate(p).unwrap();
    assert!(heap.destroy().unwrap().is_clean());
}

#[test]
fn in_place_resize_needs_no_new_entry() {
    let mut heap = heap();
    let p = heap.allocate(MIB).unwrap();

    let q = refuse(|| heap.reallocate(Some(p), 4 * MIB))
        .unwrap()
        .unwrap();
    let stats = heap.stats();
    assert_eq!(stats.resize_in_place, 1);
    assert_eq!(stats.large_blocks, 1);
    assert_eq!(stats.large_bytes, 4 * MIB);
    assert_eq!(heap.usable_size(q), Ok(4 * MIB));

    heap.deallocate(q).unwrap();
    assert!(heap.destroy().unwrap().is_clean());
}
