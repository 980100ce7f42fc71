use segfit::{
    AllocError, CreateError, DeallocError, Exhaustion, GlobalRegions, OsError, RegionSource,
    SegFit, SegFitConfig, SharedSegFit, SpinLock, State, MAX_SMALL_SIZE,
};
use std::{cell::Cell, collections::HashSet, ptr::NonNull, rc::Rc};

const MIB: usize = 1 << 20;

fn heap_with_pool(pool_size: usize) -> SegFit {
    let _ = env_logger::try_init();
    SegFit::create(
        SegFitConfig::default().with_pool_size(pool_size),
        GlobalRegions,
    )
    .unwrap()
}

#[test]
fn reverse_free_then_reallocate_reuses_one_chunk() {
    let mut heap = heap_with_pool(MIB);

    let first: Vec<_> = (0..100).map(|_| heap.allocate(64).unwrap()).collect();
    for p in first.iter().rev() {
        heap.deallocate(*p).unwrap();
    }
    let freed: HashSet<_> = first.iter().copied().collect();

    let second: Vec<_> = (0..100).map(|_| heap.allocate(64).unwrap()).collect();
    assert!(second.iter().all(|p| freed.contains(p)));

    let stats = heap.stats();
    assert_eq!(stats.pool_used, 64 * 1024);
    assert_eq!(stats.classes[3].chunks, 1);
    assert_eq!(stats.active_allocations(), 100);
    assert_eq!(heap.validate(), Ok(()));
}

#[test]
fn one_block_is_reused_immediately() {
    let mut heap = heap_with_pool(MIB);
    for size in [1, 8, 200, 5000, MAX_SMALL_SIZE] {
        let a = heap.allocate(size).unwrap();
        heap.deallocate(a).unwrap();
        assert_eq!(heap.allocate(size).unwrap(), a, "size {size}");
    }
}

#[test]
fn megabyte_block_round_trip() {
    let mut heap = heap_with_pool(MIB);
    let p = heap.allocate(MIB).unwrap();
    assert_eq!(heap.stats().large_blocks, 1);
    heap.deallocate(p).unwrap();
    assert_eq!(heap.stats().large_blocks, 0);
    assert_eq!(heap.deallocate(p), Err(DeallocError::UnknownPointer));
}

#[test]
fn out_of_memory_is_recoverable() {
    let mut heap = heap_with_pool(MIB);
    let mut held = Vec::new();
    let err = loop {
        match heap.allocate(1000) {
            Ok(p) => held.push(p),
            Err(e) => break e,
        }
    };
    assert_eq!(
        err,
        AllocError::OutOfMemory {
            cause: Exhaustion::PoolExhausted
        }
    );
    assert_eq!(held.len(), MIB / 1024);

    for p in held.drain(..) {
        heap.deallocate(p).unwrap();
    }
    let again = heap.allocate(1000).unwrap();
    heap.deallocate(again).unwrap();
    assert!(heap.destroy().unwrap().is_clean());
}

#[test]
fn stats_report_renders() {
    let mut heap = heap_with_pool(MIB);
    let p = heap.allocate(48).unwrap();
    heap.allocate(2 * MIB).unwrap();
    heap.deallocate(p).unwrap();

    let stats = heap.stats();
    let report = stats.to_string();
    assert!(report.contains("allocations:   2"));
    assert!(report.contains("large blocks:  1"));
    assert!(report.contains("64 B"));
    assert!(stats.fragmentation_ratio() > 0.99);
}

/// A region source that refuses once its budget of regions is spent, counts
/// what is outstanding, and cannot resize.
struct Rationed {
    budget: Cell<usize>,
    outstanding: Rc<Cell<usize>>,
}

impl Rationed {
    fn new(budget: usize) -> Self {
        Rationed {
            budget: Cell::new(budget),
            outstanding: Rc::new(Cell::new(0)),
        }
    }
}

unsafe impl RegionSource for Rationed {
    fn page_size(&self) -> usize {
        GlobalRegions.page_size()
    }

    fn alloc_region(&self, size: usize) -> Result<NonNull<u8>, OsError> {
        if self.budget.get() == 0 {
            return Err(OsError::Refused);
        }
        let region = GlobalRegions.alloc_region(size)?;
        self.budget.set(self.budget.get() - 1);
        self.outstanding.set(self.outstanding.get() + 1);
        Ok(region)
    }

    unsafe fn free_region(&self, region: NonNull<u8>, size: usize) {
        self.outstanding.set(self.outstanding.get() - 1);
        GlobalRegions.free_region(region, size);
    }
}

fn rationed_heap(budget: usize) -> SegFit<Rationed> {
    let _ = env_logger::try_init();
    SegFit::create(
        SegFitConfig::default().with_pool_size(MIB),
        Rationed::new(budget),
    )
    .unwrap()
}

#[test]
fn refused_backing_pool_fails_creation() {
    let result = SegFit::create(SegFitConfig::default(), Rationed::new(0));
    assert!(matches!(result, Err(CreateError::Os(OsError::Refused))));
}

#[test]
fn invalid_config_fails_creation() {
    let result = SegFit::create(
        SegFitConfig::default().with_chunk_size(1000),
        GlobalRegions,
    );
    assert!(matches!(result, Err(CreateError::Config(_))));
}

#[test]
fn refused_large_block_is_recoverable() {
    let mut heap = rationed_heap(2);
    let a = heap.allocate(MIB).unwrap();
    assert_eq!(
        heap.allocate(MIB),
        Err(AllocError::OutOfMemory {
            cause: Exhaustion::OsRefused(OsError::Refused)
        })
    );
    assert_eq!(heap.stats().large_blocks, 1);

    let small = heap.allocate(64).unwrap();
    heap.deallocate(small).unwrap();
    heap.deallocate(a).unwrap();
    assert_eq!(heap.source().outstanding.get(), 1);
}

#[test]
fn growth_without_resize_support_copies() {
    let mut heap = rationed_heap(3);
    let p = heap.allocate(MIB).unwrap();
    unsafe { p.as_ptr().write_bytes(0x9E, MIB) };

    let q = heap.reallocate(Some(p), 2 * MIB).unwrap().unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), MIB) };
    assert!(bytes.iter().all(|b| *b == 0x9E));

    let stats = heap.stats();
    assert_eq!(stats.resize_in_place, 0);
    assert_eq!(stats.resize_fallbacks, 1);
    assert_eq!(heap.source().outstanding.get(), 2);

    // The budget is spent, so the next move fails and leaves the block be.
    assert!(heap
        .reallocate(Some(q), 4 * MIB)
        .unwrap_err()
        .is_out_of_memory());
    assert_eq!(heap.usable_size(q), Ok(2 * MIB));
}

#[test]
fn destroy_and_drop_release_every_region() {
    let mut heap = rationed_heap(10);
    heap.allocate(MIB).unwrap();
    heap.allocate(3 * MIB).unwrap();
    heap.allocate(17).unwrap();
    assert_eq!(heap.source().outstanding.get(), 3);

    let audit = heap.destroy().unwrap();
    assert_eq!(audit.large_blocks, 2);
    assert_eq!(audit.small_blocks, 1);
    assert_eq!(heap.state(), State::Destroyed);
    assert_eq!(heap.source().outstanding.get(), 0);

    // Dropping an active allocator destroys it too.
    let mut heap = rationed_heap(10);
    heap.allocate(MIB).unwrap();
    let outstanding = Rc::clone(&heap.source().outstanding);
    assert_eq!(outstanding.get(), 2);
    drop(heap);
    assert_eq!(outstanding.get(), 0);
}

#[cfg(feature = "allocator_api2")]
#[test]
fn shared_heap_across_threads() {
    let _ = env_logger::try_init();
    let heap = SegFit::create(
        SegFitConfig::default().with_pool_size(8 * MIB),
        GlobalRegions,
    )
    .unwrap();
    let shared = SharedSegFit::new(heap, SpinLock::new());

    std::thread::scope(|s| {
        for t in 0..4u64 {
            let shared = &shared;
            s.spawn(move || {
                for round in 0..50 {
                    let mut v = allocator_api2::vec::Vec::new_in(shared);
                    for i in 0..(round * 97) {
                        v.push(t * 1_000_000 + i);
                    }
                    assert!(v.iter().enumerate().all(|(i, x)| *x == t * 1_000_000 + i as u64));
                }
            });
        }
    });

    let mut heap = shared.into_inner();
    assert_eq!(heap.validate(), Ok(()));
    assert_eq!(heap.stats().active_allocations(), 0);
    assert!(heap.destroy().unwrap().is_clean());
}
