//! Shared fuzzing and testing infrastructure for `segfit`.

use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use segfit::{
    size_class::size_to_class, AllocError, DeallocError, GlobalRegions, RegionSource, SegFit,
    SegFitConfig, MAX_SMALL_SIZE, PAGE_SIZE,
};
use std::{collections::BTreeMap, ptr::NonNull};

/// The requested size of a test allocation.
//
// Note: a newtype so that we can give it a default mutator biased towards
// size-class boundaries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Size(pub usize);

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// A mutator for `Size`s with a configurable maximum.
#[derive(Debug)]
pub struct SizeMutator {
    pub max_size: usize,
}

impl Default for SizeMutator {
    fn default() -> Self {
        Self {
            max_size: 4 * MAX_SMALL_SIZE,
        }
    }
}

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        // Any size at all.
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() { size.0 } else { self.max_size };
            size.0 = ctx.rng().gen_index(max_size + 1).unwrap_or(0);
            Ok(())
        })?;

        // Right at, just below, or just above a power of two.
        if !c.shrink() {
            c.mutation(|ctx| {
                let max_log2 = self.max_size.max(1).ilog2() as usize;
                let log2 = ctx.rng().gen_index(max_log2 + 1).unwrap_or(0);
                let pow2 = 1usize << log2;
                size.0 = match ctx.rng().gen_index(3) {
                    Some(0) => pow2 - 1,
                    Some(1) => pow2 + 1,
                    _ => pow2,
                };
                Ok(())
            })?;
        }

        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Size> {
        // Mostly small requests, sometimes mid-sized, occasionally large.
        let max = match ctx.rng().gen_index(8) {
            Some(0) => self.max_size,
            Some(1 | 2) => MAX_SMALL_SIZE,
            _ => 256,
        };
        let size = m::range(0..=max).generate(ctx)?;
        Ok(Size(size))
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, size: Size },
    Dealloc { id: u32 },
    Realloc { id: u32, size: Size },
    DoubleFree { id: u32 },
    Validate,
    Reset,
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Dealloc {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Realloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::DoubleFree {
                    id: ctx.rng().gen_u32(),
                })
            },
            |_| Ok(Op::Validate),
        ];

        // `Reset` wipes out everything built up so far; keep it rare.
        if ctx.rng().gen_index(64) == Some(0) {
            return Ok(Op::Reset);
        }
        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

impl Op {
    fn id_mut(&mut self) -> Option<&mut u32> {
        match self {
            Op::Alloc { id, .. }
            | Op::Dealloc { id }
            | Op::Realloc { id, .. }
            | Op::DoubleFree { id } => Some(id),
            Op::Validate | Op::Reset => None,
        }
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        fn pick_alloc(ops: &Ops, ctx: &mut mutatis::Context) -> Option<(usize, u32)> {
            let num_allocs = alloc_positions_and_ids(ops).count();
            let alloc_index = ctx.rng().gen_index(num_allocs)?;
            alloc_positions_and_ids(ops).nth(alloc_index)
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            if let Some((_, new_id)) = pick_alloc(ops, ctx) {
                if let Some(op_index) = ctx.rng().gen_index(ops.ops.len()) {
                    if let Some(id) = ops.ops[op_index].id_mut() {
                        *id = new_id;
                    }
                }
            }
            Ok(())
        })?;

        // Free, double free, or resize an existing allocation somewhere after
        // it was made.
        if !c.shrink() {
            c.mutation(|ctx| {
                if let Some((op_index, id)) = pick_alloc(ops, ctx) {
                    let op = match ctx.rng().gen_index(4) {
                        Some(0) => Op::Dealloc { id },
                        Some(1) => Op::DoubleFree { id },
                        _ => Op::Realloc {
                            id,
                            size: m::default::<Size>().generate(ctx)?,
                        },
                    };
                    let offset = ctx.rng().gen_index(ops.ops.len() - op_index).unwrap_or(0);
                    ops.ops.insert(op_index + 1 + offset, op);
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation. Returns `false` if there was none.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations against a fresh 1 MiB allocator with the
    /// given limit on live requested bytes.
    pub fn run(&self, allocation_limit: usize) -> Result<(), String> {
        let config = SegFitConfig::default()
            .with_pool_size(1 << 20)
            .with_large_block_limit(16);
        let heap = SegFit::create(config, GlobalRegions).map_err(|e| e.to_string())?;
        self.run_with_allocator(heap, allocation_limit)
    }

    /// Run these test operations with the given allocator and allocation
    /// limit.
    pub fn run_with_allocator<R>(
        &self,
        mut heap: SegFit<R>,
        allocation_limit: usize,
    ) -> Result<(), String>
    where
        R: RegionSource,
    {
        log::debug!("========== Running test operations ==========");

        let mut live = LiveMap::new(allocation_limit);

        // Check that an allocation still holds its pattern.
        let check_contents = |id: u32, alloc: &LiveAlloc, len: usize| -> Result<(), String> {
            let slice = unsafe { std::slice::from_raw_parts(alloc.ptr.as_ptr(), len) };
            ensure!(
                slice.iter().all(|b| *b == pattern(id)),
                "contents of id{id} were clobbered",
            );
            Ok(())
        };

        // Check a newly handed-out block, fill it, and insert it into the
        // live set.
        let new_alloc = |heap: &mut SegFit<R>,
                         live: &mut LiveMap,
                         id: u32,
                         ptr: NonNull<u8>,
                         size: usize|
         -> Result<(), String> {
            let usable = heap
                .usable_size(ptr)
                .map_err(|e| format!("usable_size of fresh block failed: {e}"))?;
            log::debug!("new allocation: id{id} -> {{ address: {ptr:p}, size: {size}, usable: {usable} }}");

            ensure!(usable >= size, "usable size {usable} is less than requested {size}");
            let align = usable.min(PAGE_SIZE);
            ensure!(
                ptr.as_ptr() as usize % align == 0,
                "block at {ptr:p} is not aligned to {align}",
            );
            live.assert_not_overlapping(ptr, usable)?;

            unsafe { ptr.as_ptr().write_bytes(pattern(id), size) };
            live.insert(id, LiveAlloc { ptr, size, usable });
            Ok(())
        };

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::Alloc { id, size: Size(size) } => {
                    if live.beyond_allocation_limit(size) {
                        continue;
                    }
                    if let Some(old) = live.remove(id) {
                        check_contents(id, &old, old.size)?;
                        heap.deallocate(old.ptr).map_err(|e| e.to_string())?;
                    }

                    match heap.allocate(size) {
                        Ok(ptr) => new_alloc(&mut heap, &mut live, id, ptr, size)?,
                        Err(AllocError::InvalidSize { .. }) => {
                            ensure!(size == 0, "size {size} rejected as invalid")
                        }
                        Err(e) => ensure!(e.is_out_of_memory(), "allocation failed: {e}"),
                    }
                }

                Op::Dealloc { id } => {
                    if let Some(alloc) = live.remove(id) {
                        check_contents(id, &alloc, alloc.size)?;
                        heap.deallocate(alloc.ptr)
                            .map_err(|e| format!("deallocating id{id} failed: {e}"))?;
                    }
                }

                Op::DoubleFree { id } => {
                    if let Some(alloc) = live.remove(id) {
                        heap.deallocate(alloc.ptr)
                            .map_err(|e| format!("deallocating id{id} failed: {e}"))?;
                        let second = heap.deallocate(alloc.ptr);
                        ensure!(
                            second == Err(DeallocError::UnknownPointer),
                            "double free of id{id} returned {second:?}",
                        );
                    }
                }

                Op::Realloc { id, size: Size(size) } => {
                    let Some(old) = live.remove(id) else {
                        if live.beyond_allocation_limit(size) {
                            continue;
                        }
                        match heap.reallocate(None, size) {
                            Ok(Some(ptr)) => new_alloc(&mut heap, &mut live, id, ptr, size)?,
                            Ok(None) => return Err("reallocating null returned null".into()),
                            Err(e) => ensure!(
                                e.is_out_of_memory() || size == 0,
                                "allocation via reallocate failed: {e}"
                            ),
                        }
                        continue;
                    };

                    if live.beyond_allocation_limit(size) {
                        live.insert(id, old);
                        continue;
                    }

                    match heap.reallocate(Some(old.ptr), size) {
                        Ok(None) => ensure!(size == 0, "reallocate to {size} freed the block"),
                        Ok(Some(ptr)) => {
                            let same_class = size_to_class(old.size.max(1)).is_some()
                                && size_to_class(old.size.max(1)) == size_to_class(size);
                            ensure!(
                                !same_class || ptr == old.ptr,
                                "same-class reallocate moved {:p} to {ptr:p}",
                                old.ptr
                            );

                            let kept = old.size.min(size);
                            let moved = LiveAlloc { ptr, ..old };
                            check_contents(id, &moved, kept)?;
                            new_alloc(&mut heap, &mut live, id, ptr, size)?;
                        }
                        Err(e) => {
                            ensure!(e.is_out_of_memory(), "reallocate failed: {e}");
                            check_contents(id, &old, old.size)?;
                            live.insert(id, old);
                        }
                    }
                }

                Op::Validate => {
                    heap.validate().map_err(|e| e.to_string())?;
                    let stats = heap.stats();
                    ensure!(
                        stats.active_allocations() == live.map.len() as u64,
                        "{} active allocations but {} live",
                        stats.active_allocations(),
                        live.map.len(),
                    );
                    ensure!(!stats.corruption_detected, "corruption flag set");
                }

                Op::Reset => {
                    heap.reset().map_err(|e| e.to_string())?;
                    live.clear();
                    ensure!(
                        heap.stats().total_allocations == 0,
                        "counters survived a reset"
                    );
                }
            }
        }

        // Finally, deallocate any remaining live allocations, and make sure
        // nothing was lost.
        for (id, alloc) in std::mem::take(&mut live.map) {
            check_contents(id, &alloc, alloc.size)?;
            heap.deallocate(alloc.ptr).map_err(|e| e.to_string())?;
        }
        heap.validate().map_err(|e| e.to_string())?;
        let audit = heap.destroy().map_err(|e| e.to_string())?;
        ensure!(audit.is_clean(), "leaked: {audit}");

        Ok(())
    }
}

/// The byte pattern live allocation `id` is filled with.
fn pattern(id: u32) -> u8 {
    (id % 251) as u8 + 1
}

/// A currently-live allocation.
#[derive(Debug)]
struct LiveAlloc {
    ptr: NonNull<u8>,
    /// Requested size; this many bytes hold the allocation's pattern.
    size: usize,
    /// What the allocator says the block can hold.
    usable: usize,
}

/// The set of currently-live allocations, keyed by ID.
struct LiveMap {
    map: BTreeMap<u32, LiveAlloc>,

    /// Sum of the requested sizes of every live allocation.
    total_allocated_bytes: usize,

    /// The total allocated bytes should never surpass this limit.
    allocation_limit: usize,
}

impl LiveMap {
    fn new(allocation_limit: usize) -> Self {
        LiveMap {
            map: BTreeMap::default(),
            total_allocated_bytes: 0,
            allocation_limit,
        }
    }

    /// Would an allocation of the given size push us past our allocation limit?
    fn beyond_allocation_limit(&self, size: usize) -> bool {
        self.total_allocated_bytes + size > self.allocation_limit
    }

    fn insert(&mut self, id: u32, alloc: LiveAlloc) {
        self.total_allocated_bytes += alloc.size;
        let old = self.map.insert(id, alloc);
        assert!(
            old.is_none(),
            "should remove and deallocate old entries before adding new ones"
        );
    }

    fn remove(&mut self, id: u32) -> Option<LiveAlloc> {
        let alloc = self.map.remove(&id)?;
        self.total_allocated_bytes -= alloc.size;
        Some(alloc)
    }

    fn clear(&mut self) {
        self.map.clear();
        self.total_allocated_bytes = 0;
    }

    /// Two distinct live blocks must never overlap.
    fn assert_not_overlapping(&self, ptr: NonNull<u8>, len: usize) -> Result<(), String> {
        let start = ptr.as_ptr() as usize;
        let end = start + len;
        for (id, other) in &self.map {
            let other_start = other.ptr.as_ptr() as usize;
            let other_end = other_start + other.usable;
            ensure!(
                end <= other_start || other_end <= start,
                "{ptr:p}+{len} overlaps id{id} at {:p}+{}",
                other.ptr,
                other.usable,
            );
        }
        Ok(())
    }
}
