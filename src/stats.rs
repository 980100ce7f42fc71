//! Read-only snapshots of allocator state.

use crate::size_class::{ClassIndex, NUM_SIZE_CLASSES};
use core::fmt;

/// Counters for one size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassStats {
    /// Which class this is.
    pub class: ClassIndex,
    /// Size of every block in the class.
    pub block_size: usize,
    /// Chunks carved from the backing pool for this class.
    pub chunks: usize,
    /// Blocks across all of the class's chunks.
    pub total_blocks: u32,
    /// Blocks currently in the free list.
    pub free_blocks: u32,
    /// Blocks ever handed out.
    pub allocations: u64,
    /// Blocks ever returned.
    pub deallocations: u64,
    /// The class's free list was found corrupted.
    pub poisoned: bool,
}

impl ClassStats {
    /// Blocks currently owned by callers.
    #[inline]
    pub fn live_blocks(&self) -> u32 {
        self.total_blocks - self.free_blocks
    }

    /// Bytes sitting unused in the free list.
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free_blocks as usize * self.block_size
    }

    /// Fraction of the class's blocks that are in use, in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        if self.total_blocks == 0 {
            0.0
        } else {
            f64::from(self.live_blocks()) / f64::from(self.total_blocks)
        }
    }
}

/// A snapshot of a [`SegFit`](crate::SegFit)'s counters.
#[derive(Clone, Debug, PartialEq)]
pub struct AllocatorStats {
    /// Successful allocations, small and large, including those made on
    /// behalf of `reallocate`.
    pub total_allocations: u64,
    /// Successful deallocations, including those made on behalf of
    /// `reallocate`.
    pub total_deallocations: u64,
    /// Successful calls to `reallocate` that kept or moved a block.
    pub total_reallocations: u64,
    /// Cumulative bytes handed out, in block or region granularity.
    pub bytes_allocated: u64,
    /// Cumulative bytes returned.
    pub bytes_deallocated: u64,
    /// Cumulative target sizes of reallocations.
    pub bytes_reallocated: u64,

    /// Small allocations served from a non-empty free list.
    pub cache_hits: u64,
    /// Small allocations that had to carve a chunk or failed.
    pub cache_misses: u64,
    /// Large-block resizes done by the region source.
    pub resize_in_place: u64,
    /// Resizes done by allocate, copy, and free.
    pub resize_fallbacks: u64,

    /// Size of the backing pool.
    pub pool_size: usize,
    /// Bytes of the backing pool carved into chunks.
    pub pool_used: usize,
    /// Live large blocks.
    pub large_blocks: usize,
    /// Region bytes held by live large blocks.
    pub large_bytes: usize,
    /// The class of the most recent small allocation.
    pub last_class: Option<ClassIndex>,
    /// Free-list corruption has been detected at some point.
    pub corruption_detected: bool,

    /// Per-class counters, smallest class first.
    pub classes: [ClassStats; NUM_SIZE_CLASSES],
}

impl AllocatorStats {
    /// Live allocations, small and large.
    pub fn active_allocations(&self) -> u64 {
        self.total_allocations - self.total_deallocations
    }

    /// Bytes currently handed out: live small blocks plus large regions.
    pub fn bytes_in_use(&self) -> usize {
        let small: usize = self
            .classes
            .iter()
            .map(|c| c.live_blocks() as usize * c.block_size)
            .sum();
        small + self.large_bytes
    }

    /// Bytes carved into chunks but sitting in free lists.
    pub fn free_bytes(&self) -> usize {
        self.classes.iter().map(ClassStats::free_bytes).sum()
    }

    /// Free-list bytes as a fraction of the carved pool. Zero before anything
    /// has been carved.
    pub fn fragmentation_ratio(&self) -> f64 {
        if self.pool_used == 0 {
            0.0
        } else {
            self.free_bytes() as f64 / self.pool_used as f64
        }
    }
}

impl fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MIB: f64 = 1024.0 * 1024.0;

        writeln!(f, "allocations:   {}", self.total_allocations)?;
        writeln!(f, "deallocations: {}", self.total_deallocations)?;
        writeln!(f, "reallocations: {}", self.total_reallocations)?;
        writeln!(f, "active:        {}", self.active_allocations())?;
        writeln!(
            f,
            "pool:          {:.2} / {:.2} MiB carved",
            self.pool_used as f64 / MIB,
            self.pool_size as f64 / MIB
        )?;
        writeln!(
            f,
            "large blocks:  {} ({:.2} MiB)",
            self.large_blocks,
            self.large_bytes as f64 / MIB
        )?;
        writeln!(
            f,
            "free lists:    {} hits, {} misses",
            self.cache_hits, self.cache_misses
        )?;
        writeln!(
            f,
            "resizes:       {} in place, {} copied",
            self.resize_in_place, self.resize_fallbacks
        )?;
        writeln!(f, "fragmentation: {:.3}", self.fragmentation_ratio())?;
        if self.corruption_detected {
            writeln!(f, "CORRUPTION DETECTED")?;
        }

        for class in self.classes.iter().filter(|c| c.chunks > 0) {
            writeln!(
                f,
                "  {:>6} B: {:>8} / {:<8} live, {} chunks, {:.1}% used{}",
                class.block_size,
                class.live_blocks(),
                class.total_blocks,
                class.chunks,
                class.utilization() * 100.0,
                if class.poisoned { ", poisoned" } else { "" }
            )?;
        }
        Ok(())
    }
}

/// What was still allocated when an allocator was destroyed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LeakAudit {
    /// Small blocks never returned.
    pub small_blocks: u64,
    /// Bytes in those small blocks.
    pub small_bytes: usize,
    /// Large blocks never returned.
    pub large_blocks: usize,
    /// Region bytes in those large blocks.
    pub large_bytes: usize,
}

impl LeakAudit {
    /// Was everything returned?
    pub fn is_clean(&self) -> bool {
        self.small_blocks == 0 && self.large_blocks == 0
    }
}

impl fmt::Display for LeakAudit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} small blocks ({} bytes) and {} large blocks ({} bytes) outstanding",
            self.small_blocks, self.small_bytes, self.large_blocks, self.large_bytes
        )
    }
}
