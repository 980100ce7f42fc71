#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

extern crate alloc;

use cfg_if::cfg_if;

mod config;
mod error;
mod large;
mod pool;
mod region;
mod segfit;
mod shared;
pub mod size_class;
mod stats;

pub use config::{
    SegFitConfig, DEFAULT_CHUNK_SIZE, DEFAULT_LARGE_BLOCK_LIMIT, DEFAULT_POOL_SIZE,
    DEFAULT_RESIZE_THRESHOLD,
};
pub use error::{
    AllocError, ConfigError, CorruptionKind, CorruptionReport, CreateError, DeallocError,
    Exhaustion, OsError,
};
pub use large::LargeBlock;
pub use region::{GlobalRegions, RegionSource, PAGE_SIZE};
pub use segfit::{SegFit, State, MAX_ALLOCATION_SIZE};
pub use shared::{Lock, SharedSegFit, SingleThreadedLock, SpinLock};
pub use size_class::{ClassIndex, SizeClass, MAX_SMALL_SIZE, NUM_SIZE_CLASSES};
pub use stats::{AllocatorStats, ClassStats, LeakAudit};

#[cfg(all(unix, feature = "mmap"))]
pub use region::Mmap;

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::Allocator;
        use core::alloc::AllocError as ApiAllocError;
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::Allocator;
        use allocator_api2::alloc::AllocError as ApiAllocError;
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
