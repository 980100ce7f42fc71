//! Error types.
//!
//! Every failure is an ordinary value returned to the immediate caller.
//! Allocation failures are always recoverable. Corruption gets its own type so
//! that it can never be mistaken for running out of memory.

use crate::size_class::ClassIndex;
use core::fmt;

/// Errors returned by [`SegFit::allocate`](crate::SegFit::allocate) and
/// [`SegFit::reallocate`](crate::SegFit::reallocate).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// Zero-sized request, or a request larger than `isize::MAX`.
    InvalidSize {
        /// The rejected size.
        size: usize,
    },

    /// No memory could be found for the request. See [`Exhaustion`] for why.
    OutOfMemory {
        /// What ran out.
        cause: Exhaustion,
    },

    /// The pointer given to `reallocate` was never handed out by this
    /// allocator, or has already been freed.
    UnknownPointer,

    /// The free list of the size class this request maps to is corrupted.
    Corrupted(CorruptionReport),

    /// The allocator has been destroyed.
    UseAfterDestroy,
}

impl AllocError {
    /// Is this some flavor of out-of-memory?
    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, AllocError::OutOfMemory { .. })
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InvalidSize { size } => write!(f, "invalid allocation size: {size}"),
            AllocError::OutOfMemory { cause } => write!(f, "out of memory: {cause}"),
            AllocError::UnknownPointer => f.write_str("pointer was not allocated by this allocator"),
            AllocError::Corrupted(report) => write!(f, "heap corruption detected: {report}"),
            AllocError::UseAfterDestroy => f.write_str("allocator used after being destroyed"),
        }
    }
}

impl core::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            AllocError::OutOfMemory {
                cause: Exhaustion::OsRefused(e),
            } => Some(e),
            AllocError::Corrupted(report) => Some(report),
            _ => None,
        }
    }
}

impl From<DeallocError> for AllocError {
    fn from(e: DeallocError) -> Self {
        match e {
            DeallocError::UnknownPointer => AllocError::UnknownPointer,
            DeallocError::Corrupted(report) => AllocError::Corrupted(report),
            DeallocError::UseAfterDestroy => AllocError::UseAfterDestroy,
        }
    }
}

/// The reason behind an [`AllocError::OutOfMemory`].
///
/// Callers generally only need to know that they are out of memory; this is
/// kept around for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exhaustion {
    /// The backing pool has no room left to carve another chunk for the size
    /// class, and the class's free list is empty.
    PoolExhausted,

    /// The region source refused to provide memory for a large block.
    OsRefused(OsError),

    /// The large-block registry is at capacity.
    RegistryFull,
}

impl fmt::Display for Exhaustion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exhaustion::PoolExhausted => f.write_str("backing pool exhausted"),
            Exhaustion::OsRefused(e) => write!(f, "region source refused: {e}"),
            Exhaustion::RegistryFull => f.write_str("large-block registry is full"),
        }
    }
}

/// Errors returned by [`SegFit::deallocate`](crate::SegFit::deallocate).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeallocError {
    /// Double free, interior pointer, or a pointer from somewhere else.
    UnknownPointer,

    /// The free list the block would be returned to is corrupted.
    Corrupted(CorruptionReport),

    /// The allocator has been destroyed.
    UseAfterDestroy,
}

impl fmt::Display for DeallocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeallocError::UnknownPointer => {
                f.write_str("pointer was not allocated by this allocator or was already freed")
            }
            DeallocError::Corrupted(report) => write!(f, "heap corruption detected: {report}"),
            DeallocError::UseAfterDestroy => f.write_str("allocator used after being destroyed"),
        }
    }
}

impl core::error::Error for DeallocError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            DeallocError::Corrupted(report) => Some(report),
            _ => None,
        }
    }
}

/// A free-list integrity failure.
///
/// Once reported, the affected size class refuses all further operations and
/// the allocator's sticky corruption flag is set. Nothing attempts to repair
/// the list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CorruptionReport {
    /// The size class whose free list is broken.
    pub class: ClassIndex,
    /// The slot at which the problem was noticed, if a particular slot is to
    /// blame.
    pub slot: Option<u32>,
    /// What was wrong.
    pub kind: CorruptionKind,
}

impl fmt::Display for CorruptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.kind)?;
        if let Some(slot) = self.slot {
            write!(f, " at slot {slot}")?;
        }
        Ok(())
    }
}

impl core::error::Error for CorruptionReport {}

/// The kinds of free-list corruption that are detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptionKind {
    /// A free-list link leads to a block that is not marked free.
    NotFree,

    /// A block's `prev` link does not point back at its predecessor, or a
    /// link points outside the class's slot table.
    BrokenLink,

    /// Walking the free list found a different number of blocks than the
    /// class's free counter says it holds.
    CountMismatch {
        /// Blocks found by walking the list.
        walked: u32,
        /// The class's free counter.
        recorded: u32,
    },

    /// The last block of the walk is not the recorded tail.
    TailMismatch,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptionKind::NotFree => f.write_str("free list reaches a block that is not free"),
            CorruptionKind::BrokenLink => f.write_str("inconsistent free-list link"),
            CorruptionKind::CountMismatch { walked, recorded } => write!(
                f,
                "free list holds {walked} blocks but the counter says {recorded}"
            ),
            CorruptionKind::TailMismatch => f.write_str("free-list tail does not match the walk"),
        }
    }
}

/// Failures of a [`RegionSource`](crate::RegionSource).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OsError {
    /// The system had no memory to give.
    Refused,

    /// The operation is not available from this region source.
    Unsupported,

    /// The size cannot be expressed as a page-aligned region.
    InvalidLayout,
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsError::Refused => f.write_str("the system refused to provide memory"),
            OsError::Unsupported => f.write_str("operation not supported by this region source"),
            OsError::InvalidLayout => f.write_str("size is not representable as a region"),
        }
    }
}

impl core::error::Error for OsError {}

/// An invalid [`SegFitConfig`](crate::SegFitConfig).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The chunk size must be a power of two no smaller than the largest size
    /// class.
    BadChunkSize {
        /// The rejected chunk size.
        chunk_size: usize,
    },

    /// The pool must hold at least one chunk.
    PoolTooSmall {
        /// The rejected pool size.
        pool_size: usize,
        /// The configured chunk size.
        chunk_size: usize,
    },

    /// The large-block registry must be able to hold at least one block.
    ZeroLargeBlockLimit,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::BadChunkSize { chunk_size } => write!(
                f,
                "chunk size {chunk_size} must be a power of two of at least {}",
                crate::size_class::MAX_SMALL_SIZE
            ),
            ConfigError::PoolTooSmall {
                pool_size,
                chunk_size,
            } => write!(
                f,
                "pool size {pool_size} cannot hold a single {chunk_size}-byte chunk"
            ),
            ConfigError::ZeroLargeBlockLimit => f.write_str("large-block limit must be at least 1"),
        }
    }
}

impl core::error::Error for ConfigError {}

/// Errors returned by [`SegFit::create`](crate::SegFit::create).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateError {
    /// The configuration was rejected.
    Config(ConfigError),

    /// The backing pool could not be obtained.
    Os(OsError),
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateError::Config(e) => write!(f, "invalid configuration: {e}"),
            CreateError::Os(e) => write!(f, "failed to obtain backing pool: {e}"),
        }
    }
}

impl core::error::Error for CreateError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            CreateError::Config(e) => Some(e),
            CreateError::Os(e) => Some(e),
        }
    }
}

impl From<ConfigError> for CreateError {
    fn from(e: ConfigError) -> Self {
        CreateError::Config(e)
    }
}

impl From<OsError> for CreateError {
    fn from(e: OsError) -> Self {
        CreateError::Os(e)
    }
}
