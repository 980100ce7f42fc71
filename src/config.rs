//! How big the backing pool is, how it is cut into chunks, and how the
//! large-block path behaves.
//!
//! Everything is checked once, by [`SegFitConfig::validate`], when the
//! allocator is created.

use crate::error::ConfigError;
use crate::size_class::MAX_SMALL_SIZE;

/// Default size of the backing pool: 128 MiB.
pub const DEFAULT_POOL_SIZE: usize = 128 * 1024 * 1024;

/// Default chunk size: 64 KiB, one block of the largest size class.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default capacity of the large-block registry.
pub const DEFAULT_LARGE_BLOCK_LIMIT: usize = 1000;

/// Default minimum size for attempting an in-place region resize.
pub const DEFAULT_RESIZE_THRESHOLD: usize = 4096;

/// Construction-time configuration for a [`SegFit`](crate::SegFit).
///
/// ```
/// use segfit::SegFitConfig;
///
/// let config = SegFitConfig::default()
///     .with_pool_size(1 << 20)
///     .with_large_block_limit(16);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegFitConfig {
    /// Bytes in the backing pool that every size class carves its chunks
    /// from. Rounded down to a whole number of chunks.
    pub pool_size: usize,

    /// Bytes per chunk. A power of two, at least [`MAX_SMALL_SIZE`].
    pub chunk_size: usize,

    /// The most large blocks that may be live at once.
    pub large_block_limit: usize,

    /// Large blocks at least this big are resized through
    /// [`RegionSource::resize_region`](crate::RegionSource::resize_region)
    /// before falling back to allocate-copy-free.
    pub resize_threshold: usize,

    /// Carve one chunk for every size class at creation time instead of on
    /// first use.
    pub prewarm: bool,
}

impl Default for SegFitConfig {
    fn default() -> Self {
        SegFitConfig {
            pool_size: DEFAULT_POOL_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            large_block_limit: DEFAULT_LARGE_BLOCK_LIMIT,
            resize_threshold: DEFAULT_RESIZE_THRESHOLD,
            prewarm: false,
        }
    }
}

impl SegFitConfig {
    /// Set the backing pool size.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the large-block registry capacity.
    pub fn with_large_block_limit(mut self, limit: usize) -> Self {
        self.large_block_limit = limit;
        self
    }

    /// Set the in-place resize threshold.
    pub fn with_resize_threshold(mut self, threshold: usize) -> Self {
        self.resize_threshold = threshold;
        self
    }

    /// Enable or disable pre-carving one chunk per size class.
    pub fn with_prewarm(mut self, prewarm: bool) -> Self {
        self.prewarm = prewarm;
        self
    }

    /// Check that this configuration describes a usable allocator.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.chunk_size.is_power_of_two() || self.chunk_size < MAX_SMALL_SIZE {
            return Err(ConfigError::BadChunkSize {
                chunk_size: self.chunk_size,
            });
        }
        if self.pool_size < self.chunk_size {
            return Err(ConfigError::PoolTooSmall {
                pool_size: self.pool_size,
                chunk_size: self.chunk_size,
            });
        }
        if self.large_block_limit == 0 {
            return Err(ConfigError::ZeroLargeBlockLimit);
        }
        Ok(())
    }

    /// How many chunks fit in the pool.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.pool_size / self.chunk_size
    }

    /// The pool size actually used: `pool_size` rounded down to whole chunks.
    #[inline]
    pub fn usable_pool_size(&self) -> usize {
        self.chunk_count() * self.chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = SegFitConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.chunk_count(), 2048);
    }

    #[test]
    fn rejects_bad_chunk_sizes() {
        let small = SegFitConfig::default().with_chunk_size(4096);
        assert_eq!(
            small.validate(),
            Err(ConfigError::BadChunkSize { chunk_size: 4096 })
        );

        let odd = SegFitConfig::default().with_chunk_size(MAX_SMALL_SIZE + 1);
        assert!(matches!(odd.validate(), Err(ConfigError::BadChunkSize { .. })));
    }

    #[test]
    fn rejects_tiny_pools() {
        let config = SegFitConfig::default().with_pool_size(1024);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PoolTooSmall { .. })
        ));
    }

    #[test]
    fn rejects_zero_large_blocks() {
        let config = SegFitConfig::default().with_large_block_limit(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroLargeBlockLimit));
    }

    #[test]
    fn pool_rounds_down_to_chunks() {
        let config = SegFitConfig::default().with_pool_size(3 * DEFAULT_CHUNK_SIZE + 17);
        assert_eq!(config.chunk_count(), 3);
        assert_eq!(config.usable_pool_size(), 3 * DEFAULT_CHUNK_SIZE);
    }
}
