//! Power-of-two size classes.
//!
//! Every small request is rounded up to one of the blocks in [`SIZE_CLASSES`]:
//!
//! ```text
//! class  0:     8 B     class  7:  1 KiB
//! class  1:    16 B     class  8:  2 KiB
//! class  2:    32 B     class  9:  4 KiB
//! class  3:    64 B     class 10:  8 KiB
//! class  4:   128 B     class 11: 16 KiB
//! class  5:   256 B     class 12: 32 KiB
//! class  6:   512 B     class 13: 64 KiB
//! ```
//!
//! Anything larger than [`MAX_SMALL_SIZE`] is a large block.

use core::fmt;

/// `log2` of the smallest block size.
pub const MIN_SIZE_BITS: u32 = 3;

/// `log2` of the largest block size served from a size class.
pub const MAX_SMALL_SIZE_BITS: u32 = 16;

/// The smallest block size handed out.
pub const MIN_BLOCK_SIZE: usize = 1 << MIN_SIZE_BITS;

/// Requests strictly larger than this go down the large-block path.
pub const MAX_SMALL_SIZE: usize = 1 << MAX_SMALL_SIZE_BITS;

/// The number of size classes.
pub const NUM_SIZE_CLASSES: usize = (MAX_SMALL_SIZE_BITS - MIN_SIZE_BITS + 1) as usize;

/// The index of a size class within [`SIZE_CLASSES`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassIndex(u32);

impl ClassIndex {
    /// The class index as a `usize`, for indexing tables.
    #[inline]
    pub const fn get(self) -> usize {
        self.0 as usize
    }

    /// Construct a class index, or `None` if it is out of range.
    #[inline]
    pub const fn new(index: usize) -> Option<Self> {
        if index < NUM_SIZE_CLASSES {
            Some(ClassIndex(index as u32))
        } else {
            None
        }
    }

    /// Iterate over every class, smallest first.
    pub fn all() -> impl DoubleEndedIterator<Item = ClassIndex> + ExactSizeIterator {
        (0..NUM_SIZE_CLASSES as u32).map(ClassIndex)
    }

    /// This class's entry in [`SIZE_CLASSES`].
    #[inline]
    pub fn class(self) -> SizeClass {
        SIZE_CLASSES[self.get()]
    }

    /// The block size of this class.
    #[inline]
    pub const fn block_size(self) -> usize {
        class_to_size(self)
    }
}

impl fmt::Display for ClassIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class {} ({} B)", self.0, self.block_size())
    }
}

/// A size class: its index and the size of every block in it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClass {
    /// Position in [`SIZE_CLASSES`].
    pub index: u32,
    /// Always a power of two in `[MIN_BLOCK_SIZE, MAX_SMALL_SIZE]`.
    pub block_size: usize,
}

/// Every size class, ascending by block size.
pub static SIZE_CLASSES: [SizeClass; NUM_SIZE_CLASSES] = {
    let mut table = [SizeClass {
        index: 0,
        block_size: 0,
    }; NUM_SIZE_CLASSES];
    let mut i = 0;
    while i < NUM_SIZE_CLASSES {
        table[i] = SizeClass {
            index: i as u32,
            block_size: 1 << (MIN_SIZE_BITS as usize + i),
        };
        i += 1;
    }
    table
};

/// Map a request size to the smallest class that can hold it.
///
/// Returns `None` when `size` is larger than [`MAX_SMALL_SIZE`], in which case
/// the request must be served as a large block.
///
/// `size` must not be zero; zero-sized requests are rejected before they get
/// here.
#[inline]
pub const fn size_to_class(size: usize) -> Option<ClassIndex> {
    debug_assert!(size != 0);
    if size > MAX_SMALL_SIZE {
        return None;
    }

    // Bit length of `size - 1` is the exponent of the next power of two.
    let bits = usize::BITS - size.saturating_sub(1).leading_zeros();
    Some(ClassIndex(bits.saturating_sub(MIN_SIZE_BITS)))
}

/// The block size of the given class.
#[inline]
pub const fn class_to_size(index: ClassIndex) -> usize {
    MIN_BLOCK_SIZE << index.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_ascending_powers_of_two() {
        assert_eq!(SIZE_CLASSES.len(), 14);
        assert_eq!(SIZE_CLASSES[0].block_size, 8);
        assert_eq!(SIZE_CLASSES[NUM_SIZE_CLASSES - 1].block_size, MAX_SMALL_SIZE);
        for pair in SIZE_CLASSES.windows(2) {
            assert!(pair[0].block_size.is_power_of_two());
            assert_eq!(pair[0].block_size * 2, pair[1].block_size);
        }
        for (i, class) in SIZE_CLASSES.iter().enumerate() {
            assert_eq!(class.index as usize, i);
            assert_eq!(class_to_size(ClassIndex::new(i).unwrap()), class.block_size);
        }
    }

    #[test]
    fn boundaries() {
        assert_eq!(size_to_class(1), ClassIndex::new(0));
        assert_eq!(size_to_class(8), ClassIndex::new(0));
        assert_eq!(size_to_class(9), ClassIndex::new(1));
        assert_eq!(size_to_class(64), ClassIndex::new(3));
        assert_eq!(size_to_class(65), ClassIndex::new(4));
        assert_eq!(size_to_class(4096), ClassIndex::new(9));
        assert_eq!(size_to_class(MAX_SMALL_SIZE), ClassIndex::new(13));
        assert_eq!(size_to_class(MAX_SMALL_SIZE + 1), None);
        assert_eq!(size_to_class(usize::MAX), None);
    }

    #[test]
    fn every_small_size_gets_the_tightest_class() {
        for size in 1..=MAX_SMALL_SIZE {
            let class = size_to_class(size).unwrap();
            let block = class_to_size(class);
            assert!(block >= size, "{size} does not fit in {class}");
            if class.get() > 0 {
                let smaller = ClassIndex::new(class.get() - 1).unwrap();
                assert!(
                    class_to_size(smaller) < size,
                    "{size} would have fit in {smaller}"
                );
            }
        }
    }

    #[test]
    fn out_of_range_index() {
        assert_eq!(ClassIndex::new(NUM_SIZE_CLASSES), None);
        assert_eq!(ClassIndex::all().len(), NUM_SIZE_CLASSES);
    }
}
