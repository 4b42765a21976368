use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Integer types usable as loop indices.
pub trait Index: Copy + PartialOrd + Send + Sync + std::fmt::Debug + 'static {
    /// Number of indices in `begin..end`; zero when `end <= begin`.
    fn distance(begin: Self, end: Self) -> usize;
    /// The index `n` steps past `self`.
    fn offset(self, n: usize) -> Self;
}

macro_rules! impl_index {
    ($($t:ty),+) => {
        $(
            impl Index for $t {
                #[inline]
                fn distance(begin: Self, end: Self) -> usize {
                    if end > begin {
                        (end as i128 - begin as i128) as usize
                    } else {
                        0
                    }
                }

                #[inline]
                fn offset(self, n: usize) -> Self {
                    (self as i128 + n as i128) as Self
                }
            }
        )+
    };
}

impl_index!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

/// A contiguous index set `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("[{begin:?}, {end:?})")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RangeSegment<I> {
    pub begin: I,
    pub end: I,
}

impl<I: Index> RangeSegment<I> {
    #[inline]
    pub fn new(begin: I, end: I) -> Self {
        Self { begin, end }
    }

    #[inline]
    pub fn len(&self) -> usize {
        I::distance(self.begin, self.end)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `n`-th index of the segment.
    #[inline]
    pub fn at(&self, n: usize) -> I {
        self.begin.offset(n)
    }

    #[inline]
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = I> + ExactSizeIterator + use<I> {
        let begin = self.begin;
        (0..self.len()).map(move |n| begin.offset(n))
    }
}

impl<I: Index> From<std::ops::Range<I>> for RangeSegment<I> {
    #[inline]
    fn from(value: std::ops::Range<I>) -> Self {
        Self::new(value.start, value.end)
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::RangeSegment;

    #[test]
    fn test_segment_iter() {
        let segment = RangeSegment::from(-3i32..4);
        assert_eq!(segment.len(), 7);
        assert_eq!(segment.iter().collect_vec(), (-3..4).collect_vec());
        assert_eq!(segment.iter().rev().next(), Some(3));
        assert_eq!(segment.to_string(), "[-3, 4)");

        let segment = RangeSegment::from(10u8..2);
        assert!(segment.is_empty());
        assert_eq!(segment.iter().count(), 0);
    }
}
