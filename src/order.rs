//! Ordering with sentinels.
//!
//! The sorter requires a strict weak ordering that can also produce two
//! sentinel values: `min_value()` compares less than every legal record and
//! `max_value()` compares greater. The maximum sentinel pads the tail of the
//! last block of each run so the merge never reads past the logical end; the
//! minimum sentinel seeds the debug order checker.

use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::error::SortError;

/// Strict weak ordering over records, augmented with sentinel values.
pub trait SentinelOrd<V>: Clone {
    /// Returns true iff `a` is strictly less than `b`.
    fn lt(&self, a: &V, b: &V) -> bool;

    /// A value strictly less than every legal record.
    fn min_value(&self) -> V;

    /// A value strictly greater than every legal record.
    fn max_value(&self) -> V;
}

/// Checks the sentinel consistency requirements of a comparator.
///
/// Every component that accepts a comparator calls this at construction and
/// fails with [`SortError::BadComparator`] on violation.
pub fn verify_sentinel_ord<V, C: SentinelOrd<V>>(cmp: &C) -> Result<(), SortError> {
    let min = cmp.min_value();
    let max = cmp.max_value();

    let ok = !cmp.lt(&min, &min)
        && cmp.lt(&min, &max)
        && !cmp.lt(&max, &min)
        && !cmp.lt(&max, &max);

    if ok {
        Ok(())
    } else {
        Err(SortError::BadComparator)
    }
}

/// Converts a sentinel ordering into a [`Ordering`]-returning compare
/// function usable with slice sorts.
pub fn to_ordering<V, C: SentinelOrd<V>>(cmp: &C) -> impl Fn(&V, &V) -> Ordering + '_ {
    move |a, b| {
        if cmp.lt(a, b) {
            Ordering::Less
        } else if cmp.lt(b, a) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

/// Types with intrinsic minimum and maximum values.
///
/// Implemented for the primitive integer types; records with richer keys
/// implement [`SentinelOrd`] directly instead.
pub trait Bounded {
    const MIN_VALUE: Self;
    const MAX_VALUE: Self;
}

macro_rules! impl_bounded {
    ($($t:ty),*) => {
        $(impl Bounded for $t {
            const MIN_VALUE: Self = <$t>::MIN;
            const MAX_VALUE: Self = <$t>::MAX;
        })*
    };
}

impl_bounded!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);

/// Ascending order for keys with intrinsic bounds, using the type's extremes
/// as sentinels.
pub struct NaturalOrder<T> {
    value_type: PhantomData<T>,
}

impl<T> NaturalOrder<T> {
    pub fn new() -> Self {
        NaturalOrder {
            value_type: PhantomData,
        }
    }
}

impl<T> Default for NaturalOrder<T> {
    fn default() -> Self {
        NaturalOrder::new()
    }
}

impl<T> Clone for NaturalOrder<T> {
    fn clone(&self) -> Self {
        NaturalOrder::new()
    }
}

impl<T: Ord + Bounded + Copy> SentinelOrd<T> for NaturalOrder<T> {
    fn lt(&self, a: &T, b: &T) -> bool {
        a < b
    }

    fn min_value(&self) -> T {
        T::MIN_VALUE
    }

    fn max_value(&self) -> T {
        T::MAX_VALUE
    }
}
