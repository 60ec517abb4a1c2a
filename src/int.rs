//! Provides [`BinInteger`], an abstraction over the unsigned integer types
//! used as free-list presence bitmaps.
use core::{fmt, ops};

/// An unsigned binary integer usable as a presence bitmap.
pub trait BinInteger:
    Clone
    + Copy
    + PartialEq
    + Eq
    + Ord
    + fmt::Debug
    + Send
    + Sync
    + 'static
    + ops::BitAnd<Output = Self>
    + ops::BitOr<Output = Self>
    + ops::Not<Output = Self>
{
    const ZERO: Self;
    const BITS: u32;

    fn get_bit(&self, i: u32) -> bool;
    fn set_bit(&mut self, i: u32);
    fn clear_bit(&mut self, i: u32);

    /// Find the position of the lowest set bit at position `start` or higher.
    /// Returns `Self::BITS` if there is no such bit.
    fn bit_scan_forward(&self, start: u32) -> u32;

    fn trailing_zeros(&self) -> u32;
}

macro_rules! impl_bin_integer {
    ($ty:ty) => {
        impl BinInteger for $ty {
            const ZERO: Self = 0;
            const BITS: u32 = <$ty>::MAX.count_ones();

            #[inline]
            fn get_bit(&self, i: u32) -> bool {
                debug_assert!(i < Self::BITS);
                (*self >> i) & 1 != 0
            }

            #[inline]
            fn set_bit(&mut self, i: u32) {
                debug_assert!(i < Self::BITS);
                *self |= 1 << i;
            }

            #[inline]
            fn clear_bit(&mut self, i: u32) {
                debug_assert!(i < Self::BITS);
                *self &= !(1 << i);
            }

            #[inline]
            fn bit_scan_forward(&self, start: u32) -> u32 {
                if start >= Self::BITS {
                    Self::BITS
                } else {
                    (*self & (<$ty>::MAX << start)).trailing_zeros()
                }
            }

            #[inline]
            fn trailing_zeros(&self) -> u32 {
                <$ty>::trailing_zeros(*self)
            }
        }
    };
}

impl_bin_integer!(u8);
impl_bin_integer!(u16);
impl_bin_integer!(u32);
impl_bin_integer!(u64);
impl_bin_integer!(u128);
impl_bin_integer!(usize);
