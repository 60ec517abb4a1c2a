//! The TLSF allocator core
use core::{
    debug_assert, debug_assert_eq,
    hint::unreachable_unchecked,
    mem::{self, MaybeUninit},
    ptr::NonNull,
};

use crate::{
    int::BinInteger,
    utils::{nonnull_slice_end, nonnull_slice_start},
};

/// The content granularity.
///
/// It is `size_of::<usize>() * 2` bytes. It is the minimum content size of a
/// block, the unit all content sizes are a multiple of, and also the exact
/// length of a block header.
pub const GRANULARITY: usize = mem::size_of::<usize>() * 2;

const GRANULARITY_LOG2: u32 = GRANULARITY.trailing_zeros();

/// The TLSF control structure, emplaced at the start of the arena it manages.
///
/// # Data Structure Overview
///
#[doc = svgbobdoc::transform!(
/// <center>
/// ```svgbob
///   Arena
///   ,--------+------------+---------+------------+---------+-----------,
///   | "Tlsf" | "BlockHdr" | content | "BlockHdr" | content |    ...    |
///   '--------+------------+---------+------------+---------+-----------'
///      |
///      |  First level                                          FLLEN = 8
///      |            ,-----+-----+-----+-----+-----+-----+-----+-----,
///      | fl_bitmap: |  0  |  0  |  0  |  1  |  0  |  0  |  0  |  0  |
///      |            +-----+-----+-----+-----+-----+-----+-----+-----+
///      |   min size | 2¹¹ | 2¹⁰ |  2⁹ |  2⁸ |  2⁷ |  2⁶ |  2⁵ |  2⁴ |
///      |            '-----+-----+-----+--+--+-----+-----+-----+-----'
///      |                                 |
///      |  Second level                   v                     SLLEN = 8
///      |               ,-----+-----+-----+-----+-----+-----+-----+-----,
///      | sl_bitmap[4]: |  0  |  0  |  1  |  0  |  0  |  0  |  0  |  0  |
///      |               +-----+-----+-----+-----+-----+-----+-----+-----+
///      '-> first_free: |     |     |  o  |     |     |     |     |     |
///                      '-----+-----+--+--+-----+-----+-----+-----+-----'
///                                     |
///                                     v    doubly linked free list
///                              ,------------,    ,------------,
///                              | free block |<-->| free block |
///                              '------------'    '------------'
/// ```
/// </center>
)]
///
/// # Properties
///
/// The content granularity ([`GRANULARITY`]) is `size_of::<usize>() * 2`
/// bytes, which is the minimum content size of a block and the length of a
/// block header.
///
/// The maximum content capacity is `(GRANULARITY << FLLEN) - GRANULARITY`
/// ([`Self::MAX_CAPACITY`]).
#[derive(Debug)]
pub struct Tlsf<FLBitmap, SLBitmap, const FLLEN: usize, const SLLEN: usize> {
    /// The total content capacity of the arena, set once by
    /// [`Self::emplace_ptr`].
    size: usize,
    fl_bitmap: FLBitmap,
    sl_bitmap: [SLBitmap; FLLEN],
    first_free: [[Option<NonNull<FreeBlockHdr>>; SLLEN]; FLLEN],
}

// Safety: All memory block headers directly or indirectly referenced by a
//         particular instance of `Tlsf` are logically owned by that `Tlsf` and
//         have no interior mutability, so these are safe.
unsafe impl<FLBitmap, SLBitmap, const FLLEN: usize, const SLLEN: usize> Send
    for Tlsf<FLBitmap, SLBitmap, FLLEN, SLLEN>
{
}

unsafe impl<FLBitmap, SLBitmap, const FLLEN: usize, const SLLEN: usize> Sync
    for Tlsf<FLBitmap, SLBitmap, FLLEN, SLLEN>
{
}

/// The header of a memory block. Exactly [`GRANULARITY`] bytes long; the
/// content immediately follows it.
#[repr(C)]
#[cfg_attr(target_pointer_width = "16", repr(align(4)))]
#[cfg_attr(target_pointer_width = "32", repr(align(8)))]
#[cfg_attr(target_pointer_width = "64", repr(align(16)))]
#[derive(Debug)]
struct BlockHdr {
    /// The size of the content (excluding the header).
    ///
    ///  - `bit[0]` ([`SIZE_FREE`]) indicates whether the block is a free
    ///    block or not.
    ///
    ///  - `bit[1]` ([`SIZE_LAST`]) indicates whether the block is the last
    ///    physical block of the arena or not.
    ///
    ///  - `bit[GRANULARITY_LOG2..]` represents the size, which is always a
    ///    multiple of [`GRANULARITY`].
    ///
    size: usize,
    /// The physically preceding block. `None` for the first block of the
    /// arena.
    prev_phys_block: Option<NonNull<BlockHdr>>,
}

/// The bit of [`BlockHdr::size`] indicating whether the block is free or not.
const SIZE_FREE: usize = 1;
/// The bit of [`BlockHdr::size`] indicating whether the block is the last one
/// of the arena or not.
const SIZE_LAST: usize = 2;
/// The bits of [`BlockHdr::size`] representing the content size.
const SIZE_MASK: usize = !(SIZE_FREE | SIZE_LAST);

// The flag bits must live below `GRANULARITY_LOG2`, and the header must be
// exactly one granule so that granularity-aligned blocks get
// granularity-aligned content addresses.
const _: () = assert!((SIZE_FREE | SIZE_LAST) < GRANULARITY);
const _: () = assert!(mem::size_of::<BlockHdr>() == GRANULARITY);

impl BlockHdr {
    #[inline]
    fn size(&self) -> usize {
        self.size & SIZE_MASK
    }

    #[inline]
    fn is_free(&self) -> bool {
        (self.size & SIZE_FREE) != 0
    }

    #[inline]
    fn is_last(&self) -> bool {
        (self.size & SIZE_LAST) != 0
    }

    #[inline]
    fn set_size(&mut self, size: usize) {
        debug_assert!(size % GRANULARITY == 0);
        self.size = size | (self.size & !SIZE_MASK);
    }

    #[inline]
    fn set_free(&mut self, free: bool) {
        self.size = (self.size & !SIZE_FREE) | free as usize;
    }

    #[inline]
    fn set_last(&mut self, last: bool) {
        self.size = (self.size & !SIZE_LAST) | ((last as usize) << 1);
    }

    /// Get the content address.
    #[inline]
    fn content(&self) -> NonNull<u8> {
        // Safety: The content immediately follows the header, which is not at
        //         the null address
        unsafe {
            NonNull::new_unchecked((self as *const _ as *mut u8).add(mem::size_of::<BlockHdr>()))
        }
    }

    /// Get the next physical block.
    ///
    /// # Safety
    ///
    /// `self.size & SIZE_LAST` must be telling the truth.
    #[inline]
    unsafe fn next_phys_block(&self) -> Option<NonNull<BlockHdr>> {
        if self.is_last() {
            None
        } else {
            // Safety: Since `self.size & SIZE_LAST` is not lying, the next
            //         block should exist at a non-null location.
            Some(
                NonNull::new_unchecked(
                    (self as *const _ as *mut u8).add(mem::size_of::<BlockHdr>() + self.size()),
                )
                .cast(),
            )
        }
    }
}

/// The header of a free memory block.
///
/// The free-list links overlay the first two content words, so they exist
/// only while the free bit is set; an allocated block's content carries no
/// allocator metadata.
#[repr(C)]
#[cfg_attr(target_pointer_width = "16", repr(align(4)))]
#[cfg_attr(target_pointer_width = "32", repr(align(8)))]
#[cfg_attr(target_pointer_width = "64", repr(align(16)))]
#[derive(Debug)]
struct FreeBlockHdr {
    common: BlockHdr,
    next_free: Option<NonNull<FreeBlockHdr>>,
    prev_free: Option<NonNull<FreeBlockHdr>>,
}

impl<FLBitmap: BinInteger, SLBitmap: BinInteger, const FLLEN: usize, const SLLEN: usize>
    Tlsf<FLBitmap, SLBitmap, FLLEN, SLLEN>
{
    /// Evaluates successfully if the parameters are valid.
    const VALID: () = {
        if FLLEN == 0 {
            panic!("`FLLEN` must not be zero");
        }
        if SLLEN == 0 {
            panic!("`SLLEN` must not be zero");
        }
        if (FLBitmap::BITS as u128) < FLLEN as u128 {
            panic!("`FLBitmap` should contain at least `FLLEN` bits");
        }
        if (SLBitmap::BITS as u128) < SLLEN as u128 {
            panic!("`SLBitmap` should contain at least `SLLEN` bits");
        }
    };

    /// `SLLEN.log2()`
    const SLI: u32 = if SLLEN.is_power_of_two() {
        SLLEN.trailing_zeros()
    } else {
        panic!("`SLLEN` must be a power of two")
    };

    /// The largest content capacity this configuration can manage, or `None`
    /// if it is not representable in `usize`.
    pub const MAX_CAPACITY: Option<usize> = {
        let shift = GRANULARITY_LOG2 + FLLEN as u32;
        if shift < usize::BITS {
            Some((1 << shift) - GRANULARITY)
        } else if shift == usize::BITS {
            Some(0usize.wrapping_sub(GRANULARITY))
        } else {
            None
        }
    };

    /// Find the free block list to store a free block of the specified
    /// content size.
    #[inline]
    fn map_floor(size: usize) -> Option<(usize, usize)> {
        debug_assert!(size >= GRANULARITY);
        debug_assert!(size % GRANULARITY == 0);
        let fl = usize::BITS - GRANULARITY_LOG2 - 1 - size.leading_zeros();

        let sl = if GRANULARITY_LOG2 < Self::SLI && fl < Self::SLI - GRANULARITY_LOG2 {
            size << ((Self::SLI - GRANULARITY_LOG2) - fl)
        } else {
            let sl = size >> (fl + GRANULARITY_LOG2 - Self::SLI);

            // The most significant one of `size` should be at `sl[SLI]`
            debug_assert!((sl >> Self::SLI) == 1);

            sl
        };

        // `fl` must be in a valid range
        if fl as usize >= FLLEN {
            return None;
        }

        Some((fl as usize, sl & (SLLEN - 1)))
    }

    /// Find the first free block list whose every item is at least as large
    /// as the specified content size.
    #[inline]
    fn map_ceil(size: usize) -> Option<(usize, usize)> {
        debug_assert!(size >= GRANULARITY);
        debug_assert!(size % GRANULARITY == 0);
        let mut fl = usize::BITS - GRANULARITY_LOG2 - 1 - size.leading_zeros();

        let sl = if GRANULARITY_LOG2 < Self::SLI && fl < Self::SLI - GRANULARITY_LOG2 {
            size << ((Self::SLI - GRANULARITY_LOG2) - fl)
        } else {
            let mut sl = size >> (fl + GRANULARITY_LOG2 - Self::SLI);

            // round up (this is specific to `map_ceil`)
            sl += (sl << (fl + GRANULARITY_LOG2 - Self::SLI) != size) as usize;

            debug_assert!((sl >> Self::SLI) == 0b01 || (sl >> Self::SLI) == 0b10);

            // if sl[SLI + 1] { fl += 1; sl = 0; }
            fl += (sl >> (Self::SLI + 1)) as u32;

            sl
        };

        // `fl` must be in a valid range
        if fl as usize >= FLLEN {
            return None;
        }

        Some((fl as usize, sl & (SLLEN - 1)))
    }

    /// Find the first free block list whose every item is at least as large
    /// as the specified content size and get the list's minimum size. Returns
    /// `None` if there isn't such a list.
    #[inline]
    fn map_ceil_and_unmap(size: usize) -> Option<usize> {
        debug_assert!(size >= GRANULARITY);
        debug_assert!(size % GRANULARITY == 0);

        let max_mappable = {
            // The maximum value for which `map_ceil(x)` returns
            // `(usize::BITS - GRANULARITY_LOG2 - 1, _)`, assuming `FLLEN == ∞`
            let max1 = !(usize::MAX >> (Self::SLI + 1));

            // Now take into account the fact that `FLLEN` is not infinity
            if (FLLEN as u32 - 1) < usize::BITS - GRANULARITY_LOG2 - 1 {
                max1 >> ((usize::BITS - GRANULARITY_LOG2 - 1) - (FLLEN as u32 - 1))
            } else {
                max1
            }
        };

        if size > max_mappable {
            return None;
        }

        let fl = usize::BITS - GRANULARITY_LOG2 - 1 - size.leading_zeros();

        let list_min_size = if GRANULARITY_LOG2 < Self::SLI && fl < Self::SLI - GRANULARITY_LOG2 {
            size
        } else {
            let shift = fl + GRANULARITY_LOG2 - Self::SLI;

            // round up
            (size + ((1 << shift) - 1)) & !((1 << shift) - 1)
        };

        Some(list_min_size)
    }

    /// Search for a non-empty free block list for allocation.
    ///
    /// Two bounded bit scans; an empty result from both is a definitive
    /// allocation failure.
    #[inline]
    fn search_suitable_free_block_list(&self, min_size: usize) -> Option<(usize, usize)> {
        let (mut fl, mut sl) = Self::map_ceil(min_size)?;

        // Search in range `(fl, sl..SLLEN)`
        sl = self.sl_bitmap[fl].bit_scan_forward(sl as u32) as usize;
        if sl < SLLEN {
            debug_assert!(self.sl_bitmap[fl].get_bit(sl as u32));

            return Some((fl, sl));
        }

        // Search in range `(fl + 1.., ..)`
        fl = self.fl_bitmap.bit_scan_forward(fl as u32 + 1) as usize;
        if fl < FLLEN {
            debug_assert!(self.fl_bitmap.get_bit(fl as u32));

            sl = self.sl_bitmap[fl].trailing_zeros() as usize;
            if sl >= SLLEN {
                debug_assert!(false, "bitmap disagrees with the free lists it caches");
                unsafe { unreachable_unchecked() };
            }

            debug_assert!(self.sl_bitmap[fl].get_bit(sl as u32));
            Some((fl, sl))
        } else {
            None
        }
    }

    /// Insert the specified free block to the corresponding free block list.
    ///
    /// Updates `FreeBlockHdr::{prev_free, next_free}`.
    ///
    /// # Safety
    ///
    ///  - `*block.as_ptr()` must be owned by `self`. (It does not have to be
    ///    initialized, however.)
    ///  - `size` must have a corresponding free list, which does not currently
    ///    contain `block`.
    ///
    unsafe fn link_free_block(&mut self, mut block: NonNull<FreeBlockHdr>, size: usize) {
        let (fl, sl) = Self::map_floor(size).unwrap_or_else(|| unreachable_unchecked());
        let first_free = &mut self.first_free[fl][sl];
        let next_free = mem::replace(first_free, Some(block));
        block.as_mut().next_free = next_free;
        block.as_mut().prev_free = None;
        if let Some(mut next_free) = next_free {
            next_free.as_mut().prev_free = Some(block);
        }

        self.fl_bitmap.set_bit(fl as u32);
        self.sl_bitmap[fl].set_bit(sl as u32);
    }

    /// Remove the specified free block from the corresponding free block list.
    ///
    /// # Safety
    ///
    ///  - `size` must represent the specified free block's content size.
    ///  - The free block must be currently included in a free block list.
    ///
    unsafe fn unlink_free_block(&mut self, mut block: NonNull<FreeBlockHdr>, size: usize) {
        let next_free = block.as_mut().next_free;
        let prev_free = block.as_mut().prev_free;

        if let Some(mut next_free) = next_free {
            next_free.as_mut().prev_free = prev_free;
        }

        if let Some(mut prev_free) = prev_free {
            prev_free.as_mut().next_free = next_free;
        } else {
            let (fl, sl) = Self::map_floor(size).unwrap_or_else(|| unreachable_unchecked());
            let first_free = &mut self.first_free[fl][sl];

            debug_assert_eq!(*first_free, Some(block));
            *first_free = next_free;

            if next_free.is_none() {
                // The free list is now empty - update the bitmap
                self.sl_bitmap[fl].clear_bit(sl as u32);
                if self.sl_bitmap[fl] == SLBitmap::ZERO {
                    self.fl_bitmap.clear_bit(fl as u32);
                }
            }
        }
    }

    /// Construct a `Tlsf` in place over an arena specified by a slice
    /// pointer, using the arena to hold the control structure, the free-list
    /// directory, and all blocks.
    ///
    /// The whole usable region after the control structure is carved into one
    /// free block and registered. The arena's address and length are fixed
    /// for the instance's lifetime; the allocator never calls into an
    /// external allocator.
    ///
    /// The arena must be large enough for the control structure plus one
    /// minimum-size block; violating this is a caller contract error checked
    /// by a debug assertion only. If the arena is larger than
    /// [`Self::MAX_CAPACITY`] allows, the excess at the end is left
    /// unmanaged.
    ///
    /// # Safety
    ///
    /// The arena will be considered owned by the returned instance. It must
    /// outlive the instance and must not be accessed through any other
    /// pointer while the instance is in use.
    pub unsafe fn emplace_ptr(arena: NonNull<[u8]>) -> NonNull<Self> {
        let () = Self::VALID;

        let base = nonnull_slice_start(arena).as_ptr() as usize;
        let end = nonnull_slice_end(arena) as usize;

        // The control structure sits at the arena's (aligned) start; the
        // first block header follows at the next granule boundary
        let ctrl_start =
            base.wrapping_add(mem::align_of::<Self>() - 1) & !(mem::align_of::<Self>() - 1);
        let block_start = (ctrl_start + mem::size_of::<Self>()).wrapping_add(GRANULARITY - 1)
            & !(GRANULARITY - 1);

        debug_assert!(
            block_start
                .checked_add(mem::size_of::<BlockHdr>() + GRANULARITY)
                .map_or(false, |min_end| min_end <= end),
            "arena too small for the control structure and one minimum-size block"
        );

        let mut size = (end - block_start - mem::size_of::<BlockHdr>()) & !(GRANULARITY - 1);
        if let Some(max_capacity) = Self::MAX_CAPACITY {
            if size > max_capacity {
                // The class table cannot represent the excess; leave it
                // unmanaged at the end of the arena
                size = max_capacity;
            }
        }

        let mut ctrl = NonNull::new_unchecked(ctrl_start as *mut Self);
        ctrl.as_ptr().write(Self {
            size,
            fl_bitmap: FLBitmap::ZERO,
            sl_bitmap: [SLBitmap::ZERO; FLLEN],
            first_free: [[None; SLLEN]; FLLEN],
        });

        // The one free block covering the whole usable region
        let mut block = NonNull::new_unchecked(block_start as *mut FreeBlockHdr);
        block.as_mut().common = BlockHdr {
            size: size | SIZE_FREE | SIZE_LAST,
            prev_phys_block: None,
        };
        ctrl.as_mut().link_free_block(block, size);

        ctrl
    }

    /// Construct a `Tlsf` in place over an arena specified by a slice.
    ///
    /// # Examples
    ///
    /// ```
    /// use tlsf_arena::Tlsf;
    /// use std::mem::MaybeUninit;
    /// let mut arena = [MaybeUninit::uninit(); 65536];
    /// let tlsf: &mut Tlsf<u16, u16, 12, 16> = Tlsf::emplace(&mut arena);
    /// assert!(tlsf.capacity() > 0);
    /// ```
    ///
    /// The arena must outlive the returned instance:
    ///
    /// ```rust,compile_fail
    /// use tlsf_arena::Tlsf;
    /// use std::mem::MaybeUninit;
    /// let tlsf: &mut Tlsf<u16, u16, 12, 16>;
    /// {
    ///     let mut arena = [MaybeUninit::uninit(); 65536];
    ///     tlsf = Tlsf::emplace(&mut arena);
    /// } // dropping the arena first is not allowed
    /// tlsf.allocate(16);
    /// ```
    #[inline]
    pub fn emplace(arena: &mut [MaybeUninit<u8>]) -> &mut Self {
        // Safety: `arena` is a mutable reference, which guarantees the absence
        //         of aliasing references for the returned borrow's lifetime,
        //         and references are never null
        unsafe {
            Self::emplace_ptr(NonNull::new_unchecked(arena as *mut [_] as *mut [u8])).as_mut()
        }
    }

    /// The total content capacity of the arena. This remains constant for the
    /// instance's whole lifetime.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Get the minimum arena length (in bytes) that guarantees an
    /// `allocate(size)` call to succeed right after [`Self::emplace`],
    /// regardless of the arena's address. Returns `None` if `size` exceeds
    /// [`Self::MAX_CAPACITY`].
    pub fn arena_size_to_contain_allocation(size: usize) -> Option<usize> {
        debug_assert!(size % GRANULARITY == 0);
        let size = size.max(GRANULARITY);

        // The chosen free list only guarantees blocks at least as large as
        // the list's minimum size, so the initial block must reach that
        let block_size = Self::map_ceil_and_unmap(size)?;

        block_size.checked_add(
            mem::size_of::<Self>()
                + mem::size_of::<BlockHdr>()
                + (mem::align_of::<Self>() - 1)
                + (GRANULARITY - 1),
        )
    }

    /// Attempt to allocate a block of memory.
    ///
    /// `size` is a content size in bytes and must be a multiple of
    /// [`GRANULARITY`] (zero is served from the smallest class). The rounding
    /// policy may hand out slightly more than requested so that no free
    /// sliver too small to host a block is ever produced.
    ///
    /// Returns the starting address of the allocated content on success;
    /// `None` otherwise, with the arena left unchanged.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(
            size % GRANULARITY == 0,
            "`size` must be a multiple of `GRANULARITY`"
        );
        let size = size.max(GRANULARITY);

        let (fl, sl) = self.search_suitable_free_block_list(size)?;

        // Safety: The bitmaps are a cache of the free lists, so the chosen
        //         list is non-empty and its head is a valid free block
        unsafe {
            let first_free = &mut self.first_free[fl][sl];
            let block = first_free.unwrap_or_else(|| unreachable_unchecked());

            debug_assert!(block.as_ref().common.is_free());
            debug_assert!(block.as_ref().common.size() >= size);

            // Unlink the list head. We are not using `unlink_free_block`
            // because we already know `(fl, sl)` and that `block.prev_free`
            // is `None`.
            let next_free = block.as_ref().next_free;
            *first_free = next_free;
            if let Some(mut next_free) = next_free {
                next_free.as_mut().prev_free = None;
            } else {
                // The free list is now empty - update the bitmap
                self.sl_bitmap[fl].clear_bit(sl as u32);
                if self.sl_bitmap[fl] == SLBitmap::ZERO {
                    self.fl_bitmap.clear_bit(fl as u32);
                }
            }

            // Split off the excess, unless the remainder would be too small
            // to host a header plus the minimum content
            let block_size = block.as_ref().common.size();
            if block_size - size >= mem::size_of::<BlockHdr>() + GRANULARITY {
                let remainder = Self::split_excess(block.cast(), size);
                self.link_free_block(remainder, remainder.as_ref().common.size());
            }

            let mut block = block.cast::<BlockHdr>();
            block.as_mut().set_free(false);

            Some(block.as_ref().content())
        }
    }

    /// Carve a content prefix of `asize` bytes out of `block` and turn the
    /// excess into a new free block.
    ///
    /// The remainder inherits `block`'s last flag, back-references `block`,
    /// and receives the back-reference of whatever physically follows it. It
    /// is returned unregistered; linking it into a free list is the caller's
    /// responsibility.
    ///
    /// # Safety
    ///
    /// `block`'s header must be valid, and its content size must be at least
    /// `asize + size_of::<BlockHdr>() + GRANULARITY` so that the remainder is
    /// a viable block.
    unsafe fn split_excess(mut block: NonNull<BlockHdr>, asize: usize) -> NonNull<FreeBlockHdr> {
        debug_assert!(asize % GRANULARITY == 0);
        debug_assert!(block.as_ref().size() >= asize + mem::size_of::<BlockHdr>() + GRANULARITY);

        let remainder_size = block.as_ref().size() - asize - mem::size_of::<BlockHdr>();
        let was_last = block.as_ref().is_last();

        block.as_mut().set_size(asize);
        block.as_mut().set_last(false);

        // Safety: `block` is no longer last, so the remainder starts right
        //         after its shrunken content
        let mut remainder = block
            .as_ref()
            .next_phys_block()
            .unwrap_or_else(|| unreachable_unchecked())
            .cast::<FreeBlockHdr>();
        remainder.as_mut().common = BlockHdr {
            size: remainder_size | SIZE_FREE | if was_last { SIZE_LAST } else { 0 },
            prev_phys_block: Some(block),
        };

        if let Some(mut next) = remainder.as_ref().common.next_phys_block() {
            next.as_mut().prev_phys_block = Some(remainder.cast());
        }

        remainder
    }

    /// Fuse `block` with its physical successor and re-register the combined
    /// block under the class matching its new size.
    ///
    /// # Safety
    ///
    /// `block` must not be the last block, and both `block` and its successor
    /// must be free and currently registered in their (possibly different)
    /// free lists.
    unsafe fn merge_with_next(&mut self, mut block: NonNull<FreeBlockHdr>) {
        // Safety: `block` is not the last block
        let next = block
            .as_ref()
            .common
            .next_phys_block()
            .unwrap_or_else(|| unreachable_unchecked())
            .cast::<FreeBlockHdr>();

        debug_assert!(block.as_ref().common.is_free());
        debug_assert!(next.as_ref().common.is_free());

        let size =
            block.as_ref().common.size() + mem::size_of::<BlockHdr>() + next.as_ref().common.size();

        self.unlink_free_block(block, block.as_ref().common.size());
        self.unlink_free_block(next, next.as_ref().common.size());

        // `next`'s header is absorbed into `block`'s content
        block.as_mut().common.set_size(size);
        block
            .as_mut()
            .common
            .set_last(next.as_ref().common.is_last());

        if let Some(mut next_next) = block.as_ref().common.next_phys_block() {
            next_next.as_mut().prev_phys_block = Some(block.cast());
        }

        self.link_free_block(block, size);
    }

    /// Find the `BlockHdr` for an allocation (any `NonNull<u8>` returned by
    /// our allocation functions).
    #[inline]
    unsafe fn block_hdr_for_content(ptr: NonNull<u8>) -> NonNull<BlockHdr> {
        debug_assert!(ptr.as_ptr() as usize % GRANULARITY == 0);
        NonNull::new_unchecked(ptr.as_ptr().sub(mem::size_of::<BlockHdr>())).cast()
    }

    /// Deallocate a previously allocated memory block, coalescing it with
    /// free physical neighbors (right, then left).
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a memory block previously allocated via `self` and
    /// not already deallocated.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let mut block = Self::block_hdr_for_content(ptr);
        debug_assert!(!block.as_ref().is_free(), "double free");

        block.as_mut().set_free(true);
        let size = block.as_ref().size();
        let block = block.cast::<FreeBlockHdr>();
        self.link_free_block(block, size);

        // Merge with the next block if it's a free block
        if let Some(next) = block.as_ref().common.next_phys_block() {
            if next.as_ref().is_free() {
                self.merge_with_next(block);
            }
        }

        // Merge with the previous block if it's a free block. Coalescing is
        // over after this: the neighbors' neighbors were not free before this
        // call.
        if let Some(prev) = block.as_ref().common.prev_phys_block {
            if prev.as_ref().is_free() {
                self.merge_with_next(prev.cast());
            }
        }
    }

    /// Shrink or grow a previously allocated memory block.
    ///
    /// `new_size` is a content size in bytes and must be a non-zero multiple
    /// of [`GRANULARITY`]. Growing prefers absorbing a free right neighbor
    /// (keeping the starting address) and falls back to
    /// allocate-elsewhere-and-copy.
    ///
    /// Returns the new starting address of the content on success. On
    /// failure the original block and its content are left fully intact and
    /// still owned by the caller; no implicit deallocation occurs.
    ///
    /// # Time Complexity
    ///
    /// Constant when resizing in place; `O(old_size)` when relocating.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a memory block previously allocated via `self` and
    /// not already deallocated.
    pub unsafe fn reallocate(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        debug_assert!(new_size != 0);
        debug_assert!(
            new_size % GRANULARITY == 0,
            "`new_size` must be a multiple of `GRANULARITY`"
        );
        let new_size = new_size.max(GRANULARITY);

        let mut block = Self::block_hdr_for_content(ptr);
        debug_assert!(!block.as_ref().is_free(), "reallocating a free block");

        let old_size = block.as_ref().size();

        if new_size == old_size {
            return Some(ptr);
        }

        if new_size < old_size {
            // Shrink in place. Keep the block oversized unless the freed tail
            // can host a whole new block.
            if old_size - new_size >= mem::size_of::<BlockHdr>() + GRANULARITY {
                let remainder = Self::split_excess(block, new_size);
                self.link_free_block(remainder, remainder.as_ref().common.size());

                // The tail may sit next to an existing free block
                if let Some(next) = remainder.as_ref().common.next_phys_block() {
                    if next.as_ref().is_free() {
                        self.merge_with_next(remainder);
                    }
                }
            }
            return Some(ptr);
        }

        // Grow in place by absorbing a free right neighbor, keeping the
        // starting address
        if let Some(next) = block.as_ref().next_phys_block() {
            let next_size = next.as_ref().size();
            if next.as_ref().is_free()
                && old_size + mem::size_of::<BlockHdr>() + next_size >= new_size
            {
                self.unlink_free_block(next.cast(), next_size);

                block
                    .as_mut()
                    .set_size(old_size + mem::size_of::<BlockHdr>() + next_size);
                block.as_mut().set_last(next.as_ref().is_last());

                if let Some(mut next_next) = block.as_ref().next_phys_block() {
                    next_next.as_mut().prev_phys_block = Some(block);
                }

                // Split off any excess. The excess's right neighbor was in
                // use before this call, so no merge is needed.
                if block.as_ref().size() - new_size >= mem::size_of::<BlockHdr>() + GRANULARITY {
                    let remainder = Self::split_excess(block, new_size);
                    self.link_free_block(remainder, remainder.as_ref().common.size());
                }

                return Some(ptr);
            }
        }

        // Relocate. Allocating before touching the original block keeps it
        // fully valid when no space can be found.
        let new_ptr = self.allocate(new_size)?;
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size);
        self.deallocate(ptr);

        Some(new_ptr)
    }

    /// Walk the physical block chain and the free-list directory, panicking
    /// if any structural invariant is violated.
    #[cfg(test)]
    pub(crate) fn check_integrity(&self) {
        unsafe {
            // The first block sits at the granule boundary following the
            // control structure
            let block_start = (self as *const Self as usize + mem::size_of::<Self>())
                .wrapping_add(GRANULARITY - 1)
                & !(GRANULARITY - 1);
            let mut block = NonNull::new(block_start as *mut BlockHdr).unwrap();
            let mut prev: Option<NonNull<BlockHdr>> = None;
            let mut prev_was_free = false;
            let mut total = 0;
            let mut chain_free_blocks = 0;
            loop {
                let hdr = block.as_ref();
                assert!(hdr.size() >= GRANULARITY);
                assert_eq!(hdr.size() % GRANULARITY, 0);
                assert_eq!(hdr.prev_phys_block, prev);
                if hdr.is_free() {
                    assert!(!prev_was_free, "two adjacent free blocks");
                    chain_free_blocks += 1;
                }
                prev_was_free = hdr.is_free();
                total += mem::size_of::<BlockHdr>() + hdr.size();
                prev = Some(block);
                match hdr.next_phys_block() {
                    Some(next) => block = next,
                    None => break,
                }
            }

            // Size conservation: splitting and merging never change the sum
            assert_eq!(total, mem::size_of::<BlockHdr>() + self.size);

            // The bitmaps must be a cache of the free lists, and every free
            // block must be registered in exactly the list matching its size
            let mut listed_free_blocks = 0;
            for fl in 0..FLLEN {
                for sl in 0..SLLEN {
                    let head = self.first_free[fl][sl];
                    assert_eq!(self.sl_bitmap[fl].get_bit(sl as u32), head.is_some());

                    let mut prev_free: Option<NonNull<FreeBlockHdr>> = None;
                    let mut cur = head;
                    while let Some(free_block) = cur {
                        listed_free_blocks += 1;
                        assert!(free_block.as_ref().common.is_free());
                        assert_eq!(
                            Self::map_floor(free_block.as_ref().common.size()),
                            Some((fl, sl))
                        );
                        assert_eq!(free_block.as_ref().prev_free, prev_free);
                        prev_free = cur;
                        cur = free_block.as_ref().next_free;
                    }
                }
                assert_eq!(
                    self.fl_bitmap.get_bit(fl as u32),
                    self.sl_bitmap[fl] != SLBitmap::ZERO
                );
            }
            assert_eq!(chain_free_blocks, listed_free_blocks);
        }
    }
}
