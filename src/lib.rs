#![doc = include_str!("../README.md")]
#![cfg_attr(not(any(test, fuzzing)), no_std)]

mod heap;
mod llist;
mod ptr_utils;
mod span;
mod tag;


#[cfg(unix)]
pub use heap::SbrkHeap;
pub use heap::{ArenaHeap, HeapExhausted, HeapSource};
pub use span::Span;

use core::ptr::{null_mut, NonNull};

use llist::FreeNode;
use ptr_utils::{is_aligned, ALIGNMENT};
use tag::Tag;

// Heap layout, as offsets from heap_lo:
//   0..32   bin head table, one 4-byte offset per size class (0 = empty)
//   32..36  pad word
//   36..44  prologue: an allocated block of bare overhead
//   44..48  epilogue header: size 0, allocated
// Every extension overwrites the old epilogue with the new free block's
// header and lays down a fresh epilogue, so block walks always terminate.
//
// A free block's payload starts with a next/prev link pair (see llist).

/// Size of one boundary tag.
const WSIZE: usize = core::mem::size_of::<Tag>();
/// Header plus footer overhead carried by every block.
const OVERHEAD: usize = 2 * WSIZE;
/// Smallest representable block: header, two links, footer.
const MIN_BLOCK_SIZE: usize = OVERHEAD + 2 * WSIZE;
/// Granularity of heap extension.
const CHUNK_SIZE: usize = 4096;
/// Number of segregated size classes.
const BIN_COUNT: usize = 8;
/// Bytes reserved at the bottom of the heap for the bin head table.
const BIN_TABLE_SIZE: usize = BIN_COUNT * WSIZE;
/// Bin table, pad word, prologue, epilogue.
const INIT_SIZE: usize = BIN_TABLE_SIZE + WSIZE + OVERHEAD + WSIZE;

// Block navigation. `bp` always points at a payload, one word past the
// header, and is what clients hold.

#[inline]
unsafe fn header_ptr(bp: *mut u8) -> *mut Tag {
    bp.sub(WSIZE).cast()
}

#[inline]
unsafe fn header(bp: *mut u8) -> Tag {
    header_ptr(bp).read()
}

#[inline]
unsafe fn footer_ptr(bp: *mut u8) -> *mut Tag {
    bp.add(header(bp).size() - OVERHEAD).cast()
}

#[inline]
unsafe fn next_block(bp: *mut u8) -> *mut u8 {
    bp.add(header(bp).size())
}

/// The footer of the block directly below `bp`'s.
#[inline]
unsafe fn prev_footer(bp: *mut u8) -> Tag {
    bp.sub(OVERHEAD).cast::<Tag>().read()
}

#[inline]
unsafe fn prev_block(bp: *mut u8) -> *mut u8 {
    bp.sub(prev_footer(bp).size())
}

/// Writes the identical header and footer of the block at `bp`.
#[inline]
unsafe fn write_tags(bp: *mut u8, tag: Tag) {
    header_ptr(bp).write(tag);
    footer_ptr(bp).write(tag);
}

/// Canonical bin of a block size: `ceil(log2(size)) - 5`, clamped to the
/// table. Bin ranges double, from `<= 32` in bin 0 up to `>= 2049` in the
/// last; every member of a bin is within 2x of every other, which is what
/// lets first-fit within a bin stand in for best-fit.
#[inline]
fn bin_of_size(size: usize) -> usize {
    debug_assert!(size >= MIN_BLOCK_SIZE);

    let ceil_log2 = (usize::BITS - (size - 1).leading_zeros()) as usize;
    ceil_log2.saturating_sub(5).min(BIN_COUNT - 1)
}

/// Rounds a request up to a representable block size: payload plus
/// overhead, block-aligned, at least the minimum block size. `None` if
/// the request is too large to represent at all.
#[inline]
fn adjust_request(size: usize) -> Option<usize> {
    let adjusted = size.checked_add(OVERHEAD + (ALIGNMENT - 1))? & !(ALIGNMENT - 1);
    Some(adjusted.max(MIN_BLOCK_SIZE))
}

/// The error type for [`Segalloc::init`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitError {
    /// The heap primitive could not supply the initial region.
    SourceExhausted,
    /// The heap primitive's region does not start on a block boundary.
    Misaligned,
}

/// A segregated-fit allocator over a monotonically growing heap region.
///
/// One way to get started:
/// 1. Wrap some memory in a [`HeapSource`] ([`ArenaHeap`] over a buffer,
///    or [`SbrkHeap`] over the process break on unix).
/// 2. Construct with [`init`](Segalloc::init).
/// 3. Allocate with [`allocate`](Segalloc::allocate), and hand payloads
///    back through [`free`](Segalloc::free) and
///    [`reallocate`](Segalloc::reallocate).
pub struct Segalloc<S: HeapSource> {
    /// The heap-growth primitive.
    ///
    /// Its state is entirely maintained through [`HeapSource`].
    pub source: S,

    /// One bit per bin, set exactly when the bin is nonempty.
    avails: u8,
    /// Bottom of the region; the bin head table lives here.
    lo: *mut u8,
}

unsafe impl<S: HeapSource + Send> Send for Segalloc<S> {}

impl<S: HeapSource> core::fmt::Debug for Segalloc<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Segalloc")
            .field("avails", &format_args!("{:#010b}", self.avails))
            .field("heap", &self.source.span())
            .finish()
    }
}

impl<S: HeapSource> Segalloc<S> {
    /// Establishes an allocator over `source`.
    ///
    /// Claims the first 48 bytes of the region for the bin table and the
    /// prologue/epilogue sentinels. No memory beyond that is requested
    /// until an allocation needs it.
    pub fn init(mut source: S) -> Result<Self, InitError> {
        let base = source.extend(INIT_SIZE).map_err(|_| InitError::SourceExhausted)?.as_ptr();
        if !is_aligned(base) {
            return Err(InitError::Misaligned);
        }

        let mut heap = Self { source, avails: 0, lo: base };

        unsafe {
            debug_assert!(heap.source.span().contains(base));

            for bin in 0..BIN_COUNT {
                heap.bin_ptr(bin).write(0);
            }
            base.add(BIN_TABLE_SIZE).cast::<u32>().write(0); // pad word

            let prologue = base.add(BIN_TABLE_SIZE + OVERHEAD);
            write_tags(prologue, Tag::pack(OVERHEAD, true));
            header_ptr(prologue.add(OVERHEAD)).write(Tag::pack(0, true)); // epilogue

            heap.scan_for_errors();
        }

        Ok(heap)
    }

    /// Allocates a block with a payload of at least `size` bytes, aligned
    /// to the block granule.
    ///
    /// Returns `None` for a zero-size request, or when the heap primitive
    /// cannot supply the memory; the heap is left consistent and usable
    /// either way.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let adjusted = adjust_request(size)?;

        unsafe {
            let bp = match self.find_fit(adjusted) {
                Some(bp) => bp,
                None => self.extend_heap(adjusted.max(CHUNK_SIZE)).ok()?,
            };

            self.place(bp, adjusted);
            self.scan_for_errors();

            Some(NonNull::new_unchecked(bp))
        }
    }

    /// Releases the block whose payload is `bp`.
    ///
    /// Freeing a block whose header already reads free is a no-op.
    ///
    /// # Safety
    /// `bp` must have been returned by [`allocate`](Segalloc::allocate) or
    /// [`reallocate`](Segalloc::reallocate) on this allocator, and must
    /// not have been coalesced away by an intervening operation.
    pub unsafe fn free(&mut self, bp: NonNull<u8>) {
        let bp = bp.as_ptr();
        let tag = header(bp);
        if !tag.is_allocated() {
            return;
        }

        write_tags(bp, Tag::pack(tag.size(), false));
        self.coalesce(bp);

        self.scan_for_errors();
    }

    /// Resizes the allocation at `bp` to hold at least `size` bytes,
    /// preserving the payload's prefix, and returns the possibly relocated
    /// payload pointer.
    ///
    /// A null `bp` behaves as [`allocate`](Segalloc::allocate); a zero
    /// `size` behaves as [`free`](Segalloc::free) and returns `None`.
    /// Shrinking returns `bp` unchanged, keeping the excess as internal
    /// fragmentation. Growth absorbs free neighbors in place where it can
    /// (preferring the block above, which needs no copy) and falls back to
    /// allocate-copy-free. `None` on exhaustion, with the original
    /// allocation left intact.
    ///
    /// # Safety
    /// `bp` must be null or satisfy the requirements of
    /// [`free`](Segalloc::free).
    pub unsafe fn reallocate(&mut self, bp: *mut u8, size: usize) -> Option<NonNull<u8>> {
        let Some(nonnull) = NonNull::new(bp) else {
            return self.allocate(size);
        };
        if size == 0 {
            self.free(nonnull);
            return None;
        }

        let adjusted = adjust_request(size)?;
        let old_size = header(bp).size();
        debug_assert!(header(bp).is_allocated());

        if adjusted <= old_size {
            // shrinking is a no-op; the excess stays as fragmentation
            return Some(nonnull);
        }

        let next = next_block(bp);
        let next_tag = header(next);
        let prev_tag = prev_footer(bp);

        let new_bp;
        let new_size;

        if !next_tag.is_allocated() && old_size + next_tag.size() >= adjusted {
            // absorb the block above; the payload stays put
            self.remove(next, next_tag.size());
            new_bp = bp;
            new_size = old_size + next_tag.size();
            write_tags(new_bp, Tag::pack(new_size, true));
        } else if !prev_tag.is_allocated() && old_size + prev_tag.size() >= adjusted {
            // absorb the block below and slide the payload down
            let prev = prev_block(bp);
            self.remove(prev, prev_tag.size());
            new_bp = prev;
            new_size = old_size + prev_tag.size();
            write_tags(new_bp, Tag::pack(new_size, true));
            core::ptr::copy(bp, new_bp, old_size - OVERHEAD);
        } else if !next_tag.is_allocated()
            && !prev_tag.is_allocated()
            && old_size + prev_tag.size() + next_tag.size() >= adjusted
        {
            let prev = prev_block(bp);
            self.remove(next, next_tag.size());
            self.remove(prev, prev_tag.size());
            new_bp = prev;
            new_size = old_size + prev_tag.size() + next_tag.size();
            write_tags(new_bp, Tag::pack(new_size, true));
            core::ptr::copy(bp, new_bp, old_size - OVERHEAD);
        } else {
            // no usable neighbors; relocate
            let dest = match self.find_fit(adjusted) {
                Some(dest) => dest,
                None => self.extend_heap(adjusted.max(CHUNK_SIZE)).ok()?,
            };

            new_size = header(dest).size();
            self.remove(dest, new_size);
            write_tags(dest, Tag::pack(new_size, true));
            core::ptr::copy_nonoverlapping(bp, dest, old_size - OVERHEAD);

            write_tags(bp, Tag::pack(old_size, false));
            self.coalesce(bp);

            new_bp = dest;
        }

        // trim a worthwhile trailing remainder off the expanded block
        if new_size - adjusted >= MIN_BLOCK_SIZE {
            write_tags(new_bp, Tag::pack(adjusted, true));
            let rest = next_block(new_bp);
            write_tags(rest, Tag::pack(new_size - adjusted, false));
            // the remainder may border a free region produced just above
            self.coalesce(rest);
        }

        self.scan_for_errors();

        Some(NonNull::new_unchecked(new_bp))
    }

    /// Pointer to the `bin`th bin head slot.
    #[inline]
    fn bin_ptr(&self, bin: usize) -> *mut u32 {
        debug_assert!(bin < BIN_COUNT);

        self.lo.wrapping_add(bin * WSIZE).cast()
    }

    #[inline]
    unsafe fn bin_head(&self, bin: usize) -> *mut u8 {
        llist::decode(self.lo, self.bin_ptr(bin).read())
    }

    #[inline]
    unsafe fn set_bin_head(&mut self, bin: usize, bp: *mut u8) {
        self.bin_ptr(bin).write(llist::encode(self.lo, bp));
    }

    /// Lowest nonempty bin at or above `bin`, per the availability mask.
    #[inline]
    fn next_available_bin(&self, bin: usize) -> Option<usize> {
        if bin >= BIN_COUNT {
            return None;
        }

        let shifted = self.avails >> bin;
        if shifted != 0 { Some(bin + shifted.trailing_zeros() as usize) } else { None }
    }

    /// Pushes the free block at `bp` onto the head of its size class.
    unsafe fn prepend(&mut self, bp: *mut u8, size: usize) {
        debug_assert!(!header(bp).is_allocated());
        debug_assert_eq!(header(bp).size(), size);

        let bin = bin_of_size(size);
        let head = self.bin_head(bin);

        let node = FreeNode(bp);
        node.set_next(self.lo, head);
        node.set_prev(self.lo, null_mut());

        if head.is_null() {
            self.avails |= 1 << bin;
        } else {
            FreeNode(head).set_prev(self.lo, bp);
        }

        self.set_bin_head(bin, bp);
    }

    /// Unlinks the free block at `bp` from the bin it was registered
    /// under. `size` must be the size it was registered with.
    unsafe fn remove(&mut self, bp: *mut u8, size: usize) {
        let bin = bin_of_size(size);
        let node = FreeNode(bp);
        let prev = node.prev(self.lo);
        let next = node.next(self.lo);

        if prev.is_null() {
            self.set_bin_head(bin, next);
            if next.is_null() {
                self.avails &= !(1 << bin);
            }
        } else {
            FreeNode(prev).set_next(self.lo, next);
        }

        if !next.is_null() {
            FreeNode(next).set_prev(self.lo, prev);
        }
    }

    /// Segregated first-fit: the first block of at least `size` bytes,
    /// scanning each candidate bin's list from its head.
    unsafe fn find_fit(&self, size: usize) -> Option<*mut u8> {
        let mut bin = self.next_available_bin(bin_of_size(size))?;

        loop {
            let mut bp = self.bin_head(bin);
            while !bp.is_null() {
                if header(bp).size() >= size {
                    return Some(bp);
                }
                bp = FreeNode(bp).next(self.lo);
            }

            bin = self.next_available_bin(bin + 1)?;
        }
    }

    /// Installs an allocation of `size` bytes into the free block at
    /// `bp`, splitting off the remainder when one of at least minimum
    /// block size would result.
    unsafe fn place(&mut self, bp: *mut u8, size: usize) {
        let current = header(bp).size();
        debug_assert!(current >= size);

        self.remove(bp, current);

        if current - size >= MIN_BLOCK_SIZE {
            write_tags(bp, Tag::pack(size, true));
            let rest = next_block(bp);
            write_tags(rest, Tag::pack(current - size, false));
            // the remainder borders the block just placed below and an
            // allocated block above, so it goes straight into its bin
            self.prepend(rest, current - size);
        } else {
            write_tags(bp, Tag::pack(current, true));
        }
    }

    /// Merges the free block at `bp` with any free neighbors and
    /// registers the result, returning its payload pointer.
    ///
    /// `bp`'s tags must already read free and `bp` must not be in any bin.
    unsafe fn coalesce(&mut self, mut bp: *mut u8) -> *mut u8 {
        debug_assert!(!header(bp).is_allocated());

        let mut size = header(bp).size();

        let next = next_block(bp);
        let next_tag = header(next);
        if !next_tag.is_allocated() {
            self.remove(next, next_tag.size());
            size += next_tag.size();
        }

        let prev_tag = prev_footer(bp);
        if !prev_tag.is_allocated() {
            let prev = prev_block(bp);
            self.remove(prev, prev_tag.size());
            size += prev_tag.size();
            bp = prev;
        }

        write_tags(bp, Tag::pack(size, false));
        self.prepend(bp, size);

        bp
    }

    /// Grows the region by `bytes` and turns the extension into a
    /// registered free block, merged backward into a trailing free block
    /// if one exists. Returns the payload pointer of the resulting block.
    ///
    /// On failure nothing has been touched, so an aborted allocation
    /// leaves the heap exactly as it found it.
    unsafe fn extend_heap(&mut self, bytes: usize) -> Result<*mut u8, HeapExhausted> {
        debug_assert!(bytes % ALIGNMENT == 0);

        // the old break is one word past the old epilogue header, which
        // becomes the new block's header
        let bp = self.source.extend(bytes)?.as_ptr();

        write_tags(bp, Tag::pack(bytes, false));
        header_ptr(next_block(bp)).write(Tag::pack(0, true)); // fresh epilogue

        Ok(self.coalesce(bp))
    }

    #[cfg(not(debug_assertions))]
    fn scan_for_errors(&self) {}

    /// Debugging function for checking the heap invariants: tag duality,
    /// alignment, contiguity, eager coalescing, and the bijection between
    /// free blocks and bin list members.
    #[cfg(debug_assertions)]
    fn scan_for_errors(&self) {
        unsafe {
            #[cfg(any(test, fuzzing))]
            let mut free_blocks = std::vec::Vec::new();

            let prologue = self.lo.add(BIN_TABLE_SIZE + OVERHEAD);
            assert_eq!(header(prologue), Tag::pack(OVERHEAD, true));
            assert_eq!(footer_ptr(prologue).read(), Tag::pack(OVERHEAD, true));

            // walk the blocks bottom to top
            let mut bp = next_block(prologue);
            let mut below_free = false;
            let mut free_count = 0usize;
            loop {
                let tag = header(bp);
                if tag.size() == 0 {
                    assert!(tag.is_allocated(), "epilogue must read allocated");
                    assert!(
                        self.source.span().contains(header_ptr(bp).cast()),
                        "epilogue out of heap bounds"
                    );
                    // block sizes must account for every byte up to the break
                    assert_eq!(bp as usize - self.lo as usize, self.source.heap_size());
                    break;
                }

                assert!(is_aligned(bp), "payload misaligned: {:p}", bp);
                assert!(tag.size() % ALIGNMENT == 0 && tag.size() >= MIN_BLOCK_SIZE);
                assert_eq!(footer_ptr(bp).read(), tag, "header/footer mismatch at {:p}", bp);

                if !tag.is_allocated() {
                    assert!(!below_free, "adjacent free blocks at {:p}", bp);
                    free_count += 1;
                    #[cfg(any(test, fuzzing))]
                    free_blocks.push(bp as usize);
                }

                below_free = !tag.is_allocated();
                bp = next_block(bp);
            }

            // walk the bins: membership, size classes, link duality
            let mut listed = 0usize;
            for bin in 0..BIN_COUNT {
                let mut bp = self.bin_head(bin);
                assert_eq!(self.avails & 1 << bin != 0, !bp.is_null());

                let mut prev: *mut u8 = null_mut();
                while !bp.is_null() {
                    let tag = header(bp);
                    assert!(!tag.is_allocated());
                    assert_eq!(bin_of_size(tag.size()), bin);
                    assert_eq!(FreeNode(bp).prev(self.lo), prev);
                    #[cfg(any(test, fuzzing))]
                    assert!(free_blocks.contains(&(bp as usize)));

                    listed += 1;
                    assert!(listed <= free_count, "cycle in bin {}", bin);

                    prev = bp;
                    bp = FreeNode(bp).next(self.lo);
                }
            }

            assert_eq!(listed, free_count, "bin lists and block walk disagree");
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn bin_of_size_matches_table() {
        assert_eq!(bin_of_size(16), 0);
        assert_eq!(bin_of_size(32), 0);
        assert_eq!(bin_of_size(33), 1);
        assert_eq!(bin_of_size(64), 1);
        assert_eq!(bin_of_size(65), 2);
        assert_eq!(bin_of_size(128), 2);
        assert_eq!(bin_of_size(256), 3);
        assert_eq!(bin_of_size(512), 4);
        assert_eq!(bin_of_size(1024), 5);
        assert_eq!(bin_of_size(2048), 6);
        assert_eq!(bin_of_size(2049), 7);
        assert_eq!(bin_of_size(1 << 20), 7);
    }

    #[test]
    fn adjust_request_rounds_and_floors() {
        assert_eq!(adjust_request(1), Some(MIN_BLOCK_SIZE));
        assert_eq!(adjust_request(8), Some(MIN_BLOCK_SIZE));
        assert_eq!(adjust_request(9), Some(24));
        assert_eq!(adjust_request(24), Some(32));
        assert_eq!(adjust_request(4000), Some(4008));
        assert_eq!(adjust_request(usize::MAX), None);
        assert_eq!(adjust_request(usize::MAX - OVERHEAD), None);
    }
}
