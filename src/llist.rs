//! The free-list link pair threaded through a free block's payload.
//!
//! The first payload word of a free block holds the *next* link and the
//! second the *prev* link of its bin's doubly linked list. Links are
//! stored as 4-byte byte offsets from the bottom of the heap rather than
//! as raw pointers, so a link slot is exactly one tag wide on any target.
//! Offset zero addresses the bin table itself and can never name a block
//! payload, so it doubles as the null link.
//!
//! ### Safety:
//! These views are inherently unsafe: a `FreeNode` is only meaningful
//! over the payload of a block whose tags read free, and the links form
//! an inter-referential structure that the allocator alone keeps
//! consistent. Nothing here touches headers or footers.

/// Width of one link slot.
const LINK_SIZE: usize = core::mem::size_of::<u32>();

/// Decodes a link offset into a payload pointer. Zero decodes to null.
#[inline]
pub(crate) unsafe fn decode(lo: *mut u8, offset: u32) -> *mut u8 {
    if offset == 0 { core::ptr::null_mut() } else { lo.add(offset as usize) }
}

/// Encodes a payload pointer as a link offset. Null encodes to zero.
#[inline]
pub(crate) unsafe fn encode(lo: *mut u8, bp: *mut u8) -> u32 {
    if bp.is_null() { 0 } else { (bp as usize - lo as usize) as u32 }
}

/// View of the link pair at the front of a free block's payload.
#[derive(Clone, Copy)]
pub(crate) struct FreeNode(pub *mut u8);

impl FreeNode {
    #[inline]
    fn next_slot(self) -> *mut u32 {
        self.0.cast()
    }

    #[inline]
    fn prev_slot(self) -> *mut u32 {
        // payloads are 8-aligned, so the second slot stays 4-aligned
        unsafe { self.0.add(LINK_SIZE).cast() }
    }

    /// The following node's payload pointer, or null at the list's tail.
    #[inline]
    pub unsafe fn next(self, lo: *mut u8) -> *mut u8 {
        decode(lo, self.next_slot().read())
    }

    /// The preceding node's payload pointer, or null at the list's head.
    #[inline]
    pub unsafe fn prev(self, lo: *mut u8) -> *mut u8 {
        decode(lo, self.prev_slot().read())
    }

    #[inline]
    pub unsafe fn set_next(self, lo: *mut u8, bp: *mut u8) {
        self.next_slot().write(encode(lo, bp));
    }

    #[inline]
    pub unsafe fn set_prev(self, lo: *mut u8, bp: *mut u8) {
        self.prev_slot().write(encode(lo, bp));
    }
}
