//! The heap-growth primitive: a monotone break pointer over some region.

use core::ptr::NonNull;

#[cfg(unix)]
use crate::ptr_utils::{align_up, is_aligned};
use crate::ptr_utils::ALIGNMENT;
use crate::span::Span;

/// The break could not be advanced any further.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapExhausted;

/// A monotonically growable region of memory backing a [`Segalloc`](crate::Segalloc).
///
/// The region never shrinks and never moves: [`extend`](HeapSource::extend)
/// bumps the break and hands back the old one, and [`span`](HeapSource::span)
/// reports `[heap_lo, heap_hi)` for the memory handed out so far.
///
/// # Safety
/// Implementations must return, from `extend(bytes)`, a pointer to `bytes`
/// bytes of memory that is valid for reads and writes for the allocator's
/// lifetime, directly contiguous with all previously extended memory, and
/// not mutated by anything but the allocator and its clients. The region
/// as a whole must never exceed `u32::MAX` bytes, so that offsets into it
/// stay encodable in a tag-sized word.
pub unsafe trait HeapSource {
    /// Advances the break by `bytes`, returning the previous break.
    fn extend(&mut self, bytes: usize) -> Result<NonNull<u8>, HeapExhausted>;

    /// The region handed out so far, from the fixed low address to the
    /// current break.
    fn span(&self) -> Span;

    /// Bytes between the fixed low address and the current break.
    fn heap_size(&self) -> usize {
        self.span().size()
    }
}

/// A break pointer over a caller-supplied span of memory.
///
/// `extend` fails once the span is used up, which makes a capped arena
/// behave exactly like a bounded process heap.
#[derive(Debug)]
pub struct ArenaHeap {
    base: *mut u8,
    brk: *mut u8,
    limit: *mut u8,
}

unsafe impl Send for ArenaHeap {}

impl ArenaHeap {
    /// Wraps `memory` as a growable region.
    ///
    /// The span is trimmed inward to the block granule, and capped so that
    /// offsets into the region stay encodable.
    ///
    /// # Safety
    /// The memory within `memory` must be valid for reads and writes for
    /// the lifetime of the allocator built over it, and must not be
    /// mutated except through that allocator.
    pub unsafe fn new(memory: Span) -> Self {
        match memory.align_inward().get_base_acme() {
            Some((base, acme)) => {
                let cap = (u32::MAX as usize) & !(ALIGNMENT - 1);
                let acme = if acme as usize - base as usize > cap { base.add(cap) } else { acme };
                Self { base, brk: base, limit: acme }
            }
            None => Self {
                base: core::ptr::null_mut(),
                brk: core::ptr::null_mut(),
                limit: core::ptr::null_mut(),
            },
        }
    }

    /// Bytes not yet handed out.
    pub fn remaining(&self) -> usize {
        self.limit as usize - self.brk as usize
    }
}

unsafe impl HeapSource for ArenaHeap {
    fn extend(&mut self, bytes: usize) -> Result<NonNull<u8>, HeapExhausted> {
        if bytes > self.remaining() {
            return Err(HeapExhausted);
        }

        let old = NonNull::new(self.brk).ok_or(HeapExhausted)?;
        self.brk = unsafe { self.brk.add(bytes) };
        Ok(old)
    }

    fn span(&self) -> Span {
        Span::new(self.base, self.brk)
    }
}

/// A break pointer over the process data segment via `sbrk(2)`.
///
/// This is what makes the allocator an actual process-heap replacement.
///
/// ```no_run
/// use segalloc::{SbrkHeap, Segalloc};
///
/// let source = unsafe { SbrkHeap::new().unwrap() };
/// let mut heap = Segalloc::init(source).unwrap();
/// let p = heap.allocate(128).unwrap();
/// unsafe { heap.free(p) };
/// ```
#[cfg(unix)]
#[derive(Debug)]
pub struct SbrkHeap {
    lo: *mut u8,
}

#[cfg(unix)]
unsafe impl Send for SbrkHeap {}

#[cfg(unix)]
impl SbrkHeap {
    /// Claims the current program break as the heap's low boundary,
    /// padding it onto a block granule boundary if necessary.
    ///
    /// # Safety
    /// Nothing else in the process may move the break while the allocator
    /// is live; in particular, the process's default allocator must not be
    /// backed by `brk`.
    pub unsafe fn new() -> Result<Self, HeapExhausted> {
        let brk = sbrk(0)?;
        let lo = align_up(brk);

        if lo != brk {
            sbrk(lo as usize - brk as usize)?;
        }

        Ok(Self { lo })
    }
}

#[cfg(unix)]
unsafe impl HeapSource for SbrkHeap {
    fn extend(&mut self, bytes: usize) -> Result<NonNull<u8>, HeapExhausted> {
        // keep the whole region offset-encodable
        if self.heap_size().checked_add(bytes).map_or(true, |total| total > u32::MAX as usize) {
            return Err(HeapExhausted);
        }

        let old = unsafe { sbrk(bytes)? };
        debug_assert!(is_aligned(old));

        NonNull::new(old).ok_or(HeapExhausted)
    }

    fn span(&self) -> Span {
        match unsafe { sbrk(0) } {
            Ok(brk) => Span::new(self.lo, brk),
            Err(_) => Span::empty(),
        }
    }
}

/// Advances the program break by `increment`, returning the old break.
#[cfg(unix)]
unsafe fn sbrk(increment: usize) -> Result<*mut u8, HeapExhausted> {
    let increment = isize::try_from(increment).map_err(|_| HeapExhausted)?;
    let old = libc::sbrk(increment);

    if old as isize == -1 { Err(HeapExhausted) } else { Ok(old.cast()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_extends_until_exhausted() {
        let mut backing = [0u64; 16]; // 128 bytes, 8-aligned
        let mut arena = unsafe { ArenaHeap::new(Span::from(&mut backing)) };

        assert_eq!(arena.remaining(), 128);
        assert_eq!(arena.heap_size(), 0);

        let first = arena.extend(48).unwrap();
        assert_eq!(first.as_ptr(), backing.as_mut_ptr().cast());
        assert_eq!(arena.heap_size(), 48);

        let second = arena.extend(80).unwrap();
        assert_eq!(second.as_ptr(), unsafe { first.as_ptr().add(48) });
        assert_eq!(arena.remaining(), 0);

        assert_eq!(arena.extend(8), Err(HeapExhausted));
        // a failed extension leaves the break where it was
        assert_eq!(arena.heap_size(), 128);
    }

    #[test]
    fn empty_arena_never_extends() {
        let mut arena = unsafe { ArenaHeap::new(Span::empty()) };
        assert_eq!(arena.extend(8), Err(HeapExhausted));
    }
}
