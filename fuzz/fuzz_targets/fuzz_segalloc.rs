#![no_main]

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use segalloc::{ArenaHeap, Segalloc, Span};

use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

const ARENA_SIZE: usize = 1 << 20;

#[derive(Arbitrary, Debug)]
enum Action {
    /// Allocate a payload of the given size
    Allocate { size: u16 },
    /// Free the ith live allocation
    Free { index: u8 },
    /// Reallocate the ith live allocation to a new size
    Reallocate { index: u8, new_size: u16 },
}
use Action::*;

fuzz_target!(|actions: Vec<Action>| {
    let mem_layout = Layout::from_size_align(ARENA_SIZE, 8).unwrap();
    let mem = unsafe { alloc(mem_layout) };
    assert!(!mem.is_null());

    let source = unsafe { ArenaHeap::new(Span::from_base_size(mem, ARENA_SIZE)) };
    let mut heap = Segalloc::init(source).unwrap();

    let mut allocations: Vec<(NonNull<u8>, usize)> = vec![];

    for action in actions {
        match action {
            Allocate { size } => {
                if size == 0 {
                    continue;
                }

                if let Some(ptr) = heap.allocate(size as usize) {
                    unsafe { ptr.as_ptr().write_bytes(0xab, size as usize) };
                    allocations.push((ptr, size as usize));
                }
            }
            Free { index } => {
                if index as usize >= allocations.len() {
                    continue;
                }

                let (ptr, _) = allocations.swap_remove(index as usize);
                unsafe { heap.free(ptr) };
            }
            Reallocate { index, new_size } => {
                if index as usize >= allocations.len() || new_size == 0 {
                    continue;
                }

                let (ptr, old_size) = allocations[index as usize];

                if let Some(ptr) = unsafe { heap.reallocate(ptr.as_ptr(), new_size as usize) } {
                    allocations[index as usize] = (ptr, new_size as usize);
                    if old_size < new_size as usize {
                        unsafe {
                            ptr.as_ptr()
                                .add(old_size)
                                .write_bytes(0xcd, new_size as usize - old_size);
                        }
                    }
                }
            }
        }
    }

    // Free any remaining allocations.
    for (ptr, _) in allocations {
        unsafe { heap.free(ptr) };
    }

    drop(heap);
    unsafe { dealloc(mem, mem_layout) };
});
