//! A single aligned, fixed-size-block region and its free-list bookkeeping.

use std::alloc::Layout;
use std::ptr::NonNull;

use intrusive_collections::{LinkedListLink, UnsafeRef, intrusive_adapter};

use crate::block;
use crate::constants::{BLOCK_SIZE, EFFECTIVE_BLOCKS, SLAB_HEADER_RESERVED};

/// One `SLAB_REGION_SIZE`-byte, `SLAB_REGION_SIZE`-aligned region carved into
/// `EFFECTIVE_BLOCKS` fixed-size blocks.
///
/// The header lives in place at the start of the region it describes --
/// there is no separate metadata table. `self_ptr` must stay the first
/// field: it is the back-pointer that `free` recovers via alignment masking
/// (see [`crate::thread_cache::ThreadCache::free`]).
#[repr(C)]
pub(crate) struct Slab {
    self_ptr: *mut Slab,
    free_count: usize,
    free_list: Option<NonNull<u8>>,
    /// Link into a thread's `partial_slabs` list. Unused (unlinked) while
    /// this slab is the thread's current slab or is fully allocated.
    pub(crate) link: LinkedListLink,
    /// Link into a thread's `all_slabs` list. Every slab a thread creates
    /// stays linked here for its entire lifetime, independent of which
    /// (if any) of `current_slab`/`partial_slabs` it is also reachable
    /// from, so teardown can always find and release it.
    pub(crate) teardown_link: LinkedListLink,
    raw_allocation: (NonNull<u8>, Layout),
}

intrusive_adapter!(pub(crate) SlabAdapter = UnsafeRef<Slab>: Slab { link => LinkedListLink });
intrusive_adapter!(pub(crate) AllSlabsAdapter = UnsafeRef<Slab>: Slab { teardown_link => LinkedListLink });

// SAFETY: a `Slab` is only ever touched by the thread that owns the
// `ThreadCache` it is reachable from (cross-thread `free` is the one
// documented exception, and it trades the same race the original design
// accepts -- see SPEC_FULL.md section 4.3).
unsafe impl Send for Slab {}

impl Slab {
    /// Builds a fully initialized `Slab` in place at `region_base`, which
    /// must be the start of a `SLAB_REGION_SIZE`-aligned, `SLAB_REGION_SIZE`
    /// + `SLAB_REGION_SIZE`-byte-or-larger allocation (the over-allocation
    /// performed by [`crate::thread_cache::ThreadCache::grow`]).
    ///
    /// # Safety
    /// - `region_base` must be aligned to `SLAB_REGION_SIZE`.
    /// - The `SLAB_REGION_SIZE` bytes starting at `region_base` must be
    ///   writable and not otherwise in use.
    /// - `raw_allocation` must describe the allocation that `region_base`
    ///   was carved out of, so it can be released at thread teardown.
    pub(crate) unsafe fn init_in_place(
        region_base: NonNull<u8>,
        raw_allocation: (NonNull<u8>, Layout),
    ) -> NonNull<Slab> {
        let slab_ptr = region_base.cast::<Slab>();

        unsafe {
            slab_ptr.write(Slab {
                self_ptr: slab_ptr.as_ptr(),
                free_count: 0,
                free_list: None,
                link: LinkedListLink::new(),
                teardown_link: LinkedListLink::new(),
                raw_allocation,
            });
        }

        // Zero the data region first: this faults every page in so the
        // free-list construction below, and subsequent fast-path allocs,
        // never take a first-touch page fault.
        let data_start = unsafe { region_base.add(SLAB_HEADER_RESERVED) };
        unsafe {
            data_start
                .as_ptr()
                .write_bytes(0u8, crate::constants::SLAB_REGION_SIZE - SLAB_HEADER_RESERVED);
        }

        // SAFETY: the write above just constructed a valid `Slab` at this
        // address, and we hold the only reference to it.
        let slab = unsafe { &mut *slab_ptr.as_ptr() };

        // Chain every block into the free list, head at the lowest offset.
        // Walking high-to-low keeps `free_list` pointing at the lowest
        // address, matching the order the spec's reference implementation
        // builds its list in.
        for i in (0..EFFECTIVE_BLOCKS).rev() {
            let block = unsafe { data_start.add(i * BLOCK_SIZE) };
            unsafe { block::set_next(block, slab.free_list) };
            slab.free_list = Some(block);
        }
        slab.free_count = EFFECTIVE_BLOCKS;

        slab_ptr
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free_count
    }

    pub(crate) fn is_full(&self) -> bool {
        self.free_count == 0
    }

    pub(crate) fn region_base(&self) -> NonNull<Slab> {
        // SAFETY: `self_ptr` is written once at construction and never
        // mutated afterwards.
        NonNull::new(self.self_ptr).expect("self_ptr is never null")
    }

    pub(crate) fn raw_allocation(&self) -> (NonNull<u8>, Layout) {
        self.raw_allocation
    }

    /// Detaches and returns one free block. Caller must ensure `free_count > 0`.
    ///
    /// # Safety
    /// `free_list` must be `Some` (i.e. `free_count > 0`).
    pub(crate) unsafe fn alloc_one(&mut self) -> NonNull<u8> {
        let block = self.free_list.expect("alloc_one called on a full slab");
        self.free_list = unsafe { block::next(block) };
        self.free_count -= 1;
        block
    }

    /// Detaches `n` free blocks as a single chain and returns its (head,
    /// tail). Caller must ensure `n > 0 && n <= free_count`.
    pub(crate) unsafe fn bulk_take(&mut self, n: usize) -> (NonNull<u8>, NonNull<u8>) {
        debug_assert!(n > 0 && n <= self.free_count);

        let head = self.free_list.expect("bulk_take called with n > free_count");
        let mut tail = head;
        for _ in 1..n {
            tail = unsafe { block::next(tail) }.expect("free list shorter than free_count");
        }

        self.free_list = unsafe { block::next(tail) };
        unsafe { block::set_next(tail, None) };
        self.free_count -= n;

        (head, tail)
    }

    /// Returns one block to this slab's free list.
    ///
    /// # Safety
    /// `block` must be a `BLOCK_SIZE`-aligned address within this slab's
    /// data region that is not currently on any free list.
    pub(crate) unsafe fn push_free(&mut self, block: NonNull<u8>) {
        unsafe { block::set_next(block, self.free_list) };
        self.free_list = Some(block);
        self.free_count += 1;

        #[cfg(feature = "debug-checks")]
        assert!(self.free_count <= EFFECTIVE_BLOCKS, "free_count overflowed EFFECTIVE_BLOCKS");
    }
}
