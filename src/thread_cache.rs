//! Per-thread allocator state: the current slab, the partial-slab list, and
//! the fastbin.

use std::alloc::{Layout, alloc, dealloc};
use std::ptr::NonNull;

use intrusive_collections::{LinkedList, UnsafeRef};
use log::{debug, warn};

use crate::block;
use crate::constants::{FASTBIN_CAP, FASTBIN_REFILL, SLAB_REGION_SIZE};
use crate::error::SlabCreateError;
use crate::slab::{AllSlabsAdapter, Slab, SlabAdapter};

/// One OS thread's private allocator state.
///
/// Lives inside a `thread_local!` cell (see `lib.rs`) and is exclusively
/// owned by the thread that created it for its entire lifetime. `alloc` and
/// `free` never take a lock or perform an atomic operation.
pub(crate) struct ThreadCache {
    current_slab: Option<NonNull<Slab>>,
    partial_slabs: LinkedList<SlabAdapter>,
    /// Every slab this thread has ever created, regardless of whether it is
    /// also reachable from `current_slab` or `partial_slabs`. A slab that
    /// drains to empty is detached from both of those until a future `free`
    /// rediscovers it, but it always stays linked here, so teardown can
    /// always find and release it.
    all_slabs: LinkedList<AllSlabsAdapter>,
    fastbin: Option<NonNull<u8>>,
    fastbin_count: usize,
    /// Number of slabs this thread has carved from the system allocator.
    /// Not load-bearing for correctness; kept for diagnostics and tests.
    slabs_created: usize,
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self {
            current_slab: None,
            partial_slabs: LinkedList::new(SlabAdapter::new()),
            all_slabs: LinkedList::new(AllSlabsAdapter::new()),
            fastbin: None,
            fastbin_count: 0,
            slabs_created: 0,
        }
    }
}

impl ThreadCache {
    /// Obtains one `BLOCK_SIZE`-byte block. See `SPEC_FULL.md` section 4.2.
    pub(crate) fn alloc(&mut self) -> Option<NonNull<u8>> {
        loop {
            // Step 1: fastbin pop. The hot path.
            if let Some(block) = self.fastbin {
                self.fastbin = unsafe { block::next(block) };
                self.fastbin_count -= 1;
                return Some(block);
            }

            if let Some(mut slab_ptr) = self.current_slab {
                let slab = unsafe { slab_ptr.as_mut() };

                // Step 2: current slab, with optional bulk refill.
                if slab.free_count() > FASTBIN_REFILL {
                    let (head, tail) = unsafe { slab.bulk_take(FASTBIN_REFILL) };
                    unsafe { block::set_next(tail, self.fastbin) };
                    self.fastbin = Some(head);
                    self.fastbin_count += FASTBIN_REFILL;
                    continue;
                }

                if slab.free_count() > 0 {
                    let block = unsafe { slab.alloc_one() };

                    // Step 3: current slab drained -- detach it, untracked
                    // until a future `free` rediscovers it.
                    if slab.free_count() == 0 {
                        self.current_slab = None;
                    }

                    return Some(block);
                }
            }

            // Step 4: promote a partial slab to current and retry.
            if let Some(slab) = self.partial_slabs.pop_front() {
                let raw = UnsafeRef::into_raw(slab);
                self.current_slab = Some(unsafe { NonNull::new_unchecked(raw as *mut Slab) });
                continue;
            }

            // Step 5: grow.
            match self.grow() {
                Ok(()) => continue,
                Err(err) => {
                    warn!("threadslab: slab creation failed: {err}");
                    return None;
                }
            }
        }
    }

    /// Releases one previously-allocated block. See `SPEC_FULL.md` section
    /// 4.3.
    ///
    /// # Safety
    /// `ptr` must have been returned by a prior call to [`Self::alloc`] on
    /// some thread and must not already have been freed.
    pub(crate) unsafe fn free(&mut self, ptr: NonNull<u8>) {
        // Step 1: fastbin push, the hot path.
        if self.fastbin_count < FASTBIN_CAP {
            unsafe { block::set_next(ptr, self.fastbin) };
            self.fastbin = Some(ptr);
            self.fastbin_count += 1;
            return;
        }

        // Step 2: owner recovery via alignment masking.
        let mask = !(SLAB_REGION_SIZE - 1);
        let region_base = (ptr.as_ptr() as usize) & mask;
        let owner = unsafe { *(region_base as *const *mut Slab) };
        let owner_ref = unsafe { &mut *owner };

        #[cfg(feature = "debug-checks")]
        assert_eq!(
            owner_ref.region_base().as_ptr() as usize,
            region_base,
            "threadslab: corrupt or foreign block passed to free()"
        );

        let was_full = owner_ref.is_full();

        // Step 3: slab free-list push.
        unsafe { owner_ref.push_free(ptr) };

        // Step 4: re-promotion to partial.
        let owner_ptr = owner_ref.region_base();
        let is_current = self.current_slab == Some(owner_ptr);
        if was_full && !is_current {
            let owner_ref = unsafe { UnsafeRef::from_raw(owner_ptr.as_ptr() as *const Slab) };
            self.partial_slabs.push_front(owner_ref);
        }
    }

    /// Requests a fresh slab from the system allocator and installs it as
    /// the current slab. See `SPEC_FULL.md` section 4.1.
    fn grow(&mut self) -> Result<(), SlabCreateError> {
        let over_alloc_size = 2 * SLAB_REGION_SIZE;
        // Alignment of 1: we deliberately over-allocate and align by hand
        // rather than asking the allocator for `SLAB_REGION_SIZE` alignment.
        let layout = Layout::from_size_align(over_alloc_size, 1)
            .expect("over-allocation size/align is always valid");

        let raw = unsafe { alloc(layout) };
        let Some(raw) = NonNull::new(raw) else {
            return Err(SlabCreateError::SystemAllocFailed {
                size: over_alloc_size,
            });
        };

        let aligned_addr = (raw.as_ptr() as usize).div_ceil(SLAB_REGION_SIZE) * SLAB_REGION_SIZE;
        // SAFETY: `aligned_addr` falls within the `2 * SLAB_REGION_SIZE`
        // over-allocation starting at `raw`, so it is non-null and writable
        // for at least `SLAB_REGION_SIZE` bytes.
        let region_base = unsafe { NonNull::new_unchecked(aligned_addr as *mut u8) };

        let slab = unsafe { Slab::init_in_place(region_base, (raw, layout)) };

        // SAFETY: `slab` was just created and has not been linked anywhere
        // yet, so it is safe to hand a fresh `UnsafeRef` to this list.
        unsafe {
            self.all_slabs
                .push_back(UnsafeRef::from_raw(slab.as_ptr()));
        }

        debug!(
            "threadslab: created slab at {:#x} (thread {:?})",
            aligned_addr,
            std::thread::current().id()
        );

        self.slabs_created += 1;
        self.current_slab = Some(slab);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn slabs_created(&self) -> usize {
        self.slabs_created
    }

    #[cfg(test)]
    pub(crate) fn fastbin_count(&self) -> usize {
        self.fastbin_count
    }

    #[cfg(test)]
    pub(crate) fn current_slab_free_count(&self) -> Option<usize> {
        self.current_slab
            .map(|s| unsafe { s.as_ref() }.free_count())
    }

    #[cfg(test)]
    pub(crate) fn partial_slab_free_count(&self) -> Option<usize> {
        self.partial_slabs.front().get().map(|s| s.free_count())
    }

    #[cfg(test)]
    pub(crate) fn partial_slabs_len(&self) -> usize {
        self.partial_slabs.iter().count()
    }

    #[cfg(test)]
    pub(crate) fn current_slab_is_none(&self) -> bool {
        self.current_slab.is_none()
    }

    #[cfg(test)]
    pub(crate) fn all_slabs_len(&self) -> usize {
        self.all_slabs.iter().count()
    }
}

impl Drop for ThreadCache {
    /// Releases every slab this thread carved from the system allocator,
    /// including ones drained to full and currently reachable from neither
    /// `current_slab` nor `partial_slabs`.
    ///
    /// Never calls back into [`Self::alloc`]/[`Self::free`] -- the
    /// `thread_local!` cell this value lives in is already being torn down
    /// by the time this runs, and re-entering it would panic.
    fn drop(&mut self) {
        let mut released = 0usize;

        while let Some(slab) = self.all_slabs.pop_front() {
            let (raw, layout) = slab.raw_allocation();
            unsafe { dealloc(raw.as_ptr(), layout) };
            released += 1;
        }

        debug!(
            "threadslab: tearing down thread {:?}, released {released} slab(s)",
            std::thread::current().id()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::EFFECTIVE_BLOCKS;

    #[test]
    fn fresh_alloc_creates_exactly_one_slab() {
        let mut cache = ThreadCache::default();
        let _ = cache.alloc().unwrap();
        assert_eq!(cache.slabs_created(), 1);
    }

    #[test]
    fn free_after_alloc_leaves_fastbin_count_one() {
        let mut cache = ThreadCache::default();
        for _ in 0..10 {
            let block = cache.alloc().unwrap();
            unsafe { cache.free(block) };
            assert_eq!(cache.fastbin_count(), 1);
        }
    }

    #[test]
    fn first_alloc_triggers_bulk_refill() {
        let mut cache = ThreadCache::default();
        let _ = cache.alloc().unwrap();
        assert_eq!(cache.fastbin_count(), FASTBIN_REFILL - 1);
        assert_eq!(
            cache.current_slab_free_count(),
            Some(EFFECTIVE_BLOCKS - FASTBIN_REFILL)
        );
    }

    #[test]
    fn fresh_cache_has_no_current_slab() {
        let cache = ThreadCache::default();
        assert!(cache.current_slab_is_none());
    }

    #[test]
    fn allocating_past_one_slab_creates_a_second() {
        let mut cache = ThreadCache::default();
        for _ in 0..=EFFECTIVE_BLOCKS {
            cache.alloc().unwrap();
        }
        assert_eq!(cache.slabs_created(), 2);
        assert_eq!(cache.all_slabs_len(), 2);
    }

    #[test]
    fn draining_one_slab_then_freeing_creates_a_partial_slab() {
        let mut cache = ThreadCache::default();
        let mut ptrs = Vec::new();
        for _ in 0..=EFFECTIVE_BLOCKS {
            ptrs.push(cache.alloc().unwrap());
        }
        assert_eq!(cache.partial_slabs_len(), 0);

        // The first EFFECTIVE_BLOCKS pointers came from the now-untracked,
        // fully drained first slab.
        unsafe { cache.free(ptrs[0]) };
        assert_eq!(cache.partial_slab_free_count(), Some(1));
        assert_eq!(cache.partial_slabs_len(), 1);
    }

    #[test]
    fn fastbin_fills_to_cap_and_overflow_goes_to_slab_free_list() {
        let mut cache = ThreadCache::default();
        let mut ptrs = Vec::new();
        for _ in 0..FASTBIN_CAP + 1 {
            ptrs.push(cache.alloc().unwrap());
        }
        for p in ptrs {
            unsafe { cache.free(p) };
        }
        assert_eq!(cache.fastbin_count(), FASTBIN_CAP);
    }

    #[test]
    #[cfg(feature = "debug-checks")]
    fn teardown_tracks_every_slab_even_untracked_ones() {
        let mut cache = ThreadCache::default();
        for _ in 0..=EFFECTIVE_BLOCKS {
            cache.alloc().unwrap();
        }
        // Neither freed nor otherwise touched: the first slab is full and
        // reachable from neither `current_slab` nor `partial_slabs`, yet
        // `all_slabs` must still account for it so teardown releases it.
        assert_eq!(cache.all_slabs_len(), cache.slabs_created());
        drop(cache);
    }
}
