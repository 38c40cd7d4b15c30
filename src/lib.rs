//! A fixed-size, thread-caching slab allocator.
//!
//! Every allocation is exactly `constants::BLOCK_SIZE` bytes. Each OS thread
//! keeps its own slabs and a small LIFO cache (the "fastbin") of freed
//! blocks, so the fast path never touches a lock, an atomic, or another
//! thread's memory. Slabs are carved from the system allocator in
//! `constants::SLAB_REGION_SIZE`-byte, self-aligned chunks and never
//! returned to it until the owning thread exits.
//!
//! ```
//! let p = threadslab::alloc().expect("system allocator has memory");
//! unsafe { threadslab::free(p) };
//! ```

mod block;
mod constants;
mod error;
mod slab;
mod thread_cache;

use std::cell::RefCell;
use std::ptr::NonNull;

use thread_cache::ThreadCache;

pub use constants::BLOCK_SIZE;

thread_local! {
    static CACHE: RefCell<ThreadCache> = RefCell::new(ThreadCache::default());
}

/// Allocates one `BLOCK_SIZE`-byte block, returning `None` only if the
/// system allocator itself is exhausted.
pub fn alloc() -> Option<NonNull<u8>> {
    CACHE.with(|cache| cache.borrow_mut().alloc())
}

/// Releases a block previously returned by [`alloc`].
///
/// # Safety
/// - `ptr` must have been returned by a call to [`alloc`] on some thread.
/// - `ptr` must not already have been freed.
/// - No reference into the `BLOCK_SIZE` bytes at `ptr` may outlive this call.
pub unsafe fn free(ptr: NonNull<u8>) {
    CACHE.with(|cache| unsafe { cache.borrow_mut().free(ptr) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn alloc_returns_distinct_aligned_blocks() {
        let a = alloc().unwrap();
        let b = alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_ptr() as usize % BLOCK_SIZE, 0);
        unsafe {
            free(a);
            free(b);
        }
    }

    #[test]
    fn freed_block_is_reused_lifo() {
        let a = alloc().unwrap();
        unsafe { free(a) };
        let b = alloc().unwrap();
        assert_eq!(a, b);
        unsafe { free(b) };
    }

    #[test]
    fn many_allocations_are_unique() {
        let mut seen = HashSet::new();
        let mut ptrs = Vec::new();
        for _ in 0..5000 {
            let p = alloc().unwrap();
            assert!(seen.insert(p), "duplicate block handed out");
            ptrs.push(p);
        }
        for p in ptrs {
            unsafe { free(p) };
        }
    }

    #[test]
    fn concurrent_threads_never_observe_each_others_blocks() {
        let barrier = std::sync::Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut seen = HashSet::new();
                    let mut ptrs = Vec::new();
                    for _ in 0..2000 {
                        let p = alloc().unwrap();
                        assert!(seen.insert(p));
                        ptrs.push(p);
                    }
                    for p in ptrs {
                        unsafe { free(p) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
