//! Internal error type for the allocator's one recoverable failure mode.
//!
//! Never exposed through the public API: [`crate::alloc`] converts this to
//! `None` after logging it, matching the "no exception machinery" policy in
//! `SPEC_FULL.md` section 7.

/// The global allocator refused a slab's backing over-allocation.
#[derive(thiserror::Error, Debug)]
pub(crate) enum SlabCreateError {
    #[error("system allocator returned null for a {size}-byte over-allocation")]
    SystemAllocFailed { size: usize },
}
