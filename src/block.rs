//! The unit of allocation.
//!
//! A [`Block`] is never materialized as an owned Rust value — it is a
//! `BLOCK_SIZE`-byte span of memory whose *meaning* changes depending on
//! whether the allocator or the caller currently holds it. While free, its
//! first machine word is an intrusive next-pointer linking it into whichever
//! free list currently owns it. While allocated, the entire span is opaque
//! bytes belonging to the caller and the allocator must not read or write
//! through it.
//!
//! These helpers are the only place that distinction gets crossed, and they
//! do so through raw pointers rather than a typed node, so that handing a
//! block to the caller never requires zeroing or otherwise disturbing bytes
//! beyond the first word.

use std::ptr::NonNull;

/// Reads the intrusive next-pointer stored in a free block's first word.
///
/// # Safety
/// `block` must point to `BLOCK_SIZE` readable bytes that are currently
/// free (i.e. the allocator, not the caller, owns them) and were either
/// freshly chained by [`set_next`] or are part of a slab's initial free
/// list construction.
#[inline]
pub(crate) unsafe fn next(block: NonNull<u8>) -> Option<NonNull<u8>> {
    unsafe { block.cast::<Option<NonNull<u8>>>().read() }
}

/// Writes the intrusive next-pointer into a free block's first word.
///
/// # Safety
/// `block` must point to `BLOCK_SIZE` writable bytes that are currently
/// free. Overwriting an allocated block's contents this way would corrupt
/// caller data.
#[inline]
pub(crate) unsafe fn set_next(block: NonNull<u8>, next: Option<NonNull<u8>>) {
    unsafe { block.cast::<Option<NonNull<u8>>>().write(next) };
}
