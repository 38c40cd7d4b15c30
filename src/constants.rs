//! Compile-time layout constants for the allocator.
//!
//! Every constant here is fixed at build time; there are no runtime
//! configuration knobs (see `SPEC_FULL.md` section 6).

use crate::slab::Slab;

/// Size of a single hand-out, in bytes.
pub const BLOCK_SIZE: usize = 64;

/// Blocks per slab before the header reservation is subtracted.
pub const BLOCK_COUNT: usize = 1024;

/// Size, and required alignment, of a slab's usable region.
pub const SLAB_REGION_SIZE: usize = BLOCK_SIZE * BLOCK_COUNT;

/// Bytes at the start of each aligned region reserved for the `Slab` header.
///
/// Rounded up to a whole number of blocks so the free list still starts on
/// a `BLOCK_SIZE` boundary.
pub const SLAB_HEADER_RESERVED: usize = (size_of::<Slab>().div_ceil(BLOCK_SIZE)) * BLOCK_SIZE;

/// Blocks actually handed out per slab, after the header reservation.
pub const EFFECTIVE_BLOCKS: usize = BLOCK_COUNT - SLAB_HEADER_RESERVED / BLOCK_SIZE;

/// Maximum blocks cached per thread's fastbin.
pub const FASTBIN_CAP: usize = 64;

/// Bulk-refill size when the fastbin is empty and the current slab is rich.
pub const FASTBIN_REFILL: usize = 32;

const _: () = assert!(BLOCK_SIZE.is_power_of_two());
const _: () = assert!(SLAB_REGION_SIZE.is_power_of_two());
const _: () = assert!(SLAB_HEADER_RESERVED % BLOCK_SIZE == 0);
const _: () = assert!(SLAB_HEADER_RESERVED < SLAB_REGION_SIZE);
const _: () = assert!(EFFECTIVE_BLOCKS > FASTBIN_REFILL);
const _: () = assert!(FASTBIN_REFILL < FASTBIN_CAP);
