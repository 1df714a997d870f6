//! slice_bitmap - Concurrent two-level bitmap index
//!
//! The core index structure of a page/slice allocator: a lock-free
//! hierarchical bitmap that can atomically find and claim runs of bits
//! while many threads race for the same pool.

pub mod bitmap;
pub mod concurrency;
pub mod errors;
pub mod mem;

pub use bitmap::{
    rendezvous_busy_wait_count, Bitmap, ClaimOutcome, SliceClaimer, BCHUNK_BITS, BCHUNK_FIELDS,
    BCHUNK_SIZE, BFIELD_BITS, MAX_BIT_COUNT, MAX_CHUNK_COUNT,
};
pub use errors::BitmapError;
