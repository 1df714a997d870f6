//! Concurrent two-level bitmap for page/slice allocation.
//!
//! Tracks millions of binary slots and supports the two operations that
//! locked bitmaps handle poorly under contention:
//! - Atomically find and claim a run of consecutive bits while many
//!   threads race for the same pool
//! - Report ownership transitions (0 to 1, 1 to 0) so callers can drive
//!   external state machines on the edge
//!
//! # Structure
//!
//! Three layers, each a thin shell over the one below:
//! - `bfield`: one atomic machine word
//! - `bchunk`: a cache-line array of bfields with ranged and
//!   find-and-clear operations
//! - [`Bitmap`]: chunks plus a chunkmap whose bit `i` summarizes "chunk
//!   `i` may have set bits"
//!
//! The chunkmap is a conservative over-approximation: its bit may be 1
//! while the chunk is momentarily empty, but it is never 0 while the
//! chunk has a set bit. Searches consult the chunkmap first and help
//! clean up stale entries as they go.
//!
//! # Concurrency
//!
//! - No locks anywhere; every word is an independent atomic
//! - Mutations use acquire-release ordering; relaxed reads appear only
//!   as hints that a compare-exchange re-validates
//! - `try_*` operations are lock-free: a lost race is reported, never
//!   retried in place on the same bit
//! - Only [`Bitmap::clear_once_set`] blocks, spinning for the set edge

mod bchunk;
mod bfield;
mod claim;
mod cycle;
#[cfg(all(feature = "simd", target_arch = "x86_64"))]
mod simd;

use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

use crate::errors::BitmapError;
use crate::mem::BitUtil;

use bchunk::BChunk;
use cycle::CycleIter;

pub use bfield::rendezvous_busy_wait_count;
pub use claim::{ClaimOutcome, SliceClaimer};

/// Bits in one atomic field (the machine word width).
pub const BFIELD_BITS: usize = usize::BITS as usize;
/// Bytes in one atomic field.
pub(crate) const BFIELD_SIZE: usize = BFIELD_BITS / 8;
/// Bytes in one chunk (one cache line).
pub const BCHUNK_SIZE: usize = 64;
/// Bits in one chunk.
pub const BCHUNK_BITS: usize = BCHUNK_SIZE * 8;
/// Fields in one chunk.
pub const BCHUNK_FIELDS: usize = BCHUNK_BITS / BFIELD_BITS;
/// Maximum chunks per bitmap; bounded so the chunkmap fits in one chunk.
pub const MAX_CHUNK_COUNT: usize = BCHUNK_BITS;
/// Maximum bits per bitmap.
pub const MAX_BIT_COUNT: usize = MAX_CHUNK_COUNT * BCHUNK_BITS;

/// Direction shared by the set/clear operation pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BitOp {
    Set,
    Clear,
}

impl BitOp {
    /// The compensating direction, used to undo a partial transaction.
    pub(crate) fn inverse(self) -> Self {
        match self {
            BitOp::Set => BitOp::Clear,
            BitOp::Clear => BitOp::Set,
        }
    }
}

/// Concurrent two-level bitmap.
///
/// Created once with a bit count (rounded up to whole chunks) and never
/// resized. All operations take `&self` and are safe to call from any
/// thread, except [`set_range`](Self::set_range) which requires
/// exclusive access and exists for single-threaded startup.
///
/// # Example
///
/// ```
/// use slice_bitmap::Bitmap;
///
/// let bitmap = Bitmap::new(2048).unwrap();
/// bitmap.set(1000);
///
/// // any thread can race for the set bit; exactly one wins it
/// let claimed = bitmap.try_find_and_clear(0);
/// assert_eq!(claimed, Some(1000));
/// assert_eq!(bitmap.try_find_and_clear(0), None);
/// ```
pub struct Bitmap {
    /// Fixed after construction.
    chunk_count: usize,
    /// Monotone hint: a chunk index at least as high as recently touched
    /// ones. May lag under races; readers treat it as a lower bound.
    chunk_max_accessed: AtomicUsize,
    /// Bit `i` is 1 whenever chunk `i` may contain set bits.
    chunkmap: BChunk,
    chunks: Box<[BChunk]>,
}

impl Bitmap {
    /// Creates a bitmap with room for `bit_count` bits, all clear.
    ///
    /// The count is rounded up to a multiple of [`BCHUNK_BITS`].
    ///
    /// # Errors
    ///
    /// Fails when `bit_count` is zero or exceeds [`MAX_BIT_COUNT`].
    pub fn new(bit_count: usize) -> Result<Self, BitmapError> {
        if bit_count == 0 {
            return Err(BitmapError::ZeroBitCount);
        }
        if bit_count > MAX_BIT_COUNT {
            return Err(BitmapError::TooManyBits {
                requested: bit_count,
            });
        }
        let rounded = BitUtil::align(bit_count, BCHUNK_BITS);
        let chunk_count = rounded / BCHUNK_BITS;
        let chunks: Box<[BChunk]> = (0..chunk_count).map(|_| BChunk::new()).collect();
        debug!("bitmap::new: bit_count={rounded}, chunk_count={chunk_count}");
        Ok(Self {
            chunk_count,
            chunk_max_accessed: AtomicUsize::new(0),
            chunkmap: BChunk::new(),
            chunks,
        })
    }

    /// Estimates the memory footprint of a bitmap with `bit_count` bits.
    pub fn memory_estimation(bit_count: usize) -> usize {
        let chunk_count = BitUtil::ceil_div(bit_count, BCHUNK_BITS);
        std::mem::size_of::<Self>() + chunk_count * std::mem::size_of::<BChunk>()
    }

    /// Total number of bits (a multiple of [`BCHUNK_BITS`]).
    pub fn bit_count(&self) -> usize {
        self.chunk_count * BCHUNK_BITS
    }

    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    // ------- chunkmap maintenance -------

    /// Advances the accessed-chunk hint. A lost race leaves a lower
    /// value, which is fine for a lower bound.
    fn chunkmap_set_max(&self, chunk_idx: usize) {
        let old = self.chunk_max_accessed.load(Ordering::Relaxed);
        if chunk_idx > old {
            let _ = self.chunk_max_accessed.compare_exchange(
                old,
                chunk_idx,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }

    /// Marks chunk `chunk_idx` as possibly occupied. Must run after the
    /// chunk mutation it reports.
    fn chunkmap_set(&self, chunk_idx: usize) {
        debug_assert!(chunk_idx < self.chunk_count);
        self.chunkmap.set(chunk_idx);
        self.chunkmap_set_max(chunk_idx);
    }

    /// Clears the chunkmap bit of `chunk_idx` if the chunk is empty.
    ///
    /// A concurrent setter orders "set chunk bit, then set chunkmap bit";
    /// its chunkmap write can land between our emptiness check and our
    /// clear, and would then be undone by it. The re-check below catches
    /// exactly that interleaving and restores the bit, keeping the
    /// invariant that an occupied chunk is never unmapped.
    fn chunkmap_try_clear(&self, chunk_idx: usize) -> bool {
        debug_assert!(chunk_idx < self.chunk_count);
        if !self.chunks[chunk_idx].all_are_clear_relaxed() {
            return false;
        }
        self.chunkmap.clear(chunk_idx);
        if !self.chunks[chunk_idx].all_are_clear_relaxed() {
            self.chunkmap.set(chunk_idx);
            return false;
        }
        self.chunkmap_set_max(chunk_idx);
        true
    }

    // ------- single-bit operations -------

    /// Sets bit `idx`. Returns `true` iff it transitioned 0 to 1.
    pub fn set(&self, idx: usize) -> bool {
        debug_assert!(idx < self.bit_count());
        let chunk_idx = idx / BCHUNK_BITS;
        let transitioned = self.chunks[chunk_idx].set(idx % BCHUNK_BITS);
        self.chunkmap_set(chunk_idx);
        transitioned
    }

    /// Clears bit `idx`. Returns `true` iff it transitioned 1 to 0.
    pub fn clear(&self, idx: usize) -> bool {
        debug_assert!(idx < self.bit_count());
        let chunk_idx = idx / BCHUNK_BITS;
        let (transitioned, maybe_all_clear) = self.chunks[chunk_idx].clear(idx % BCHUNK_BITS);
        if maybe_all_clear {
            self.chunkmap_try_clear(chunk_idx);
        }
        transitioned
    }

    /// Is bit `idx` set? Advisory read.
    pub fn get(&self, idx: usize) -> bool {
        self.is_all_set(idx, 1)
    }

    // ------- ranged operations -------

    fn set8(&self, idx: usize) -> (bool, usize) {
        debug_assert!(idx % 8 == 0);
        let chunk_idx = idx / BCHUNK_BITS;
        let result = self.chunks[chunk_idx].set8((idx % BCHUNK_BITS) / 8);
        self.chunkmap_set(chunk_idx);
        result
    }

    fn clear8(&self, idx: usize) -> (bool, usize) {
        debug_assert!(idx % 8 == 0);
        let chunk_idx = idx / BCHUNK_BITS;
        let (transitioned, already, maybe_all_clear) =
            self.chunks[chunk_idx].clear8((idx % BCHUNK_BITS) / 8);
        if maybe_all_clear {
            self.chunkmap_try_clear(chunk_idx);
        }
        (transitioned, already)
    }

    fn set_field(&self, idx: usize) -> (bool, usize) {
        debug_assert!(idx % BFIELD_BITS == 0);
        let chunk_idx = idx / BCHUNK_BITS;
        let result = self.chunks[chunk_idx].set_field((idx % BCHUNK_BITS) / BFIELD_BITS);
        self.chunkmap_set(chunk_idx);
        result
    }

    fn clear_field(&self, idx: usize) -> (bool, usize) {
        debug_assert!(idx % BFIELD_BITS == 0);
        let chunk_idx = idx / BCHUNK_BITS;
        let (transitioned, already, maybe_all_clear) =
            self.chunks[chunk_idx].clear_field((idx % BCHUNK_BITS) / BFIELD_BITS);
        if maybe_all_clear {
            self.chunkmap_try_clear(chunk_idx);
        }
        (transitioned, already)
    }

    fn set_n_ranged(&self, idx: usize, n: usize) -> (bool, usize) {
        let chunk_idx = idx / BCHUNK_BITS;
        let result = self.chunks[chunk_idx].xset_n(BitOp::Set, idx % BCHUNK_BITS, n);
        self.chunkmap_set(chunk_idx);
        result
    }

    fn clear_n_ranged(&self, idx: usize, n: usize) -> (bool, usize) {
        let chunk_idx = idx / BCHUNK_BITS;
        let (all, already) = self.chunks[chunk_idx].xset_n(BitOp::Clear, idx % BCHUNK_BITS, n);
        if already < n {
            // something actually cleared; the chunk may now be empty
            self.chunkmap_try_clear(chunk_idx);
        }
        (all, already)
    }

    /// Sets `n` bits starting at `idx`. The range must lie inside one
    /// chunk. Returns `(all_transitioned, already_set)`.
    ///
    /// Routes byte-aligned and field-aligned shapes to their cheaper
    /// specializations.
    pub fn set_n(&self, idx: usize, n: usize) -> (bool, usize) {
        self.check_range(idx, n);
        if n == 1 {
            let transitioned = self.set(idx);
            return (transitioned, !transitioned as usize);
        }
        if n == 8 && idx % 8 == 0 {
            return self.set8(idx);
        }
        if n == BFIELD_BITS && idx % BFIELD_BITS == 0 {
            return self.set_field(idx);
        }
        self.set_n_ranged(idx, n)
    }

    /// Clears `n` bits starting at `idx`. The range must lie inside one
    /// chunk. Returns `(all_transitioned, already_clear)`.
    pub fn clear_n(&self, idx: usize, n: usize) -> (bool, usize) {
        self.check_range(idx, n);
        if n == 1 {
            let transitioned = self.clear(idx);
            return (transitioned, !transitioned as usize);
        }
        if n == 8 && idx % 8 == 0 {
            return self.clear8(idx);
        }
        if n == BFIELD_BITS && idx % BFIELD_BITS == 0 {
            return self.clear_field(idx);
        }
        self.clear_n_ranged(idx, n)
    }

    fn check_range(&self, idx: usize, n: usize) {
        debug_assert!(n > 0 && n <= BCHUNK_BITS);
        debug_assert!(idx + n <= self.bit_count());
        debug_assert!(
            idx / BCHUNK_BITS == (idx + n - 1) / BCHUNK_BITS,
            "range [{idx}, {idx}+{n}) crosses a chunk boundary"
        );
    }

    /// Are all `n` bits starting at `idx` set? The range may span
    /// chunks. Advisory read.
    pub fn is_all_set(&self, idx: usize, n: usize) -> bool {
        self.is_xset_n(BitOp::Set, idx, n)
    }

    /// Are all `n` bits starting at `idx` clear? The range may span
    /// chunks. Advisory read.
    pub fn is_all_clear(&self, idx: usize, n: usize) -> bool {
        self.is_xset_n(BitOp::Clear, idx, n)
    }

    fn is_xset_n(&self, op: BitOp, idx: usize, n: usize) -> bool {
        debug_assert!(n > 0);
        debug_assert!(idx + n <= self.bit_count());
        let mut idx = idx;
        let mut remaining = n;
        while remaining > 0 {
            let cidx = idx % BCHUNK_BITS;
            let m = remaining.min(BCHUNK_BITS - cidx);
            if !self.chunks[idx / BCHUNK_BITS].is_xset_n(op, cidx, m) {
                return false;
            }
            idx += m;
            remaining -= m;
        }
        true
    }

    // ------- find-and-clear -------

    /// Visits candidate chunks in a contention-dispersed order until the
    /// visitor reports a hit.
    ///
    /// The outer cycle walks chunkmap fields, the inner cycle the set
    /// bits of each field. Both start at an offset derived from `tseq`
    /// so concurrent finders fan out over different chunks, and both
    /// confine the first arm to the accessed prefix of the bitmap so
    /// low-occupancy searches stay cache-resident.
    fn find(
        &self,
        tseq: usize,
        mut visit: impl FnMut(usize) -> Option<usize>,
    ) -> Option<usize> {
        let cmap_field_count = BitUtil::ceil_div(self.chunk_count, BFIELD_BITS);
        let chunk_acc = self.chunk_max_accessed.load(Ordering::Relaxed);
        let cmap_acc = chunk_acc / BFIELD_BITS;
        let cmap_acc_bits = 1 + chunk_acc % BFIELD_BITS;

        let cmap_mask = bfield::mask(cmap_field_count, 0);
        for cmap_idx in CycleIter::new(cmap_mask, tseq, cmap_acc + 1) {
            let cmap_entry = self.chunkmap.field_value(cmap_idx);
            let entry_cycle = if cmap_idx == cmap_acc {
                cmap_acc_bits
            } else {
                BFIELD_BITS
            };
            for eidx in CycleIter::new(cmap_entry, tseq, entry_cycle) {
                let chunk_idx = cmap_idx * BFIELD_BITS + eidx;
                debug_assert!(chunk_idx < self.chunk_count);
                if let Some(found) = visit(chunk_idx) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn find_and_clear_with(
        &self,
        tseq: usize,
        chunk_op: impl Fn(&BChunk) -> Option<usize>,
    ) -> Option<usize> {
        self.find(tseq, |chunk_idx| {
            if let Some(cidx) = chunk_op(&self.chunks[chunk_idx]) {
                Some(chunk_idx * BCHUNK_BITS + cidx)
            } else {
                // a stale chunkmap entry is expected here; help clean up
                self.chunkmap_try_clear(chunk_idx);
                None
            }
        })
    }

    /// Finds a set bit and atomically clears it, returning its index.
    ///
    /// `tseq` is the caller's thread sequence number; it spaces
    /// concurrent finders over different chunks. `None` means no set bit
    /// was found (possibly because other threads claimed them all during
    /// the scan).
    pub fn try_find_and_clear(&self, tseq: usize) -> Option<usize> {
        self.find_and_clear_with(tseq, |chunk| chunk.try_find_and_clear())
    }

    /// Finds an aligned byte of 8 set bits and atomically clears it,
    /// returning the index of its first bit.
    pub fn try_find_and_clear8(&self, tseq: usize) -> Option<usize> {
        self.find_and_clear_with(tseq, |chunk| chunk.try_find_and_clear8())
    }

    /// Finds a fully set field of [`BFIELD_BITS`] bits and atomically
    /// clears it, returning the index of its first bit.
    pub fn try_find_and_clear_field(&self, tseq: usize) -> Option<usize> {
        self.find_and_clear_with(tseq, |chunk| chunk.try_find_and_clear_field())
    }

    /// Finds `n` consecutive set bits within a single field
    /// (`n <= BFIELD_BITS`) and atomically clears them.
    pub fn try_find_and_clear_run(&self, tseq: usize, n: usize) -> Option<usize> {
        debug_assert!(n > 0 && n <= BFIELD_BITS);
        self.find_and_clear_with(tseq, |chunk| chunk.try_find_and_clear_run(n))
    }

    /// Finds `n` consecutive set bits (`n <= BCHUNK_BITS`) at a
    /// field-aligned position and atomically clears them. Runs never
    /// cross chunk boundaries.
    pub fn try_find_and_clear_span(&self, tseq: usize, n: usize) -> Option<usize> {
        debug_assert!(n > 0 && n <= BCHUNK_BITS);
        self.find_and_clear_with(tseq, |chunk| chunk.try_find_and_clear_span(n))
    }

    /// Finds a set bit, clears it, and asks `claimer` to validate the
    /// claim. On [`ClaimOutcome::Rejected`] the bit is restored and the
    /// search continues; on [`ClaimOutcome::Released`] the cleared state
    /// stands and the search continues.
    ///
    /// Returns the claimed index, or `None` when no candidate survived
    /// validation.
    pub fn try_find_and_claim<C: SliceClaimer>(&self, tseq: usize, claimer: &C) -> Option<usize> {
        self.find(tseq, |chunk_idx| {
            let chunk = &self.chunks[chunk_idx];
            if let Some(cidx) = chunk.try_find_and_clear() {
                let slice_index = chunk_idx * BCHUNK_BITS + cidx;
                match claimer.claim(slice_index) {
                    ClaimOutcome::Claimed => Some(slice_index),
                    ClaimOutcome::Rejected => {
                        // we cleared a bit that was not ours to take
                        let was_clear = chunk.set(cidx);
                        debug_assert!(was_clear);
                        None
                    }
                    ClaimOutcome::Released => None,
                }
            } else {
                self.chunkmap_try_clear(chunk_idx);
                None
            }
        })
    }

    // ------- auxiliary -------

    /// Index of the highest set bit, if any.
    pub fn highest_set_bit(&self) -> Option<usize> {
        let cmap_field_count = BitUtil::ceil_div(self.chunk_count, BFIELD_BITS);
        for i in (0..cmap_field_count).rev() {
            if let Some(cmap_idx) = bfield::find_highest_bit(self.chunkmap.field_value(i)) {
                let chunk_idx = i * BFIELD_BITS + cmap_idx;
                if let Some(cidx) = self.chunks[chunk_idx].highest_set_bit() {
                    return Some(chunk_idx * BCHUNK_BITS + cidx);
                }
            }
        }
        None
    }

    /// Blocks until bit `idx` is observed set, then atomically clears
    /// it, consuming the 0 to 1 edge published by another thread.
    pub fn clear_once_set(&self, idx: usize) {
        debug_assert!(idx < self.bit_count());
        self.chunks[idx / BCHUNK_BITS].clear_once_set(idx % BCHUNK_BITS);
    }

    /// Visits every set bit in ascending order. The visitor returns
    /// `false` to stop early; the result is `true` iff the walk ran to
    /// completion.
    ///
    /// # Warning
    ///
    /// Bits set or cleared concurrently may or may not be visited; call
    /// this on a quiescent bitmap for an exact snapshot.
    pub fn for_each_set_bit(&self, mut visit: impl FnMut(usize) -> bool) -> bool {
        let cmap_field_count = BitUtil::ceil_div(self.chunk_count, BFIELD_BITS);
        for i in 0..cmap_field_count {
            let mut cmap_entry = self.chunkmap.field_value(i);
            while let Some(cmap_idx) = bfield::find_least_bit(cmap_entry) {
                cmap_entry = bfield::clear_least_bit(cmap_entry);
                let chunk_idx = i * BFIELD_BITS + cmap_idx;
                let chunk = &self.chunks[chunk_idx];
                for j in 0..BCHUNK_FIELDS {
                    let base = chunk_idx * BCHUNK_BITS + j * BFIELD_BITS;
                    let mut b = chunk.field_value(j);
                    while let Some(bidx) = bfield::find_least_bit(b) {
                        b = bfield::clear_least_bit(b);
                        if !visit(base + bidx) {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// Number of set bits.
    ///
    /// # Warning
    ///
    /// Racy under concurrent mutation; exact only at quiescence.
    pub fn cardinality(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.popcount()).sum()
    }

    /// Sets `n` bits starting at `idx`, spanning chunks freely.
    ///
    /// Startup-only bulk operation: the exclusive borrow guarantees no
    /// other thread touches the bitmap. Full middle chunks are filled
    /// wholesale and their chunkmap bits force-set a whole field at a
    /// time. Resets the accessed-chunk hint so later searches start from
    /// the origin.
    pub fn set_range(&mut self, idx: usize, n: usize) {
        debug_assert!(n > 0);
        debug_assert!(idx + n <= self.bit_count());

        // leading chunk
        let mut chunk_idx = idx / BCHUNK_BITS;
        let cidx = idx % BCHUNK_BITS;
        let m = n.min(BCHUNK_BITS - cidx);
        self.chunks[chunk_idx].xset_n(BitOp::Set, cidx, m);
        self.chunkmap_set(chunk_idx);
        chunk_idx += 1;
        let mut remaining = n - m;

        // full middle chunks
        let mid_chunks = remaining / BCHUNK_BITS;
        if mid_chunks > 0 {
            let end_chunk = chunk_idx + mid_chunks;
            for c in chunk_idx..end_chunk {
                self.chunks[c].fill_all_set();
            }
            while chunk_idx < end_chunk {
                if chunk_idx % BFIELD_BITS == 0 && chunk_idx + BFIELD_BITS <= end_chunk {
                    // a whole chunkmap field at once
                    self.chunkmap.store_field(chunk_idx / BFIELD_BITS, !0);
                    self.chunkmap_set_max(chunk_idx + BFIELD_BITS - 1);
                    chunk_idx += BFIELD_BITS;
                } else {
                    self.chunkmap_set(chunk_idx);
                    chunk_idx += 1;
                }
            }
            remaining -= mid_chunks * BCHUNK_BITS;
        }

        // trailing chunk
        if remaining > 0 {
            debug_assert!(remaining < BCHUNK_BITS);
            self.chunks[chunk_idx].xset_n(BitOp::Set, 0, remaining);
            self.chunkmap_set(chunk_idx);
        }

        // deliberate reset: search again from the origin
        self.chunk_max_accessed.store(0, Ordering::Relaxed);
    }
}
