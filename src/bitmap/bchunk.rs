//! A cache-line sized array of bit fields with multi-field operations.
//!
//! Chunks add two things over single fields: ranged operations that may
//! span several fields (with compensating rollback when an atomic
//! attempt fails midway) and the find-and-clear scans used by the
//! allocation fast path. No operation here crosses a chunk boundary.

use crate::mem::BitUtil;

use super::bfield::{self, BField};
use super::{BitOp, BCHUNK_BITS, BCHUNK_FIELDS, BFIELD_BITS, BFIELD_SIZE};

/// A chunk of [`BCHUNK_BITS`] bits stored as [`BCHUNK_FIELDS`] atomic
/// fields. Aligned to its own size so a whole chunk sits on one cache
/// line and can be loaded as a vector.
#[repr(C, align(64))]
pub(crate) struct BChunk {
    fields: [BField; BCHUNK_FIELDS],
}

impl BChunk {
    pub(crate) fn new() -> Self {
        Self {
            fields: [BField::ZERO; BCHUNK_FIELDS],
        }
    }

    /// Relaxed read of field `field_idx`.
    #[inline]
    pub(crate) fn field_value(&self, field_idx: usize) -> usize {
        self.fields[field_idx].value()
    }

    /// Relaxed store to field `field_idx`. Exclusive access only.
    #[inline]
    pub(crate) fn store_field(&self, field_idx: usize, value: usize) {
        self.fields[field_idx].store(value);
    }

    /// Fills the whole chunk with ones. Exclusive access only; this is
    /// the bulk-initialization analogue of a memset.
    pub(crate) fn fill_all_set(&self) {
        for field in &self.fields {
            field.store(!0);
        }
    }

    // ------- single-point operations -------

    /// Sets bit `cidx`. Returns `true` iff it transitioned 0 to 1.
    pub(crate) fn set(&self, cidx: usize) -> bool {
        debug_assert!(cidx < BCHUNK_BITS);
        self.fields[cidx / BFIELD_BITS].set(cidx % BFIELD_BITS)
    }

    /// Clears bit `cidx`. Returns `(transitioned, maybe_all_clear)`;
    /// the second flag means the touched field just became zero and the
    /// caller may want to re-examine the whole chunk.
    pub(crate) fn clear(&self, cidx: usize) -> (bool, bool) {
        debug_assert!(cidx < BCHUNK_BITS);
        self.fields[cidx / BFIELD_BITS].clear(cidx % BFIELD_BITS)
    }

    /// Sets the aligned byte `byte_idx`; `(transitioned, already_set)`.
    pub(crate) fn set8(&self, byte_idx: usize) -> (bool, usize) {
        debug_assert!(byte_idx < BCHUNK_BITS / 8);
        self.fields[byte_idx / BFIELD_SIZE].set8(byte_idx % BFIELD_SIZE)
    }

    /// Clears the aligned byte `byte_idx`;
    /// `(transitioned, already_clear, maybe_all_clear)`.
    pub(crate) fn clear8(&self, byte_idx: usize) -> (bool, usize, bool) {
        debug_assert!(byte_idx < BCHUNK_BITS / 8);
        self.fields[byte_idx / BFIELD_SIZE].clear8(byte_idx % BFIELD_SIZE)
    }

    /// Sets whole field `field_idx`; `(transitioned, already_set)`.
    pub(crate) fn set_field(&self, field_idx: usize) -> (bool, usize) {
        debug_assert!(field_idx < BCHUNK_FIELDS);
        self.fields[field_idx].set_all()
    }

    /// Clears whole field `field_idx`;
    /// `(transitioned, already_clear, maybe_all_clear)`. The last flag
    /// is always `true` since the field is zero afterwards.
    pub(crate) fn clear_field(&self, field_idx: usize) -> (bool, usize, bool) {
        debug_assert!(field_idx < BCHUNK_FIELDS);
        let (transitioned, already) = self.fields[field_idx].clear_all();
        (transitioned, already, true)
    }

    // ------- ranged operations -------

    /// Sets or clears `n` bits starting at `cidx`, walking up to
    /// [`BCHUNK_FIELDS`] fields. Not atomic across fields; another
    /// thread may observe a partial state. Returns
    /// `(all_transitioned, already)` where `already` totals the bits
    /// found already in the target state.
    pub(crate) fn xset_n(&self, op: BitOp, cidx: usize, n: usize) -> (bool, usize) {
        debug_assert!(n > 0);
        debug_assert!(cidx + n <= BCHUNK_BITS);
        let mut field = cidx / BFIELD_BITS;
        let mut idx = cidx % BFIELD_BITS;
        let mut remaining = n;
        let mut all_transitioned = true;
        let mut total_already = 0;
        while remaining > 0 {
            let m = remaining.min(BFIELD_BITS - idx);
            let mask = bfield::mask(m, idx);
            let (transitioned, already) = self.fields[field].xset_mask(op, mask);
            debug_assert!(transitioned == (already == 0));
            all_transitioned &= transitioned;
            total_already += already;
            field += 1;
            idx = 0;
            remaining -= m;
        }
        (all_transitioned, total_already)
    }

    /// Are all `n` bits starting at `cidx` in the state selected by `op`?
    pub(crate) fn is_xset_n(&self, op: BitOp, cidx: usize, n: usize) -> bool {
        debug_assert!(n > 0);
        debug_assert!(cidx + n <= BCHUNK_BITS);
        let mut field = cidx / BFIELD_BITS;
        let mut idx = cidx % BFIELD_BITS;
        if idx + n <= BFIELD_BITS {
            return self.is_xset_mask(op, field, bfield::mask(n, idx));
        }
        // straddles fields
        let mut remaining = n;
        while remaining > 0 {
            let m = remaining.min(BFIELD_BITS - idx);
            if !self.is_xset_mask(op, field, bfield::mask(m, idx)) {
                return false;
            }
            field += 1;
            idx = 0;
            remaining -= m;
        }
        true
    }

    fn is_xset_mask(&self, op: BitOp, field_idx: usize, mask: usize) -> bool {
        match op {
            BitOp::Set => self.fields[field_idx].is_set_mask(mask),
            BitOp::Clear => self.fields[field_idx].is_clear_mask(mask),
        }
    }

    /// Atomically sets or clears `n` bits starting at `cidx`: either all
    /// `n` bits transition and the result is `(true, maybe_all_clear)`,
    /// or the chunk is left exactly as it was and the result is
    /// `(false, false)`.
    ///
    /// The transaction commits field by field. When an intermediate
    /// field refuses (some bit not in the expected state), every field
    /// committed so far is compensated by applying the inverse operation
    /// with the same mask, walking backward.
    pub(crate) fn try_xset_n(&self, op: BitOp, cidx: usize, n: usize) -> (bool, bool) {
        debug_assert!(n > 0);
        debug_assert!(cidx + n <= BCHUNK_BITS);
        let start_field = cidx / BFIELD_BITS;
        let start_idx = cidx % BFIELD_BITS;

        // first field
        let mut field = start_field;
        let m = n.min(BFIELD_BITS - start_idx);
        let mask_start = bfield::mask(m, start_idx);
        let (ok, field_is_clear) = self.fields[field].try_xset_mask(op, mask_start);
        if !ok {
            return (false, false);
        }
        let mut maybe_all_clear = field_is_clear;
        let mut remaining = n - m;
        if remaining == 0 {
            return (true, maybe_all_clear);
        }

        // mid fields and last field; on refusal the committed prefix is undone
        let mut mask_mid = 0;
        let mut mask_end = 0;
        let mut end_field = BCHUNK_FIELDS;
        let committed = loop {
            if remaining >= BFIELD_BITS {
                field += 1;
                debug_assert!(field < BCHUNK_FIELDS);
                mask_mid = !0;
                let (ok, field_is_clear) = self.fields[field].try_xset_mask(op, mask_mid);
                if !ok {
                    break false;
                }
                maybe_all_clear &= field_is_clear;
                remaining -= BFIELD_BITS;
            } else if remaining > 0 {
                field += 1;
                debug_assert!(field < BCHUNK_FIELDS);
                end_field = field;
                mask_end = bfield::mask(remaining, 0);
                let (ok, field_is_clear) = self.fields[field].try_xset_mask(op, mask_end);
                if !ok {
                    break false;
                }
                maybe_all_clear &= field_is_clear;
                remaining = 0;
            } else {
                break true;
            }
        };
        if committed {
            return (true, maybe_all_clear);
        }

        // restore: `field` is the one that refused, everything before it
        // back to `start_field` holds our tentative bits
        debug_assert!(field > start_field);
        let inverse = op.inverse();
        while field > start_field {
            field -= 1;
            let mask = if field == start_field {
                mask_start
            } else if field == end_field {
                mask_end
            } else {
                mask_mid
            };
            self.fields[field].xset_mask(inverse, mask);
        }
        (false, false)
    }

    // ------- find-and-clear -------

    /// Scans field `field_idx` for its least set bit and tries to clear
    /// it. All-ones fields are skipped unless `allow_allset`, which
    /// steers single-bit claims away from fully free regions and keeps
    /// large runs intact. On a lost race returns `None` so the caller
    /// moves on instead of retrying the same bit.
    fn try_find_and_clear_at(&self, field_idx: usize, allow_allset: bool) -> Option<usize> {
        debug_assert!(field_idx < BCHUNK_FIELDS);
        let b = self.fields[field_idx].value();
        if !allow_allset && !b == 0 {
            return None;
        }
        let idx = bfield::find_least_bit(b)?;
        if self.fields[field_idx].try_clear(idx).0 {
            Some(field_idx * BFIELD_BITS + idx)
        } else {
            None
        }
    }

    /// Finds the least set bit in the chunk and atomically clears it.
    /// Returns its chunk-relative index.
    pub(crate) fn try_find_and_clear(&self) -> Option<usize> {
        #[cfg(all(feature = "simd", target_arch = "x86_64"))]
        if std::arch::is_x86_feature_detected!("avx2") {
            loop {
                let field_idx = unsafe { super::simd::find_nonzero_field(self)? };
                if let Some(idx) = self.try_find_and_clear_at(field_idx, true) {
                    return Some(idx);
                }
                // lost the race; reload the whole vector
            }
        }
        for i in 0..BCHUNK_FIELDS {
            if let Some(idx) = self.try_find_and_clear_at(i, false) {
                return Some(idx);
            }
        }
        for i in 0..BCHUNK_FIELDS {
            if let Some(idx) = self.try_find_and_clear_at(i, true) {
                return Some(idx);
            }
        }
        None
    }

    fn try_find_and_clear8_at(&self, field_idx: usize, allow_allset: bool) -> Option<usize> {
        let b = self.fields[field_idx].value();
        if !allow_allset && !b == 0 {
            return None;
        }
        let idx = bfield::find_least_bit(bfield::has_set_byte(b))?;
        debug_assert!(idx % 8 == 0);
        if self.fields[field_idx].try_clear8(idx / 8).0 {
            Some(field_idx * BFIELD_BITS + idx)
        } else {
            None
        }
    }

    /// Finds the least byte whose 8 bits are all set and atomically
    /// clears it. Returns the chunk-relative index of its first bit.
    pub(crate) fn try_find_and_clear8(&self) -> Option<usize> {
        #[cfg(all(feature = "simd", target_arch = "x86_64"))]
        if std::arch::is_x86_feature_detected!("avx2") {
            loop {
                let byte_idx = unsafe { super::simd::find_allset_byte(self)? };
                let field_idx = byte_idx / BFIELD_SIZE;
                if self.fields[field_idx].try_clear8(byte_idx % BFIELD_SIZE).0 {
                    return Some(byte_idx * 8);
                }
            }
        }
        for i in 0..BCHUNK_FIELDS {
            if let Some(idx) = self.try_find_and_clear8_at(i, false) {
                return Some(idx);
            }
        }
        for i in 0..BCHUNK_FIELDS {
            if let Some(idx) = self.try_find_and_clear8_at(i, true) {
                return Some(idx);
            }
        }
        None
    }

    /// Finds the least field whose bits are all set and atomically
    /// clears the whole field. Returns the chunk-relative index of its
    /// first bit.
    pub(crate) fn try_find_and_clear_field(&self) -> Option<usize> {
        #[cfg(all(feature = "simd", target_arch = "x86_64"))]
        if std::arch::is_x86_feature_detected!("avx2") {
            loop {
                let field_idx = unsafe { super::simd::find_allset_field(self)? };
                if self.fields[field_idx].try_clear_all() {
                    return Some(field_idx * BFIELD_BITS);
                }
            }
        }
        for i in 0..BCHUNK_FIELDS {
            if self.fields[i].value() == !0 && self.fields[i].try_clear_all() {
                return Some(i * BFIELD_BITS);
            }
        }
        None
    }

    /// Finds `n` consecutive set bits inside a single field
    /// (`1 < n < BFIELD_BITS`, runs never straddle fields) and
    /// atomically clears them. Returns the chunk-relative index of the
    /// run start.
    pub(crate) fn try_find_and_clear_run(&self, n: usize) -> Option<usize> {
        if n == 0 || n > BFIELD_BITS {
            return None;
        }
        let mask = bfield::mask(n, 0);
        for i in 0..BCHUNK_FIELDS {
            let mut b = self.fields[i].value();
            let mut bshift = 0;
            while let Some(idx) = bfield::find_least_bit(b) {
                b >>= idx;
                bshift += idx;
                if bshift + n > BFIELD_BITS {
                    break;
                }
                if b & mask == mask {
                    if self.fields[i].try_clear_mask(mask << bshift).0 {
                        return Some(i * BFIELD_BITS + bshift);
                    }
                    // lost the race; reload and retry from this position
                    bshift -= idx;
                    b = self.fields[i].value() >> bshift;
                } else {
                    // the run of ones here is too short; skip past it
                    let ones = (!b).trailing_zeros() as usize;
                    debug_assert!(ones > 0);
                    b >>= ones;
                    bshift += ones;
                }
            }
        }
        None
    }

    /// Finds `n` consecutive set bits (`n` up to [`BCHUNK_BITS`]) at a
    /// field-aligned position and atomically clears them, rolling back
    /// on a lost race. Returns the chunk-relative index of the span.
    ///
    /// The span needs `ceil(n / BFIELD_BITS)` fields that are fully set
    /// except possibly the last. A relaxed pre-scan rejects misaligned
    /// candidates cheaply; only fully plausible spans pay for the
    /// multi-field atomic commit.
    pub(crate) fn try_find_and_clear_span(&self, n: usize) -> Option<usize> {
        if n == 0 || n > BCHUNK_BITS {
            return None;
        }
        let field_count = BitUtil::ceil_div(n, BFIELD_BITS);
        let mut i = 0;
        while i + field_count <= BCHUNK_FIELDS {
            let mut allset = true;
            let mut j = 0;
            let mut m = n;
            loop {
                let b = self.fields[i + j].value();
                if let Some(idx) = bfield::find_least_bit(!b) {
                    if m > idx {
                        allset = false;
                        // the scan cannot succeed before this field
                        i += j;
                        break;
                    }
                } else {
                    // field fully set; may underflow on the last field
                    m = m.wrapping_sub(BFIELD_BITS);
                }
                j += 1;
                if j >= field_count {
                    break;
                }
            }
            if allset {
                let cidx = i * BFIELD_BITS;
                if self.try_xset_n(BitOp::Clear, cidx, n).0 {
                    return Some(cidx);
                }
            }
            i += 1;
        }
        None
    }

    // ------- auxiliary -------

    /// Blocks until bit `cidx` is observed set, then clears it.
    pub(crate) fn clear_once_set(&self, cidx: usize) {
        debug_assert!(cidx < BCHUNK_BITS);
        self.fields[cidx / BFIELD_BITS].clear_once_set(cidx % BFIELD_BITS);
    }

    /// Are all bits clear? Reads every field.
    pub(crate) fn all_are_clear(&self) -> bool {
        self.fields.iter().all(|f| f.value() == 0)
    }

    /// Are all bits clear? Vectorized single load when available.
    pub(crate) fn all_are_clear_relaxed(&self) -> bool {
        #[cfg(all(feature = "simd", target_arch = "x86_64"))]
        if std::arch::is_x86_feature_detected!("avx2") {
            return unsafe { super::simd::all_zero(self) };
        }
        self.all_are_clear()
    }

    /// Chunk-relative index of the highest set bit, if any.
    pub(crate) fn highest_set_bit(&self) -> Option<usize> {
        for i in (0..BCHUNK_FIELDS).rev() {
            if let Some(idx) = bfield::find_highest_bit(self.fields[i].value()) {
                return Some(i * BFIELD_BITS + idx);
            }
        }
        None
    }

    /// Number of set bits. Racy under concurrent mutation.
    pub(crate) fn popcount(&self) -> usize {
        self.fields
            .iter()
            .map(|f| f.value().count_ones() as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(chunk: &BChunk) -> Vec<usize> {
        (0..BCHUNK_FIELDS).map(|i| chunk.field_value(i)).collect()
    }

    #[test]
    fn test_single_point_ops() {
        let chunk = BChunk::new();
        assert!(chunk.set(0));
        assert!(!chunk.set(0));
        assert!(chunk.set(BCHUNK_BITS - 1));

        assert_eq!(chunk.clear(0), (true, false));
        let (transitioned, maybe_all_clear) = chunk.clear(BCHUNK_BITS - 1);
        assert!(transitioned);
        assert!(maybe_all_clear);
        assert!(chunk.all_are_clear());
    }

    #[test]
    fn test_xset_n_straddles_fields() {
        let chunk = BChunk::new();
        let start = BFIELD_BITS - 4;
        let (all, already) = chunk.xset_n(BitOp::Set, start, 8);
        assert!(all);
        assert_eq!(already, 0);
        assert!(chunk.is_xset_n(BitOp::Set, start, 8));
        assert!(chunk.is_xset_n(BitOp::Clear, start + 8, 8));
        assert_eq!(chunk.popcount(), 8);

        // matches bit-by-bit setting
        let reference = BChunk::new();
        for i in start..start + 8 {
            reference.set(i);
        }
        assert_eq!(snapshot(&chunk), snapshot(&reference));

        let (all, already) = chunk.xset_n(BitOp::Clear, start, 8);
        assert!(all);
        assert_eq!(already, 0);
        assert!(chunk.all_are_clear());
    }

    #[test]
    fn test_xset_n_counts_already_set() {
        let chunk = BChunk::new();
        chunk.set(BFIELD_BITS - 1);
        chunk.set(BFIELD_BITS + 1);
        let (all, already) = chunk.xset_n(BitOp::Set, BFIELD_BITS - 2, 4);
        assert!(!all);
        assert_eq!(already, 2);
    }

    #[test]
    fn test_is_xset_n_within_and_across_fields() {
        let chunk = BChunk::new();
        chunk.xset_n(BitOp::Set, 10, 2 * BFIELD_BITS);
        assert!(chunk.is_xset_n(BitOp::Set, 10, 2 * BFIELD_BITS));
        assert!(!chunk.is_xset_n(BitOp::Set, 9, 2));
        assert!(chunk.is_xset_n(BitOp::Set, BFIELD_BITS - 1, 2));
        assert!(!chunk.is_xset_n(BitOp::Clear, BFIELD_BITS - 1, 2));
        assert!(chunk.is_xset_n(BitOp::Clear, 0, 10));
    }

    #[test]
    fn test_try_xset_n_single_field() {
        let chunk = BChunk::new();
        let (ok, _) = chunk.try_xset_n(BitOp::Set, 4, 8);
        assert!(ok);
        assert!(chunk.is_xset_n(BitOp::Set, 4, 8));

        // overlapping attempt refuses and changes nothing
        let before = snapshot(&chunk);
        let (ok, maybe_all_clear) = chunk.try_xset_n(BitOp::Set, 8, 8);
        assert!(!ok);
        assert!(!maybe_all_clear);
        assert_eq!(snapshot(&chunk), before);

        let (ok, maybe_all_clear) = chunk.try_xset_n(BitOp::Clear, 4, 8);
        assert!(ok);
        assert!(maybe_all_clear);
        assert!(chunk.all_are_clear());
    }

    #[test]
    fn test_try_xset_n_rolls_back_on_mid_field_failure() {
        let chunk = BChunk::new();
        // a single set bit two fields in makes the mid field refuse a set
        let obstacle = 2 * BFIELD_BITS + 7;
        chunk.set(obstacle);
        let before = snapshot(&chunk);

        let start = BFIELD_BITS - 4;
        let n = 2 * BFIELD_BITS; // spans into the obstacle field
        let (ok, _) = chunk.try_xset_n(BitOp::Set, start, n);
        assert!(!ok);
        assert_eq!(snapshot(&chunk), before, "failed set must leave no trace");
    }

    #[test]
    fn test_try_xset_n_rolls_back_on_end_field_failure() {
        let chunk = BChunk::new();
        // all bits of the span present except one in the final field
        let start = 4;
        let n = BFIELD_BITS + 8;
        chunk.xset_n(BitOp::Set, start, n);
        let missing = start + n - 1;
        chunk.clear(missing);
        let before = snapshot(&chunk);

        let (ok, _) = chunk.try_xset_n(BitOp::Clear, start, n);
        assert!(!ok);
        assert_eq!(snapshot(&chunk), before, "failed clear must restore all fields");

        // after repairing the hole the same clear succeeds
        chunk.set(missing);
        let (ok, maybe_all_clear) = chunk.try_xset_n(BitOp::Clear, start, n);
        assert!(ok);
        assert!(maybe_all_clear);
        assert!(chunk.all_are_clear());
    }

    #[test]
    fn test_try_xset_n_whole_chunk() {
        let chunk = BChunk::new();
        let (ok, _) = chunk.try_xset_n(BitOp::Set, 0, BCHUNK_BITS);
        assert!(ok);
        assert_eq!(chunk.popcount(), BCHUNK_BITS);
        let (ok, maybe_all_clear) = chunk.try_xset_n(BitOp::Clear, 0, BCHUNK_BITS);
        assert!(ok);
        assert!(maybe_all_clear);
    }

    #[test]
    fn test_try_find_and_clear_takes_least_bit() {
        let chunk = BChunk::new();
        chunk.set(BFIELD_BITS + 3);
        chunk.set(2 * BFIELD_BITS + 1);
        assert_eq!(chunk.try_find_and_clear(), Some(BFIELD_BITS + 3));
        assert_eq!(chunk.try_find_and_clear(), Some(2 * BFIELD_BITS + 1));
        assert_eq!(chunk.try_find_and_clear(), None);
    }

    // scalar scan policy; the vector scan claims from any non-empty field
    #[cfg(not(feature = "simd"))]
    #[test]
    fn test_try_find_and_clear_prefers_fragmented_fields() {
        let chunk = BChunk::new();
        chunk.set_field(0);
        chunk.set(BFIELD_BITS + 5);
        // the partially occupied field is preferred over the full one
        assert_eq!(chunk.try_find_and_clear(), Some(BFIELD_BITS + 5));
        // only the full field remains; now its least bit is taken
        assert_eq!(chunk.try_find_and_clear(), Some(0));
    }

    #[test]
    fn test_try_find_and_clear8() {
        let chunk = BChunk::new();
        // a nearly full byte does not qualify
        chunk.xset_n(BitOp::Set, 8, 7);
        assert_eq!(chunk.try_find_and_clear8(), None);
        chunk.set(15);
        assert_eq!(chunk.try_find_and_clear8(), Some(8));
        assert!(chunk.is_xset_n(BitOp::Clear, 8, 8));
    }

    #[cfg(not(feature = "simd"))]
    #[test]
    fn test_try_find_and_clear8_prefers_fragmented_fields() {
        let chunk = BChunk::new();
        chunk.set_field(0);
        chunk.xset_n(BitOp::Set, BFIELD_BITS + 16, 8);
        assert_eq!(chunk.try_find_and_clear8(), Some(BFIELD_BITS + 16));
        assert_eq!(chunk.try_find_and_clear8(), Some(0));
    }

    #[test]
    fn test_try_find_and_clear_field() {
        let chunk = BChunk::new();
        chunk.xset_n(BitOp::Set, 0, BFIELD_BITS - 1);
        assert_eq!(chunk.try_find_and_clear_field(), None);
        chunk.set_field(1);
        assert_eq!(chunk.try_find_and_clear_field(), Some(BFIELD_BITS));
        assert_eq!(chunk.field_value(1), 0);
        assert_eq!(chunk.try_find_and_clear_field(), None);
    }

    #[test]
    fn test_try_find_and_clear_run() {
        let chunk = BChunk::new();
        chunk.xset_n(BitOp::Set, 10, 10);
        assert_eq!(chunk.try_find_and_clear_run(5), Some(10));
        assert!(chunk.is_xset_n(BitOp::Clear, 10, 5));
        assert!(chunk.is_xset_n(BitOp::Set, 15, 5));
        assert_eq!(chunk.try_find_and_clear_run(5), Some(15));
        assert_eq!(chunk.try_find_and_clear_run(5), None);
    }

    #[test]
    fn test_try_find_and_clear_run_skips_short_runs() {
        let chunk = BChunk::new();
        chunk.xset_n(BitOp::Set, 0, 3);
        chunk.xset_n(BitOp::Set, 8, 4);
        assert_eq!(chunk.try_find_and_clear_run(4), Some(8));
        assert_eq!(chunk.try_find_and_clear_run(4), None);
        assert!(chunk.is_xset_n(BitOp::Set, 0, 3));
    }

    #[test]
    fn test_try_find_and_clear_run_does_not_straddle_fields() {
        let chunk = BChunk::new();
        // eight set bits, but four on each side of a field boundary
        chunk.xset_n(BitOp::Set, BFIELD_BITS - 4, 8);
        assert_eq!(chunk.try_find_and_clear_run(8), None);
        assert_eq!(chunk.popcount(), 8);
        assert_eq!(chunk.try_find_and_clear_run(4), Some(BFIELD_BITS - 4));
    }

    #[test]
    fn test_try_find_and_clear_span() {
        let chunk = BChunk::new();
        chunk.xset_n(BitOp::Set, 0, 3 * BFIELD_BITS);
        let n = 2 * BFIELD_BITS;
        assert_eq!(chunk.try_find_and_clear_span(n), Some(0));
        assert!(chunk.is_xset_n(BitOp::Clear, 0, n));
        assert!(chunk.is_xset_n(BitOp::Set, n, BFIELD_BITS));
        assert_eq!(chunk.try_find_and_clear_span(n), None);
    }

    #[test]
    fn test_try_find_and_clear_span_requires_aligned_full_fields() {
        let chunk = BChunk::new();
        // plenty of set bits but never a field-aligned fully set span
        chunk.xset_n(BitOp::Set, BFIELD_BITS / 2, BFIELD_BITS);
        assert_eq!(chunk.try_find_and_clear_span(BFIELD_BITS), None);
        assert_eq!(chunk.popcount(), BFIELD_BITS);
    }

    #[test]
    fn test_try_find_and_clear_span_whole_chunk() {
        let chunk = BChunk::new();
        chunk.fill_all_set();
        assert_eq!(chunk.try_find_and_clear_span(BCHUNK_BITS), Some(0));
        assert!(chunk.all_are_clear());
    }

    #[test]
    fn test_try_find_and_clear_span_partial_tail() {
        let chunk = BChunk::new();
        chunk.xset_n(BitOp::Set, 0, BFIELD_BITS + 8);
        assert_eq!(
            chunk.try_find_and_clear_span(BFIELD_BITS + 8),
            Some(0),
            "a span with a partial last field must be found"
        );
        assert!(chunk.all_are_clear());
    }

    #[test]
    fn test_span_rejects_oversized() {
        let chunk = BChunk::new();
        chunk.fill_all_set();
        assert_eq!(chunk.try_find_and_clear_span(BCHUNK_BITS + 1), None);
        assert_eq!(chunk.try_find_and_clear_span(0), None);
        assert_eq!(chunk.popcount(), BCHUNK_BITS);
    }

    #[test]
    fn test_highest_set_bit() {
        let chunk = BChunk::new();
        assert_eq!(chunk.highest_set_bit(), None);
        chunk.set(0);
        assert_eq!(chunk.highest_set_bit(), Some(0));
        chunk.set(3 * BFIELD_BITS + 17);
        assert_eq!(chunk.highest_set_bit(), Some(3 * BFIELD_BITS + 17));
    }

    #[test]
    fn test_all_are_clear_variants_agree() {
        let chunk = BChunk::new();
        assert!(chunk.all_are_clear());
        assert!(chunk.all_are_clear_relaxed());
        chunk.set(BCHUNK_BITS / 2);
        assert!(!chunk.all_are_clear());
        assert!(!chunk.all_are_clear_relaxed());
    }

    #[test]
    fn test_alignment_and_size() {
        assert_eq!(std::mem::size_of::<BChunk>(), BCHUNK_BITS / 8);
        assert_eq!(std::mem::align_of::<BChunk>(), 64);
    }

    #[test]
    fn test_try_xset_n_racing_overlapping_ranges() {
        // two ranges overlapping across a field boundary; at any moment
        // at most one holder, and every failure must roll back fully
        let chunk = BChunk::new();
        let ranges = [(BFIELD_BITS - 4, 8), (BFIELD_BITS + 1, 4)];

        std::thread::scope(|s| {
            for &(start, n) in &ranges {
                let chunk = &chunk;
                s.spawn(move || {
                    let mut held = 0;
                    while held < 1000 {
                        let (ok, _) = chunk.try_xset_n(BitOp::Set, start, n);
                        if ok {
                            held += 1;
                            assert!(chunk.is_xset_n(BitOp::Set, start, n));
                            let (released, _) = chunk.try_xset_n(BitOp::Clear, start, n);
                            assert!(released, "holder must be able to release");
                        }
                    }
                });
            }
        });

        assert!(chunk.all_are_clear(), "all claims were released");
    }
}
