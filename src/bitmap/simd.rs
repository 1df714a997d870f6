//! AVX2 chunk scans.
//!
//! A chunk is one 64-byte cache line, so two 256-bit loads cover it.
//! Each scan condenses the chunk into a lane mask and picks the lowest
//! qualifying lane; the caller re-validates with a compare-exchange, so
//! these reads carry no ordering obligations of their own.
//!
//! Callers must check `is_x86_feature_detected!("avx2")` before calling.

use std::arch::x86_64::{
    __m256i, _mm256_cmpeq_epi64, _mm256_cmpeq_epi8, _mm256_load_si256, _mm256_movemask_epi8,
    _mm256_or_si256, _mm256_set1_epi64x, _mm256_setzero_si256, _mm256_testz_si256,
};

use super::bchunk::BChunk;
use super::{BCHUNK_BITS, BCHUNK_FIELDS};

// the lane math below is written for 64-bit fields in a 512-bit chunk
const _: () = assert!(BCHUNK_BITS == 512 && BCHUNK_FIELDS == 8);

#[inline]
#[target_feature(enable = "avx2")]
unsafe fn load(chunk: &BChunk) -> (__m256i, __m256i) {
    let p = chunk as *const BChunk as *const __m256i;
    (_mm256_load_si256(p), _mm256_load_si256(p.add(1)))
}

/// Is the whole chunk zero?
#[target_feature(enable = "avx2")]
pub(super) unsafe fn all_zero(chunk: &BChunk) -> bool {
    let (v1, v2) = load(chunk);
    let combined = _mm256_or_si256(v1, v2);
    _mm256_testz_si256(combined, combined) != 0
}

/// Index of the lowest field with any bit set.
#[target_feature(enable = "avx2")]
pub(super) unsafe fn find_nonzero_field(chunk: &BChunk) -> Option<usize> {
    let (v1, v2) = load(chunk);
    let zero = _mm256_setzero_si256();
    // per 64-bit lane: 0xFF bytes if the lane is zero; invert so a set
    // byte marks a claimable lane
    let m1 = !(_mm256_movemask_epi8(_mm256_cmpeq_epi64(v1, zero)) as u32);
    let m2 = !(_mm256_movemask_epi8(_mm256_cmpeq_epi64(v2, zero)) as u32);
    let mask = ((m2 as u64) << 32) | m1 as u64;
    if mask == 0 {
        return None;
    }
    debug_assert!(mask.trailing_zeros() % 8 == 0);
    Some((mask.trailing_zeros() / 8) as usize)
}

/// Chunk-level byte index (0..64) of the lowest byte equal to 0xFF.
#[target_feature(enable = "avx2")]
pub(super) unsafe fn find_allset_byte(chunk: &BChunk) -> Option<usize> {
    let (v1, v2) = load(chunk);
    let ones = _mm256_set1_epi64x(!0);
    let m1 = _mm256_movemask_epi8(_mm256_cmpeq_epi8(v1, ones)) as u32;
    let m2 = _mm256_movemask_epi8(_mm256_cmpeq_epi8(v2, ones)) as u32;
    let mask = ((m2 as u64) << 32) | m1 as u64;
    if mask == 0 {
        return None;
    }
    Some(mask.trailing_zeros() as usize)
}

/// Index of the lowest field with all bits set.
#[target_feature(enable = "avx2")]
pub(super) unsafe fn find_allset_field(chunk: &BChunk) -> Option<usize> {
    let (v1, v2) = load(chunk);
    let ones = _mm256_set1_epi64x(!0);
    let m1 = _mm256_movemask_epi8(_mm256_cmpeq_epi64(v1, ones)) as u32;
    let m2 = _mm256_movemask_epi8(_mm256_cmpeq_epi64(v2, ones)) as u32;
    let mask = ((m2 as u64) << 32) | m1 as u64;
    if mask == 0 {
        return None;
    }
    debug_assert!(mask.trailing_zeros() % 8 == 0);
    Some((mask.trailing_zeros() / 8) as usize)
}

#[cfg(test)]
mod tests {
    use super::super::BitOp;
    use super::*;

    fn avx2() -> bool {
        std::arch::is_x86_feature_detected!("avx2")
    }

    #[test]
    fn test_all_zero() {
        if !avx2() {
            return;
        }
        let chunk = BChunk::new();
        assert!(unsafe { all_zero(&chunk) });
        chunk.set(300);
        assert!(!unsafe { all_zero(&chunk) });
    }

    #[test]
    fn test_find_nonzero_field() {
        if !avx2() {
            return;
        }
        let chunk = BChunk::new();
        assert_eq!(unsafe { find_nonzero_field(&chunk) }, None);
        chunk.set(5 * 64 + 3);
        assert_eq!(unsafe { find_nonzero_field(&chunk) }, Some(5));
        chunk.set(2 * 64);
        assert_eq!(unsafe { find_nonzero_field(&chunk) }, Some(2));
    }

    #[test]
    fn test_find_allset_byte() {
        if !avx2() {
            return;
        }
        let chunk = BChunk::new();
        chunk.xset_n(BitOp::Set, 40 * 8, 7);
        assert_eq!(unsafe { find_allset_byte(&chunk) }, None);
        chunk.set(40 * 8 + 7);
        assert_eq!(unsafe { find_allset_byte(&chunk) }, Some(40));
    }

    #[test]
    fn test_find_allset_field() {
        if !avx2() {
            return;
        }
        let chunk = BChunk::new();
        chunk.xset_n(BitOp::Set, 0, 63);
        assert_eq!(unsafe { find_allset_field(&chunk) }, None);
        chunk.set_field(6);
        assert_eq!(unsafe { find_allset_field(&chunk) }, Some(6));
    }
}
