//! Contention-dispersed iteration over the set bits of a word.
//!
//! Concurrent finders that all scan from bit 0 pile up on the same
//! entries. Instead, each thread derives a starting offset from its
//! thread sequence number and walks the word in two arms:
//!
//! 1. `[start, cycle)`
//! 2. `[0, start)` followed by `[cycle, BFIELD_BITS)`
//!
//! `cycle` bounds the hot zone (typically one past the highest recently
//! accessed entry) so low-occupancy bitmaps keep their searches inside a
//! small, cache-resident prefix. The two-arm order is part of the
//! contention-spacing contract and must not be reordered.

use super::bfield;
use super::BFIELD_BITS;

/// Iterator over the set bits of a captured word, visiting the arm
/// `[start, cycle)` before the wrap-around remainder.
pub(crate) struct CycleIter {
    /// Set bits in `[start, cycle)`, consumed first.
    primary: usize,
    /// Set bits in `[0, start)` and `[cycle, BFIELD_BITS)`.
    secondary: usize,
}

impl CycleIter {
    /// Captures `word` and splits it at `start = tseq % cycle`.
    ///
    /// `cycle` must be in `1..=BFIELD_BITS`.
    pub(crate) fn new(word: usize, tseq: usize, cycle: usize) -> Self {
        debug_assert!(cycle >= 1 && cycle <= BFIELD_BITS);
        let start = tseq % cycle;
        let cycle_mask = bfield::mask(cycle - start, start);
        Self {
            primary: word & cycle_mask,
            secondary: word & !cycle_mask,
        }
    }
}

impl Iterator for CycleIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let arm = if self.primary != 0 {
            &mut self.primary
        } else {
            &mut self.secondary
        };
        let idx = bfield::find_least_bit(*arm)?;
        *arm = bfield::clear_least_bit(*arm);
        Some(idx)
    }
}
