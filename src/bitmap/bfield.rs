//! A single machine word treated as an atomic bit vector.
//!
//! This is the leaf layer of the bitmap: every operation acts on one
//! `AtomicUsize` and reports whether the touched bits actually
//! transitioned. Mutations use acquire-release ordering; relaxed loads
//! appear only as pre-reads that a subsequent compare-exchange
//! re-validates.

use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;

use crate::concurrency::PaddedAtomicCounter;

use super::{BitOp, BFIELD_BITS};

/// Low bit of every byte (0x0101...01).
const LO_BIT8: usize = !0 / 0xFF;
/// High bit of every byte (0x8080...80).
const HI_BIT8: usize = LO_BIT8 << 7;

/// Process-wide count of rendezvous waits that hit the busy-wait slow
/// path. Observability only; never read by the bitmap itself.
static RENDEZVOUS_BUSY_WAITS: PaddedAtomicCounter = PaddedAtomicCounter::new();

/// Returns how many [`clear_once_set`](BField::clear_once_set) calls had
/// to spin for the set edge since process start.
pub fn rendezvous_busy_wait_count() -> u64 {
    RENDEZVOUS_BUSY_WAITS.get()
}

/// Builds a mask of `bit_count` ones shifted up by `shift`.
#[inline]
pub(crate) fn mask(bit_count: usize, shift: usize) -> usize {
    debug_assert!(bit_count > 0);
    debug_assert!(bit_count + shift <= BFIELD_BITS);
    let mask0 = if bit_count < BFIELD_BITS {
        (1usize << bit_count) - 1
    } else {
        !0
    };
    mask0 << shift
}

/// Index of the least significant set bit, if any.
#[inline]
pub(crate) fn find_least_bit(x: usize) -> Option<usize> {
    if x == 0 {
        None
    } else {
        Some(x.trailing_zeros() as usize)
    }
}

/// Index of the most significant set bit, if any.
#[inline]
pub(crate) fn find_highest_bit(x: usize) -> Option<usize> {
    if x == 0 {
        None
    } else {
        Some(BFIELD_BITS - 1 - x.leading_zeros() as usize)
    }
}

/// Clears the least significant set bit of `x`.
#[inline]
pub(crate) fn clear_least_bit(x: usize) -> usize {
    x & x.wrapping_sub(1)
}

/// Returns a word whose low bit per byte is 1 iff that byte of `x` is 0xFF.
#[inline]
pub(crate) fn has_set_byte(x: usize) -> usize {
    ((!x).wrapping_sub(LO_BIT8) & (x & HI_BIT8)) >> 7
}

/// One atomic bit field of [`BFIELD_BITS`] bits, numbered 0 (LSB) up.
#[repr(transparent)]
pub(crate) struct BField {
    bits: AtomicUsize,
}

impl BField {
    pub(crate) const ZERO: BField = BField {
        bits: AtomicUsize::new(0),
    };

    /// Relaxed read of the whole word. Advisory only; any decision taken
    /// from it must be re-validated by a compare-exchange.
    #[inline]
    pub(crate) fn value(&self) -> usize {
        self.bits.load(Ordering::Relaxed)
    }

    /// Relaxed store of the whole word. Only for use under exclusive
    /// access (bulk initialization).
    #[inline]
    pub(crate) fn store(&self, value: usize) {
        self.bits.store(value, Ordering::Relaxed);
    }

    /// Sets bit `idx`. Returns `true` iff the bit transitioned 0 to 1.
    pub(crate) fn set(&self, idx: usize) -> bool {
        debug_assert!(idx < BFIELD_BITS);
        let mask = 1usize << idx;
        let old = self.bits.fetch_or(mask, Ordering::AcqRel);
        (old & mask) == 0
    }

    /// Clears bit `idx`. Returns `(transitioned, all_clear)` where
    /// `transitioned` is `true` iff the bit went 1 to 0 and `all_clear`
    /// is `true` iff the field is zero afterwards.
    pub(crate) fn clear(&self, idx: usize) -> (bool, bool) {
        debug_assert!(idx < BFIELD_BITS);
        let mask = 1usize << idx;
        let old = self.bits.fetch_and(!mask, Ordering::AcqRel);
        ((old & mask) == mask, (old & !mask) == 0)
    }

    /// Clears bit `idx`, waiting for it to be set first.
    ///
    /// This is the rendezvous primitive: the caller consumes a 1 to 0
    /// edge and must not run ahead of the corresponding 0 to 1 edge.
    /// The motivating scenario is a concurrent free racing the producer
    /// that publishes the bit; the freer arrives early and has to wait
    /// for the publication before undoing it.
    ///
    /// Spins with a CPU yield hint until the bit is observed set. There
    /// is no deadline; callers needing a bounded wait must enforce it
    /// externally.
    pub(crate) fn clear_once_set(&self, idx: usize) {
        debug_assert!(idx < BFIELD_BITS);
        let mask = 1usize << idx;
        let mut old = self.bits.load(Ordering::Relaxed);
        loop {
            if old & mask == 0 {
                old = self.bits.load(Ordering::Acquire);
                if old & mask == 0 {
                    RENDEZVOUS_BUSY_WAITS.increment();
                    trace!("rendezvous busy-wait for bit {idx}");
                    while old & mask == 0 {
                        std::hint::spin_loop();
                        old = self.bits.load(Ordering::Acquire);
                    }
                }
            }
            match self.bits.compare_exchange_weak(
                old,
                old & !mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => old = current,
            }
        }
        debug_assert!(old & mask == mask);
    }

    /// ORs `mask` into the field. Returns `(transitioned, already_set)`:
    /// `transitioned` is `true` iff every mask bit was previously 0,
    /// `already_set` counts the mask bits that were already 1.
    pub(crate) fn set_mask(&self, mask: usize) -> (bool, usize) {
        debug_assert!(mask != 0);
        let old = self.bits.fetch_or(mask, Ordering::AcqRel);
        ((old & mask) == 0, (old & mask).count_ones() as usize)
    }

    /// ANDs `mask` out of the field. Returns
    /// `(transitioned, already_clear, all_clear)`: `transitioned` is
    /// `true` iff every mask bit was previously 1, `already_clear`
    /// counts the mask bits that were already 0, and `all_clear` is
    /// `true` iff the field is zero afterwards.
    pub(crate) fn clear_mask(&self, mask: usize) -> (bool, usize, bool) {
        debug_assert!(mask != 0);
        let old = self.bits.fetch_and(!mask, Ordering::AcqRel);
        (
            (old & mask) == mask,
            (mask & !old).count_ones() as usize,
            (old & !mask) == 0,
        )
    }

    /// Mask set or clear selected by `op`.
    /// Returns `(transitioned, already)` as in [`set_mask`](Self::set_mask)
    /// and [`clear_mask`](Self::clear_mask).
    pub(crate) fn xset_mask(&self, op: BitOp, mask: usize) -> (bool, usize) {
        match op {
            BitOp::Set => self.set_mask(mask),
            BitOp::Clear => {
                let (transitioned, already, _) = self.clear_mask(mask);
                (transitioned, already)
            }
        }
    }

    /// Sets all mask bits iff they are currently all 0.
    /// On failure the field is left untouched.
    pub(crate) fn try_set_mask(&self, mask: usize) -> bool {
        debug_assert!(mask != 0);
        let mut old = self.bits.load(Ordering::Relaxed);
        loop {
            if old & mask != 0 {
                return false;
            }
            match self.bits.compare_exchange_weak(
                old,
                old | mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => old = current,
            }
        }
    }

    /// Clears all mask bits iff they are currently all 1.
    /// Returns `(cleared, all_clear)`. On failure the field is left
    /// untouched and `all_clear` reports whether the field was zero.
    pub(crate) fn try_clear_mask(&self, mask: usize) -> (bool, bool) {
        debug_assert!(mask != 0);
        let mut old = self.bits.load(Ordering::Relaxed);
        loop {
            if old & mask != mask {
                return (false, old == 0);
            }
            match self.bits.compare_exchange_weak(
                old,
                old & !mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (true, (old & !mask) == 0),
                Err(current) => old = current,
            }
        }
    }

    /// Try-mask set or clear selected by `op`; `all_clear` is only
    /// meaningful for clears and reported `false` for sets.
    pub(crate) fn try_xset_mask(&self, op: BitOp, mask: usize) -> (bool, bool) {
        match op {
            BitOp::Set => (self.try_set_mask(mask), false),
            BitOp::Clear => self.try_clear_mask(mask),
        }
    }

    /// Clears bit `idx` iff it is currently set; `(cleared, all_clear)`.
    pub(crate) fn try_clear(&self, idx: usize) -> (bool, bool) {
        debug_assert!(idx < BFIELD_BITS);
        self.try_clear_mask(1usize << idx)
    }

    /// Sets the aligned byte `byte_idx`;
    /// `(transitioned, already_set)` as in [`set_mask`](Self::set_mask).
    pub(crate) fn set8(&self, byte_idx: usize) -> (bool, usize) {
        debug_assert!(byte_idx < BFIELD_BITS / 8);
        self.set_mask(0xFF << (byte_idx * 8))
    }

    /// Clears the aligned byte `byte_idx`.
    /// Returns `(transitioned, already_clear, all_clear)`.
    pub(crate) fn clear8(&self, byte_idx: usize) -> (bool, usize, bool) {
        debug_assert!(byte_idx < BFIELD_BITS / 8);
        self.clear_mask(0xFF << (byte_idx * 8))
    }

    /// Clears the aligned byte `byte_idx` iff it is 0xFF; `(cleared, all_clear)`.
    pub(crate) fn try_clear8(&self, byte_idx: usize) -> (bool, bool) {
        debug_assert!(byte_idx < BFIELD_BITS / 8);
        self.try_clear_mask(0xFF << (byte_idx * 8))
    }

    /// Sets the whole field. Returns `(transitioned, already_set)` where
    /// `transitioned` is `true` iff the field was previously all 0.
    pub(crate) fn set_all(&self) -> (bool, usize) {
        let old = self.bits.swap(!0, Ordering::AcqRel);
        (old == 0, old.count_ones() as usize)
    }

    /// Clears the whole field. Returns `(transitioned, already_clear)`
    /// where `transitioned` is `true` iff the field was previously all 1.
    pub(crate) fn clear_all(&self) -> (bool, usize) {
        let old = self.bits.swap(0, Ordering::AcqRel);
        (!old == 0, old.count_zeros() as usize)
    }

    /// Clears the whole field iff it is currently all 1.
    pub(crate) fn try_clear_all(&self) -> bool {
        self.bits
            .compare_exchange(!0, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Advisory: are all mask bits set? Relaxed read.
    pub(crate) fn is_set_mask(&self, mask: usize) -> bool {
        debug_assert!(mask != 0);
        (self.value() & mask) == mask
    }

    /// Advisory: are all mask bits clear? Relaxed read.
    pub(crate) fn is_clear_mask(&self, mask: usize) -> bool {
        debug_assert!(mask != 0);
        (self.value() & mask) == 0
    }
}
