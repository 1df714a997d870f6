// Atomic primitives for lock-free bookkeeping around the bitmap.
//
// All types here use plain atomic operations; none of them take locks.

mod padded_atomic_counter;

pub use padded_atomic_counter::PaddedAtomicCounter;
