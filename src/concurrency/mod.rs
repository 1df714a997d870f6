pub mod atomics;

pub use atomics::PaddedAtomicCounter;
