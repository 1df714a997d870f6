mod bit_util;

pub use bit_util::BitUtil;
