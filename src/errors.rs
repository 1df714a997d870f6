use thiserror::Error;

use crate::bitmap::MAX_BIT_COUNT;

/// Errors reported when constructing a [`Bitmap`](crate::Bitmap).
///
/// Operations on a constructed bitmap never fail with an error; try
/// variants report contention or absence through their return value.
#[derive(Debug, Error)]
pub enum BitmapError {
    #[error("bitmap requires a non-zero bit count")]
    ZeroBitCount,
    #[error("bitmap of {requested} bits exceeds the maximum of {}", MAX_BIT_COUNT)]
    TooManyBits { requested: usize },
}
