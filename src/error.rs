//! The [`AllocError`] taxonomy shared by all pool allocators.

use thiserror::Error;

/// Failure modes of the pooling allocators.
///
/// Only genuinely recoverable conditions are represented here. Double frees,
/// mismatched plain/aligned pairing and pointers foreign to the allocator are
/// contract violations, not reported errors; they are caught by debug
/// assertions where that is cheap and are otherwise undefined.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The backing store could not satisfy a page-growth request.
    ///
    /// Propagated to the caller of `allocate`; never retried internally.
    #[error("backing store exhausted while growing a page")]
    OutOfMemory,

    /// The request cannot be serviced by this pool; the caller should fall
    /// back to a general-purpose allocator.
    #[error("request of {requested} bytes exceeds the {ceiling}-byte pool ceiling")]
    SizeNotSupported {
        /// Effective size of the rejected request.
        requested: usize,
        /// Largest record size this pool serves.
        ceiling: usize,
    },

    /// A non-power-of-two alignment was requested.
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_1() {
        let e = AllocError::SizeNotSupported { requested: 300, ceiling: 256 };
        assert_eq!(
            e.to_string(),
            "request of 300 bytes exceeds the 256-byte pool ceiling"
        );
    }

    #[test]
    fn test_2() {
        assert_ne!(AllocError::OutOfMemory, AllocError::InvalidAlignment(3));
        assert_eq!(AllocError::OutOfMemory, AllocError::OutOfMemory);
    }
}
