//! Error taxonomy for the code-memory subsystem

use thiserror::Error;

/// Errors surfaced by code-heap allocation and publication paths.
///
/// Lookup misses (`find_*` returning `None`) are normal negative answers,
/// not errors. OS unwind-table registration failures are swallowed at the
/// publication site (the table goes inactive); [`CodeMemError::Publication`]
/// only travels across the `UnwindOs` trait boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeMemError {
    /// Reservation, commit, or bump allocation failed with no address
    /// window in play. The allocator recovers by opening a new heap; if
    /// that also fails, this propagates to the caller.
    #[error("out of executable memory")]
    OutOfMemory,

    /// A range-constrained allocation could not be placed in `[lo, hi]`.
    /// Callers that did not demand success receive `None` instead and may
    /// retry with a relaxed window.
    #[error("out of executable memory within range [{lo:#x}, {hi:#x}]")]
    OutOfMemoryWithinRange {
        /// Lowest acceptable address.
        lo: usize,
        /// Highest acceptable address.
        hi: usize,
    },

    /// The OS rejected a growable function-table registration.
    #[error("unwind table registration failed")]
    Publication,
}
