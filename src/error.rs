//! Error handling
//!
//! All fallible operations in this crate report one of a small set of error
//! classes. Validation failures are detected locally, before a collective
//! call issues its first transport operation; once the exchange has begun a
//! failure is fatal to the call and the group's state must be considered
//! invalid for that call region.

use crate::topology::Rank;

use thiserror::Error;

/// The error classes surfaced by collective calls and operator evaluation.
#[derive(Debug, Error)]
pub enum Error {
    /// A malformed argument: null operator, uncommitted or out-of-bounds
    /// derived layout, element type disagreement, or an operator applied to
    /// an element type it is not defined for.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The root rank lies outside `[0, size)`.
    #[error("invalid root rank {root} for group of size {size}")]
    InvalidRoot {
        /// The offending root rank
        root: Rank,
        /// The size of the group
        size: Rank,
    },

    /// Operand element counts or payload extents disagree.
    #[error("length mismatch: expected {expected} but got {actual}")]
    LengthMismatch {
        /// The locally declared extent
        expected: usize,
        /// The extent actually presented
        actual: usize,
    },

    /// The user-operator registry has no free slot.
    #[error("user operation capacity ({0}) exhausted")]
    ResourceExhausted(usize),

    /// A released or otherwise stale operator handle was used.
    #[error("invalid operation handle")]
    InvalidHandle,

    /// The feature is not provided by the underlying transport or by the
    /// operator's registered calling convention. Callers should treat the
    /// feature as absent rather than retry.
    #[error("not implemented: {0}")]
    Unsupported(&'static str),

    /// A failure reported by the transport underneath the dispatcher.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// A `Result` with this crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
