//! Collective communication over process groups
//!
//! This library provides the collective exchange and reduction patterns of
//! message-passing concurrency -- broadcast, gather, scatter, all-gather,
//! all-to-all, reduce, all-reduce and the prefix scans -- decoupled from
//! any particular transport. A group is anything implementing the small
//! [`Communicator`](topology::Communicator) oracle: ranked identity plus
//! tagged, buffered point-to-point messaging. The [`local`] module ships a
//! thread-backed transport for testing and single-process use.
//!
//! # Usage
//!
//! Add the `collectives` crate as a dependency in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! collectives = "0.1.0"
//! ```
//!
//! Then use it in your program like this:
//!
//! ```
//! use collectives::traits::*;
//! use collectives::operation::SystemOperation;
//!
//! collectives::local::run(4, |world| {
//!     let rank = world.rank();
//!     let mut sum = 0i32;
//!     world.all_reduce_into(&rank, &mut sum, SystemOperation::Sum).unwrap();
//!     assert_eq!(sum, 6);
//! });
//! ```
//!
//! # Features
//!
//! - **Collective communication**: barrier, broadcast, (all) gather and
//!   gather in place, scatter and scatter in place, all to all with equal
//!   or varying counts, reductions to one or all ranks, inclusive and
//!   exclusive prefix scans.
//! - **Datatypes**: scalar and slice buffers of the fixed-width machine
//!   types, value/location pairs for the locating reductions, and
//!   indexed-block derived layouts that restrict a collective to a
//!   selection of a buffer's elements.
//! - **Operations**: fourteen predefined element-wise reduction
//!   operations plus registration of user-defined ones in typed and
//!   opaque calling conventions.
//!
//! Reductions fold contributions in ascending rank order, so results are
//! deterministic even for non-commutative user operations and
//! non-associative floating-point arithmetic.

pub mod collective;
pub mod datatype;
pub mod error;
pub mod local;
pub mod operation;
pub mod topology;

pub use crate::error::{Error, Result};

/// Number of elements in a buffer or message.
pub type Count = i32;

/// Identifies a message within a (source, destination) pair.
///
/// Tags at or above [`collective::RESERVED_TAG_BASE`] are reserved for the
/// collective schedules.
pub type Tag = i32;

/// Re-exports all traits.
pub mod traits {
    pub use crate::collective::{CommunicatorCollectives, Root};
    pub use crate::datatype::{Buffer, BufferMut, Equivalence};
    pub use crate::operation::Operation;
    pub use crate::topology::{AsCommunicator, Communicator};
}
